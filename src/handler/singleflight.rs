//! シングルフライト
//!
//! 同一キーに対する同時フェッチを1つにまとめます。最初に到着した
//! リクエストがリーダーとしてフェッチを実行し、後続は同じ
//! `Flight`ハンドル上で完了通知を待ちます。
//!
//! 待機者数はハンドルごとに参照カウントされ、クライアント切断時の
//! 「待機者ゼロなら中断」判定に使われます。

use dashmap::DashMap;
use std::hash::Hash;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

/// 1件のフェッチの共有状態
pub struct Flight<T> {
    outcome: OnceLock<T>,
    notify: Notify,
    waiters: AtomicUsize,
}

impl<T: Clone> Flight<T> {
    fn new() -> Self {
        Self {
            outcome: OnceLock::new(),
            notify: Notify::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    /// 結果を設定して全ての待機者を起こす
    ///
    /// 2回目以降の呼び出しは無視されます。
    pub fn complete(&self, outcome: T) {
        let _ = self.outcome.set(outcome);
        self.notify.notify_waiters();
    }

    /// 結果が設定されるまで待つ
    pub async fn wait(self: &Arc<Self>) -> T {
        let _guard = WaiterGuard::new(self.as_ref());
        loop {
            let mut notified = pin!(self.notify.notified());
            // 先に通知待ちへ登録してから結果を確認する（取りこぼし防止）
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome.get() {
                return outcome.clone();
            }
            notified.await;
        }
    }

    /// 現在の待機者数
    #[inline]
    pub fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }
}

/// 待機者カウントの増減を担うガード
struct WaiterGuard<'a, T> {
    flight: &'a Flight<T>,
}

impl<'a, T> WaiterGuard<'a, T> {
    fn new(flight: &'a Flight<T>) -> Self {
        flight.waiters.fetch_add(1, Ordering::AcqRel);
        Self { flight }
    }
}

impl<T> Drop for WaiterGuard<'_, T> {
    fn drop(&mut self) {
        self.flight.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

/// クレームの結果
pub enum Claim<T> {
    /// このリクエストがフェッチを実行する
    Leader(Arc<Flight<T>>),
    /// 他のリクエストのフェッチを待つ
    Follower(Arc<Flight<T>>),
}

/// キーごとの実行中フェッチの索引
pub struct FlightGroup<K, T> {
    flights: DashMap<K, Arc<Flight<T>>>,
}

impl<K: Eq + Hash + Clone, T: Clone> FlightGroup<K, T> {
    pub fn new() -> Self {
        Self { flights: DashMap::new() }
    }

    /// キーに対するフェッチ権を取得する
    ///
    /// 最初の呼び出しだけが`Leader`になります。リーダーは完了時に
    /// `complete`と`finish`を必ず呼ぶ責任を負います。
    pub fn claim(&self, key: &K) -> Claim<T> {
        use dashmap::mapref::entry::Entry;
        match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => Claim::Follower(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let flight = Arc::new(Flight::new());
                entry.insert(Arc::clone(&flight));
                Claim::Leader(flight)
            }
        }
    }

    /// 完了したフェッチを索引から取り除く
    pub fn finish(&self, key: &K) {
        self.flights.remove(key);
    }

    /// 実行中のフェッチ数
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

impl<K: Eq + Hash + Clone, T: Clone> Default for FlightGroup<K, T> {
    fn default() -> Self {
        Self::new()
    }
}
