//! 有効期限スケジューラ
//!
//! オブジェクトのハッシュ（16進表現）をキーとして、指定時刻に
//! コールバックを1回実行するイベントループです。
//!
//! 内部は絶対期限で順序付けたmin-heapと、キーごとの世代番号による
//! 遅延キャンセルで構成されます。同じキーで再スケジュールすると
//! 古いイベントは世代番号の不一致により発火時に読み飛ばされます。
//!
//! コールバックはロックの外、ブロッキングスレッド上で実行され、
//! パニックは捕捉してログに残します。

use ftlog::{debug, error, info};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

/// 発火時に実行されるアクション
pub type ExpireAction = Box<dyn FnOnce() + Send + 'static>;

/// ヒープ上のイベント
struct Event {
    when: Instant,
    generation: u64,
    key: String,
    action: ExpireAction,
}

// BinaryHeapはmax-heapなので順序を反転してmin-heapにする
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.generation == other.generation
    }
}
impl Eq for Event {}
impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Event {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

struct Inner {
    heap: BinaryHeap<Event>,
    /// キーごとの有効な世代番号。ヒープ上のイベントは
    /// 世代が一致する場合のみ発火する。
    generations: HashMap<String, u64>,
    next_generation: u64,
}

/// 有効期限スケジューラ
pub struct Scheduler {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl Scheduler {
    /// スケジューラを作成してイベントループを起動
    ///
    /// `shutdown`がtrueになるとループは停止します。
    /// 実行中のアクションは完了まで継続されます。
    pub fn new(shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner {
                heap: BinaryHeap::new(),
                generations: HashMap::new(),
                next_generation: 0,
            })),
            notify: Arc::new(Notify::new()),
        });

        tokio::spawn(run_loop(
            Arc::clone(&scheduler.inner),
            Arc::clone(&scheduler.notify),
            shutdown,
        ));

        scheduler
    }

    /// イベントを登録する
    ///
    /// 同じキーが既に登録されている場合は新しいイベントで置き換えます。
    pub fn schedule(&self, key: String, when: Instant, action: ExpireAction) {
        let mut inner = self.inner.lock().unwrap();
        let generation = inner.next_generation;
        inner.next_generation += 1;

        inner.generations.insert(key.clone(), generation);
        let is_new_min = inner.heap.peek().map(|e| when < e.when).unwrap_or(true);
        inner.heap.push(Event { when, generation, key, action });
        drop(inner);

        // 最小期限が変わった場合はループを起こす
        if is_new_min {
            self.notify.notify_one();
        }
    }

    /// イベントをキャンセルする（ベストエフォート）
    pub fn cancel(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.generations.remove(key);
    }

    /// 登録中のイベント数
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().generations.len()
    }

    /// イベントが無いかどうか
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// イベントループ本体
async fn run_loop(
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        // 発火済みイベントの回収と次の期限の決定
        let mut due: Vec<Event> = Vec::new();
        let next_deadline = {
            let mut guard = inner.lock().unwrap();
            let now = Instant::now();
            loop {
                let (when, generation, key) = match guard.heap.peek() {
                    Some(event) => (event.when, event.generation, event.key.clone()),
                    None => break None,
                };

                if guard.generations.get(&key) != Some(&generation) {
                    // キャンセル済みまたは置き換え済み
                    guard.heap.pop();
                    continue;
                }

                if when > now {
                    break Some(when);
                }

                let event = guard.heap.pop().unwrap();
                guard.generations.remove(&event.key);
                due.push(event);
            }
        };

        // アクションはロックの外で実行する
        for event in due {
            debug!("[Scheduler] firing event for {}", event.key);
            let key = event.key;
            let action = event.action;
            let result = tokio::task::spawn_blocking(action).await;
            if let Err(e) = result {
                if e.is_panic() {
                    error!("[Scheduler] expiration action for {} panicked", key);
                }
            }
        }

        tokio::select! {
            _ = notify.notified() => {}
            _ = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    // イベントが無い間は通知が来るまで眠る
                    None => std::future::pending::<()>().await,
                }
            } => {}
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    info!("[Scheduler] shutting down");
                    return;
                }
            }
        }
    }
}
