//! Segmented LRU
//!
//! 4段の再利用距離セグメントで構成されるLRU変種です。
//! 新規パートは最下段に入り、ヒットのたびに1段ずつ上へ昇格します。
//! 容量超過時は最も下の空でないセグメントの末尾から追い出します。
//!
//! 追い出されたパートのファイル削除はバックグラウンドタスクが
//! `bulk_remove_count`件ずつまとめて行い、バルク間で
//! `bulk_remove_timeout`だけ休止してファイルシステム負荷を均します。

use super::{CacheAlgorithm, CacheStats, RemovePartFn};
use crate::error::{CacheError, Result};
use crate::types::ObjectIndex;
use ftlog::{debug, warn};
use lru::LruCache;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// セグメント数
const CACHE_TIERS: usize = 4;

/// Segmented LRUアルゴリズム
pub struct SegmentedLru {
    /// ゾーンID（統計表示用）
    id: String,
    /// パートサイズ（占有サイズ計算用）
    part_size: u64,
    /// 参照数
    requests: AtomicU64,
    /// ヒット数
    hits: AtomicU64,
    /// 残存インデックス（Mutexで保護）
    inner: Arc<Mutex<Inner>>,
    /// バックグラウンド削除キュー
    remove_tx: mpsc::UnboundedSender<ObjectIndex>,
}

struct Inner {
    /// 再利用距離セグメント（0が最下段）
    tiers: Vec<LruCache<ObjectIndex, ()>>,
    /// パート → 所属セグメント
    index: HashMap<ObjectIndex, usize>,
    /// パート数の上限
    capacity: u64,
    /// 一括削除の1回あたり削除数
    bulk_remove_count: usize,
    /// バルク間の休止時間
    bulk_remove_timeout: Duration,
}

impl Inner {
    /// セグメントあたりの容量
    fn tier_capacity(&self) -> u64 {
        (self.capacity / CACHE_TIERS as u64).max(1)
    }

    /// 最も下の空でないセグメントの末尾から1件追い出す
    fn pop_coldest(&mut self) -> Option<ObjectIndex> {
        for tier in self.tiers.iter_mut() {
            if let Some((victim, _)) = tier.pop_lru() {
                self.index.remove(&victim);
                return Some(victim);
            }
        }
        None
    }

    /// 容量超過分を追い出してキューに積む
    fn evict_overflow(&mut self, tx: &mpsc::UnboundedSender<ObjectIndex>) {
        while self.index.len() as u64 > self.capacity {
            match self.pop_coldest() {
                Some(victim) => {
                    // 受信側が終了していても残存インデックスの整合性は保つ
                    let _ = tx.send(victim);
                }
                None => break,
            }
        }
    }
}

impl SegmentedLru {
    /// 新しいSegmented LRUを作成
    ///
    /// 削除キューを処理するバックグラウンドタスクを起動するため、
    /// Tokioランタイム上で呼び出す必要があります。
    pub fn new(
        id: &str,
        capacity_objects: u64,
        part_size: u64,
        bulk_remove_count: usize,
        bulk_remove_timeout: Duration,
        remove_fn: RemovePartFn,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            tiers: (0..CACHE_TIERS).map(|_| LruCache::unbounded()).collect(),
            index: HashMap::new(),
            capacity: capacity_objects.max(1),
            bulk_remove_count: bulk_remove_count.max(1),
            bulk_remove_timeout,
        }));

        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_remover(remove_rx, Arc::clone(&inner), remove_fn));

        Self {
            id: id.to_string(),
            part_size,
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            inner,
            remove_tx,
        }
    }
}

impl CacheAlgorithm for SegmentedLru {
    fn add_object(&self, idx: &ObjectIndex) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.index.contains_key(idx) {
            return Err(CacheError::AlreadyInCache);
        }

        inner.tiers[0].push(idx.clone(), ());
        inner.index.insert(idx.clone(), 0);
        inner.evict_overflow(&self.remove_tx);
        Ok(())
    }

    fn remove(&self, indices: &[ObjectIndex]) {
        let mut inner = self.inner.lock().unwrap();
        for idx in indices {
            if let Some(tier) = inner.index.remove(idx) {
                inner.tiers[tier].pop(idx);
            }
        }
    }

    fn promote(&self, idx: &ObjectIndex) {
        let mut inner = self.inner.lock().unwrap();
        let tier = match inner.index.get(idx) {
            Some(t) => *t,
            None => return,
        };

        if tier + 1 >= CACHE_TIERS {
            // 最上段の中ではMRU位置へ移動するだけ
            inner.tiers[tier].promote(idx);
            return;
        }

        inner.tiers[tier].pop(idx);
        inner.tiers[tier + 1].push(idx.clone(), ());
        inner.index.insert(idx.clone(), tier + 1);

        // 上段があふれたらLRU末尾を1段下へ戻す
        let cap = inner.tier_capacity();
        if inner.tiers[tier + 1].len() as u64 > cap {
            if let Some((demoted, _)) = inner.tiers[tier + 1].pop_lru() {
                inner.tiers[tier].push(demoted.clone(), ());
                inner.index.insert(demoted, tier);
            }
        }
    }

    fn lookup(&self, idx: &ObjectIndex) -> bool {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.lock().unwrap();
        let found = inner.index.contains_key(idx);
        if found {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    fn should_keep(&self, idx: &ObjectIndex) -> bool {
        // プレーンなLRUは全てのパートを受け入れる。登録だけ済ませる。
        match self.add_object(idx) {
            Ok(()) | Err(CacheError::AlreadyInCache) => true,
            Err(e) => {
                warn!("[SegmentedLru] cannot admit {}: {}", idx, e);
                true
            }
        }
    }

    fn stats(&self) -> CacheStats {
        let objects = self.inner.lock().unwrap().index.len() as u64;
        let hits = self.hits.load(Ordering::Relaxed);
        let requests = self.requests.load(Ordering::Relaxed);
        let hit_percent = if requests > 0 {
            (hits as f64 / requests as f64) * 100.0
        } else {
            0.0
        };

        CacheStats {
            id: self.id.clone(),
            hits,
            requests,
            objects,
            size: objects * self.part_size,
            hit_percent,
        }
    }

    fn change_config(
        &self,
        bulk_remove_timeout: Duration,
        bulk_remove_count: usize,
        capacity_objects: u64,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.bulk_remove_timeout = bulk_remove_timeout;
        inner.bulk_remove_count = bulk_remove_count.max(1);
        inner.capacity = capacity_objects.max(1);
        inner.evict_overflow(&self.remove_tx);
    }
}

/// バックグラウンド削除タスク
///
/// キューから追い出されたパートを受け取り、バルク単位で
/// 削除ケイパビリティを呼び出します。削除自体はブロッキング
/// スレッドで実行されます。
async fn run_remover(
    mut rx: mpsc::UnboundedReceiver<ObjectIndex>,
    inner: Arc<Mutex<Inner>>,
    remove_fn: RemovePartFn,
) {
    loop {
        let first = match rx.recv().await {
            Some(idx) => idx,
            None => break,
        };

        let (bulk_count, bulk_timeout) = {
            let inner = inner.lock().unwrap();
            (inner.bulk_remove_count, inner.bulk_remove_timeout)
        };

        let mut batch = vec![first];
        while batch.len() < bulk_count {
            match rx.try_recv() {
                Ok(idx) => batch.push(idx),
                Err(_) => break,
            }
        }

        debug!("[SegmentedLru] evicting {} parts", batch.len());
        let remove_fn = Arc::clone(&remove_fn);
        let result = tokio::task::spawn_blocking(move || {
            for idx in &batch {
                if let Err(e) = remove_fn(idx) {
                    if !e.is_not_found() {
                        warn!("[SegmentedLru] cannot remove part {}: {}", idx, e);
                    }
                }
            }
        })
        .await;
        if let Err(e) = result {
            warn!("[SegmentedLru] remover batch panicked: {}", e);
        }

        // バルク間で他の処理に譲る
        tokio::time::sleep(bulk_timeout).await;
    }
}
