//! キャッシュゾーン
//!
//! ストレージ・エビクションアルゴリズム・有効期限スケジューラを
//! 束ねるオーケストレータです。起動時にはディスク上の永続状態を
//! 走査して、新鮮なオブジェクトをスケジューラとアルゴリズムに
//! 再登録します。
//!
//! アルゴリズムにはゾーンへの逆参照を渡さず、ストアの`discard_part`を
//! 削除ケイパビリティとして渡します。

use crate::cache::{self, CacheAlgorithm, CacheStats};
use crate::config::CacheZoneConfig;
use crate::error::{CacheError, Result};
use crate::handler::{MetaOutcome, PartOutcome};
use crate::handler::singleflight::FlightGroup;
use crate::scheduler::Scheduler;
use crate::storage::{DiskStorage, IterateFlow, IterateVisitor, Storage};
use crate::types::{unix_now, ObjectId, ObjectIndex, ObjectMetadata};
use ftlog::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// リロード中に他の処理へ譲るまでのオブジェクト数
const RELOAD_YIELD_EVERY: usize = 100;

/// リロード時の休止時間
const RELOAD_YIELD_FOR: Duration = Duration::from_millis(100);

/// キャッシュゾーン
pub struct CacheZone {
    id: String,
    part_size: u64,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) algorithm: Arc<dyn CacheAlgorithm>,
    pub(crate) scheduler: Arc<Scheduler>,
    /// パート単位のシングルフライト索引
    pub(crate) part_flights: FlightGroup<ObjectIndex, PartOutcome>,
    /// メタデータ発見のシングルフライト索引
    pub(crate) meta_flights: FlightGroup<ObjectId, MetaOutcome>,
}

impl CacheZone {
    /// ゾーンを構築する
    ///
    /// ストレージのセンチネル検証に失敗した場合はエラーを返します
    /// （起動時のみ致命的）。
    pub fn new(cfg: &CacheZoneConfig, shutdown: watch::Receiver<bool>) -> Result<Arc<Self>> {
        let storage: Arc<dyn Storage> = Arc::new(DiskStorage::new(cfg)?);

        let remove_storage = Arc::clone(&storage);
        let remove_fn = Arc::new(move |idx: &ObjectIndex| remove_storage.discard_part(idx));
        let algorithm = cache::new(cfg, remove_fn)?;

        let scheduler = Scheduler::new(shutdown);

        Ok(Arc::new(Self {
            id: cfg.id.clone(),
            part_size: cfg.part_size,
            storage,
            algorithm,
            scheduler,
            part_flights: FlightGroup::new(),
            meta_flights: FlightGroup::new(),
        }))
    }

    /// ゾーンID
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// パートサイズ
    #[inline]
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// アルゴリズムの統計情報
    pub fn stats(&self) -> CacheStats {
        self.algorithm.stats()
    }

    /// オブジェクトの有効期限イベントを登録する
    ///
    /// 発火時にオブジェクトはディスクから破棄され、パートの
    /// 残存登録も取り消されます。既に破棄済みの場合は何もしません。
    pub(crate) fn schedule_expiration(self: &Arc<Self>, meta: &ObjectMetadata) {
        let remaining = meta.expires_at.saturating_sub(unix_now()).max(0) as u64;
        let deadline = Instant::now() + Duration::from_secs(remaining);

        let zone = Arc::clone(self);
        let id = meta.id.clone();
        self.scheduler.schedule(
            meta.id.hex(),
            deadline,
            Box::new(move || zone.expire_object(&id)),
        );
    }

    /// 期限切れオブジェクトを破棄する
    fn expire_object(&self, id: &ObjectId) {
        let parts = self.storage.get_available_parts(id).unwrap_or_default();
        match self.storage.discard(id) {
            Ok(()) => {
                self.algorithm.remove(&parts);
                info!("[CacheZone {}] expired object {}", self.id, id);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                error!("[CacheZone {}] cannot expire object {}: {}", self.id, id, e);
            }
        }
    }

    /// オブジェクトをパージする
    ///
    /// 戻り値はパージ前にオブジェクトが存在したかどうかです。
    /// ブロッキングI/Oを行うため、非同期コンテキストからは
    /// `spawn_blocking`経由で呼び出します。
    pub fn purge_object(&self, id: &ObjectId) -> Result<bool> {
        let parts = match self.storage.get_available_parts(id) {
            Ok(parts) => parts,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };

        match self.storage.discard(id) {
            Ok(()) => {
                self.algorithm.remove(&parts);
                self.scheduler.cancel(&id.hex());
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// ディスク上の永続状態を再登録する
    ///
    /// 新鮮なオブジェクトには有効期限イベントを登録し、存在する
    /// パートをアルゴリズムに追加します。期限切れのオブジェクトは
    /// その場で破棄します。`RELOAD_YIELD_EVERY`件ごとに休止して
    /// 他のサブシステムを飢えさせないようにします。
    pub fn reload(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let zone = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            info!("[CacheZone {}] start storage reload", zone.id);

            let mut visitor = ReloadVisitor {
                zone: Arc::clone(&zone),
                shutdown,
                loaded: 0,
                discarded: 0,
            };
            match zone.storage.iterate(&mut visitor) {
                Ok(()) => info!(
                    "[CacheZone {}] storage reload finished: {} loaded, {} stale discarded",
                    zone.id, visitor.loaded, visitor.discarded
                ),
                Err(e) => error!(
                    "[CacheZone {}] storage reload failed after {} objects: {}",
                    zone.id, visitor.loaded, e
                ),
            }
        })
    }
}

/// リロード用ビジター
struct ReloadVisitor {
    zone: Arc<CacheZone>,
    shutdown: watch::Receiver<bool>,
    loaded: usize,
    discarded: usize,
}

impl IterateVisitor for ReloadVisitor {
    fn on_object(&mut self, meta: &ObjectMetadata, parts: &[ObjectIndex]) -> IterateFlow {
        self.loaded += 1;
        if self.loaded % RELOAD_YIELD_EVERY == 0 {
            std::thread::sleep(RELOAD_YIELD_FOR);
            if *self.shutdown.borrow() {
                return IterateFlow::Stop;
            }
        }

        if !meta.is_fresh() {
            self.discarded += 1;
            if let Err(e) = self.zone.storage.discard(&meta.id) {
                if !e.is_not_found() {
                    error!(
                        "[CacheZone {}] cannot discard stale object {}: {}",
                        self.zone.id, meta.id, e
                    );
                }
            }
            return IterateFlow::Continue;
        }

        self.zone.schedule_expiration(meta);
        for idx in parts {
            match self.zone.algorithm.add_object(idx) {
                Ok(()) | Err(CacheError::AlreadyInCache) => {}
                Err(e) => warn!(
                    "[CacheZone {}] cannot register part {}: {}",
                    self.zone.id, idx, e
                ),
            }
        }

        IterateFlow::Continue
    }
}
