//! キャッシュアルゴリズム
//!
//! どのパートをディスク上に残すかを決めるエビクションアルゴリズムです。
//! ゾーンはアルゴリズムに削除ケイパビリティ（通常はストアの
//! `discard_part`）を渡し、アルゴリズムは容量超過時にそれを呼び出します。
//!
//! 現在の実装は4段のSegmented LRUのみですが、TinyLFU系のアドミッション
//! ポリシーを差し替えられるようトレイトで抽象化しています。

mod lru;

pub use lru::SegmentedLru;

use crate::config::CacheZoneConfig;
use crate::error::{CacheError, Result};
use crate::types::ObjectIndex;
use std::sync::Arc;
use std::time::Duration;

/// パート削除ケイパビリティ
///
/// ゾーンへの逆参照を持たせない代わりに、削除操作だけを
/// クロージャとして受け取ります。
pub type RemovePartFn = Arc<dyn Fn(&ObjectIndex) -> Result<()> + Send + Sync>;

/// アルゴリズムの統計情報
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// ゾーンID
    pub id: String,
    /// ヒット数
    pub hits: u64,
    /// 参照数
    pub requests: u64,
    /// 登録されているパート数
    pub objects: u64,
    /// 占有サイズ（パート数 × パートサイズ）
    pub size: u64,
    /// ヒット率（パーセンテージ）
    pub hit_percent: f64,
}

/// エビクションアルゴリズムの契約
pub trait CacheAlgorithm: Send + Sync {
    /// パートを登録する
    ///
    /// 既に登録済みの場合は`AlreadyInCache`を返します。
    /// 容量超過時は削除ケイパビリティ経由でエビクションが起こります。
    fn add_object(&self, idx: &ObjectIndex) -> Result<()>;

    /// パートの登録を外部から取り消す（purge等）
    ///
    /// 削除ケイパビリティは呼び出されません。
    fn remove(&self, indices: &[ObjectIndex]);

    /// ヒットしたパートをMRU方向へ昇格させる
    fn promote(&self, idx: &ObjectIndex);

    /// パートが登録されているか調べる
    ///
    /// 統計情報の参照数・ヒット数はこの呼び出しで更新されます。
    fn lookup(&self, idx: &ObjectIndex) -> bool;

    /// 新しく取得したパートを保存すべきかどうか
    fn should_keep(&self, idx: &ObjectIndex) -> bool;

    /// 統計情報を取得
    fn stats(&self) -> CacheStats;

    /// 実行中の設定変更
    fn change_config(
        &self,
        bulk_remove_timeout: Duration,
        bulk_remove_count: usize,
        capacity_objects: u64,
    );
}

/// 設定からアルゴリズムを構築
pub fn new(cfg: &CacheZoneConfig, remove_fn: RemovePartFn) -> Result<Arc<dyn CacheAlgorithm>> {
    match cfg.algorithm.as_str() {
        "lru" => Ok(Arc::new(SegmentedLru::new(
            &cfg.id,
            cfg.storage_objects,
            cfg.part_size,
            cfg.bulk_remove_count,
            cfg.bulk_remove_timeout(),
            remove_fn,
        ))),
        other => Err(CacheError::Config(format!(
            "unknown cache algorithm `{}`",
            other
        ))),
    }
}
