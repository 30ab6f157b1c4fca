//! リクエスト処理
//!
//! リクエストをパート集合に分解し、ストアのヒットとアップストリーム
//! からのフェッチを組み合わせてレスポンスを構成するホットパスです。
//!
//! ## 構成
//!
//! - **policy**: RFC 7234ベースのキャッシュ可否・TTL判定
//! - **singleflight**: 同一パートへの同時フェッチの合流
//! - **fetcher**: パート計画・リーダーフェッチ・ストリーミング

pub mod policy;
pub mod singleflight;

mod fetcher;

pub use fetcher::{CacheRequest, CacheResponse, Fetcher};

use crate::error::CacheError;
use crate::types::ObjectMetadata;
use bytes::Bytes;
use std::sync::Arc;

/// パートフェッチの結果
///
/// シングルフライトの待機者全員に配られるためクローン可能です。
#[derive(Clone)]
pub enum PartOutcome {
    /// パートのバイト列
    Done(Bytes),
    /// フェッチの失敗
    Failed(Arc<CacheError>),
}

/// メタデータ発見の結果
#[derive(Clone)]
pub enum MetaOutcome {
    /// 発見されたメタデータ
    Done(ObjectMetadata),
    /// 発見の失敗
    Failed(Arc<CacheError>),
}
