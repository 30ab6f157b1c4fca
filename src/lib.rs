//! # kura
//!
//! HTTPリバースプロキシのためのディスクキャッシュコアを提供します。
//! レスポンスを固定長のパートに分割してコンテンツアドレスの
//! ディレクトリツリーへ永続化し、LRU系のエビクションとHTTP鮮度に
//! 基づく有効期限管理で滞留量を制御します。
//!
//! ## アーキテクチャ
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Application                                  │
//! │  ├─ Location ──┐                              │
//! │  │             ├─ Fetcher（パート計画 + 合流） │
//! │  │             │    ├─ Upstream（バランサー）  │
//! │  │             │    └─ CacheZone              │
//! │  │             │         ├─ DiskStorage      │← メタデータ + パート
//! │  │             │         ├─ SegmentedLru     │← 残存管理
//! │  │             │         └─ Scheduler        │← 有効期限
//! └───────────────────────────────────────────────┘
//! ```
//!
//! HTTPサーバー・TLS終端・管理エンドポイントはこのクレートの外側で
//! 実装され、`Application`のAPI（`serve` / `purge` / `stats`）を
//! 呼び出します。

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod scheduler;
pub mod storage;
pub mod types;
pub mod upstream;
pub mod zone;

pub use app::{AppStats, Application, Location};
pub use config::Config;
pub use error::{CacheError, Result};
pub use handler::{CacheRequest, CacheResponse, Fetcher};
pub use types::{ObjectId, ObjectIndex, ObjectMetadata};
pub use zone::CacheZone;
