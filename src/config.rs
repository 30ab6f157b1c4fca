//! 設定
//!
//! キャッシュコアが消費する設定面を定義します。
//! JSONファイルからのデコードと起動時バリデーションを提供します。

use crate::error::{CacheError, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// デフォルト値関数
fn default_part_size() -> u64 { 1024 * 1024 } // 1MB
fn default_storage_objects() -> u64 { 1024 * 1024 }
fn default_algorithm() -> String { "lru".to_string() }
fn default_bulk_remove_count() -> usize { 100 }
fn default_bulk_remove_timeout_ms() -> u64 { 100 }
fn default_dir_permissions() -> u32 { 0o700 }
fn default_file_permissions() -> u32 { 0o600 }
fn default_balancing() -> String { "round-robin".to_string() }
fn default_weight() -> u32 { 1 }
fn default_max_conns_per_server() -> usize { 0 } // 0 = 無制限
fn default_dial_timeout_secs() -> u64 { 10 }
fn default_tls_handshake_timeout_secs() -> u64 { 5 }
fn default_keepalive_secs() -> u64 { 10 }
fn default_resolve_interval_secs() -> u64 { 60 }
fn default_ttl_secs() -> u64 { 300 } // 5分
fn default_true() -> bool { true }

/// ルート設定
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Config {
    /// キャッシュゾーン定義
    #[serde(default)]
    pub cache_zones: Vec<CacheZoneConfig>,

    /// アップストリーム定義
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// ロケーション定義（ホスト名 → ゾーン/アップストリームの対応）
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

/// キャッシュゾーン設定
#[derive(Deserialize, Clone, Debug)]
pub struct CacheZoneConfig {
    /// ゾーンID
    pub id: String,

    /// ストレージルートディレクトリ
    pub path: PathBuf,

    /// パートサイズ（バイト）
    ///
    /// デフォルト: 1MB
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// 保持するパート数の上限
    #[serde(default = "default_storage_objects")]
    pub storage_objects: u64,

    /// エビクションアルゴリズム名
    ///
    /// デフォルト: "lru"
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// 一括削除の1回あたり削除数
    #[serde(default = "default_bulk_remove_count")]
    pub bulk_remove_count: usize,

    /// 一括削除の間隔（ミリ秒）
    #[serde(default = "default_bulk_remove_timeout_ms")]
    pub bulk_remove_timeout_ms: u64,

    /// ディスクパスにキャッシュキー階層を含めない
    #[serde(default)]
    pub skip_cache_key_in_path: bool,

    /// ディレクトリ作成時のパーミッション
    #[serde(default = "default_dir_permissions")]
    pub dir_permissions: u32,

    /// ファイル作成時のパーミッション
    #[serde(default = "default_file_permissions")]
    pub file_permissions: u32,
}

impl CacheZoneConfig {
    /// 一括削除間隔をDurationで取得
    #[inline]
    pub fn bulk_remove_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_remove_timeout_ms)
    }
}

/// アップストリーム設定
#[derive(Deserialize, Clone, Debug)]
pub struct UpstreamConfig {
    /// アップストリームID
    pub id: String,

    /// バランシングアルゴリズム名
    ///
    /// "round-robin" | "random" | "hash" | "ip-hash"
    #[serde(default = "default_balancing")]
    pub balancing: String,

    /// バックエンドアドレス（URL形式）
    pub addresses: Vec<AddressConfig>,

    /// 接続設定
    #[serde(default)]
    pub settings: UpstreamSettings,
}

/// バックエンドアドレス設定
///
/// 単純なURL文字列か、重み付きのオブジェクトのどちらでも書けます。
#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum AddressConfig {
    /// `"http://backend:8080"` 形式（重み1）
    Plain(String),
    /// `{"address": "http://backend:8080", "weight": 3}` 形式
    Weighted {
        address: String,
        #[serde(default = "default_weight")]
        weight: u32,
    },
}

impl AddressConfig {
    /// アドレス文字列を取得
    #[inline]
    pub fn address(&self) -> &str {
        match self {
            AddressConfig::Plain(address) => address,
            AddressConfig::Weighted { address, .. } => address,
        }
    }

    /// 重みを取得
    #[inline]
    pub fn weight(&self) -> u32 {
        match self {
            AddressConfig::Plain(_) => 1,
            AddressConfig::Weighted { weight, .. } => (*weight).max(1),
        }
    }
}

/// アップストリーム接続設定
#[derive(Deserialize, Clone, Debug)]
pub struct UpstreamSettings {
    /// サーバーあたりの最大同時接続数（0で無制限）
    #[serde(default = "default_max_conns_per_server")]
    pub max_conns_per_server: usize,

    /// 接続タイムアウト（秒）
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// TLSハンドシェイクタイムアウト（秒）
    ///
    /// 接続確立の予算に合算されます
    #[serde(default = "default_tls_handshake_timeout_secs")]
    pub tls_handshake_timeout_secs: u64,

    /// アイドル接続の保持時間（秒）
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// DNS再解決の間隔（秒）
    #[serde(default = "default_resolve_interval_secs")]
    pub resolve_interval_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            max_conns_per_server: default_max_conns_per_server(),
            dial_timeout_secs: default_dial_timeout_secs(),
            tls_handshake_timeout_secs: default_tls_handshake_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            resolve_interval_secs: default_resolve_interval_secs(),
        }
    }
}

impl UpstreamSettings {
    /// 接続確立全体のタイムアウト（TCP + TLS）
    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs + self.tls_handshake_timeout_secs)
    }

    /// アイドル接続の保持時間
    #[inline]
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// DNS再解決の間隔
    #[inline]
    pub fn resolve_interval(&self) -> Duration {
        Duration::from_secs(self.resolve_interval_secs)
    }
}

/// ロケーション設定
///
/// リクエストのホスト名をキャッシュゾーンとアップストリームに対応付けます。
#[derive(Deserialize, Clone, Debug)]
pub struct LocationConfig {
    /// ロケーション名（ホスト名）
    pub name: String,

    /// エビクション名前空間
    ///
    /// 省略時はロケーション名が使われます
    #[serde(default)]
    pub cache_key: Option<String>,

    /// 使用するキャッシュゾーンのID
    pub cache_zone: String,

    /// 使用するアップストリームのID
    pub upstream: String,

    /// Cache-Control等が無い場合のデフォルトTTL（秒）
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// オブジェクトIDにクエリ文字列を含めるか
    #[serde(default = "default_true")]
    pub include_query: bool,

    /// 待機者が居なくなったらフェッチを中断する
    #[serde(default)]
    pub abort_on_lone_cancel: bool,
}

impl LocationConfig {
    /// 実効キャッシュキーを取得
    #[inline]
    pub fn effective_cache_key(&self) -> &str {
        self.cache_key.as_deref().unwrap_or(&self.name)
    }
}

impl Config {
    /// JSONファイルから設定を読み込む
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(CacheError::from_io)?;
        let cfg: Config = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| CacheError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 設定の静的バリデーション
    pub fn validate(&self) -> Result<()> {
        let mut zone_ids = HashSet::new();
        for zone in &self.cache_zones {
            if zone.part_size == 0 {
                return Err(CacheError::Config(format!(
                    "cache zone `{}` has part_size 0",
                    zone.id
                )));
            }
            if zone.storage_objects == 0 {
                return Err(CacheError::Config(format!(
                    "cache zone `{}` has storage_objects 0",
                    zone.id
                )));
            }
            if !zone_ids.insert(&zone.id) {
                return Err(CacheError::Config(format!(
                    "duplicate cache zone id `{}`",
                    zone.id
                )));
            }
        }

        let mut upstream_ids = HashSet::new();
        for up in &self.upstreams {
            if up.addresses.is_empty() {
                return Err(CacheError::Config(format!(
                    "upstream `{}` has no addresses",
                    up.id
                )));
            }
            if !upstream_ids.insert(&up.id) {
                return Err(CacheError::Config(format!(
                    "duplicate upstream id `{}`",
                    up.id
                )));
            }
        }

        let mut location_names = HashSet::new();
        for loc in &self.locations {
            if !zone_ids.contains(&loc.cache_zone) {
                return Err(CacheError::Config(format!(
                    "location `{}` references unknown cache zone `{}`",
                    loc.name, loc.cache_zone
                )));
            }
            if !upstream_ids.contains(&loc.upstream) {
                return Err(CacheError::Config(format!(
                    "location `{}` references unknown upstream `{}`",
                    loc.name, loc.upstream
                )));
            }
            if !location_names.insert(&loc.name) {
                return Err(CacheError::Config(format!(
                    "duplicate location `{}`",
                    loc.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "cache_zones": [
                {"id": "default", "path": "/var/cache/kura/default", "part_size": 4096}
            ],
            "upstreams": [
                {"id": "origin", "addresses": ["http://127.0.0.1:8080"]}
            ],
            "locations": [
                {"name": "example.com", "cache_zone": "default", "upstream": "origin"}
            ]
        }"#
    }

    #[test]
    fn test_parse_weighted_addresses() {
        let json = r#"{
            "id": "origin",
            "addresses": [
                "http://plain:8080",
                {"address": "http://heavy:8080", "weight": 4}
            ]
        }"#;
        let cfg: UpstreamConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.addresses[0].address(), "http://plain:8080");
        assert_eq!(cfg.addresses[0].weight(), 1);
        assert_eq!(cfg.addresses[1].address(), "http://heavy:8080");
        assert_eq!(cfg.addresses[1].weight(), 4);
    }

    #[test]
    fn test_parse_defaults() {
        let cfg: Config = serde_json::from_str(sample_json()).unwrap();
        cfg.validate().unwrap();

        let zone = &cfg.cache_zones[0];
        assert_eq!(zone.part_size, 4096);
        assert_eq!(zone.algorithm, "lru");
        assert_eq!(zone.bulk_remove_count, 100);
        assert!(!zone.skip_cache_key_in_path);
        assert_eq!(zone.dir_permissions, 0o700);

        let up = &cfg.upstreams[0];
        assert_eq!(up.balancing, "round-robin");
        assert_eq!(up.settings.dial_timeout_secs, 10);

        let loc = &cfg.locations[0];
        assert_eq!(loc.effective_cache_key(), "example.com");
        assert_eq!(loc.default_ttl_secs, 300);
        assert!(loc.include_query);
    }

    #[test]
    fn test_validate_zero_part_size() {
        let mut cfg: Config = serde_json::from_str(sample_json()).unwrap();
        cfg.cache_zones[0].part_size = 0;
        assert!(matches!(cfg.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_validate_unknown_zone_reference() {
        let mut cfg: Config = serde_json::from_str(sample_json()).unwrap();
        cfg.locations[0].cache_zone = "nope".to_string();
        assert!(matches!(cfg.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let mut cfg: Config = serde_json::from_str(sample_json()).unwrap();
        let dup = cfg.cache_zones[0].clone();
        cfg.cache_zones.push(dup);
        assert!(matches!(cfg.validate(), Err(CacheError::Config(_))));
    }
}
