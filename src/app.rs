//! アプリケーション
//!
//! 設定からキャッシュゾーン・アップストリーム・ロケーションを
//! 組み立て、パージと統計の管理操作を提供します。
//! グローバルな状態はここに限定され、各コンポーネントへは
//! 明示的に渡されます。

use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::handler::{CacheResponse, Fetcher};
use crate::types::ObjectId;
use crate::upstream::Upstream;
use crate::zone::CacheZone;
use crate::cache::CacheStats;
use ftlog::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

/// ロケーション
///
/// 1つのホスト名をキャッシュゾーンとアップストリームへ対応付け、
/// リクエストURLからオブジェクトIDを導出します。
pub struct Location {
    name: String,
    cache_key: String,
    include_query: bool,
    zone: Arc<CacheZone>,
    fetcher: Fetcher,
}

impl Location {
    /// ロケーション名（ホスト名）
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// このロケーションのゾーン
    #[inline]
    pub fn zone(&self) -> &Arc<CacheZone> {
        &self.zone
    }

    /// URLのパスとクエリからオブジェクトIDを導出する
    pub fn object_id_for(&self, path: &str, query: Option<&str>) -> ObjectId {
        let key_path = match query {
            Some(query) if self.include_query && !query.is_empty() => {
                format!("{}?{}", path, query)
            }
            _ => path.to_string(),
        };
        ObjectId::new(&self.cache_key, &key_path)
    }

    /// リクエストを処理する
    ///
    /// `range`は閉区間のバイトレンジです。レスポンスのボディは
    /// チャネル経由でバイト順にストリームされます。
    pub async fn serve(
        &self,
        path: &str,
        query: Option<&str>,
        range: Option<(u64, u64)>,
    ) -> Result<CacheResponse> {
        let uri = match query {
            Some(query) if !query.is_empty() => format!("{}?{}", path, query),
            _ => path.to_string(),
        };
        let request = crate::handler::CacheRequest {
            object_id: self.object_id_for(path, query),
            uri,
            range,
        };
        self.fetcher.serve(request).await
    }
}

/// アプリケーション全体の統計情報
#[derive(Debug, Clone)]
pub struct AppStats {
    /// ゾーンごとの統計
    pub zones: Vec<CacheStats>,
    /// 稼働時間（秒）
    pub uptime_secs: u64,
    /// バージョン文字列
    pub version: String,
}

/// アプリケーション
pub struct Application {
    zones: HashMap<String, Arc<CacheZone>>,
    locations: HashMap<String, Arc<Location>>,
    started: Instant,
    shutdown: watch::Sender<bool>,
    reload_handles: Mutex<Vec<JoinHandle<()>>>,
    #[allow(dead_code)]
    resolver_handles: Vec<JoinHandle<()>>,
}

impl Application {
    /// 設定からアプリケーションを組み立てる
    ///
    /// 各ゾーンのストレージリロードとアップストリームのDNSリゾルバは
    /// バックグラウンドで開始されます。Tokioランタイム上で呼び出す
    /// 必要があります。
    pub fn new(cfg: &Config) -> Result<Arc<Self>> {
        cfg.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut zones = HashMap::new();
        let mut reload_handles = Vec::new();
        for zone_cfg in &cfg.cache_zones {
            let zone = CacheZone::new(zone_cfg, shutdown_rx.clone())?;
            reload_handles.push(zone.reload(shutdown_rx.clone()));
            zones.insert(zone_cfg.id.clone(), zone);
        }

        let mut upstreams: HashMap<String, Arc<Upstream>> = HashMap::new();
        let mut resolver_handles = Vec::new();
        for upstream_cfg in &cfg.upstreams {
            let upstream = Upstream::new(upstream_cfg)?;
            resolver_handles.push(upstream.spawn_resolver(shutdown_rx.clone()));
            upstreams.insert(upstream_cfg.id.clone(), upstream);
        }

        let mut locations = HashMap::new();
        for loc_cfg in &cfg.locations {
            // validate()が参照整合性を保証している
            let zone = Arc::clone(&zones[&loc_cfg.cache_zone]);
            let upstream = Arc::clone(&upstreams[&loc_cfg.upstream]);
            let fetcher = Fetcher::new(
                Arc::clone(&zone),
                upstream,
                Duration::from_secs(loc_cfg.default_ttl_secs),
                loc_cfg.abort_on_lone_cancel,
                shutdown_rx.clone(),
            );
            locations.insert(
                loc_cfg.name.clone(),
                Arc::new(Location {
                    name: loc_cfg.name.clone(),
                    cache_key: loc_cfg.effective_cache_key().to_string(),
                    include_query: loc_cfg.include_query,
                    zone,
                    fetcher,
                }),
            );
        }

        info!(
            "[Application] initialized with {} zones, {} locations",
            zones.len(),
            locations.len()
        );

        Ok(Arc::new(Self {
            zones,
            locations,
            started: Instant::now(),
            shutdown: shutdown_tx,
            reload_handles: Mutex::new(reload_handles),
            resolver_handles,
        }))
    }

    /// ホスト名からロケーションを引く
    pub fn location(&self, host: &str) -> Option<Arc<Location>> {
        self.locations.get(host).cloned()
    }

    /// IDからゾーンを引く
    pub fn zone(&self, id: &str) -> Option<Arc<CacheZone>> {
        self.zones.get(id).cloned()
    }

    /// URLに対するリクエストを処理する
    pub async fn serve(&self, url: &Url, range: Option<(u64, u64)>) -> Result<CacheResponse> {
        let host = url.host_str().ok_or(CacheError::NotFound)?;
        let location = self.location(host).ok_or(CacheError::NotFound)?;
        location.serve(url.path(), url.query(), range).await
    }

    /// URLのリストをパージする
    ///
    /// 戻り値はURLごとの「パージ前に存在したか」です。ロケーションが
    /// 設定されていないURLは結果に含まれません。
    pub async fn purge(&self, urls: &[String]) -> HashMap<String, bool> {
        let mut results = HashMap::new();

        for raw_url in urls {
            let url = match Url::parse(raw_url) {
                Ok(url) => url,
                Err(_) => continue,
            };
            let location = match url.host_str().and_then(|host| self.location(host)) {
                Some(location) => location,
                None => {
                    info!(
                        "[Application] purge requested for unconfigured location: {}",
                        raw_url
                    );
                    continue;
                }
            };

            let object_id = location.object_id_for(url.path(), url.query());
            let zone = Arc::clone(location.zone());
            let purged = tokio::task::spawn_blocking(move || zone.purge_object(&object_id)).await;

            match purged {
                Ok(Ok(existed)) => {
                    results.insert(raw_url.clone(), existed);
                }
                Ok(Err(e)) => {
                    warn!("[Application] purge of {} failed: {}", raw_url, e);
                    results.insert(raw_url.clone(), false);
                }
                Err(e) => {
                    warn!("[Application] purge task for {} failed: {}", raw_url, e);
                    results.insert(raw_url.clone(), false);
                }
            }
        }

        results
    }

    /// 統計情報を取得する
    pub fn stats(&self) -> AppStats {
        let mut zones: Vec<CacheStats> = self.zones.values().map(|zone| zone.stats()).collect();
        zones.sort_by(|a, b| a.id.cmp(&b.id));

        AppStats {
            zones,
            uptime_secs: self.started.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// 全ゾーンのストレージリロードの完了を待つ
    pub async fn wait_for_reload(&self) {
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.reload_handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// シャットダウンを通知する
    ///
    /// スケジューラ・リゾルバ・リロードタスクが停止します。
    /// 実行中のフェッチは完了まで継続されます。
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
