//! DNSリゾルバ
//!
//! 設定されたホスト名を定期的に再解決し、結果が変わったときに
//! バランサーのバックエンドリストを原子的に差し替えます。
//! 解決に失敗したアドレスは前回の結果を維持します。

use super::balancing::{Backend, Balancer};
use crate::config::AddressConfig;
use crate::error::{CacheError, Result};
use ftlog::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

/// アドレス設定をそのままバックエンドに変換する（名前解決なし）
///
/// リゾルバの初回実行が終わるまでの初期リストとして使います。
pub fn literal_backends(addresses: &[AddressConfig]) -> Result<Vec<Backend>> {
    addresses
        .iter()
        .map(|addr| {
            let url = Url::parse(addr.address()).map_err(|e| {
                CacheError::Config(format!("invalid upstream address `{}`: {}", addr.address(), e))
            })?;
            if url.host_str().is_none() {
                return Err(CacheError::Config(format!(
                    "upstream address `{}` has no host",
                    addr.address()
                )));
            }
            Ok(Backend::with_weight(url, addr.weight()))
        })
        .collect()
}

/// 1アドレスを解決してバックエンドを作る
///
/// httpのURLはホスト部を解決済みIPに置き換えます。httpsはTLSの
/// サーバー名検証があるためホスト名のままにします。
async fn resolve_one(addr: &AddressConfig) -> Result<Backend> {
    let url = Url::parse(addr.address()).map_err(|e| {
        CacheError::Config(format!("invalid upstream address `{}`: {}", addr.address(), e))
    })?;
    let host = url
        .host_str()
        .ok_or_else(|| CacheError::Config(format!("address `{}` has no host", addr.address())))?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(80);

    // IPリテラルやhttpsはそのまま使う
    if url.scheme() != "http" || host.parse::<std::net::IpAddr>().is_ok() {
        return Ok(Backend::with_weight(url, addr.weight()));
    }

    let resolved = lookup_host((host.as_str(), port))
        .await
        .map_err(|e| CacheError::UpstreamTransport(format!("cannot resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| {
            CacheError::UpstreamTransport(format!("no addresses resolved for {}", host))
        })?;

    let mut resolved_url = url;
    resolved_url
        .set_ip_host(resolved.ip())
        .map_err(|_| CacheError::UpstreamTransport(format!("cannot rewrite host for {}", host)))?;

    let mut backend = Backend::with_weight(resolved_url, addr.weight());
    // Hostヘッダーには元のホスト名を残す
    backend.host = host;
    Ok(backend)
}

/// 定期再解決タスクを起動
pub fn spawn(
    balancer: Arc<dyn Balancer>,
    addresses: Vec<AddressConfig>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // アドレスごとの前回の解決結果
        let mut last: HashMap<String, Backend> = HashMap::new();
        let mut current_urls: Vec<String> = Vec::new();

        loop {
            let mut backends = Vec::with_capacity(addresses.len());
            for addr in &addresses {
                match resolve_one(addr).await {
                    Ok(backend) => {
                        last.insert(addr.address().to_string(), backend.clone());
                        backends.push(backend);
                    }
                    Err(e) => {
                        warn!("[Resolver] {}", e);
                        if let Some(prev) = last.get(addr.address()) {
                            backends.push(prev.clone());
                        }
                    }
                }
            }

            if !backends.is_empty() {
                let urls: Vec<String> =
                    backends.iter().map(|b| b.url.as_str().to_string()).collect();
                if urls != current_urls {
                    info!("[Resolver] backend list changed: {:?}", urls);
                    current_urls = urls;
                    balancer.set_backends(backends);
                } else {
                    debug!("[Resolver] backend list unchanged");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}
