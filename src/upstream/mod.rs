//! アップストリーム
//!
//! バックエンドへのHTTP/1.1クライアントです。リクエストごとに
//! バランサーがバックエンドを1台選び、`Range`ヘッダー付きの
//! GETリクエストを送信します。
//!
//! `max_conns_per_server`が設定されている場合はセマフォで
//! 同時リクエスト数を制限します。許可はレスポンスボディの
//! 読み終わりまで保持されます。

pub mod balancing;
pub mod resolver;

use crate::config::UpstreamConfig;
use crate::error::{CacheError, Result};
use crate::types::Headers;
use balancing::Balancer;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HOST, RANGE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

/// アップストリームクライアント
pub struct Upstream {
    id: String,
    client: reqwest::Client,
    balancer: Arc<dyn Balancer>,
    limiter: Option<Arc<Semaphore>>,
    addresses: Vec<crate::config::AddressConfig>,
    resolve_interval: Duration,
}

impl Upstream {
    /// 設定からアップストリームを構築
    ///
    /// バックエンドリストは設定のURLで初期化され、`spawn_resolver`で
    /// 起動するリゾルバが解決済みアドレスへ置き換えます。
    pub fn new(cfg: &UpstreamConfig) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .connect_timeout(cfg.settings.connect_timeout())
            .pool_idle_timeout(cfg.settings.keepalive())
            .tcp_keepalive(cfg.settings.keepalive())
            .build()
            .map_err(|e| CacheError::Config(format!("cannot build HTTP client: {}", e)))?;

        let balancer = balancing::new(&cfg.balancing)?;
        balancer.set_backends(resolver::literal_backends(&cfg.addresses)?);

        let limiter = if cfg.settings.max_conns_per_server > 0 {
            Some(Arc::new(Semaphore::new(cfg.settings.max_conns_per_server)))
        } else {
            None
        };

        Ok(Arc::new(Self {
            id: cfg.id.clone(),
            client,
            balancer,
            limiter,
            addresses: cfg.addresses.clone(),
            resolve_interval: cfg.settings.resolve_interval(),
        }))
    }

    /// アップストリームID
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// DNSリゾルバタスクを起動
    pub fn spawn_resolver(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        resolver::spawn(
            Arc::clone(&self.balancer),
            self.addresses.clone(),
            self.resolve_interval,
            shutdown,
        )
    }

    /// バックエンドへGETリクエストを送る
    ///
    /// `range`は閉区間`[start, end]`で、`Range: bytes=start-end`として
    /// 送信されます。`extra_headers`は条件付きリクエスト等に使います。
    pub async fn fetch(
        &self,
        uri: &str,
        range: Option<(u64, u64)>,
        extra_headers: &[(String, String)],
    ) -> Result<UpstreamResponse> {
        // 接続数制限はボディの読み終わりまで保持する
        let permit = match &self.limiter {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| CacheError::Cancelled)?,
            ),
            None => None,
        };

        let backend = self
            .balancer
            .get(uri)
            .ok_or_else(|| CacheError::UpstreamTransport("no backends available".to_string()))?;

        let url = backend
            .url
            .join(uri)
            .map_err(|e| CacheError::UpstreamTransport(format!("bad request uri {}: {}", uri, e)))?;

        let mut request = self.client.get(url).header(HOST, backend.host.clone());
        if let Some((start, end)) = range {
            request = request.header(RANGE, format!("bytes={}-{}", start, end));
        }
        for (name, value) in extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        Ok(UpstreamResponse {
            inner: response,
            permit,
        })
    }
}

/// アップストリームのレスポンス
#[derive(Debug)]
pub struct UpstreamResponse {
    inner: reqwest::Response,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl UpstreamResponse {
    /// ステータスコード
    #[inline]
    pub fn code(&self) -> u16 {
        self.inner.status().as_u16()
    }

    /// ヘッダーをマルチマップ形式で取得（名前は小文字）
    pub fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in self.inner.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_ascii_lowercase())
                    .or_default()
                    .push(value.to_string());
            }
        }
        headers
    }

    /// Content-Lengthヘッダーの値
    pub fn content_length(&self) -> Option<u64> {
        self.inner
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    /// Content-Rangeヘッダーの`(start, end, total)`
    pub fn content_range(&self) -> Option<(u64, u64, u64)> {
        let value = self
            .inner
            .headers()
            .get(reqwest::header::CONTENT_RANGE)?
            .to_str()
            .ok()?;
        parse_content_range(value)
    }

    /// ボディのストリームを取得
    ///
    /// 接続数制限の許可はストリームが読み終わるまで保持されます。
    pub fn bytes_stream(self) -> impl Stream<Item = Result<Bytes>> {
        let permit = self.permit;
        self.inner.bytes_stream().map(move |chunk| {
            let _ = &permit;
            chunk.map_err(CacheError::from)
        })
    }
}

/// `Content-Range: bytes S-E/T`をパースする
fn parse_content_range(value: &str) -> Option<(u64, u64, u64)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let total: u64 = total.trim().parse().ok()?;
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    Some((start, end, total))
}
