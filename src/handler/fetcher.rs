//! パートフェッチャー
//!
//! リクエストされたバイトレンジをパート列に変換し、各パートを
//! ストアから読むか、シングルフライトでアップストリームから
//! 取得してレスポンスを組み立てます。
//!
//! ## コールドスタート
//!
//! メタデータが無い場合、リーダーのデータリクエストが発見を兼ねます。
//! レスポンスヘッダーからメタデータを構築・永続化し、ボディは
//! そのままパートへ分割されて待機者全員に配られます。アップストリーム
//! への往復は1回で済みます。
//!
//! ## キャンセル
//!
//! クライアントが切断してもリーダーのフェッチは継続し、他の待機者と
//! キャッシュへの保存を完了させます。`abort_on_lone_cancel`が有効で
//! 待機者が居なくなった場合のみフェッチを中断します。

use super::policy;
use super::singleflight::{Claim, Flight};
use super::{MetaOutcome, PartOutcome};
use crate::error::{CacheError, Result};
use crate::types::range::{part_byte_range, part_size_of, parts_for};
use crate::types::{unix_now, ObjectId, ObjectIndex, ObjectMetadata};
use crate::upstream::{Upstream, UpstreamResponse};
use crate::zone::CacheZone;
use bytes::{Bytes, BytesMut};
use ftlog::{debug, warn};
use futures::StreamExt;
use std::collections::VecDeque;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;

/// ボディチャネルのバッファ（パート数単位）
const BODY_CHANNEL_DEPTH: usize = 4;

/// キャッシュ層へのリクエスト
pub struct CacheRequest {
    /// オブジェクトID（キャッシュキー + 正規化済みパス）
    pub object_id: ObjectId,
    /// アップストリームへ送るリクエストURI（パス + クエリ）
    pub uri: String,
    /// クライアントの要求レンジ（閉区間）
    pub range: Option<(u64, u64)>,
}

/// キャッシュ層からのレスポンス
///
/// `code`はオブジェクトのステータスです。レンジリクエストに対する
/// 206への変換やContent-Rangeヘッダーの生成は外側のHTTP層が行います。
pub struct CacheResponse {
    /// ステータスコード
    pub code: u16,
    /// レスポンスヘッダー
    pub headers: crate::types::Headers,
    /// オブジェクト全体のサイズ
    pub object_size: u64,
    /// 実際に返すレンジ（クランプ後、レンジリクエストの場合のみ）
    pub range: Option<(u64, u64)>,
    /// ボディのチャネル
    pub body: mpsc::Receiver<Result<Bytes>>,
}

impl CacheResponse {
    /// ボディを最後まで読み切る（テスト・小オブジェクト用）
    pub async fn read_body(mut self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.body.recv().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(collected.freeze())
    }
}

/// パートフェッチャー
#[derive(Clone)]
pub struct Fetcher {
    zone: Arc<CacheZone>,
    upstream: Arc<Upstream>,
    default_ttl: Duration,
    abort_on_lone_cancel: bool,
    shutdown: watch::Receiver<bool>,
}

impl Fetcher {
    /// フェッチャーを構築
    pub fn new(
        zone: Arc<CacheZone>,
        upstream: Arc<Upstream>,
        default_ttl: Duration,
        abort_on_lone_cancel: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            zone,
            upstream,
            default_ttl,
            abort_on_lone_cancel,
            shutdown,
        }
    }

    /// リクエストを処理してレスポンスを返す
    ///
    /// ボディはチャネル経由でバイト順にストリームされます。
    pub async fn serve(&self, request: CacheRequest) -> Result<CacheResponse> {
        let meta = self.load_metadata(&request).await?;
        if !meta.is_cacheable {
            debug!("[Fetcher] {} is not cacheable, bypassing store", meta.id);
            return self.bypass(&request).await;
        }

        // レンジをオブジェクトサイズにクランプする
        let (start, end) = match request.range {
            Some((start, end)) => (start, end.min(meta.size.saturating_sub(1))),
            None => (0, meta.size.saturating_sub(1)),
        };

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
        let response = CacheResponse {
            code: meta.code,
            headers: meta.headers.clone(),
            object_size: meta.size,
            range: request.range.map(|_| (start, end)),
            body: rx,
        };

        if meta.size == 0 || start > end {
            // 空ボディ（送信側がdropされチャネルは即EOFになる）
            return Ok(response);
        }

        let fetcher = self.clone();
        let uri = request.uri.clone();
        tokio::spawn(async move {
            fetcher.stream_to_client(meta, uri, start, end, tx).await;
        });

        Ok(response)
    }

    /// パート列を順番にクライアントへ流す
    ///
    /// パート単位で取得し、リクエスト範囲との交差部分だけを送ります。
    /// クライアント切断時は送信を止めるだけで、進行中の共有フェッチは
    /// 継続します。
    async fn stream_to_client(
        &self,
        meta: ObjectMetadata,
        uri: String,
        start: u64,
        end: u64,
        tx: mpsc::Sender<Result<Bytes>>,
    ) {
        let ps = self.zone.part_size();
        let indices = parts_for(start, end, ps);
        let last_wanted = *indices.last().unwrap_or(&0);

        for part in indices {
            let bytes = match self.part_bytes(&meta, &uri, part, last_wanted).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let (part_start, part_end) = match part_byte_range(part, meta.size, ps) {
                Some(range) => range,
                None => break,
            };
            let lo = (start.max(part_start) - part_start) as usize;
            let hi = (((end.min(part_end) - part_start) + 1) as usize).min(bytes.len());
            if lo >= hi {
                continue;
            }

            if tx.send(Ok(bytes.slice(lo..hi))).await.is_err() {
                return;
            }
        }
    }

    /// 1パート分のバイト列を取得する
    ///
    /// ストアのヒットを優先し、ミス時はシングルフライトで
    /// アップストリームから取得します。リーダーは`last_wanted`までの
    /// 連続した欠損パートを1回のレンジリクエストにまとめます。
    async fn part_bytes(
        &self,
        meta: &ObjectMetadata,
        uri: &str,
        part: u32,
        last_wanted: u32,
    ) -> Result<Bytes> {
        let idx = ObjectIndex::new(meta.id.clone(), part);
        // 1アクセスにつき1回だけ参照として数える
        let resident = self.zone.algorithm.lookup(&idx);

        loop {
            match self.read_part(&idx).await {
                Ok(bytes) => {
                    if resident {
                        self.zone.algorithm.promote(&idx);
                    } else {
                        // クラッシュ回復などで登録から漏れたパートを拾う
                        let _ = self.zone.algorithm.add_object(&idx);
                    }
                    return Ok(bytes);
                }
                Err(e) if e.is_not_found() => {}
                Err(CacheError::Corrupt(message)) => {
                    // 壊れたパートはget_partが破棄済みなので取り直す
                    warn!("[Fetcher] corrupt part {}: {}", idx, message);
                }
                Err(e) => return Err(e),
            }

            match self.zone.part_flights.claim(&idx) {
                Claim::Follower(flight) => match flight.wait().await {
                    PartOutcome::Done(bytes) => return Ok(bytes),
                    PartOutcome::Failed(e) => return Err(e.duplicate()),
                },
                Claim::Leader(flight) => {
                    let run = self.claim_run(meta, part, last_wanted, &flight).await;
                    let first_flight = Arc::clone(&flight);

                    let fetcher = self.clone();
                    let meta = meta.clone();
                    let uri = uri.to_string();
                    tokio::spawn(async move {
                        fetcher.lead_fetch(meta, uri, run).await;
                    });

                    match first_flight.wait().await {
                        PartOutcome::Done(bytes) => return Ok(bytes),
                        PartOutcome::Failed(e) => return Err(e.duplicate()),
                    }
                }
            }
        }
    }

    /// リーダーが担当する連続パート列を確保する
    ///
    /// `first`から始めて、ディスクに無く、かつ他のリーダーが
    /// フェッチしていないパートが続く限りフェッチ権を取ります。
    async fn claim_run(
        &self,
        meta: &ObjectMetadata,
        first: u32,
        last_wanted: u32,
        first_flight: &Arc<Flight<PartOutcome>>,
    ) -> Vec<(u32, Arc<Flight<PartOutcome>>)> {
        let mut run = vec![(first, Arc::clone(first_flight))];

        let available: std::collections::HashSet<u32> = {
            let zone = Arc::clone(&self.zone);
            let id = meta.id.clone();
            tokio::task::spawn_blocking(move || zone.storage.get_available_parts(&id))
                .await
                .ok()
                .and_then(|parts| parts.ok())
                .map(|parts| parts.into_iter().map(|idx| idx.part).collect())
                .unwrap_or_default()
        };

        for next in (first + 1)..=last_wanted {
            if available.contains(&next) {
                break;
            }
            let next_idx = ObjectIndex::new(meta.id.clone(), next);
            match self.zone.part_flights.claim(&next_idx) {
                Claim::Leader(flight) => run.push((next, flight)),
                Claim::Follower(_) => break,
            }
        }

        run
    }

    /// リーダーフェッチの実行
    ///
    /// 担当パート列を覆うレンジリクエストを1回送り、ボディを
    /// パートへ分割しながらハンドルを完了させていきます。
    async fn lead_fetch(
        &self,
        meta: ObjectMetadata,
        uri: String,
        run: Vec<(u32, Arc<Flight<PartOutcome>>)>,
    ) {
        let ps = self.zone.part_size();
        let first = run[0].0;
        let last = run[run.len() - 1].0;

        let start = first as u64 * ps;
        let end = match part_byte_range(last, meta.size, ps) {
            Some((_, end)) => end,
            None => {
                self.fail_run(&meta, run.into(), CacheError::InvalidSize);
                return;
            }
        };

        debug!(
            "[Fetcher] leader fetching parts {}..={} of {} (bytes {}-{})",
            first, last, meta.id, start, end
        );

        match self.upstream.fetch(&uri, Some((start, end)), &[]).await {
            Ok(resp) => match resp.code() {
                206 => {
                    let body_start = resp.content_range().map(|(s, _, _)| s).unwrap_or(start);
                    self.stream_into_parts(&meta, resp, body_start, run.into()).await;
                }
                200 => {
                    // レンジ未対応のアップストリームは全体を返してくる
                    self.stream_into_parts(&meta, resp, 0, run.into()).await;
                }
                code => self.fail_run(&meta, run.into(), CacheError::Upstream(code)),
            },
            Err(e) => self.fail_run(&meta, run.into(), e),
        }
    }

    /// アップストリームのボディをパートへ分割する
    ///
    /// `body_start`はボディ先頭のオブジェクト内オフセットです。
    /// 完成したパートから順にアドミッション・永続化・完了通知を
    /// 行います。ボディが途中で尽きた場合、残りのハンドルは失敗します。
    async fn stream_into_parts(
        &self,
        meta: &ObjectMetadata,
        resp: UpstreamResponse,
        body_start: u64,
        mut remaining: VecDeque<(u32, Arc<Flight<PartOutcome>>)>,
    ) {
        let ps = self.zone.part_size();
        let first_start = match remaining.front() {
            Some((part, _)) => *part as u64 * ps,
            None => return,
        };

        if body_start > first_start {
            self.fail_run(
                meta,
                remaining,
                CacheError::UpstreamTransport(format!(
                    "response body starts at {} but part run starts at {}",
                    body_start, first_start
                )),
            );
            return;
        }

        let mut to_skip = first_start - body_start;
        let mut buffer = BytesMut::new();
        let mut stream = resp.bytes_stream();
        let mut shutdown = self.shutdown.clone();

        while let Some((part, flight)) = remaining.front().cloned() {
            let expected = part_size_of(part, meta.size, ps) as usize;

            // 現在のパートが完成するまでチャンクを読み進める
            while buffer.len() < expected {
                let chunk = tokio::select! {
                    chunk = stream.next() => chunk,
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            self.fail_run(meta, remaining, CacheError::Cancelled);
                            return;
                        }
                        continue;
                    }
                };
                match chunk {
                    Some(Ok(mut chunk)) => {
                        if to_skip > 0 {
                            if (chunk.len() as u64) <= to_skip {
                                to_skip -= chunk.len() as u64;
                                continue;
                            }
                            chunk = chunk.slice(to_skip as usize..);
                            to_skip = 0;
                        }
                        buffer.extend_from_slice(&chunk);
                    }
                    Some(Err(e)) => {
                        self.fail_run(meta, remaining, e);
                        return;
                    }
                    None => {
                        self.fail_run(
                            meta,
                            remaining,
                            CacheError::UpstreamTransport(
                                "upstream body ended short of the declared length".to_string(),
                            ),
                        );
                        return;
                    }
                }
            }

            let bytes = buffer.split_to(expected).freeze();
            self.complete_part(meta, part, &flight, bytes).await;
            remaining.pop_front();

            // 待機者が誰も居なくなったら中断できる
            if self.abort_on_lone_cancel
                && !remaining.is_empty()
                && remaining.iter().all(|(_, f)| f.waiter_count() == 0)
            {
                debug!("[Fetcher] no waiters left for {}, aborting fetch", meta.id);
                self.fail_run(meta, remaining, CacheError::Cancelled);
                return;
            }
        }
    }

    /// 完成した1パートの後処理
    ///
    /// アドミッションに通った場合のみ永続化し、結果に関わらず
    /// バイト列は待機者全員へ配られます。
    async fn complete_part(
        &self,
        meta: &ObjectMetadata,
        part: u32,
        flight: &Arc<Flight<PartOutcome>>,
        bytes: Bytes,
    ) {
        let idx = ObjectIndex::new(meta.id.clone(), part);

        if self.zone.algorithm.should_keep(&idx) {
            let zone = Arc::clone(&self.zone);
            let save_idx = idx.clone();
            let data = bytes.clone();
            let saved = tokio::task::spawn_blocking(move || {
                zone.storage.save_part(&save_idx, &mut Cursor::new(data))
            })
            .await;

            match saved {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_already_exists() => {}
                Ok(Err(e)) => {
                    // 永続化できなかったパートを残存扱いにしない
                    if !e.is_not_found() {
                        warn!("[Fetcher] cannot persist part {}: {}", idx, e);
                    }
                    self.zone.algorithm.remove(std::slice::from_ref(&idx));
                }
                Err(e) => {
                    warn!("[Fetcher] part persist task failed for {}: {}", idx, e);
                    self.zone.algorithm.remove(std::slice::from_ref(&idx));
                }
            }
        }

        flight.complete(PartOutcome::Done(bytes));
        self.zone.part_flights.finish(&idx);
    }

    /// 残りのハンドルを失敗として完了させる
    fn fail_run(
        &self,
        meta: &ObjectMetadata,
        remaining: VecDeque<(u32, Arc<Flight<PartOutcome>>)>,
        error: CacheError,
    ) {
        if !matches!(error, CacheError::Cancelled) {
            warn!("[Fetcher] fetch for {} failed: {}", meta.id, error);
        }
        let shared = Arc::new(error);
        for (part, flight) in remaining {
            let idx = ObjectIndex::new(meta.id.clone(), part);
            flight.complete(PartOutcome::Failed(Arc::clone(&shared)));
            self.zone.part_flights.finish(&idx);
        }
    }

    /// メタデータを取得または発見する
    async fn load_metadata(&self, request: &CacheRequest) -> Result<ObjectMetadata> {
        let id = request.object_id.clone();

        loop {
            match self.read_metadata(&id).await {
                Ok(meta) => {
                    if meta.is_fresh() {
                        return Ok(meta);
                    }
                    if meta.is_cacheable {
                        return self.revalidate(meta, request).await;
                    }
                    // キャッシュ不可の記録も鮮度切れで取り直す
                    let zone = Arc::clone(&self.zone);
                    let discard_id = id.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        zone.storage.discard(&discard_id)
                    })
                    .await;
                }
                Err(e) if e.is_not_found() => {}
                Err(CacheError::Corrupt(message)) => {
                    // 壊れたオブジェクトは破棄して取り直す
                    warn!("[Fetcher] corrupt metadata for {}: {}", id, message);
                    let zone = Arc::clone(&self.zone);
                    let discard_id = id.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        zone.storage.discard(&discard_id)
                    })
                    .await;
                }
                Err(e) => return Err(e),
            }

            match self.zone.meta_flights.claim(&id) {
                Claim::Follower(flight) => match flight.wait().await {
                    MetaOutcome::Done(meta) => return Ok(meta),
                    MetaOutcome::Failed(e) => return Err(e.duplicate()),
                },
                Claim::Leader(flight) => {
                    let result = self.discover(request).await;
                    match &result {
                        Ok(meta) => flight.complete(MetaOutcome::Done(meta.clone())),
                        Err(e) => {
                            flight.complete(MetaOutcome::Failed(Arc::new(e.duplicate())))
                        }
                    }
                    self.zone.meta_flights.finish(&id);
                    return result;
                }
            }
        }
    }

    /// コールドスタート時の発見フェッチ
    ///
    /// リクエスト範囲に合わせた1回のGETがメタデータの発見を兼ねます。
    /// キャッシュ可能な場合、ボディが覆うパートのフェッチ権を確保して
    /// からメタデータを公開するので、後続のリクエストは必ずこのボディ
    /// の分配に合流します。
    async fn discover(&self, request: &CacheRequest) -> Result<ObjectMetadata> {
        let ps = self.zone.part_size();
        let aligned = request.range.map(|(start, end)| {
            // パート境界へ正規化（末尾はアップストリームがクランプする）
            ((start / ps) * ps, ((end / ps) + 1) * ps - 1)
        });

        let resp = self.upstream.fetch(&request.uri, aligned, &[]).await?;
        let code = resp.code();
        let now = unix_now();

        let (size, body_start) = match code {
            200 => (resp.content_length(), 0),
            206 => match resp.content_range() {
                Some((start, _, total)) => (Some(total), start),
                None => {
                    return Err(CacheError::UpstreamTransport(
                        "206 response without content-range".to_string(),
                    ))
                }
            },
            code => return Err(CacheError::Upstream(code)),
        };

        let mut headers = resp.headers();
        strip_entity_headers(&mut headers);

        // サイズが不明（chunked等）な場合はパート分割できないので素通り扱い
        let is_cacheable = policy::is_cacheable_response(code, &headers) && size.is_some();
        let meta = ObjectMetadata {
            id: request.object_id.clone(),
            response_timestamp: now,
            expires_at: policy::expires_at(&headers, now, self.default_ttl),
            size: size.unwrap_or(0),
            headers,
            is_cacheable,
            code: 200,
        };

        // メタデータを公開する前にボディが覆うパートのフェッチ権を取る
        let mut run = VecDeque::new();
        if meta.is_cacheable && meta.size > 0 {
            let covered_start = aligned.map(|(start, _)| start).unwrap_or(0);
            let covered_end = aligned
                .map(|(_, end)| end)
                .unwrap_or(meta.size - 1)
                .min(meta.size - 1);
            for part in parts_for(covered_start, covered_end, ps) {
                let idx = ObjectIndex::new(meta.id.clone(), part);
                match self.zone.part_flights.claim(&idx) {
                    Claim::Leader(flight) => run.push_back((part, flight)),
                    Claim::Follower(_) => break,
                }
            }
        }

        match self.save_metadata(meta.clone()).await {
            Ok(()) => {
                if meta.is_cacheable {
                    self.zone.schedule_expiration(&meta);
                }
            }
            Err(e) if e.is_already_exists() => {}
            Err(e) => warn!("[Fetcher] cannot persist metadata for {}: {}", meta.id, e),
        }

        if !run.is_empty() {
            let fetcher = self.clone();
            let meta_for_body = meta.clone();
            tokio::spawn(async move {
                fetcher
                    .stream_into_parts(&meta_for_body, resp, body_start, run)
                    .await;
            });
        }

        Ok(meta)
    }

    /// 期限切れメタデータの再検証
    ///
    /// 条件付きのゼロバイトレンジプローブを送り、304なら有効期限と
    /// ヘッダーだけを更新してパートを保持します。200/206はオブジェクト
    /// が変わったことを意味するので破棄して発見からやり直します。
    /// 5xxや接続エラーの場合は古いコピーで応答します（stale-if-error）。
    async fn revalidate(
        &self,
        stale: ObjectMetadata,
        request: &CacheRequest,
    ) -> Result<ObjectMetadata> {
        let id = stale.id.clone();
        match self.zone.meta_flights.claim(&id) {
            Claim::Follower(flight) => match flight.wait().await {
                MetaOutcome::Done(meta) => Ok(meta),
                MetaOutcome::Failed(e) => Err(e.duplicate()),
            },
            Claim::Leader(flight) => {
                let result = self.do_revalidate(stale, request).await;
                match &result {
                    Ok(meta) => flight.complete(MetaOutcome::Done(meta.clone())),
                    Err(e) => flight.complete(MetaOutcome::Failed(Arc::new(e.duplicate()))),
                }
                self.zone.meta_flights.finish(&id);
                result
            }
        }
    }

    async fn do_revalidate(
        &self,
        stale: ObjectMetadata,
        request: &CacheRequest,
    ) -> Result<ObjectMetadata> {
        let conditions = policy::conditional_headers(&stale.headers);
        let probe = self
            .upstream
            .fetch(&request.uri, Some((0, 0)), &conditions)
            .await;

        let resp = match probe {
            Ok(resp) => resp,
            Err(e) => {
                warn!(
                    "[Fetcher] revalidation of {} failed ({}), serving stale copy",
                    stale.id, e
                );
                return Ok(stale);
            }
        };

        match resp.code() {
            304 => {
                let now = unix_now();
                let mut refreshed = stale;
                refreshed.response_timestamp = now;

                let mut fresh_headers = resp.headers();
                strip_entity_headers(&mut fresh_headers);
                for (name, values) in fresh_headers {
                    refreshed.headers.insert(name, values);
                }
                refreshed.expires_at =
                    policy::expires_at(&refreshed.headers, now, self.default_ttl);

                // objIDファイルだけを置き換え、パートは保持する
                let zone = Arc::clone(&self.zone);
                let to_save = refreshed.clone();
                let replaced = tokio::task::spawn_blocking(move || {
                    zone.storage.replace_metadata(&to_save)
                })
                .await
                .map_err(join_error)?;
                if let Err(e) = replaced {
                    warn!(
                        "[Fetcher] cannot persist revalidated metadata for {}: {}",
                        refreshed.id, e
                    );
                }

                self.zone.schedule_expiration(&refreshed);
                debug!("[Fetcher] revalidated {} until {}", refreshed.id, refreshed.expires_at);
                Ok(refreshed)
            }
            200 | 206 => {
                // オブジェクトが変わった。古いコピーを破棄して発見し直す
                let zone = Arc::clone(&self.zone);
                let id = stale.id.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    let parts = zone.storage.get_available_parts(&id).unwrap_or_default();
                    let result = zone.storage.discard(&id);
                    zone.algorithm.remove(&parts);
                    result
                })
                .await;
                drop(resp);
                self.discover(request).await
            }
            code if (500..600).contains(&code) => {
                warn!(
                    "[Fetcher] upstream returned {} for revalidation of {}, serving stale copy",
                    code, stale.id
                );
                Ok(stale)
            }
            code => Err(CacheError::Upstream(code)),
        }
    }

    /// キャッシュ不可オブジェクトの素通り転送
    async fn bypass(&self, request: &CacheRequest) -> Result<CacheResponse> {
        let resp = self
            .upstream
            .fetch(&request.uri, request.range, &[])
            .await?;
        let code = resp.code();
        let headers = resp.headers();
        let object_size = resp.content_length().unwrap_or(0);

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    return;
                }
            }
        });

        Ok(CacheResponse {
            code,
            headers,
            object_size,
            range: None,
            body: rx,
        })
    }

    /// ストアからメタデータを読む（ブロッキング層へ委譲）
    async fn read_metadata(&self, id: &ObjectId) -> Result<ObjectMetadata> {
        let zone = Arc::clone(&self.zone);
        let id = id.clone();
        tokio::task::spawn_blocking(move || zone.storage.get_metadata(&id))
            .await
            .map_err(join_error)?
    }

    /// ストアへメタデータを書く（ブロッキング層へ委譲）
    async fn save_metadata(&self, meta: ObjectMetadata) -> Result<()> {
        let zone = Arc::clone(&self.zone);
        tokio::task::spawn_blocking(move || zone.storage.save_metadata(&meta))
            .await
            .map_err(join_error)?
    }

    /// ストアからパートを読む（ブロッキング層へ委譲）
    async fn read_part(&self, idx: &ObjectIndex) -> Result<Bytes> {
        let zone = Arc::clone(&self.zone);
        let idx = idx.clone();
        tokio::task::spawn_blocking(move || -> Result<Bytes> {
            let mut reader = zone.storage.get_part(&idx)?;
            let mut data = Vec::new();
            reader.read_to_end(&mut data).map_err(CacheError::Io)?;
            Ok(Bytes::from(data))
        })
        .await
        .map_err(join_error)?
    }
}

/// レスポンス固有のヘッダーをメタデータから取り除く
///
/// Content-Length等は発見プローブのレンジに依存するため、
/// オブジェクトのメタデータとしては意味を持ちません。
fn strip_entity_headers(headers: &mut crate::types::Headers) {
    for name in ["content-length", "content-range", "transfer-encoding", "connection", "keep-alive"] {
        headers.remove(name);
    }
}

/// JoinErrorをエラー種別へ変換
fn join_error(e: JoinError) -> CacheError {
    if e.is_cancelled() {
        CacheError::Cancelled
    } else {
        CacheError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("storage task failed: {}", e),
        ))
    }
}
