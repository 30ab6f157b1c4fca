//! テスト用オリジンサーバー
//!
//! 実際のTCP接続でRangeリクエストと条件付きリクエストに応答する
//! 最小限のHTTPサーバーです。受け付けたリクエスト数を数えるので、
//! シングルフライトやキャッシュヒットの検証に使えます。

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// テスト用オリジン
pub struct TestOrigin {
    address: SocketAddr,
    hits: Arc<AtomicUsize>,
    status: Arc<AtomicU16>,
}

/// オリジンの応答設定
#[derive(Clone, Default)]
pub struct OriginOptions {
    /// 追加レスポンスヘッダー
    pub headers: Vec<(String, String)>,
    /// ETag（設定するとIf-None-Match一致時に304を返す）
    pub etag: Option<String>,
}

impl TestOrigin {
    /// 指定のボディとヘッダーで応答するオリジンを起動
    pub fn start(body: Vec<u8>, headers: Vec<(String, String)>) -> Self {
        Self::start_with(body, OriginOptions { headers, etag: None })
    }

    /// 応答設定を指定してオリジンを起動
    pub fn start_with(body: Vec<u8>, options: OriginOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let status = Arc::new(AtomicU16::new(200));

        let counter = Arc::clone(&hits);
        let current_status = Arc::clone(&status);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => break,
                };
                let body = body.clone();
                let options = options.clone();
                let counter = Arc::clone(&counter);
                let current_status = Arc::clone(&current_status);
                thread::spawn(move || {
                    handle_connection(stream, current_status, body, options, counter);
                });
            }
        });

        Self { address, hits, status }
    }

    /// オリジンのURL
    pub fn url(&self) -> String {
        format!("http://{}", self.address)
    }

    /// 受け付けたリクエスト数
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// 以降の応答のステータスコードを変更する
    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }
}

fn handle_connection(
    mut stream: TcpStream,
    status: Arc<AtomicU16>,
    body: Vec<u8>,
    options: OriginOptions,
    counter: Arc<AtomicUsize>,
) {
    loop {
        // ヘッダー終端まで読む
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                Err(_) => return,
            }
        }
        counter.fetch_add(1, Ordering::SeqCst);

        let request = String::from_utf8_lossy(&request).into_owned();
        let status = status.load(Ordering::SeqCst);

        let mut header_lines = String::new();
        for (name, value) in &options.headers {
            header_lines.push_str(&format!("{}: {}\r\n", name, value));
        }
        if let Some(etag) = &options.etag {
            header_lines.push_str(&format!("ETag: {}\r\n", etag));
        }

        let response = build_response(&request, status, &body, &options, &header_lines);
        if stream.write_all(&response).is_err() {
            return;
        }
        // keep-aliveで次のリクエストを待つ
    }
}

fn build_response(
    request: &str,
    status: u16,
    body: &[u8],
    options: &OriginOptions,
    header_lines: &str,
) -> Vec<u8> {
    // 条件付きリクエストへの304応答
    if status == 200 {
        if let Some(etag) = &options.etag {
            let matches = request
                .lines()
                .any(|line| {
                    line.to_ascii_lowercase().starts_with("if-none-match:")
                        && line.contains(etag.as_str())
                });
            if matches {
                return format!("HTTP/1.1 304 Not Modified\r\n{}\r\n", header_lines).into_bytes();
            }
        }
    }

    if status != 200 {
        let reason = match status {
            404 => "Not Found",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Response",
        };
        let error_body = b"origin error";
        let mut response = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n{}\r\n",
            status,
            reason,
            error_body.len(),
            header_lines
        )
        .into_bytes();
        response.extend_from_slice(error_body);
        return response;
    }

    match parse_range_header(request, body.len()) {
        Some((start, end)) => {
            let slice = &body[start..=end];
            let mut response = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\n{}\r\n",
                slice.len(),
                start,
                end,
                body.len(),
                header_lines
            )
            .into_bytes();
            response.extend_from_slice(slice);
            response
        }
        None => {
            let mut response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}\r\n",
                body.len(),
                header_lines
            )
            .into_bytes();
            response.extend_from_slice(body);
            response
        }
    }
}

/// `Range: bytes=S-E`ヘッダーをパースして閉区間に変換
fn parse_range_header(request: &str, body_len: usize) -> Option<(usize, usize)> {
    let line = request
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("range:"))?;
    let spec = line.split(':').nth(1)?.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = end.parse().unwrap_or(body_len.saturating_sub(1));
    if start >= body_len {
        return None;
    }
    Some((start, end.min(body_len - 1)))
}
