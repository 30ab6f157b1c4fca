//! キャッシュポリシー
//!
//! RFC 7234のセマンティクスに基づき、レスポンスのキャッシュ可否と
//! 有効期限を判定します。
//!
//! TTLの優先順位: `s-maxage` > `max-age` > `Expires` > 設定のデフォルト

use crate::types::Headers;
use std::time::Duration;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::PrimitiveDateTime;

/// キャッシュ可能なステータスコード
const CACHEABLE_CODES: [u16; 2] = [200, 206];

/// IMF-fixdate形式（例: `Sun, 06 Nov 1994 08:49:37 GMT`）
const IMF_FIXDATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Cache-Controlディレクティブ
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    /// max-age（秒）
    pub max_age: Option<u64>,
    /// s-maxage（秒、共有キャッシュ用）
    pub s_maxage: Option<u64>,
    /// no-cache フラグ
    pub no_cache: bool,
    /// no-store フラグ
    pub no_store: bool,
    /// private フラグ
    pub private: bool,
    /// public フラグ
    pub public: bool,
    /// must-revalidate フラグ
    pub must_revalidate: bool,
    /// stale-if-error（秒）
    pub stale_if_error: Option<u64>,
}

impl CacheControl {
    /// ヘッダー値をパース
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();

        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            match directive.as_str() {
                "no-cache" => cc.no_cache = true,
                "no-store" => cc.no_store = true,
                "private" => cc.private = true,
                "public" => cc.public = true,
                "must-revalidate" => cc.must_revalidate = true,
                _ => {
                    if let Some(value) = directive.strip_prefix("max-age=") {
                        cc.max_age = value.parse().ok();
                    } else if let Some(value) = directive.strip_prefix("s-maxage=") {
                        cc.s_maxage = value.parse().ok();
                    } else if let Some(value) = directive.strip_prefix("stale-if-error=") {
                        cc.stale_if_error = value.parse().ok();
                    }
                }
            }
        }

        cc
    }

    /// レスポンスヘッダーからパース
    ///
    /// 複数のCache-Controlヘッダーはマージして扱います。
    pub fn from_headers(headers: &Headers) -> Self {
        match headers.get("cache-control") {
            Some(values) => Self::parse(&values.join(",")),
            None => Self::default(),
        }
    }

    /// 共有キャッシュで保存して良いか
    pub fn is_storable(&self) -> bool {
        !self.no_store && !self.private
    }

    /// プロキシ用のTTL（秒）
    pub fn ttl(&self) -> Option<u64> {
        self.s_maxage.or(self.max_age)
    }
}

/// レスポンスがキャッシュ可能かどうか
pub fn is_cacheable_response(code: u16, headers: &Headers) -> bool {
    CACHEABLE_CODES.contains(&code) && CacheControl::from_headers(headers).is_storable()
}

/// レスポンスの有効期限（UNIX秒）を導出する
pub fn expires_at(headers: &Headers, response_timestamp: i64, default_ttl: Duration) -> i64 {
    let cc = CacheControl::from_headers(headers);
    if let Some(ttl) = cc.ttl() {
        return response_timestamp + ttl as i64;
    }

    if let Some(values) = headers.get("expires") {
        if let Some(at) = values.first().and_then(|v| parse_http_date(v)) {
            return at;
        }
    }

    response_timestamp + default_ttl.as_secs() as i64
}

/// HTTP日付（IMF-fixdate）をUNIX秒へ変換
pub fn parse_http_date(value: &str) -> Option<i64> {
    let parsed = PrimitiveDateTime::parse(value.trim(), IMF_FIXDATE).ok()?;
    Some(parsed.assume_utc().unix_timestamp())
}

/// 条件付きリクエスト用のヘッダーを組み立てる
///
/// キャッシュ済みメタデータの`etag`と`last-modified`から
/// `If-None-Match` / `If-Modified-Since`を導出します。
pub fn conditional_headers(cached: &Headers) -> Vec<(String, String)> {
    let mut conditions = Vec::new();
    if let Some(etag) = cached.get("etag").and_then(|v| v.first()) {
        conditions.push(("if-none-match".to_string(), etag.clone()));
    }
    if let Some(modified) = cached.get("last-modified").and_then(|v| v.first()) {
        conditions.push(("if-modified-since".to_string(), modified.clone()));
    }
    conditions
}
