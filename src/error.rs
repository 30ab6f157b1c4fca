//! エラー型
//!
//! キャッシュコア全体で使用するエラー種別を定義します。
//! ストレージ層の`NotFound`と`AlreadyExists`は多くの場合「期待された」
//! 結果であり、呼び出し側で制御フローに変換されます。

use std::io;
use thiserror::Error;

/// キャッシュコアのエラー種別
#[derive(Debug, Error)]
pub enum CacheError {
    /// オブジェクトまたはパートが存在しない
    #[error("not found")]
    NotFound,

    /// 保存先のファイルが既に存在する
    #[error("already exists")]
    AlreadyExists,

    /// オブジェクトは既にキャッシュアルゴリズムに登録済み
    #[error("object is already in the cache")]
    AlreadyInCache,

    /// パートサイズが許容範囲を超えている
    #[error("invalid part size")]
    InvalidSize,

    /// ファイルシステム操作の失敗
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// ディスク上のデータが壊れている（メタデータ不整合など）
    #[error("corrupt cache data: {0}")]
    Corrupt(String),

    /// アップストリームがエラーステータスを返した
    #[error("upstream responded with status {0}")]
    Upstream(u16),

    /// アップストリームへの接続・転送エラー
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    /// リクエストがキャンセルされた
    #[error("cancelled")]
    Cancelled,

    /// 設定エラー（起動時のみ致命的）
    #[error("configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// `io::Error`をエラー種別へマッピング
    ///
    /// `NotFound`と`AlreadyExists`は専用のバリアントに変換し、
    /// それ以外は`Io`として保持します。
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound,
            io::ErrorKind::AlreadyExists => CacheError::AlreadyExists,
            _ => CacheError::Io(err),
        }
    }

    /// `NotFound`かどうか
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }

    /// `AlreadyExists`かどうか
    #[inline]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, CacheError::AlreadyExists)
    }

    /// 同じ意味を持つエラーの複製を作る
    ///
    /// `io::Error`がクローン不可のため、シングルフライトで待機者全員に
    /// エラーを配る際にこのメソッドを使います。
    pub fn duplicate(&self) -> CacheError {
        match self {
            CacheError::NotFound => CacheError::NotFound,
            CacheError::AlreadyExists => CacheError::AlreadyExists,
            CacheError::AlreadyInCache => CacheError::AlreadyInCache,
            CacheError::InvalidSize => CacheError::InvalidSize,
            CacheError::Io(e) => {
                CacheError::Io(io::Error::new(e.kind(), e.to_string()))
            }
            CacheError::Corrupt(message) => CacheError::Corrupt(message.clone()),
            CacheError::Upstream(code) => CacheError::Upstream(*code),
            CacheError::UpstreamTransport(message) => {
                CacheError::UpstreamTransport(message.clone())
            }
            CacheError::Cancelled => CacheError::Cancelled,
            CacheError::Config(message) => CacheError::Config(message.clone()),
        }
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::UpstreamTransport(err.to_string())
    }
}

/// キャッシュコア共通のResult型
pub type Result<T> = std::result::Result<T, CacheError>;
