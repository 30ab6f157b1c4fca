//! オブジェクトメタデータ
//!
//! ディスク上の`objID`ファイルにJSONとして永続化される
//! レスポンスメタデータを定義します。作成後は不変で、
//! 更新はオブジェクト全体の破棄と再保存によってのみ行われます。

use super::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// レスポンスヘッダーのマルチマップ表現
///
/// キーは小文字に正規化されます。
pub type Headers = HashMap<String, Vec<String>>;

/// 現在時刻のUNIX秒を取得
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// キャッシュされたオブジェクトのメタデータ
///
/// 必須フィールドが欠けたJSONはデコードエラーとなり、
/// イテレーション時には破損として読み飛ばされます。
/// 未知のフィールドは無視されます。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// オブジェクトID
    pub id: ObjectId,
    /// アップストリームがレスポンスを返した時刻（UNIX秒）
    pub response_timestamp: i64,
    /// 有効期限（UNIX秒）
    pub expires_at: i64,
    /// オブジェクト全体のサイズ（バイト）
    pub size: u64,
    /// レスポンスヘッダー
    pub headers: Headers,
    /// キャッシュ可能かどうか
    ///
    /// キャッシュ不可のオブジェクトもメタデータだけは保存され、
    /// 以降のリクエストはストアを素通りします。
    pub is_cacheable: bool,
    /// HTTPステータスコード
    pub code: u16,
}

impl ObjectMetadata {
    /// 有効期限内かどうか
    #[inline]
    pub fn is_fresh(&self) -> bool {
        unix_now() < self.expires_at
    }

    /// このオブジェクトのパート総数
    pub fn part_count(&self, part_size: u64) -> u32 {
        if self.size == 0 {
            return 0;
        }
        self.size.div_ceil(part_size) as u32
    }
}
