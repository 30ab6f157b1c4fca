//! オブジェクトインデックス
//!
//! オブジェクト内の固定長パート1つを識別します。

use super::ObjectId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// オブジェクトの1パートを指す識別子
///
/// パート番号は0始まりで、ディスク上では6桁ゼロ埋めの
/// ファイル名（例: `000042`）として保存されます。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectIndex {
    /// 対象オブジェクト
    pub id: ObjectId,
    /// パート番号
    pub part: u32,
}

impl ObjectIndex {
    /// 新しいインデックスを作成
    pub fn new(id: ObjectId, part: u32) -> Self {
        Self { id, part }
    }

    /// ディスク上のパートファイル名を生成
    pub fn filename(&self) -> String {
        part_filename(self.part)
    }
}

impl fmt::Display for ObjectIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.part)
    }
}

/// パート番号から6桁ゼロ埋めのファイル名を生成
pub fn part_filename(part: u32) -> String {
    format!("{:06}", part)
}

/// ファイル名をパート番号へ復元
///
/// 6桁ゼロ埋めの形式に一致しない名前は`None`を返します
/// （書き込み途中の一時ファイルなどを除外するため）。
pub fn parse_part_filename(name: &str) -> Option<u32> {
    if name.len() != 6 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let part: u32 = name.parse().ok()?;
    // 再フォーマットして正規形であることを確認
    if part_filename(part) != name {
        return None;
    }
    Some(part)
}
