//! オブジェクトストア
//!
//! レスポンスメタデータとパートをディスクに永続化するストレージ層です。
//!
//! ## 契約
//!
//! - メタデータとパートの書き込みは一時ファイル + renameで原子的に行う
//! - パートはメタデータが存在するオブジェクトにのみ保存できる
//! - 更新はオブジェクトディレクトリ全体の破棄によってのみ行う
//!
//! 全メソッドは同期（ブロッキング）であり、非同期コンテキストからは
//! `tokio::task::spawn_blocking`経由で呼び出します。

mod disk;

#[cfg(test)]
pub(crate) mod mock;

pub use disk::DiskStorage;

use crate::error::Result;
use crate::types::{ObjectId, ObjectIndex, ObjectMetadata};
use std::io::Read;

/// イテレーションの継続可否
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterateFlow {
    /// 次のオブジェクトへ進む
    Continue,
    /// イテレーションを打ち切る
    Stop,
}

/// ストア走査のビジター
///
/// オブジェクトごとにメタデータと存在するパートの一覧を受け取ります。
pub trait IterateVisitor {
    /// 1オブジェクト分の通知
    fn on_object(&mut self, meta: &ObjectMetadata, parts: &[ObjectIndex]) -> IterateFlow;
}

/// オブジェクトストアの契約
pub trait Storage: Send + Sync {
    /// このストアのパートサイズ
    fn part_size(&self) -> u64;

    /// メタデータを取得
    fn get_metadata(&self, id: &ObjectId) -> Result<ObjectMetadata>;

    /// メタデータを保存
    ///
    /// 既に存在する場合は`AlreadyExists`で失敗します。
    fn save_metadata(&self, meta: &ObjectMetadata) -> Result<()>;

    /// メタデータを原子的に置き換える
    ///
    /// 304再検証で有効期限とヘッダーを更新する際に使います。
    /// パートファイルには触れません。
    fn replace_metadata(&self, meta: &ObjectMetadata) -> Result<()>;

    /// パートの読み込みストリームを取得
    ///
    /// ファイルが`part_size`を超えている場合は破損として扱います。
    fn get_part(&self, idx: &ObjectIndex) -> Result<Box<dyn Read + Send>>;

    /// パートを保存
    ///
    /// `part_size`を超える入力は書き込みを中断し一時ファイルを削除します。
    /// 対象オブジェクトのメタデータが未保存の場合は`NotFound`です。
    fn save_part(&self, idx: &ObjectIndex, data: &mut dyn Read) -> Result<()>;

    /// ディスク上に存在するパートの一覧を取得
    ///
    /// サイズが期待値と一致しないパートファイルは除外されます。
    fn get_available_parts(&self, id: &ObjectId) -> Result<Vec<ObjectIndex>>;

    /// オブジェクト全体（メタデータ + 全パート）を破棄
    fn discard(&self, id: &ObjectId) -> Result<()>;

    /// 1パートを破棄
    fn discard_part(&self, idx: &ObjectIndex) -> Result<()>;

    /// 全オブジェクトを走査
    ///
    /// 壊れたメタデータはログを出して読み飛ばします。
    fn iterate(&self, visitor: &mut dyn IterateVisitor) -> Result<()>;
}
