//! オブジェクトID
//!
//! キャッシュキーとパスのペアからオブジェクトを一意に識別します。
//! ハッシュ値は生成時に事前計算され、ディスク上のディレクトリ名と
//! 有効期限スケジューラのキーの両方に使用されます。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// オブジェクトID
///
/// `cache_key`は同じエビクション空間を共有するURL群の名前空間、
/// `path`はその中の個別リソースを指します。
/// クローンが安価になるよう内部は`Arc<str>`で保持します。
#[derive(Clone, Debug)]
pub struct ObjectId {
    /// エビクション名前空間
    cache_key: Arc<str>,
    /// リソースパス（クエリを含む場合あり）
    path: Arc<str>,
    /// 事前計算されたハッシュ値
    hash: u64,
}

impl ObjectId {
    /// 新しいオブジェクトIDを作成
    pub fn new(cache_key: &str, path: &str) -> Self {
        let hash = Self::compute_hash(cache_key, path);
        Self {
            cache_key: cache_key.into(),
            path: path.into(),
            hash,
        }
    }

    /// ハッシュ値を計算
    fn compute_hash(cache_key: &str, path: &str) -> u64 {
        let mut data = Vec::with_capacity(cache_key.len() + path.len() + 1);
        data.extend_from_slice(cache_key.as_bytes());
        data.push(b'\x00');
        data.extend_from_slice(path.as_bytes());
        xxh3_64(&data)
    }

    /// キャッシュキーを取得
    #[inline]
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// パスを取得
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// ハッシュ値を取得
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    /// 小文字16進数のハッシュ表現（16文字）
    ///
    /// ディスク上のオブジェクトディレクトリ名と
    /// スケジューラキーに使用されます。
    pub fn hex(&self) -> String {
        format!("{:016x}", self.hash)
    }

    /// ディレクトリ分散用のプレフィックス2階層を生成
    ///
    /// 最上位・第2階層とも最大256ディレクトリに分散されます。
    pub fn hex_prefixes(&self) -> (String, String) {
        let dir1 = format!("{:02x}", (self.hash >> 56) as u8);
        let dir2 = format!("{:02x}", (self.hash >> 48) as u8);
        (dir1, dir2)
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.cache_key == other.cache_key
            && self.path == other.path
    }
}

impl Eq for ObjectId {}

impl Hash for ObjectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // 事前計算されたハッシュ値を使用
        state.write_u64(self.hash);
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cache_key, self.path)
    }
}

/// JSONメタデータ内での表現
///
/// ハッシュ値は保存せず、読み込み時に再計算します。
#[derive(Serialize, Deserialize)]
struct ObjectIdRepr {
    cache_key: String,
    path: String,
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ObjectIdRepr {
            cache_key: self.cache_key.to_string(),
            path: self.path.to_string(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = ObjectIdRepr::deserialize(deserializer)?;
        Ok(ObjectId::new(&repr.cache_key, &repr.path))
    }
}
