//! バランシングアルゴリズム
//!
//! リクエストURIからバックエンドを1つ選ぶアルゴリズム群です。
//! バックエンドリストはDNSリゾルバによって実行中に置き換えられるため、
//! 全アルゴリズムが`set_backends`による原子的な差し替えをサポートします。
//! 読み手は古いリストか新しいリストのどちらか完全な方だけを観測します。

mod consistent;
mod iphash;
mod random;
mod roundrobin;

pub use consistent::ConsistentHash;
pub use iphash::IpHash;
pub use random::Random;
pub use roundrobin::RoundRobin;

use crate::error::{CacheError, Result};
use std::sync::Arc;
use url::Url;

/// バックエンド1台分の情報
#[derive(Clone, Debug)]
pub struct Backend {
    /// 接続先URL
    pub url: Url,
    /// 元のホスト名（Hostヘッダー用）
    pub host: String,
    /// 重み（1以上）
    pub weight: u32,
}

impl Backend {
    /// URLからバックエンドを作成（重み1）
    pub fn from_url(url: Url) -> Self {
        let host = url.host_str().unwrap_or_default().to_string();
        Self { url, host, weight: 1 }
    }

    /// 重み付きでバックエンドを作成
    pub fn with_weight(url: Url, weight: u32) -> Self {
        let mut backend = Self::from_url(url);
        backend.weight = weight.max(1);
        backend
    }
}

/// バランシングアルゴリズムの契約
pub trait Balancer: Send + Sync {
    /// バックエンドリストを差し替える
    fn set_backends(&self, backends: Vec<Backend>);

    /// リクエストURIに対応するバックエンドを選ぶ
    fn get(&self, uri: &str) -> Option<Backend>;
}

/// アルゴリズム名からバランサーを構築
pub fn new(name: &str) -> Result<Arc<dyn Balancer>> {
    match name {
        "round-robin" => Ok(Arc::new(RoundRobin::new())),
        "random" => Ok(Arc::new(Random::new())),
        "hash" => Ok(Arc::new(ConsistentHash::new())),
        "ip-hash" => Ok(Arc::new(IpHash::new())),
        other => Err(CacheError::Config(format!(
            "unknown balancing algorithm `{}`",
            other
        ))),
    }
}

/// 重みに応じてバックエンドを選択スロットへ展開する
///
/// 重み2のバックエンドは2スロットを占め、選ばれる確率が2倍になります。
fn weighted_slots(backends: &[Backend]) -> Vec<usize> {
    let mut slots = Vec::new();
    for (i, backend) in backends.iter().enumerate() {
        for _ in 0..backend.weight.max(1) {
            slots.push(i);
        }
    }
    slots
}

#[cfg(test)]
pub(crate) fn test_backends(addrs: &[&str]) -> Vec<Backend> {
    addrs
        .iter()
        .map(|a| Backend::from_url(Url::parse(a).unwrap()))
        .collect()
}
