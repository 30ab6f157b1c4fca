//! コンシステントハッシュ
//!
//! バックエンドごとに重みに比例した数の仮想ノードをリング上へ配置し、
//! リクエストURIのハッシュから時計回りで最初のノードを選びます。
//! リングはノードのハッシュ値のみでソートされるため、同じバックエンド
//! 集合であれば投入順序に依らず同じ割り当てになります。

use super::{Backend, Balancer};
use std::sync::{Arc, RwLock};
use xxhash_rust::xxh3::xxh3_64;

/// バックエンド1台あたりの基準仮想ノード数
const VNODES_PER_WEIGHT: u32 = 160;

/// コンシステントハッシュ
pub struct ConsistentHash {
    state: RwLock<Arc<Ring>>,
}

struct Ring {
    backends: Vec<Backend>,
    /// (ポイント, バックエンド番号) をポイント昇順に並べたもの
    points: Vec<(u64, usize)>,
}

impl ConsistentHash {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(Ring { backends: Vec::new(), points: Vec::new() })),
        }
    }

    fn build_ring(backends: Vec<Backend>) -> Ring {
        let mut points = Vec::new();
        for (i, backend) in backends.iter().enumerate() {
            let vnodes = backend.weight.max(1) * VNODES_PER_WEIGHT;
            let addr = backend.url.as_str();
            for vnode in 0..vnodes {
                // 仮想ノードのポイントはアドレスと番号から決まる
                let label = format!("{}#{}", addr, vnode);
                points.push((xxh3_64(label.as_bytes()), i));
            }
        }
        points.sort_unstable();
        Ring { backends, points }
    }
}

impl Default for ConsistentHash {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for ConsistentHash {
    fn set_backends(&self, backends: Vec<Backend>) {
        *self.state.write().unwrap() = Arc::new(Self::build_ring(backends));
    }

    fn get(&self, uri: &str) -> Option<Backend> {
        let ring = Arc::clone(&self.state.read().unwrap());
        if ring.points.is_empty() {
            return None;
        }

        let hash = xxh3_64(uri.as_bytes());
        // hash以上の最初のポイント、無ければリング先頭へ折り返す
        let pos = ring.points.partition_point(|(point, _)| *point < hash);
        let (_, backend_index) = ring.points[pos % ring.points.len()];
        Some(ring.backends[backend_index].clone())
    }
}
