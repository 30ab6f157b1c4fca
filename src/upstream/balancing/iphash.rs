//! IPハッシュ
//!
//! リクエストURIのハッシュ値を重みスロット数で割った剰余で選択します。
//! コンシステントハッシュと異なり、バックエンド集合が変わると
//! 割り当ては大きく変わりますが、計算は単純です。

use super::{weighted_slots, Backend, Balancer};
use std::sync::{Arc, RwLock};
use xxhash_rust::xxh3::xxh3_64;

/// 剰余ベースのハッシュ選択
pub struct IpHash {
    state: RwLock<Arc<State>>,
}

struct State {
    backends: Vec<Backend>,
    slots: Vec<usize>,
}

impl IpHash {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(State { backends: Vec::new(), slots: Vec::new() })),
        }
    }
}

impl Default for IpHash {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for IpHash {
    fn set_backends(&self, backends: Vec<Backend>) {
        let slots = weighted_slots(&backends);
        *self.state.write().unwrap() = Arc::new(State { backends, slots });
    }

    fn get(&self, uri: &str) -> Option<Backend> {
        let state = Arc::clone(&self.state.read().unwrap());
        if state.slots.is_empty() {
            return None;
        }
        let hash = xxh3_64(uri.as_bytes()) as usize;
        let slot = state.slots[hash % state.slots.len()];
        Some(state.backends[slot].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_backends;
    use super::*;

    #[test]
    fn test_deterministic() {
        let iphash = IpHash::new();
        iphash.set_backends(test_backends(&["http://a:80", "http://b:80"]));

        let first = iphash.get("/file").unwrap().host;
        for _ in 0..10 {
            assert_eq!(iphash.get("/file").unwrap().host, first);
        }
    }

    #[test]
    fn test_spreads_across_backends() {
        let iphash = IpHash::new();
        iphash.set_backends(test_backends(&["http://a:80", "http://b:80"]));

        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            seen.insert(iphash.get(&format!("/obj/{}", i)).unwrap().host);
        }
        assert_eq!(seen.len(), 2);
    }
}
