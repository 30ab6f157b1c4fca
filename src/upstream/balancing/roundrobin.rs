//! ラウンドロビン

use super::{weighted_slots, Backend, Balancer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// 重み付きラウンドロビン
///
/// リクエストごとにカウンタを進め、重みスロット順に選択します。
pub struct RoundRobin {
    state: RwLock<Arc<State>>,
    counter: AtomicUsize,
}

struct State {
    backends: Vec<Backend>,
    slots: Vec<usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(State { backends: Vec::new(), slots: Vec::new() })),
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for RoundRobin {
    fn set_backends(&self, backends: Vec<Backend>) {
        let slots = weighted_slots(&backends);
        *self.state.write().unwrap() = Arc::new(State { backends, slots });
    }

    fn get(&self, _uri: &str) -> Option<Backend> {
        let state = Arc::clone(&self.state.read().unwrap());
        if state.slots.is_empty() {
            return None;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let slot = state.slots[n % state.slots.len()];
        Some(state.backends[slot].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_backends;
    use super::*;

    #[test]
    fn test_cycles_through_backends() {
        let rr = RoundRobin::new();
        rr.set_backends(test_backends(&["http://a:80", "http://b:80", "http://c:80"]));

        let picked: Vec<String> = (0..6)
            .map(|_| rr.get("/x").unwrap().host)
            .collect();
        assert_eq!(picked, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_weights_bias_selection() {
        let rr = RoundRobin::new();
        let mut backends = test_backends(&["http://a:80", "http://b:80"]);
        backends[0].weight = 2;
        rr.set_backends(backends);

        let picked: Vec<String> = (0..6)
            .map(|_| rr.get("/x").unwrap().host)
            .collect();
        assert_eq!(picked, vec!["a", "a", "b", "a", "a", "b"]);
    }
}
