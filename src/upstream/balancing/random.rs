//! ランダム選択

use super::{weighted_slots, Backend, Balancer};
use rand::Rng;
use std::sync::{Arc, RwLock};

/// 重み付きランダム
pub struct Random {
    state: RwLock<Arc<State>>,
}

struct State {
    backends: Vec<Backend>,
    slots: Vec<usize>,
}

impl Random {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(State { backends: Vec::new(), slots: Vec::new() })),
        }
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for Random {
    fn set_backends(&self, backends: Vec<Backend>) {
        let slots = weighted_slots(&backends);
        *self.state.write().unwrap() = Arc::new(State { backends, slots });
    }

    fn get(&self, _uri: &str) -> Option<Backend> {
        let state = Arc::clone(&self.state.read().unwrap());
        if state.slots.is_empty() {
            return None;
        }
        let slot = state.slots[rand::thread_rng().gen_range(0..state.slots.len())];
        Some(state.backends[slot].clone())
    }
}
