//! Mock endpoint namer for testing

use super::EndpointNamer;
use crate::slot::SlotId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

#[derive(Default)]
struct MockState {
    live: HashMap<String, SlotId>,
    failing: HashSet<String>,
    removals: u64,
}

/// Records endpoint creation and removal in memory
#[derive(Clone, Default)]
pub struct MockEndpoints {
    state: Arc<Mutex<MockState>>,
}

impl MockEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make endpoint creation fail for `name`
    pub fn fail_for(&self, name: &str) {
        self.state.lock().failing.insert(name.to_string());
    }

    /// Slot the endpoints of `name` currently point at
    pub fn slot_of(&self, name: &str) -> Option<SlotId> {
        self.state.lock().live.get(name).copied()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn removals(&self) -> u64 {
        self.state.lock().removals
    }
}

impl EndpointNamer for MockEndpoints {
    fn create_endpoints(&self, name: &str, slot: SlotId) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.failing.contains(name) {
            return Err(io::Error::other(format!("mock endpoints for {} refused", name)));
        }
        if state.live.contains_key(name) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, name.to_string()));
        }
        state.live.insert(name.to_string(), slot);
        Ok(())
    }

    fn remove_endpoints(&self, name: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        state.live.remove(name);
        state.removals += 1;
        Ok(())
    }
}
