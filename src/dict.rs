//! Session dictionary side-channel.
//!
//! A per-flow key/value store indexed by conntrack id. The dispatch writes
//! the bypass flag here; the kernel shim observes it and stops queueing
//! packets for that flow. Plugins may add their own keys (hop counts, etc).

use std::collections::HashMap;
use std::sync::Mutex;

/// Dictionary key the kernel shim watches to drop a flow from the queue.
pub const BYPASS_KEY: &str = "bypass_packetd";

/// Value types the dictionary can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum DictValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

/// Conntrack-id-keyed dictionary service.
#[derive(Debug, Default)]
pub struct Dictionary {
    sessions: Mutex<HashMap<u32, HashMap<String, DictValue>>>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one key for one flow, replacing any previous value.
    pub fn add_session_entry(&self, ctid: u32, key: &str, value: DictValue) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(ctid)
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Reads one key for one flow.
    pub fn get_session_entry(&self, ctid: u32, key: &str) -> Option<DictValue> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&ctid).and_then(|entries| entries.get(key)).cloned()
    }

    /// Removes every key for one flow.
    pub fn flush_session(&self, ctid: u32) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(&ctid);
    }

    /// Copy of all entries for one flow.
    pub fn session_entries(&self, ctid: u32) -> HashMap<String, DictValue> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&ctid).cloned().unwrap_or_default()
    }

    /// Number of flows with at least one entry.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }

    /// True when the bypass flag is set for the flow.
    pub fn is_bypassed(&self, ctid: u32) -> bool {
        matches!(
            self.get_session_entry(ctid, BYPASS_KEY),
            Some(DictValue::Bool(true))
        )
    }
}
