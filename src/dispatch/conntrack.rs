//! Conntrack table and event consumer
//!
//! Kernel-authoritative accounting rows, one per conntrack id. NEW/UPDATE
//! events confirm the owning session and refresh the row's byte counters
//! and rates; DESTROY drops both the row and the session.

use super::subscription::ConntrackSubscription;
use super::DispatchEngine;
use crate::kernel::{ConntrackEvent, ConntrackEventType};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Conntrack handler: `(event type, row copy)`.
pub type ConntrackFunc = Arc<dyn Fn(ConntrackEventType, &Conntrack) + Send + Sync>;

/// Accounting row for one kernel flow.
#[derive(Debug, Clone)]
pub struct Conntrack {
    pub conntrack_id: u32,
    /// Owning session, when the dispatch saw the flow's first packet.
    pub session_id: Option<u64>,
    pub creation_time: Instant,
    pub last_activity_time: Instant,
    /// Kernel byte totals per direction.
    pub orig_bytes: u64,
    pub repl_bytes: u64,
    pub total_bytes: u64,
    /// Per-interval differences.
    pub orig_bytes_diff: u64,
    pub repl_bytes_diff: u64,
    pub total_bytes_diff: u64,
    /// Byte rates over the conntrack update interval.
    pub orig_byte_rate: f64,
    pub repl_byte_rate: f64,
    pub total_byte_rate: f64,
}

impl Conntrack {
    fn new(conntrack_id: u32) -> Self {
        let now = Instant::now();
        Self {
            conntrack_id,
            session_id: None,
            creation_time: now,
            last_activity_time: now,
            orig_bytes: 0,
            repl_bytes: 0,
            total_bytes: 0,
            orig_bytes_diff: 0,
            repl_bytes_diff: 0,
            total_bytes_diff: 0,
            orig_byte_rate: 0.0,
            repl_byte_rate: 0.0,
            total_byte_rate: 0.0,
        }
    }
}

/// Returns `current - previous` and stores `current` as the new previous
/// value. The subtraction wraps: when a kernel counter resets, one interval
/// reports a huge difference.
pub fn calculate_difference(previous: &mut u64, current: u64) -> u64 {
    let diff = current.wrapping_sub(*previous);
    *previous = current;
    diff
}

/// Process-wide conntrack rows, one lock.
#[derive(Default)]
pub struct ConntrackTable {
    rows: Mutex<HashMap<u32, Conntrack>>,
}

impl ConntrackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a NEW/UPDATE event and returns a copy of the refreshed row.
    pub fn process_event(
        &self,
        event: &ConntrackEvent,
        interval: Duration,
        session_id: Option<u64>,
    ) -> Conntrack {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .entry(event.conntrack_id)
            .or_insert_with(|| Conntrack::new(event.conntrack_id));

        if session_id.is_some() {
            row.session_id = session_id;
        }

        row.orig_bytes_diff = calculate_difference(&mut row.orig_bytes, event.orig_bytes);
        row.repl_bytes_diff = calculate_difference(&mut row.repl_bytes, event.repl_bytes);
        let total = event.orig_bytes.wrapping_add(event.repl_bytes);
        row.total_bytes_diff = calculate_difference(&mut row.total_bytes, total);

        let secs = interval.as_secs().max(1) as f64;
        row.orig_byte_rate = row.orig_bytes_diff as f64 / secs;
        row.repl_byte_rate = row.repl_bytes_diff as f64 / secs;
        row.total_byte_rate = row.total_bytes_diff as f64 / secs;

        row.last_activity_time = Instant::now();
        row.clone()
    }

    pub fn get(&self, ctid: u32) -> Option<Conntrack> {
        self.rows.lock().unwrap().get(&ctid).cloned()
    }

    pub fn remove(&self, ctid: u32) -> Option<Conntrack> {
        self.rows.lock().unwrap().remove(&ctid)
    }

    /// Sweeps rows idle longer than the threshold. Returns the number
    /// removed.
    pub fn clean(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, row| now.duration_since(row.last_activity_time) <= idle_timeout);
        before - rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().unwrap().is_empty()
    }

    /// Copies for inspectors; never live rows.
    pub fn snapshot(&self) -> Vec<Conntrack> {
        self.rows.lock().unwrap().values().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn age(&self, ctid: u32, by: Duration) {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&ctid) {
            row.last_activity_time -= by;
        }
    }
}

impl DispatchEngine {
    /// Consumes one conntrack event from the kernel shim.
    ///
    /// The shim has already filtered loopback and non-TCP/UDP flows.
    pub fn conntrack_callback(&self, event: ConntrackEvent) {
        trace!(
            "conntrack event[{}]: {:?}",
            event.conntrack_id,
            event.event_type
        );

        match event.event_type {
            ConntrackEventType::New | ConntrackEventType::Update => {
                if event.event_type == ConntrackEventType::New {
                    self.metrics.conntrack_new.inc();
                } else {
                    self.metrics.conntrack_update.inc();
                }

                let session = self.sessions.find_by_conntrack_id(event.conntrack_id);
                if let Some(ref session) = session {
                    if !session.is_conntrack_confirmed() {
                        debug!(
                            "conntrack confirmed session {} for ctid {}",
                            session.session_id(),
                            event.conntrack_id
                        );
                        session.confirm();
                    }
                    session.touch();
                }

                let row = self.conntracks.process_event(
                    &event,
                    self.settings.conntrack_interval,
                    session.map(|s| s.session_id()),
                );
                self.fan_out_conntrack(event.event_type, &row);
            }
            ConntrackEventType::Destroy => {
                self.metrics.conntrack_destroy.inc();

                let row = self.conntracks.remove(event.conntrack_id);
                if let Some(session) = self.sessions.remove_by_conntrack_id(event.conntrack_id) {
                    debug!(
                        "conntrack destroy removed session {}",
                        session.session_id()
                    );
                    self.metrics.sessions_removed.inc();
                }
                if let Some(row) = row {
                    self.fan_out_conntrack(ConntrackEventType::Destroy, &row);
                }
            }
        }

        self.metrics
            .session_table_size
            .set(self.sessions.len() as u64);
        self.metrics
            .conntrack_table_size
            .set(self.conntracks.len() as u64);
    }

    fn fan_out_conntrack(&self, event_type: ConntrackEventType, row: &Conntrack) {
        let subscribers: Vec<ConntrackSubscription> = self.registry.conntrack_subscribers();
        for subscriber in subscribers {
            trace!(
                "calling conntrack plugin:{} priority:{} ctid:{}",
                subscriber.owner,
                subscriber.priority,
                row.conntrack_id
            );
            (subscriber.func)(event_type, row);
        }
    }
}
