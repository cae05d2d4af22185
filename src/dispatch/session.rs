//! Session record and session table
//!
//! One session per kernel flow, reachable by its forward tuple string and
//! by its conntrack id. Both indexes point at the same record and are
//! guarded by a single table lock; each session carries its own lock for
//! the subscription map so plugin callbacks never block unrelated flows.

use super::subscription::NfqueueSubscription;
use super::tuple::Tuple;
use crate::dict::{DictValue, Dictionary, BYPASS_KEY};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-flow record.
pub struct Session {
    session_id: u64,
    conntrack_id: u32,
    client_side_tuple: Tuple,
    creation_time: Instant,
    conntrack_confirmed: AtomicBool,
    last_activity_time: Mutex<Instant>,
    packet_count: AtomicU64,
    byte_count: AtomicU64,
    event_count: AtomicU64,
    /// Guarded separately so releases never contend with the table lock.
    subscriptions: Mutex<HashMap<String, NfqueueSubscription>>,
    /// Opaque per-plugin state, keyed by plugin-chosen names.
    attachments: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Session {
    /// Creates a session for the first packet of a flow.
    pub fn new(session_id: u64, conntrack_id: u32, tuple: Tuple, length: u64) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            conntrack_id,
            client_side_tuple: tuple,
            creation_time: now,
            conntrack_confirmed: AtomicBool::new(false),
            last_activity_time: Mutex::new(now),
            packet_count: AtomicU64::new(1),
            byte_count: AtomicU64::new(length),
            event_count: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
            attachments: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn conntrack_id(&self) -> u32 {
        self.conntrack_id
    }

    pub fn client_side_tuple(&self) -> &Tuple {
        &self.client_side_tuple
    }

    pub fn creation_time(&self) -> Instant {
        self.creation_time
    }

    pub fn is_conntrack_confirmed(&self) -> bool {
        self.conntrack_confirmed.load(Ordering::Acquire)
    }

    /// Marks the flow as confirmed by a kernel conntrack event.
    pub fn confirm(&self) {
        self.conntrack_confirmed.store(true, Ordering::Release);
    }

    pub fn last_activity_time(&self) -> Instant {
        *self.last_activity_time.lock().unwrap()
    }

    /// Refreshes the activity timestamp.
    pub fn touch(&self) {
        *self.last_activity_time.lock().unwrap() = Instant::now();
    }

    /// Accounts one packet against the session.
    pub fn record_packet(&self, bytes: u64) {
        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count.fetch_add(bytes, Ordering::Relaxed);
        self.event_count.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count.load(Ordering::Relaxed)
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    /// Installs the registry snapshot. Happens exactly once, at creation;
    /// afterwards the map only ever shrinks.
    pub fn attach_subscriptions(&self, snapshot: HashMap<String, NfqueueSubscription>) {
        *self.subscriptions.lock().unwrap() = snapshot;
    }

    /// Copy of the live subscription map for one fan-out pass.
    pub fn mirror_subscriptions(&self) -> HashMap<String, NfqueueSubscription> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Stops sending packets of this flow to `owner`.
    ///
    /// When the last subscriber goes, the kernel is asked to bypass the
    /// flow entirely. Returns true when this call set the bypass flag.
    pub fn release_subscription(&self, owner: &str, dict: &Dictionary) -> bool {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let original_len = subscriptions.len();
        if original_len == 0 {
            return false;
        }

        subscriptions.remove(owner);
        let len = subscriptions.len();
        if len != original_len {
            debug!(
                "removing {} nfqueue subscription for session {}",
                owner, self.session_id
            );
        }

        if len == 0 {
            debug!(
                "zero subscribers reached - setting {}=true for session {}",
                BYPASS_KEY, self.session_id
            );
            dict.add_session_entry(self.conntrack_id, BYPASS_KEY, DictValue::Bool(true));
            return true;
        }
        false
    }

    /// Stashes opaque plugin state on the session.
    pub fn put_attachment(&self, key: &str, value: Arc<dyn Any + Send + Sync>) {
        self.attachments
            .lock()
            .unwrap()
            .insert(key.to_string(), value);
    }

    /// Fetches opaque plugin state.
    pub fn get_attachment(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attachments.lock().unwrap().get(key).cloned()
    }

    /// Value-typed copy for inspectors.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            conntrack_id: self.conntrack_id,
            client_side_tuple: self.client_side_tuple.forward(),
            conntrack_confirmed: self.is_conntrack_confirmed(),
            packet_count: self.packet_count(),
            byte_count: self.byte_count(),
            event_count: self.event_count(),
            subscriptions: self.subscription_count(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, instant: Instant) {
        *self.last_activity_time.lock().unwrap() = instant;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("conntrack_id", &self.conntrack_id)
            .field("client_side_tuple", &self.client_side_tuple)
            .field("conntrack_confirmed", &self.is_conntrack_confirmed())
            .field("packet_count", &self.packet_count())
            .field("byte_count", &self.byte_count())
            .finish()
    }
}

/// Copy of one session's externally interesting state.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: u64,
    pub conntrack_id: u32,
    pub client_side_tuple: String,
    pub conntrack_confirmed: bool,
    pub packet_count: u64,
    pub byte_count: u64,
    pub event_count: u64,
    pub subscriptions: usize,
}

#[derive(Default)]
struct Indexes {
    by_tuple: HashMap<String, Arc<Session>>,
    by_conntrack_id: HashMap<u32, Arc<Session>>,
}

/// Two indexes over the same session records, one lock.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<Indexes>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts under both indexes, replacing any prior entry with the same
    /// tuple key. A replaced entry also loses its conntrack index so a
    /// conntrack id never maps to a dead session.
    pub fn insert(&self, tuple_key: String, session: Arc<Session>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.by_tuple.insert(tuple_key, session.clone()) {
            let still_indexed = inner
                .by_conntrack_id
                .get(&old.conntrack_id())
                .is_some_and(|indexed| Arc::ptr_eq(indexed, &old));
            if still_indexed {
                inner.by_conntrack_id.remove(&old.conntrack_id());
            }
        }
        inner
            .by_conntrack_id
            .insert(session.conntrack_id(), session);
    }

    pub fn find_by_tuple(&self, tuple_key: &str) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().by_tuple.get(tuple_key).cloned()
    }

    pub fn find_by_conntrack_id(&self, ctid: u32) -> Option<Arc<Session>> {
        self.inner
            .lock()
            .unwrap()
            .by_conntrack_id
            .get(&ctid)
            .cloned()
    }

    /// Removes by tuple key from both indexes.
    pub fn remove(&self, tuple_key: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner.by_tuple.remove(tuple_key)?;
        let still_indexed = inner
            .by_conntrack_id
            .get(&session.conntrack_id())
            .is_some_and(|indexed| Arc::ptr_eq(indexed, &session));
        if still_indexed {
            inner.by_conntrack_id.remove(&session.conntrack_id());
        }
        Some(session)
    }

    /// Removes by conntrack id from both indexes.
    pub fn remove_by_conntrack_id(&self, ctid: u32) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner.by_conntrack_id.remove(&ctid)?;
        let tuple_key = session.client_side_tuple().forward();
        let still_indexed = inner
            .by_tuple
            .get(&tuple_key)
            .is_some_and(|indexed| Arc::ptr_eq(indexed, &session));
        if still_indexed {
            inner.by_tuple.remove(&tuple_key);
        }
        Some(session)
    }

    /// Sweeps sessions idle longer than the threshold. Returns the number
    /// removed.
    pub fn clean(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let stale: Vec<(String, Arc<Session>)> = inner
            .by_tuple
            .iter()
            .filter(|(_, session)| {
                now.duration_since(session.last_activity_time()) > idle_timeout
            })
            .map(|(key, session)| (key.clone(), session.clone()))
            .collect();

        for (key, session) in &stale {
            debug!("removing idle session {}", session.session_id());
            inner.by_tuple.remove(key);
            let still_indexed = inner
                .by_conntrack_id
                .get(&session.conntrack_id())
                .is_some_and(|indexed| Arc::ptr_eq(indexed, session));
            if still_indexed {
                inner.by_conntrack_id.remove(&session.conntrack_id());
            }
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_tuple.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().by_tuple.is_empty()
    }

    /// Copies for inspectors; never live records.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.inner
            .lock()
            .unwrap()
            .by_tuple
            .values()
            .map(|session| session.summary())
            .collect()
    }
}
