//! Plugin subscriptions
//!
//! A subscription is a static, startup-time description of the dispatch
//! pipeline: a named handler with an integer priority. The three lists
//! (nfqueue, conntrack, netlogger) are independent; only the nfqueue list
//! is snapshotted into sessions.

use super::conntrack::ConntrackFunc;
use super::netlogger::NetloggerFunc;
use super::nfqueue::NfqueueFunc;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::info;

/// Highest allowed subscription priority.
pub const MAX_PRIORITY: u8 = 100;

/// A named handler with a dispatch priority.
#[derive(Clone)]
pub struct SubscriptionHolder<F> {
    pub owner: String,
    pub priority: u8,
    pub func: F,
}

impl<F> fmt::Debug for SubscriptionHolder<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHolder")
            .field("owner", &self.owner)
            .field("priority", &self.priority)
            .finish()
    }
}

pub type NfqueueSubscription = SubscriptionHolder<NfqueueFunc>;
pub type ConntrackSubscription = SubscriptionHolder<ConntrackFunc>;
pub type NetloggerSubscription = SubscriptionHolder<NetloggerFunc>;

/// Process-wide subscription lists, one mutex each.
#[derive(Default)]
pub struct SubscriptionRegistry {
    nfqueue: Mutex<HashMap<String, NfqueueSubscription>>,
    conntrack: Mutex<HashMap<String, ConntrackSubscription>>,
    netlogger: Mutex<HashMap<String, NetloggerSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription for receiving nfqueue messages.
    ///
    /// Panics on a duplicate owner or an out-of-range priority; both mean a
    /// broken plugin registration, and the pipeline must not start that way.
    pub fn insert_nfqueue(&self, owner: &str, priority: u8, func: NfqueueFunc) {
        assert!(
            priority <= MAX_PRIORITY,
            "nfqueue subscription priority {} out of range for {}",
            priority,
            owner
        );
        info!("adding nfqueue subscription ({}, {})", owner, priority);

        let mut list = self.nfqueue.lock().unwrap();
        let existing = list.insert(
            owner.to_string(),
            SubscriptionHolder {
                owner: owner.to_string(),
                priority,
                func,
            },
        );
        drop(list);

        if existing.is_some() {
            panic!("duplicate nfqueue subscription detected: {}", owner);
        }
    }

    /// Adds a subscription for receiving conntrack events.
    pub fn insert_conntrack(&self, owner: &str, priority: u8, func: ConntrackFunc) {
        assert!(
            priority <= MAX_PRIORITY,
            "conntrack subscription priority {} out of range for {}",
            priority,
            owner
        );
        info!("adding conntrack subscription ({}, {})", owner, priority);

        let mut list = self.conntrack.lock().unwrap();
        let existing = list.insert(
            owner.to_string(),
            SubscriptionHolder {
                owner: owner.to_string(),
                priority,
                func,
            },
        );
        drop(list);

        if existing.is_some() {
            panic!("duplicate conntrack subscription detected: {}", owner);
        }
    }

    /// Adds a subscription for receiving netlogger events.
    pub fn insert_netlogger(&self, owner: &str, priority: u8, func: NetloggerFunc) {
        assert!(
            priority <= MAX_PRIORITY,
            "netlogger subscription priority {} out of range for {}",
            priority,
            owner
        );
        info!("adding netlogger subscription ({}, {})", owner, priority);

        let mut list = self.netlogger.lock().unwrap();
        let existing = list.insert(
            owner.to_string(),
            SubscriptionHolder {
                owner: owner.to_string(),
                priority,
                func,
            },
        );
        drop(list);

        if existing.is_some() {
            panic!("duplicate netlogger subscription detected: {}", owner);
        }
    }

    /// Copy of the nfqueue list, taken once per session at creation time.
    pub fn mirror_nfqueue(&self) -> HashMap<String, NfqueueSubscription> {
        self.nfqueue.lock().unwrap().clone()
    }

    /// Conntrack subscribers in ascending priority order.
    pub fn conntrack_subscribers(&self) -> Vec<ConntrackSubscription> {
        let mut subscribers: Vec<_> = self.conntrack.lock().unwrap().values().cloned().collect();
        subscribers.sort_by_key(|s| s.priority);
        subscribers
    }

    /// Netlogger subscribers in ascending priority order.
    pub fn netlogger_subscribers(&self) -> Vec<NetloggerSubscription> {
        let mut subscribers: Vec<_> = self.netlogger.lock().unwrap().values().cloned().collect();
        subscribers.sort_by_key(|s| s.priority);
        subscribers
    }

    pub fn nfqueue_count(&self) -> usize {
        self.nfqueue.lock().unwrap().len()
    }
}
