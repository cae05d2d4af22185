//! Metrics collection for dispatch statistics.
//!
//! Thread-safe counters covering the per-packet path, session lifecycle,
//! and the kernel event consumers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-write-wins gauge for table sizes.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Global metrics registry for the dispatch engine.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    // nfqueue path
    /// Packets handed up from the kernel queue.
    pub packets_dispatched: Counter,
    /// Packets with no IP layer, accepted untouched.
    pub non_ip_accepted: Counter,
    /// Mid-flow packets with no session, bypassed.
    pub midflow_bypasses: Counter,
    /// Plugin handlers that exceeded the guard timer.
    pub handler_timeouts: Counter,
    /// Subscriptions released from sessions.
    pub session_releases: Counter,
    /// Sessions whose subscriber count reached zero.
    pub bypasses_set: Counter,

    // session lifecycle
    /// Sessions created.
    pub sessions_created: Counter,
    /// Sessions removed (destroy, cleanup, or playback flush).
    pub sessions_removed: Counter,
    /// Unconfirmed sessions evicted by a colliding new flow.
    pub sessions_collided: Counter,

    // kernel event consumers
    /// Conntrack NEW events.
    pub conntrack_new: Counter,
    /// Conntrack UPDATE events.
    pub conntrack_update: Counter,
    /// Conntrack DESTROY events.
    pub conntrack_destroy: Counter,
    /// Netlogger events delivered.
    pub netlogger_events: Counter,

    // cleaner
    /// Completed cleaner passes.
    pub cleaner_passes: Counter,

    // table sizes
    /// Current session table entry count.
    pub session_table_size: Gauge,
    /// Current conntrack table entry count.
    pub conntrack_table_size: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.add(10);
        assert_eq!(counter.get(), 11);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::default();
        gauge.set(42);
        assert_eq!(gauge.get(), 42);
        gauge.set(7);
        assert_eq!(gauge.get(), 7);
    }

    #[test]
    fn test_registry_counters_independent() {
        let registry = MetricsRegistry::new();
        registry.packets_dispatched.inc();
        registry.sessions_created.inc();
        registry.sessions_created.inc();
        assert_eq!(registry.packets_dispatched.get(), 1);
        assert_eq!(registry.sessions_created.get(), 2);
        assert_eq!(registry.handler_timeouts.get(), 0);
    }
}
