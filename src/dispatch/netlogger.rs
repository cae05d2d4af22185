//! Netlogger event fan-out
//!
//! NFLOG records are delivered to every netlogger subscriber in ascending
//! priority order. No session is involved and no guard timer applies; the
//! handlers are expected to be cheap.

use super::DispatchEngine;
use crate::kernel::NetloggerEvent;
use std::sync::Arc;
use tracing::trace;

/// Netlogger handler.
pub type NetloggerFunc = Arc<dyn Fn(&NetloggerEvent) + Send + Sync>;

impl DispatchEngine {
    /// Consumes one NFLOG record from the kernel shim.
    pub fn netlogger_callback(&self, event: &NetloggerEvent) {
        self.metrics.netlogger_events.inc();
        trace!(
            "netlogger event: {} -> {} prefix '{}'",
            event.src_address,
            event.dst_address,
            event.prefix
        );

        for subscriber in self.registry.netlogger_subscribers() {
            trace!(
                "calling netlogger plugin:{} priority:{}",
                subscriber.owner,
                subscriber.priority
            );
            (subscriber.func)(event);
        }
    }
}
