//! Kernel boundary
//!
//! Types shared with whatever feeds the engine: verdicts, the mark bit
//! contract, conntrack/netlogger event shapes, the shim-side delivery
//! filter, and the driver trait. Production wires a real netfilter queue
//! behind this boundary; tests and playback wire the in-memory driver.

mod playback;

pub use playback::{CaptureReader, CaptureWriter, PlaybackDriver, Record, VerdictRecord};

use crate::dispatch::DispatchEngine;
use crate::Result;
use std::collections::HashSet;
use std::future::Future;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// Mark bit the kernel sets on the first packet of a new flow.
pub const NEW_FLOW_MARK: u32 = 0x1000_0000;

/// Verdict returned to the kernel for a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Verdict {
    Drop = 0,
    Accept = 1,
}

impl Verdict {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Conntrack event kinds reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConntrackEventType {
    New,
    Update,
    Destroy,
}

impl ConntrackEventType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            b'N' => Some(Self::New),
            b'U' => Some(Self::Update),
            b'D' => Some(Self::Destroy),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::New => b'N',
            Self::Update => b'U',
            Self::Destroy => b'D',
        }
    }
}

/// One conntrack notification handed up from the kernel.
#[derive(Debug, Clone)]
pub struct ConntrackEvent {
    pub event_type: ConntrackEventType,
    pub conntrack_id: u32,
    pub protocol: u8,
    pub src_address: IpAddr,
    pub dst_address: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Original-direction byte total reported by the kernel.
    pub orig_bytes: u64,
    /// Reply-direction byte total reported by the kernel.
    pub repl_bytes: u64,
}

/// One NFLOG record handed up from the kernel.
#[derive(Debug, Clone)]
pub struct NetloggerEvent {
    pub version: u8,
    pub protocol: u8,
    pub icmp_type: u16,
    pub src_interface: u8,
    pub dst_interface: u8,
    pub src_address: IpAddr,
    pub dst_address: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub mark: u32,
    pub prefix: String,
}

/// Shim-side delivery filter: loopback flows and anything other than
/// TCP/UDP never reach the engine.
pub fn conntrack_event_allowed(event: &ConntrackEvent) -> bool {
    if event.protocol != 6 && event.protocol != 17 {
        return false;
    }
    if leading_octet(&event.src_address) == 127 || leading_octet(&event.dst_address) == 127 {
        return false;
    }
    true
}

fn leading_octet(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(a) => a.octets()[0],
        IpAddr::V6(a) => a.octets()[0],
    }
}

/// Conntrack ids created during a warehouse playback, kept so the entries
/// can be removed once the capture has been analyzed.
#[derive(Debug, Default)]
pub struct PlaybackCleanup {
    pub nfqueue_ids: HashSet<u32>,
    pub conntrack_ids: HashSet<u32>,
}

/// The boundary between the dispatch engine and its packet source.
///
/// A production driver owns the netfilter queue sockets; [`PlaybackDriver`]
/// replays capture files. Either way the driver holds the engine handle and
/// invokes its callbacks, which is the registration step the engine's
/// startup expects.
pub trait KernelDriver: Send + Sync {
    /// Apply a verdict for a queued packet.
    fn send_verdict(&self, ctid: u32, verdict: Verdict, mark: u32);

    /// Replay a capture file through the engine, returning the ids created
    /// during playback so they can be cleaned up.
    fn warehouse_playback_file(
        &self,
        path: &Path,
    ) -> impl Future<Output = Result<PlaybackCleanup>> + Send;

    /// The engine this driver feeds.
    fn engine(&self) -> &Arc<DispatchEngine>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn event(protocol: u8, src: [u8; 4], dst: [u8; 4]) -> ConntrackEvent {
        ConntrackEvent {
            event_type: ConntrackEventType::New,
            conntrack_id: 1,
            protocol,
            src_address: IpAddr::V4(Ipv4Addr::from(src)),
            dst_address: IpAddr::V4(Ipv4Addr::from(dst)),
            src_port: 1000,
            dst_port: 80,
            orig_bytes: 0,
            repl_bytes: 0,
        }
    }

    #[test]
    fn test_tcp_and_udp_allowed() {
        assert!(conntrack_event_allowed(&event(6, [10, 0, 0, 1], [10, 0, 0, 2])));
        assert!(conntrack_event_allowed(&event(17, [10, 0, 0, 1], [10, 0, 0, 2])));
    }

    #[test]
    fn test_icmp_filtered() {
        assert!(!conntrack_event_allowed(&event(1, [10, 0, 0, 1], [10, 0, 0, 2])));
    }

    #[test]
    fn test_loopback_filtered() {
        assert!(!conntrack_event_allowed(&event(6, [127, 0, 0, 1], [10, 0, 0, 2])));
        assert!(!conntrack_event_allowed(&event(6, [10, 0, 0, 1], [127, 1, 2, 3])));
    }

    #[test]
    fn test_event_type_roundtrip() {
        for event_type in [
            ConntrackEventType::New,
            ConntrackEventType::Update,
            ConntrackEventType::Destroy,
        ] {
            assert_eq!(
                ConntrackEventType::from_u8(event_type.to_u8()),
                Some(event_type)
            );
        }
        assert_eq!(ConntrackEventType::from_u8(b'X'), None);
    }
}
