//! Network protocol header views
//!
//! Zero-copy parsers for the layers the dispatch needs to identify a flow,
//! plus small builders used to assemble packets in tests and capture files.

pub mod icmp;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;
