//! nfdispatch - per-packet plugin dispatch engine
//!
//! Sits between the kernel netfilter queue / conntrack subsystem and a set
//! of user-space plugin subscribers. Every queued packet is parsed into a
//! session tuple, matched to (or creating) a session table entry, fanned out
//! to the subscribed plugins in priority order, and answered with a single
//! combined verdict and packet mark before the kernel queue timeout fires.

pub mod config;
pub mod dict;
pub mod dispatch;
pub mod error;
pub mod kernel;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result};
