//! Session tuple
//!
//! A flow is identified by protocol plus the client and server endpoints as
//! first observed. The forward string form keys the session table; the
//! reverse form is probed to recognize reply-direction packets.

use std::fmt;
use std::net::IpAddr;

/// Canonical bidirectional 5-tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub protocol: u8,
    pub client_address: IpAddr,
    pub client_port: u16,
    pub server_address: IpAddr,
    pub server_port: u16,
}

impl Tuple {
    /// Forward canonical form, the session-table key.
    pub fn forward(&self) -> String {
        format!(
            "{}|{}:{}-{}:{}",
            self.protocol,
            self.client_address,
            self.client_port,
            self.server_address,
            self.server_port
        )
    }

    /// Reverse canonical form with client and server swapped.
    pub fn reverse(&self) -> String {
        format!(
            "{}|{}:{}-{}:{}",
            self.protocol,
            self.server_address,
            self.server_port,
            self.client_address,
            self.client_port
        )
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.forward())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn tcp_tuple() -> Tuple {
        Tuple {
            protocol: 6,
            client_address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_port: 50000,
            server_address: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            server_port: 443,
        }
    }

    #[test]
    fn test_forward_form() {
        assert_eq!(tcp_tuple().forward(), "6|10.0.0.1:50000-93.184.216.34:443");
        assert_eq!(tcp_tuple().to_string(), tcp_tuple().forward());
    }

    #[test]
    fn test_reverse_form() {
        assert_eq!(tcp_tuple().reverse(), "6|93.184.216.34:443-10.0.0.1:50000");
    }

    #[test]
    fn test_reverse_of_reverse_is_forward() {
        let tuple = tcp_tuple();
        let swapped = Tuple {
            protocol: tuple.protocol,
            client_address: tuple.server_address,
            client_port: tuple.server_port,
            server_address: tuple.client_address,
            server_port: tuple.client_port,
        };
        assert_eq!(swapped.reverse(), tuple.forward());
    }

    #[test]
    fn test_ipv6_form() {
        let tuple = Tuple {
            protocol: 17,
            client_address: IpAddr::V6(Ipv6Addr::LOCALHOST),
            client_port: 1,
            server_address: IpAddr::V6("2001:db8::5".parse().unwrap()),
            server_port: 53,
        };
        assert_eq!(tuple.forward(), "17|::1:1-2001:db8::5:53");
    }
}
