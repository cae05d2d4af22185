//! Nfqueue message
//!
//! The parsed form of one queued packet, handed to every subscribed plugin.
//! Layer views carry owned copies of the header fields so the message can
//! outlive the kernel buffer and cross task boundaries.

use super::session::Session;
use super::tuple::Tuple;
use crate::protocol::icmp::IcmpHeader;
use crate::protocol::ipv4::Ipv4Header;
use crate::protocol::ipv6::Ipv6Header;
use crate::protocol::tcp::{TcpFlags, TcpHeader};
use crate::protocol::udp::UdpHeader;
use crate::protocol::{icmp, tcp, udp};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// IPv4 layer view
#[derive(Debug, Clone, Copy)]
pub struct Ip4View {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
}

/// IPv6 layer view
#[derive(Debug, Clone, Copy)]
pub struct Ip6View {
    pub src_addr: Ipv6Addr,
    pub dst_addr: Ipv6Addr,
    pub next_header: u8,
    pub hop_limit: u8,
}

/// TCP layer view
#[derive(Debug, Clone, Copy)]
pub struct TcpView {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: TcpFlags,
}

/// UDP layer view
#[derive(Debug, Clone, Copy)]
pub struct UdpView {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
}

/// ICMPv4 layer view
#[derive(Debug, Clone, Copy)]
pub struct Icmp4View {
    pub icmp_type: u8,
    pub code: u8,
    pub identifier: u16,
}

/// One queued packet, parsed.
#[derive(Debug)]
pub struct NfqueueMessage {
    /// The session this packet belongs to, set once lookup has run.
    pub session: Option<Arc<Session>>,
    /// Flow tuple in packet direction.
    pub tuple: Tuple,
    /// Raw IP packet bytes (copied out of the kernel buffer).
    pub data: Vec<u8>,
    /// Packet length as reported by the kernel.
    pub length: usize,
    /// True when the packet travels in the client-to-server direction.
    pub client_to_server: bool,
    pub ip4: Option<Ip4View>,
    pub ip6: Option<Ip6View>,
    pub tcp: Option<TcpView>,
    pub udp: Option<UdpView>,
    pub icmp4: Option<Icmp4View>,
    payload_offset: usize,
}

impl NfqueueMessage {
    /// Parse a raw IP packet into a message.
    ///
    /// Returns None when neither an IPv4 nor an IPv6 header is present; such
    /// packets are accepted untouched and never reach a session.
    pub fn parse(data: Vec<u8>, length: usize) -> Option<Self> {
        let mut message = NfqueueMessage {
            session: None,
            tuple: Tuple {
                protocol: 0,
                client_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                client_port: 0,
                server_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                server_port: 0,
            },
            data,
            length,
            client_to_server: true,
            ip4: None,
            ip6: None,
            tcp: None,
            udp: None,
            icmp4: None,
            payload_offset: 0,
        };

        let (transport, l4_offset) = if let Ok(ip4) = Ipv4Header::parse(&message.data) {
            message.ip4 = Some(Ip4View {
                src_addr: ip4.src_addr(),
                dst_addr: ip4.dst_addr(),
                protocol: ip4.protocol(),
                ttl: ip4.ttl(),
            });
            message.tuple.protocol = ip4.protocol();
            message.tuple.client_address = IpAddr::V4(ip4.src_addr());
            message.tuple.server_address = IpAddr::V4(ip4.dst_addr());
            (ip4.protocol(), ip4.header_len())
        } else if let Ok(ip6) = Ipv6Header::parse(&message.data) {
            message.ip6 = Some(Ip6View {
                src_addr: ip6.src_addr(),
                dst_addr: ip6.dst_addr(),
                next_header: ip6.next_header(),
                hop_limit: ip6.hop_limit(),
            });
            // NextHeader stands in for the transport protocol even when an
            // extension header chain follows.
            message.tuple.protocol = ip6.next_header();
            message.tuple.client_address = IpAddr::V6(ip6.src_addr());
            message.tuple.server_address = IpAddr::V6(ip6.dst_addr());
            (ip6.next_header(), crate::protocol::ipv6::HEADER_SIZE)
        } else {
            return None;
        };

        message.payload_offset = message.data.len().min(l4_offset);
        let l4_data = &message.data[message.payload_offset..];

        match transport {
            tcp::PROTOCOL_NUMBER => {
                if let Ok(header) = TcpHeader::parse(l4_data) {
                    message.tuple.client_port = header.src_port();
                    message.tuple.server_port = header.dst_port();
                    message.tcp = Some(TcpView {
                        src_port: header.src_port(),
                        dst_port: header.dst_port(),
                        flags: header.flags(),
                    });
                    message.payload_offset += header.header_len();
                }
            }
            udp::PROTOCOL_NUMBER => {
                if let Ok(header) = UdpHeader::parse(l4_data) {
                    message.tuple.client_port = header.src_port();
                    message.tuple.server_port = header.dst_port();
                    message.udp = Some(UdpView {
                        src_port: header.src_port(),
                        dst_port: header.dst_port(),
                        length: header.length(),
                    });
                    message.payload_offset += udp::HEADER_SIZE;
                }
            }
            icmp::PROTOCOL_NUMBER => {
                if let Ok(header) = IcmpHeader::parse(l4_data) {
                    // Both ports carry the echo identifier so the standard
                    // tuple form works for ICMP flows.
                    message.tuple.client_port = header.identifier();
                    message.tuple.server_port = header.identifier();
                    message.icmp4 = Some(Icmp4View {
                        icmp_type: header.icmp_type(),
                        code: header.code(),
                        identifier: header.identifier(),
                    });
                    message.payload_offset += 8;
                }
            }
            // ICMPv6 flows keep zeroed ports; the payload view still works.
            _ => {}
        }

        message.payload_offset = message.payload_offset.min(message.data.len());
        Some(message)
    }

    /// Application-layer payload after the parsed headers.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_offset..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ipv4::{Ipv4Builder, Protocol};
    use crate::protocol::ipv6::Ipv6Builder;
    use crate::protocol::{icmp, tcp, udp};

    fn tcp_packet() -> Vec<u8> {
        let flags = TcpFlags {
            syn: true,
            ..Default::default()
        };
        let segment = tcp::build_segment(50000, 443, flags, b"payload");
        Ipv4Builder::new()
            .src_addr(Ipv4Addr::new(10, 0, 0, 1))
            .dst_addr(Ipv4Addr::new(93, 184, 216, 34))
            .protocol(Protocol::Tcp as u8)
            .payload(&segment)
            .build()
    }

    #[test]
    fn test_parse_tcp_v4() {
        let packet = tcp_packet();
        let length = packet.len();
        let message = NfqueueMessage::parse(packet, length).unwrap();

        assert_eq!(
            message.tuple.forward(),
            "6|10.0.0.1:50000-93.184.216.34:443"
        );
        assert!(message.ip4.is_some());
        assert!(message.ip6.is_none());
        let tcp = message.tcp.unwrap();
        assert!(tcp.flags.syn);
        assert_eq!(message.payload(), b"payload");
    }

    #[test]
    fn test_parse_udp_v6() {
        let datagram = udp::build_datagram(5353, 53, b"q");
        let packet = Ipv6Builder::new()
            .src_addr("2001:db8::1".parse().unwrap())
            .dst_addr("2001:db8::2".parse().unwrap())
            .next_header(Protocol::Udp as u8)
            .payload(&datagram)
            .build();
        let length = packet.len();

        let message = NfqueueMessage::parse(packet, length).unwrap();
        assert_eq!(message.tuple.protocol, 17);
        assert_eq!(message.tuple.client_port, 5353);
        assert_eq!(message.tuple.server_port, 53);
        assert!(message.ip6.is_some());
        assert_eq!(message.payload(), b"q");
    }

    #[test]
    fn test_parse_icmp_uses_identifier_for_both_ports() {
        let echo = icmp::build_echo_request(0x4242, 1);
        let packet = Ipv4Builder::new()
            .src_addr(Ipv4Addr::new(192, 168, 1, 10))
            .dst_addr(Ipv4Addr::new(8, 8, 8, 8))
            .protocol(Protocol::Icmp as u8)
            .payload(&echo)
            .build();
        let length = packet.len();

        let message = NfqueueMessage::parse(packet, length).unwrap();
        assert_eq!(message.tuple.client_port, 0x4242);
        assert_eq!(message.tuple.server_port, 0x4242);
        assert_eq!(message.icmp4.unwrap().identifier, 0x4242);
    }

    #[test]
    fn test_parse_non_ip_returns_none() {
        assert!(NfqueueMessage::parse(vec![0xAA; 60], 60).is_none());
        assert!(NfqueueMessage::parse(Vec::new(), 0).is_none());
    }

    #[test]
    fn test_truncated_l4_keeps_ip_view() {
        let packet = Ipv4Builder::new()
            .src_addr(Ipv4Addr::new(10, 0, 0, 1))
            .dst_addr(Ipv4Addr::new(10, 0, 0, 2))
            .protocol(Protocol::Tcp as u8)
            .payload(&[0u8; 4]) // too short for a TCP header
            .build();
        let length = packet.len();

        let message = NfqueueMessage::parse(packet, length).unwrap();
        assert!(message.ip4.is_some());
        assert!(message.tcp.is_none());
        assert_eq!(message.tuple.client_port, 0);
    }
}
