//! IPv6 protocol - RFC 8200

use crate::{Error, Result};
use std::net::Ipv6Addr;

/// IPv6 fixed header size (always 40 bytes)
pub const HEADER_SIZE: usize = 40;

/// Parsed IPv6 header (zero-copy reference)
#[derive(Debug)]
pub struct Ipv6Header<'a> {
    buffer: &'a [u8],
}

impl<'a> Ipv6Header<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("IPv6 header too short".into()));
        }

        let version = buffer[0] >> 4;
        if version != 6 {
            return Err(Error::Parse("not an IPv6 packet".into()));
        }

        Ok(Self { buffer })
    }

    pub fn version(&self) -> u8 {
        self.buffer[0] >> 4
    }

    /// Payload Length (excludes 40-byte header)
    pub fn payload_length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    /// Next Header (protocol or extension header type)
    pub fn next_header(&self) -> u8 {
        self.buffer[6]
    }

    pub fn hop_limit(&self) -> u8 {
        self.buffer[7]
    }

    pub fn src_addr(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.buffer[8..24]);
        Ipv6Addr::from(octets)
    }

    pub fn dst_addr(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.buffer[24..40]);
        Ipv6Addr::from(octets)
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..]
    }
}

/// Builder for IPv6 packets (fixed header only, no extension headers)
#[derive(Debug)]
pub struct Ipv6Builder {
    src_addr: Ipv6Addr,
    dst_addr: Ipv6Addr,
    next_header: u8,
    hop_limit: u8,
    payload: Vec<u8>,
}

impl Default for Ipv6Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Ipv6Builder {
    pub fn new() -> Self {
        Self {
            src_addr: Ipv6Addr::UNSPECIFIED,
            dst_addr: Ipv6Addr::UNSPECIFIED,
            next_header: 59, // no next header
            hop_limit: 64,
            payload: Vec::new(),
        }
    }

    pub fn src_addr(mut self, addr: Ipv6Addr) -> Self {
        self.src_addr = addr;
        self
    }

    pub fn dst_addr(mut self, addr: Ipv6Addr) -> Self {
        self.dst_addr = addr;
        self
    }

    pub fn next_header(mut self, next_header: u8) -> Self {
        self.next_header = next_header;
        self
    }

    pub fn hop_limit(mut self, hop_limit: u8) -> Self {
        self.hop_limit = hop_limit;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut packet = vec![0u8; HEADER_SIZE];

        packet[0] = 0x60; // version 6
        packet[4..6].copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        packet[6] = self.next_header;
        packet[7] = self.hop_limit;
        packet[8..24].copy_from_slice(&self.src_addr.octets());
        packet[24..40].copy_from_slice(&self.dst_addr.octets());

        packet.extend_from_slice(&self.payload);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_parse() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();

        let packet = Ipv6Builder::new()
            .src_addr(src)
            .dst_addr(dst)
            .next_header(17)
            .payload(&[1, 2, 3, 4])
            .build();

        let header = Ipv6Header::parse(&packet).unwrap();
        assert_eq!(header.version(), 6);
        assert_eq!(header.next_header(), 17);
        assert_eq!(header.src_addr(), src);
        assert_eq!(header.dst_addr(), dst);
        assert_eq!(header.payload_length(), 4);
        assert_eq!(header.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_parse_too_short() {
        assert!(Ipv6Header::parse(&[0x60; 39]).is_err());
    }

    #[test]
    fn test_parse_wrong_version() {
        let mut packet = Ipv6Builder::new().build();
        packet[0] = 0x45;
        assert!(Ipv6Header::parse(&packet).is_err());
    }
}
