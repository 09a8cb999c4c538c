//! Zero-copy IPv6 header parser.
//!
//! IPv6 fixed header layout (40 bytes):
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |Version| Traffic Class |           Flow Label                  |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |         Payload Length        |  Next Header  |   Hop Limit   |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                         Source Address                        |
//!  |                          (128 bits)                           |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                      Destination Address                      |
//!  |                          (128 bits)                           |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

use super::{Ecn, IpProtocol, ParseError};
use std::fmt;
use std::net::Ipv6Addr;

/// IPv6 fixed header length
pub const IPV6_HEADER_LEN: usize = 40;

/// Zero-copy IPv6 header.
#[derive(Debug)]
pub struct Ipv6Header<'a> {
    data: &'a [u8],
}

impl<'a> Ipv6Header<'a> {
    /// Parse an IPv6 header from a byte slice.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() < IPV6_HEADER_LEN {
            return Err(ParseError::TooShort {
                expected: IPV6_HEADER_LEN,
                actual: data.len(),
            });
        }

        let version = (data[0] >> 4) & 0x0F;
        if version != 6 {
            return Err(ParseError::InvalidHeader(format!(
                "expected IPv6 (version 6), got version {}",
                version
            )));
        }

        Ok(Ipv6Header { data })
    }

    /// IP version (always 6).
    #[inline]
    pub fn version(&self) -> u8 {
        (self.data[0] >> 4) & 0x0F
    }

    /// Traffic class (8 bits).
    #[inline]
    pub fn traffic_class(&self) -> u8 {
        ((self.data[0] & 0x0F) << 4) | ((self.data[1] >> 4) & 0x0F)
    }

    /// ECN codepoint (lower 2 bits of the traffic class).
    #[inline]
    pub fn ecn(&self) -> Ecn {
        Ecn::from_bits(self.traffic_class())
    }

    /// Flow label (20 bits).
    #[inline]
    pub fn flow_label(&self) -> u32 {
        ((self.data[1] & 0x0F) as u32) << 16 | (self.data[2] as u32) << 8 | self.data[3] as u32
    }

    /// Payload length (not including the 40-byte fixed header).
    #[inline]
    pub fn payload_length(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    /// Next header protocol number.
    #[inline]
    pub fn next_header(&self) -> IpProtocol {
        IpProtocol::from(self.data[6])
    }

    /// Next header raw value.
    #[inline]
    pub fn next_header_raw(&self) -> u8 {
        self.data[6]
    }

    /// Hop limit (analogous to IPv4 TTL).
    #[inline]
    pub fn hop_limit(&self) -> u8 {
        self.data[7]
    }

    /// Source IPv6 address.
    #[inline]
    pub fn src_addr(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data[8..24]);
        Ipv6Addr::from(octets)
    }

    /// Destination IPv6 address.
    #[inline]
    pub fn dst_addr(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data[24..40]);
        Ipv6Addr::from(octets)
    }

    /// Payload after the fixed IPv6 header.
    /// Note: does not handle extension headers (they appear in payload).
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let payload_len = self.payload_length() as usize;
        let available = self.data.len() - IPV6_HEADER_LEN;
        let end = IPV6_HEADER_LEN + payload_len.min(available);
        &self.data[IPV6_HEADER_LEN..end]
    }
}

impl<'a> fmt::Display for Ipv6Header<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} next_hdr={} hop_limit={} len={}",
            self.src_addr(),
            self.dst_addr(),
            self.next_header_raw(),
            self.hop_limit(),
            self.payload_length()
        )
    }
}
