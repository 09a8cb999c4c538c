//! Zero-copy IPv4 header parser.
//!
//! IPv4 header layout (20-60 bytes):
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |Version|  IHL  |Type of Service|          Total Length         |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |         Identification        |Flags|      Fragment Offset    |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |  Time to Live |    Protocol   |         Header Checksum       |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                       Source Address                          |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                    Destination Address                        |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                    Options                    |    Padding    |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

use super::{Ecn, IpProtocol, ParseError};
use std::fmt;
use std::net::Ipv4Addr;

/// Minimum IPv4 header length (no options)
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Zero-copy IPv4 header.
#[derive(Debug)]
pub struct Ipv4Header<'a> {
    data: &'a [u8],
    header_len: usize,
}

impl<'a> Ipv4Header<'a> {
    /// Parse an IPv4 header from a byte slice.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() < IPV4_MIN_HEADER_LEN {
            return Err(ParseError::TooShort {
                expected: IPV4_MIN_HEADER_LEN,
                actual: data.len(),
            });
        }

        let version = (data[0] >> 4) & 0x0F;
        if version != 4 {
            return Err(ParseError::InvalidHeader(format!(
                "expected IPv4 (version 4), got version {}",
                version
            )));
        }

        let ihl = (data[0] & 0x0F) as usize;
        let header_len = ihl * 4;

        if header_len < IPV4_MIN_HEADER_LEN {
            return Err(ParseError::InvalidHeader(format!(
                "IHL too small: {} (min 5)",
                ihl
            )));
        }

        if data.len() < header_len {
            return Err(ParseError::TooShort {
                expected: header_len,
                actual: data.len(),
            });
        }

        Ok(Ipv4Header { data, header_len })
    }

    /// IP version (always 4).
    #[inline]
    pub fn version(&self) -> u8 {
        (self.data[0] >> 4) & 0x0F
    }

    /// Internet Header Length in 32-bit words.
    #[inline]
    pub fn ihl(&self) -> u8 {
        self.data[0] & 0x0F
    }

    /// Header length in bytes.
    #[inline]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Type of Service / DSCP + ECN.
    #[inline]
    pub fn tos(&self) -> u8 {
        self.data[1]
    }

    /// Differentiated Services Code Point (upper 6 bits of TOS).
    #[inline]
    pub fn dscp(&self) -> u8 {
        self.data[1] >> 2
    }

    /// ECN codepoint (lower 2 bits of TOS).
    #[inline]
    pub fn ecn(&self) -> Ecn {
        Ecn::from_bits(self.data[1])
    }

    /// Total length of the IP packet (header + payload) in bytes.
    #[inline]
    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    /// More Fragments flag.
    #[inline]
    pub fn more_fragments(&self) -> bool {
        (self.data[6] >> 5) & 1 == 1
    }

    /// Fragment offset in 8-byte units.
    #[inline]
    pub fn fragment_offset(&self) -> u16 {
        u16::from_be_bytes([self.data[6] & 0x1F, self.data[7]])
    }

    /// True for any fragment, first or later.
    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    /// Time to Live.
    #[inline]
    pub fn ttl(&self) -> u8 {
        self.data[8]
    }

    /// Protocol number.
    #[inline]
    pub fn protocol(&self) -> IpProtocol {
        IpProtocol::from(self.data[9])
    }

    /// Protocol number as raw u8.
    #[inline]
    pub fn protocol_raw(&self) -> u8 {
        self.data[9]
    }

    /// Source IP address.
    #[inline]
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    /// Destination IP address.
    #[inline]
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }

    /// Payload after the IPv4 header.
    /// Clamped to `total_length - header_len` to avoid reading trailer bytes.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let total = self.total_length() as usize;
        let payload_len = total.saturating_sub(self.header_len);
        let available = self.data.len() - self.header_len;
        let end = self.header_len + payload_len.min(available);
        &self.data[self.header_len..end]
    }
}

impl<'a> fmt::Display for Ipv4Header<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} proto={} ttl={} len={}",
            self.src_addr(),
            self.dst_addr(),
            self.protocol_raw(),
            self.ttl(),
            self.total_length()
        )
    }
}
