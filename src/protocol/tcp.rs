//! Zero-copy TCP header parser, including the option fields the flow
//! engine feeds on (timestamps and SACK blocks).
//!
//! TCP header layout (20-60 bytes):
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |          Source Port          |       Destination Port        |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                        Sequence Number                       |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                    Acknowledgment Number                     |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |  Data |       |N|C|E|U|A|P|R|S|F|                             |
//!  | Offset| Rsrvd |S|W|C|R|C|S|S|Y|I|           Window            |
//!  |       |       | |R|E|G|K|H|T|N|N|                             |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |           Checksum            |         Urgent Pointer        |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                    Options                    |    Padding    |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!
//! NS (RFC 3540 nonce sum, reused by SCE as ESCE) lives in the low bit
//! of byte 12, outside the main flags byte.

use super::ParseError;
use std::fmt;

/// Minimum TCP header length (no options)
pub const TCP_MIN_HEADER_LEN: usize = 20;

/// TCP flags bitmask constants (byte 13)
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;
}

/// TCP option kinds this tool reads.
pub mod option_kind {
    pub const EOL: u8 = 0;
    pub const NOP: u8 = 1;
    pub const SACK: u8 = 5;
    pub const TIMESTAMPS: u8 = 8;
}

/// Parsed TCP timestamps option (kind 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpTimestamps {
    pub ts_val: u32,
    pub ts_ecr: u32,
}

/// One SACK block: the receiver holds the byte range [left, right).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    pub left: u32,
    pub right: u32,
}

impl SackBlock {
    /// Width of the block in bytes, modulo sequence wraparound.
    #[inline]
    pub fn bytes(&self) -> u32 {
        self.right.wrapping_sub(self.left)
    }
}

/// Zero-copy TCP header.
#[derive(Debug)]
pub struct TcpHeader<'a> {
    data: &'a [u8],
    header_len: usize,
}

impl<'a> TcpHeader<'a> {
    /// Parse a TCP header from a byte slice.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() < TCP_MIN_HEADER_LEN {
            return Err(ParseError::TooShort {
                expected: TCP_MIN_HEADER_LEN,
                actual: data.len(),
            });
        }

        let data_offset = ((data[12] >> 4) & 0x0F) as usize;
        let header_len = data_offset * 4;

        if header_len < TCP_MIN_HEADER_LEN {
            return Err(ParseError::InvalidHeader(format!(
                "TCP data offset too small: {} (min 5)",
                data_offset
            )));
        }

        if data.len() < header_len {
            return Err(ParseError::TooShort {
                expected: header_len,
                actual: data.len(),
            });
        }

        Ok(TcpHeader { data, header_len })
    }

    /// Source port.
    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    /// Destination port.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    /// Sequence number.
    #[inline]
    pub fn sequence_number(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    /// Acknowledgment number.
    #[inline]
    pub fn ack_number(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    /// Data offset in 32-bit words.
    #[inline]
    pub fn data_offset(&self) -> u8 {
        (self.data[12] >> 4) & 0x0F
    }

    /// Header length in bytes.
    #[inline]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Check individual flags
    #[inline]
    pub fn fin(&self) -> bool {
        self.data[13] & flags::FIN != 0
    }

    #[inline]
    pub fn syn(&self) -> bool {
        self.data[13] & flags::SYN != 0
    }

    #[inline]
    pub fn rst(&self) -> bool {
        self.data[13] & flags::RST != 0
    }

    #[inline]
    pub fn psh(&self) -> bool {
        self.data[13] & flags::PSH != 0
    }

    #[inline]
    pub fn ack(&self) -> bool {
        self.data[13] & flags::ACK != 0
    }

    #[inline]
    pub fn urg(&self) -> bool {
        self.data[13] & flags::URG != 0
    }

    #[inline]
    pub fn ece(&self) -> bool {
        self.data[13] & flags::ECE != 0
    }

    #[inline]
    pub fn cwr(&self) -> bool {
        self.data[13] & flags::CWR != 0
    }

    /// NS bit (low bit of the data-offset byte).
    #[inline]
    pub fn ns(&self) -> bool {
        self.data[12] & 0x01 != 0
    }

    /// Format flags as a string like "[SYN, ACK]".
    pub fn flags_string(&self) -> String {
        let mut parts = Vec::new();
        if self.syn() {
            parts.push("SYN");
        }
        if self.ack() {
            parts.push("ACK");
        }
        if self.fin() {
            parts.push("FIN");
        }
        if self.rst() {
            parts.push("RST");
        }
        if self.psh() {
            parts.push("PSH");
        }
        if self.urg() {
            parts.push("URG");
        }
        if self.ece() {
            parts.push("ECE");
        }
        if self.cwr() {
            parts.push("CWR");
        }
        if self.ns() {
            parts.push("NS");
        }
        format!("[{}]", parts.join(", "))
    }

    /// Window size.
    #[inline]
    pub fn window_size(&self) -> u16 {
        u16::from_be_bytes([self.data[14], self.data[15]])
    }

    /// Checksum field (not verified).
    #[inline]
    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[16], self.data[17]])
    }

    /// TCP options bytes (if any).
    #[inline]
    pub fn options(&self) -> &'a [u8] {
        &self.data[TCP_MIN_HEADER_LEN..self.header_len]
    }

    /// Iterate raw (kind, data) options.
    pub fn options_iter(&self) -> TcpOptionsIter<'a> {
        TcpOptionsIter {
            rest: self.options(),
        }
    }

    /// The timestamps option, when present and exactly 10 bytes.
    pub fn timestamps(&self) -> Option<TcpTimestamps> {
        for (kind, data) in self.options_iter() {
            if kind == option_kind::TIMESTAMPS && data.len() == 8 {
                return Some(TcpTimestamps {
                    ts_val: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
                    ts_ecr: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                });
            }
        }
        None
    }

    /// SACK blocks in option order. Trailing bytes that do not fill a
    /// whole 8-byte block are ignored.
    pub fn sack_blocks(&self) -> impl Iterator<Item = SackBlock> + 'a {
        TcpOptionsIter {
            rest: self.options(),
        }
        .filter(|(kind, _)| *kind == option_kind::SACK)
        .flat_map(|(_, data)| {
            data.chunks_exact(8).map(|c| SackBlock {
                left: u32::from_be_bytes([c[0], c[1], c[2], c[3]]),
                right: u32::from_be_bytes([c[4], c[5], c[6], c[7]]),
            })
        })
    }

    /// Payload after the TCP header.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len..]
    }
}

impl<'a> fmt::Display for TcpHeader<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ":{} -> :{} {} seq={} ack={} win={}",
            self.src_port(),
            self.dst_port(),
            self.flags_string(),
            self.sequence_number(),
            self.ack_number(),
            self.window_size()
        )
    }
}

/// Walks the TCP options area. EOL stops the walk; a declared length
/// shorter than 2 or running past the buffer stops it as malformed.
pub struct TcpOptionsIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for TcpOptionsIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (&kind, after_kind) = self.rest.split_first()?;
        match kind {
            option_kind::EOL => None,
            option_kind::NOP => {
                self.rest = after_kind;
                Some((kind, &[]))
            }
            _ => {
                let (&len, after_len) = after_kind.split_first()?;
                let len = len as usize;
                if len < 2 || len - 2 > after_len.len() {
                    self.rest = &[];
                    return None;
                }
                let (data, tail) = after_len.split_at(len - 2);
                self.rest = tail;
                Some((kind, data))
            }
        }
    }
}
