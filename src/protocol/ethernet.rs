//! Zero-copy Ethernet frame parser.
//!
//! Only the EtherType matters to this tool; MAC addresses are skipped
//! over. VLAN tags are handled by the caller.

use super::{EtherType, ParseError};

/// Minimum Ethernet header length (no VLAN tags)
pub const ETH_HEADER_LEN: usize = 14;

/// Zero-copy Ethernet header that borrows from the packet buffer.
#[derive(Debug)]
pub struct EthernetHeader<'a> {
    data: &'a [u8],
}

impl<'a> EthernetHeader<'a> {
    /// Parse an Ethernet header from a raw byte slice.
    /// Returns an error if there aren't enough bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() < ETH_HEADER_LEN {
            return Err(ParseError::TooShort {
                expected: ETH_HEADER_LEN,
                actual: data.len(),
            });
        }
        Ok(EthernetHeader { data })
    }

    /// EtherType field.
    #[inline]
    pub fn ether_type(&self) -> EtherType {
        EtherType::from(self.ether_type_raw())
    }

    /// Raw EtherType as u16.
    #[inline]
    pub fn ether_type_raw(&self) -> u16 {
        u16::from_be_bytes([self.data[12], self.data[13]])
    }

    /// The payload after the Ethernet header.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.data[ETH_HEADER_LEN..]
    }
}
