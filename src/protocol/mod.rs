//! Zero-copy packet decoding.
//!
//! Headers borrow the captured byte buffer; accessors read fields on
//! demand. `parse_packet` walks Ethernet → optional 802.1Q VLAN →
//! IPv4/IPv6 → TCP. Non-TCP transports are left undecoded (the flow
//! engine only accounts for them at the IP level), and a TCP header
//! that fails to parse yields `tcp: None` rather than an error, so a
//! truncated segment still counts toward the IP totals.

pub mod ethernet;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;

use std::fmt;
use std::net::IpAddr;

/// EtherType values this tool dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    Ipv4,
    Ipv6,
    VlanTagged,
    Unknown(u16),
}

impl From<u16> for EtherType {
    fn from(value: u16) -> Self {
        match value {
            0x0800 => EtherType::Ipv4,
            0x86DD => EtherType::Ipv6,
            0x8100 => EtherType::VlanTagged,
            other => EtherType::Unknown(other),
        }
    }
}

/// IP protocol numbers this tool dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Tcp,
    Udp,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(value: u8) -> Self {
        match value {
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }
}

/// 2-bit ECN codepoint from the low bits of the IPv4 TOS byte or the
/// IPv6 traffic class. 0b01, standardized as ECT(1), is read as the
/// experimental SCE mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ecn {
    NotEct,
    Sce,
    Ect,
    Ce,
}

impl Ecn {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0x00 => Ecn::NotEct,
            0x01 => Ecn::Sce,
            0x02 => Ecn::Ect,
            _ => Ecn::Ce,
        }
    }
}

/// Errors from protocol parsing
#[derive(Debug)]
pub enum ParseError {
    /// Not enough bytes to parse the header
    TooShort { expected: usize, actual: usize },
    /// Invalid header values
    InvalidHeader(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::TooShort { expected, actual } => {
                write!(f, "packet too short: need {} bytes, got {}", expected, actual)
            }
            ParseError::InvalidHeader(msg) => write!(f, "invalid header: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

/// A decoded packet, referencing the original byte slice.
#[derive(Debug)]
pub struct ParsedPacket<'a> {
    pub ethernet: ethernet::EthernetHeader<'a>,
    pub vlan: Option<VlanTag>,
    pub network: Option<NetworkHeader<'a>>,
    pub tcp: Option<tcp::TcpHeader<'a>>,
}

/// VLAN tag (802.1Q)
#[derive(Debug, Clone, Copy)]
pub struct VlanTag {
    pub priority: u8,
    pub dei: bool,
    pub vlan_id: u16,
}

/// Network layer header
#[derive(Debug)]
pub enum NetworkHeader<'a> {
    Ipv4(ipv4::Ipv4Header<'a>),
    Ipv6(ipv6::Ipv6Header<'a>),
}

impl<'a> NetworkHeader<'a> {
    pub fn src_ip(&self) -> IpAddr {
        match self {
            NetworkHeader::Ipv4(h) => IpAddr::V4(h.src_addr()),
            NetworkHeader::Ipv6(h) => IpAddr::V6(h.src_addr()),
        }
    }

    pub fn dst_ip(&self) -> IpAddr {
        match self {
            NetworkHeader::Ipv4(h) => IpAddr::V4(h.dst_addr()),
            NetworkHeader::Ipv6(h) => IpAddr::V6(h.dst_addr()),
        }
    }

    /// On-wire IP length: the IPv4 total length, or the IPv6 payload
    /// length plus the 40-byte fixed header.
    pub fn ip_len(&self) -> u64 {
        match self {
            NetworkHeader::Ipv4(h) => h.total_length() as u64,
            NetworkHeader::Ipv6(h) => h.payload_length() as u64 + ipv6::IPV6_HEADER_LEN as u64,
        }
    }

    /// ECN codepoint from the TOS / traffic class byte.
    pub fn ecn(&self) -> Ecn {
        match self {
            NetworkHeader::Ipv4(h) => h.ecn(),
            NetworkHeader::Ipv6(h) => h.ecn(),
        }
    }
}

/// Parse a complete packet from raw bytes.
/// This is the main entry point for the protocol stack.
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    // Layer 2: Ethernet
    let eth = ethernet::EthernetHeader::parse(data)?;
    let mut remaining = eth.payload();
    let mut ether_type = eth.ether_type();
    let mut vlan = None;

    // Handle VLAN tagging (802.1Q)
    if ether_type == EtherType::VlanTagged {
        if remaining.len() < 4 {
            return Err(ParseError::TooShort {
                expected: 4,
                actual: remaining.len(),
            });
        }
        let tci = u16::from_be_bytes([remaining[0], remaining[1]]);
        vlan = Some(VlanTag {
            priority: (tci >> 13) as u8,
            dei: (tci >> 12) & 1 == 1,
            vlan_id: tci & 0x0FFF,
        });
        ether_type = EtherType::from(u16::from_be_bytes([remaining[2], remaining[3]]));
        remaining = &remaining[4..];
    }

    // Layer 3: Network
    let (network, l4_data, ip_proto) = match ether_type {
        EtherType::Ipv4 => {
            let hdr = ipv4::Ipv4Header::parse(remaining)?;
            // No reassembly: any fragment stops at the IP layer.
            let proto = if hdr.is_fragment() {
                None
            } else {
                Some(hdr.protocol())
            };
            let payload = hdr.payload();
            (Some(NetworkHeader::Ipv4(hdr)), payload, proto)
        }
        EtherType::Ipv6 => {
            let hdr = ipv6::Ipv6Header::parse(remaining)?;
            let proto = hdr.next_header();
            let payload = hdr.payload();
            (Some(NetworkHeader::Ipv6(hdr)), payload, Some(proto))
        }
        _ => (None, remaining, None),
    };

    // Layer 4: TCP only. A failed TCP parse (snaplen truncation)
    // degrades to tcp=None instead of failing the packet.
    let tcp = match ip_proto {
        Some(IpProtocol::Tcp) => tcp::TcpHeader::parse(l4_data).ok(),
        _ => None,
    };

    Ok(ParsedPacket {
        ethernet: eth,
        vlan,
        network,
        tcp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecn_codepoints() {
        assert_eq!(Ecn::from_bits(0x00), Ecn::NotEct);
        assert_eq!(Ecn::from_bits(0x01), Ecn::Sce);
        assert_eq!(Ecn::from_bits(0x02), Ecn::Ect);
        assert_eq!(Ecn::from_bits(0x03), Ecn::Ce);
        // Only the low two bits matter.
        assert_eq!(Ecn::from_bits(0xFF), Ecn::Ce);
        assert_eq!(Ecn::from_bits(0xB8), Ecn::NotEct);
    }

    #[test]
    fn parse_ipv4_tcp_packet() {
        let pkt = testpkt::Ip4Tcp {
            flags: tcp::flags::SYN,
            ..Default::default()
        }
        .build();
        let parsed = parse_packet(&pkt).unwrap();
        assert!(parsed.vlan.is_none());
        let net = parsed.network.expect("network header");
        assert_eq!(net.ip_len(), 40);
        assert_eq!(net.src_ip().to_string(), "10.0.0.1");
        let tcp_hdr = parsed.tcp.expect("tcp header");
        assert!(tcp_hdr.syn());
        assert_eq!(tcp_hdr.dst_port(), 5201);
    }

    #[test]
    fn parse_vlan_tagged_packet() {
        let inner = testpkt::Ip4Tcp::default().build();
        // Splice a VLAN tag between the Ethernet header and the IP body.
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&inner[..12]);
        pkt.extend_from_slice(&[0x81, 0x00]); // EtherType: 802.1Q
        pkt.extend_from_slice(&[0x20, 0x2A]); // priority 1, VLAN 42
        pkt.extend_from_slice(&[0x08, 0x00]); // inner EtherType: IPv4
        pkt.extend_from_slice(&inner[14..]);

        let parsed = parse_packet(&pkt).unwrap();
        let vlan = parsed.vlan.expect("vlan tag");
        assert_eq!(vlan.vlan_id, 42);
        assert_eq!(vlan.priority, 1);
        assert!(parsed.network.is_some());
        assert!(parsed.tcp.is_some());
    }

    #[test]
    fn ipv4_fragment_stops_at_the_ip_layer() {
        let mut pkt = testpkt::Ip4Tcp {
            payload_len: 32,
            ..Default::default()
        }
        .build();
        // Rewrite flags/offset to a later fragment at offset 8.
        pkt[20] = 0x00;
        pkt[21] = 0x08;
        let parsed = parse_packet(&pkt).unwrap();
        assert!(parsed.network.is_some());
        assert!(parsed.tcp.is_none());
    }

    #[test]
    fn non_ip_packet_has_no_network_layer() {
        let mut pkt = vec![0u8; 60];
        pkt[12] = 0x08;
        pkt[13] = 0x06; // ARP
        let parsed = parse_packet(&pkt).unwrap();
        assert!(parsed.network.is_none());
        assert!(parsed.tcp.is_none());
    }

    #[test]
    fn truncated_tcp_degrades_to_none() {
        let full = testpkt::Ip4Tcp::default().build();
        // Keep Ethernet + IPv4 but only 10 bytes of the TCP header, as a
        // tight snaplen would.
        let cut = &full[..14 + 20 + 10];
        let parsed = parse_packet(cut).unwrap();
        assert!(parsed.network.is_some());
        assert!(parsed.tcp.is_none());
    }

    #[test]
    fn truncated_ethernet_is_an_error() {
        let pkt = [0u8; 10];
        assert!(parse_packet(&pkt).is_err());
    }

    #[test]
    fn ipv6_tcp_packet_lengths() {
        let pkt = testpkt::Ip6Tcp {
            payload_len: 100,
            ..Default::default()
        }
        .build();
        let parsed = parse_packet(&pkt).unwrap();
        let net = parsed.network.expect("network header");
        // 40-byte fixed header + 20-byte TCP header + 100 bytes of data
        assert_eq!(net.ip_len(), 160);
        assert!(parsed.tcp.is_some());
    }
}

#[cfg(test)]
pub(crate) mod testpkt {
    //! Hand-assembled packets shared by the decoder and flow tests.

    use super::tcp::flags;

    /// Ethernet + IPv4 + TCP packet builder. The defaults describe an
    /// empty segment between two fixed hosts; tests override the fields
    /// they care about.
    pub(crate) struct Ip4Tcp {
        pub src_ip: [u8; 4],
        pub dst_ip: [u8; 4],
        pub src_port: u16,
        pub dst_port: u16,
        pub seq: u32,
        pub ack: u32,
        pub flags: u8,
        pub ns: bool,
        pub ecn: u8,
        pub payload_len: u16,
        pub ts: Option<(u32, u32)>,
        pub sack: Vec<(u32, u32)>,
    }

    impl Default for Ip4Tcp {
        fn default() -> Self {
            Ip4Tcp {
                src_ip: [10, 0, 0, 1],
                dst_ip: [10, 0, 0, 2],
                src_port: 40000,
                dst_port: 5201,
                seq: 0,
                ack: 0,
                flags: 0,
                ns: false,
                ecn: 0,
                payload_len: 0,
                ts: None,
                sack: Vec::new(),
            }
        }
    }

    impl Ip4Tcp {
        /// Swap source and destination, keeping everything else.
        pub(crate) fn reversed(mut self) -> Self {
            std::mem::swap(&mut self.src_ip, &mut self.dst_ip);
            std::mem::swap(&mut self.src_port, &mut self.dst_port);
            self
        }

        pub(crate) fn build(&self) -> Vec<u8> {
            let tcp = build_tcp(
                self.src_port,
                self.dst_port,
                self.seq,
                self.ack,
                self.flags,
                self.ns,
                self.payload_len,
                self.ts,
                &self.sack,
            );

            let total_length = (20 + tcp.len()) as u16;
            let mut pkt = Vec::with_capacity(14 + 20 + tcp.len());
            // Ethernet: zero MACs, EtherType IPv4
            pkt.extend_from_slice(&[0u8; 12]);
            pkt.extend_from_slice(&[0x08, 0x00]);
            // IPv4 header, no options
            pkt.push(0x45);
            pkt.push(self.ecn & 0x03);
            pkt.extend_from_slice(&total_length.to_be_bytes());
            pkt.extend_from_slice(&[0, 0, 0, 0]); // id, flags, frag offset
            pkt.push(64); // TTL
            pkt.push(6); // protocol: TCP
            pkt.extend_from_slice(&[0, 0]); // checksum (unverified)
            pkt.extend_from_slice(&self.src_ip);
            pkt.extend_from_slice(&self.dst_ip);
            pkt.extend_from_slice(&tcp);
            pkt
        }
    }

    /// Ethernet + IPv6 + TCP, minimal knobs.
    pub(crate) struct Ip6Tcp {
        pub src_ip: [u8; 16],
        pub dst_ip: [u8; 16],
        pub src_port: u16,
        pub dst_port: u16,
        pub seq: u32,
        pub flags: u8,
        pub ecn: u8,
        pub payload_len: u16,
    }

    impl Default for Ip6Tcp {
        fn default() -> Self {
            let mut src_ip = [0u8; 16];
            src_ip[15] = 1;
            let mut dst_ip = [0u8; 16];
            dst_ip[15] = 2;
            Ip6Tcp {
                src_ip,
                dst_ip,
                src_port: 40000,
                dst_port: 5201,
                seq: 0,
                flags: flags::ACK,
                ecn: 0,
                payload_len: 0,
            }
        }
    }

    impl Ip6Tcp {
        pub(crate) fn build(&self) -> Vec<u8> {
            let tcp = build_tcp(
                self.src_port,
                self.dst_port,
                self.seq,
                0,
                self.flags,
                false,
                self.payload_len,
                None,
                &[],
            );

            let mut pkt = Vec::with_capacity(14 + 40 + tcp.len());
            pkt.extend_from_slice(&[0u8; 12]);
            pkt.extend_from_slice(&[0x86, 0xDD]);
            // IPv6 fixed header
            pkt.push(0x60); // version 6, DSCP zero
            pkt.push((self.ecn & 0x03) << 4); // ECN in the traffic class low bits
            pkt.extend_from_slice(&[0, 0]); // flow label
            pkt.extend_from_slice(&(tcp.len() as u16).to_be_bytes());
            pkt.push(6); // next header: TCP
            pkt.push(64); // hop limit
            pkt.extend_from_slice(&self.src_ip);
            pkt.extend_from_slice(&self.dst_ip);
            pkt.extend_from_slice(&tcp);
            pkt
        }
    }

    fn build_tcp(
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        ns: bool,
        payload_len: u16,
        ts: Option<(u32, u32)>,
        sack: &[(u32, u32)],
    ) -> Vec<u8> {
        let mut opts = Vec::new();
        if let Some((ts_val, ts_ecr)) = ts {
            // NOP NOP for alignment, then kind 8 length 10
            opts.extend_from_slice(&[1, 1, 8, 10]);
            opts.extend_from_slice(&ts_val.to_be_bytes());
            opts.extend_from_slice(&ts_ecr.to_be_bytes());
        }
        if !sack.is_empty() {
            opts.extend_from_slice(&[1, 1, 5, (2 + 8 * sack.len()) as u8]);
            for (left, right) in sack {
                opts.extend_from_slice(&left.to_be_bytes());
                opts.extend_from_slice(&right.to_be_bytes());
            }
        }

        let header_len = 20 + opts.len();
        let data_offset = (header_len / 4) as u8;
        let mut tcp = Vec::with_capacity(header_len + payload_len as usize);
        tcp.extend_from_slice(&src_port.to_be_bytes());
        tcp.extend_from_slice(&dst_port.to_be_bytes());
        tcp.extend_from_slice(&seq.to_be_bytes());
        tcp.extend_from_slice(&ack.to_be_bytes());
        tcp.push((data_offset << 4) | u8::from(ns));
        tcp.push(flags);
        tcp.extend_from_slice(&0xFFFFu16.to_be_bytes()); // window
        tcp.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent pointer
        tcp.extend_from_slice(&opts);
        tcp.resize(header_len + payload_len as usize, 0);
        tcp
    }
}
