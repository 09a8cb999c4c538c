//! Bidirectional TCP flow tracking.
//!
//! A flow is keyed by its (src ip, src port, dst ip, dst port) tuple in
//! the orientation of its first packet; packets matching the reversed
//! tuple belong to the same flow in the opposite direction. Each
//! direction carries its own counters, RTT tables, and accumulators in
//! a [`OneWayState`], and every per-packet update touches exactly one
//! flow. Flows are never evicted: a capture is a bounded observation
//! window and the final report wants every connection it saw.

use crate::protocol::{Ecn, NetworkHeader, ParsedPacket};
use crate::protocol::tcp::TcpHeader;
use crate::seq;
use crate::stats::{DurationStats, ValueStats};
use ahash::AHashMap;
use serde::Serialize;
use std::hash::Hash;
use std::net::IpAddr;
use std::time::Duration;

/// Which way a packet travels relative to the flow's first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// Directed IPv4 flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ip4FlowKey {
    pub src_ip: [u8; 4],
    pub src_port: u16,
    pub dst_ip: [u8; 4],
    pub dst_port: u16,
}

/// Directed IPv6 flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ip6FlowKey {
    pub src_ip: [u8; 16],
    pub src_port: u16,
    pub dst_ip: [u8; 16],
    pub dst_port: u16,
}

impl Ip4FlowKey {
    /// The same connection seen from the other side.
    pub fn reverse(&self) -> Self {
        Ip4FlowKey {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

impl Ip6FlowKey {
    /// The same connection seen from the other side.
    pub fn reverse(&self) -> Self {
        Ip6FlowKey {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

trait BidirKey: Copy + Eq + Hash {
    fn reversed(self) -> Self;
}

impl BidirKey for Ip4FlowKey {
    fn reversed(self) -> Self {
        self.reverse()
    }
}

impl BidirKey for Ip6FlowKey {
    fn reversed(self) -> Self {
        self.reverse()
    }
}

/// Per-direction flow state. Public fields are the raw material for
/// the final report; the private ones are transient tracking state
/// that never leaves this module.
#[derive(Debug, Default)]
pub struct OneWayState {
    pub segments: u64,
    pub data_segments: u64,
    pub acks: u64,
    pub acked_bytes: u64,
    pub sacked_bytes: u64,
    pub esce_acked_bytes: u64,
    pub duplicate_acks: u64,
    pub gaps: u64,
    pub gap_bytes: u64,
    pub late_segments: u64,
    pub retransmitted_segments: u64,
    pub ce: u64,
    pub sce: u64,
    pub esce: u64,
    pub ece: u64,
    pub cwr: u64,
    pub first_ack_time: Option<Duration>,
    pub last_ack_time: Option<Duration>,

    pub ipg: DurationStats,
    pub sce_ipg: DurationStats,
    pub seq_rtt: DurationStats,
    pub tsval_rtt: DurationStats,

    // Transient tracking state.
    initialized: bool,
    fin_seen: bool,
    exp_seq: u32,
    hi_ts_val: u32,
    ack_seen: bool,
    prior_ack: u32,
    sacked_bytes_ctr: u32,
    sce_run: u64,
    prior_packet_time: Option<Duration>,
    prior_sce_time: Option<Duration>,
    sce_run_len: ValueStats,
    seq_times: AHashMap<u32, Duration>,
    tsval_times: AHashMap<u32, Duration>,
}

impl OneWayState {
    /// SCE run-length distribution, counting a run still open at the
    /// time of the call. Does not mutate the flow, so reporting stays
    /// repeatable.
    pub fn sce_run_lengths(&self) -> ValueStats {
        let mut stats = self.sce_run_len.clone();
        if self.sce_run > 0 {
            stats.push(self.sce_run as f64);
        }
        stats
    }
}

/// One bidirectional TCP connection. `src`/`dst` reflect the first
/// packet seen; `up` is that packet's direction.
#[derive(Debug)]
pub struct Flow {
    pub index: u64,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub ecn_initiated: bool,
    pub ecn_accepted: bool,
    pub up: OneWayState,
    pub down: OneWayState,
}

impl Flow {
    fn new(index: u64, src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        Flow {
            index,
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            ecn_initiated: false,
            ecn_accepted: false,
            up: OneWayState::default(),
            down: OneWayState::default(),
        }
    }

    pub fn way(&self, dir: Direction) -> &OneWayState {
        match dir {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    /// This direction's state and the peer's, in that order.
    fn ways_mut(&mut self, dir: Direction) -> (&mut OneWayState, &mut OneWayState) {
        match dir {
            Direction::Up => (&mut self.up, &mut self.down),
            Direction::Down => (&mut self.down, &mut self.up),
        }
    }

    /// Apply one TCP segment travelling in `dir`. `seg_len` is the
    /// payload length derived from the IP header lengths, `ecn` the IP
    /// ECN codepoint.
    fn apply(&mut self, dir: Direction, ts: Duration, seg_len: u32, ecn: Ecn, tcp: &TcpHeader<'_>) {
        // ECN negotiation is recorded on the flow from the handshake.
        if tcp.syn() {
            if tcp.ack() {
                self.ecn_accepted = tcp.ece();
            } else {
                self.ecn_initiated = tcp.ece() && tcp.cwr();
            }
        }

        let (this, peer) = self.ways_mut(dir);
        let tsopt = tcp.timestamps();

        // Timestamp-clock RTT: log our TSval, and match our TSecr echo
        // against the peer's outstanding TSval. A matched entry leaves
        // the table either way; a capture clock running backwards
        // forfeits the sample.
        if let Some(tsopt) = tsopt {
            this.tsval_times.insert(tsopt.ts_val, ts);
            if let Some(sent) = peer.tsval_times.remove(&tsopt.ts_ecr) {
                if let Some(rtt) = ts.checked_sub(sent) {
                    peer.tsval_rtt.push(rtt);
                }
            }
        }

        // A SYN seeds the sequence baseline: it occupies one sequence
        // number, so the next in-order byte is seq + 1.
        if tcp.syn() {
            this.exp_seq = tcp.sequence_number().wrapping_add(1);
            this.initialized = true;
            if let Some(tsopt) = tsopt {
                this.hi_ts_val = tsopt.ts_val;
            }
        }

        // Cumulative ack accounting, SACK correction, and the
        // sequence-clock RTT correlator.
        let mut newly_acked: u64 = 0;
        if tcp.ack() {
            this.acks += 1;
            let ack = tcp.ack_number();
            if !this.ack_seen {
                this.ack_seen = true;
                this.prior_ack = ack;
                this.first_ack_time = Some(ts);
                this.last_ack_time = Some(ts);
            } else if ack == this.prior_ack {
                // Pure duplicate. SACK blocks carried here are counted
                // now and must not count again when the cumulative ack
                // catches up, hence the pending correction.
                this.duplicate_acks += 1;
                for block in tcp.sack_blocks() {
                    let bytes = block.bytes();
                    this.sacked_bytes += bytes as u64;
                    this.sacked_bytes_ctr = this.sacked_bytes_ctr.wrapping_add(bytes);
                }
            } else if seq::at_or_after(ack, this.prior_ack) {
                let delta = seq::distance(this.prior_ack, ack);
                let acked = delta.saturating_sub(this.sacked_bytes_ctr);
                this.sacked_bytes_ctr = 0;
                if acked > 0 {
                    newly_acked = acked as u64;
                    this.acked_bytes += newly_acked;
                    this.last_ack_time = Some(ts);
                    // At most one RTT sample per ack: the peer logged
                    // its send time under the first newly-acked byte.
                    let base = ack.wrapping_sub(acked);
                    if let Some(sent) = peer.seq_times.remove(&base) {
                        if let Some(rtt) = ts.checked_sub(sent) {
                            peer.seq_rtt.push(rtt);
                        }
                    }
                }
                this.prior_ack = ack;
            }
            // An ack behind prior_ack is a reordered straggler. It
            // counts nothing and prior_ack stays put.
        }

        // A data-bearing segment logs its send time keyed by its first
        // byte. A retransmission overwrites the entry, so an eventual
        // sample measures from the last transmission.
        if seg_len > 0 {
            this.seq_times.insert(tcp.sequence_number(), ts);
            this.data_segments += 1;
        }

        // Gap, retransmission, and timestamp-lateness detection over
        // the data stream. SYN and FIN segments are excluded, and
        // teardown churn after a FIN must not read as loss.
        if seg_len > 0 && !tcp.syn() && !tcp.fin() && !this.fin_seen {
            let seq_num = tcp.sequence_number();
            if !this.initialized {
                // Mid-stream capture: the first data segment only
                // establishes the baseline.
                this.initialized = true;
                this.exp_seq = seq_num.wrapping_add(seg_len);
                if let Some(tsopt) = tsopt {
                    this.hi_ts_val = tsopt.ts_val;
                }
            } else {
                if seq::before(seq_num, this.exp_seq) {
                    this.retransmitted_segments += 1;
                } else {
                    if seq_num != this.exp_seq {
                        this.gaps += 1;
                        this.gap_bytes += seq::distance(this.exp_seq, seq_num) as u64;
                    }
                    this.exp_seq = seq_num.wrapping_add(seg_len);
                }
                if let Some(tsopt) = tsopt {
                    if seq::before(tsopt.ts_val, this.hi_ts_val) {
                        this.late_segments += 1;
                    } else {
                        this.hi_ts_val = tsopt.ts_val;
                    }
                }
            }
        }

        // Inter-packet gap is sampled for every packet.
        if let Some(prior) = this.prior_packet_time {
            if let Some(gap) = ts.checked_sub(prior) {
                this.ipg.push(gap);
            }
        }
        this.prior_packet_time = Some(ts);

        // Congestion signals are only meaningful on data-bearing
        // segments outside connection setup and teardown.
        if seg_len > 0 && !tcp.syn() && !tcp.fin() && !tcp.rst() && !this.fin_seen {
            if tcp.cwr() {
                this.cwr += 1;
            }
            if tcp.ece() {
                this.ece += 1;
            }
            if tcp.ns() {
                this.esce += 1;
                this.esce_acked_bytes += newly_acked;
            }
            match ecn {
                Ecn::Ce => this.ce += 1,
                Ecn::Sce => {
                    this.sce += 1;
                    if let Some(prior) = this.prior_sce_time {
                        if let Some(gap) = ts.checked_sub(prior) {
                            this.sce_ipg.push(gap);
                        }
                    }
                    this.prior_sce_time = Some(ts);
                    this.sce_run += 1;
                }
                Ecn::NotEct | Ecn::Ect => {
                    if this.sce_run > 0 {
                        this.sce_run_len.push(this.sce_run as f64);
                        this.sce_run = 0;
                    }
                }
            }
        }

        // The FIN itself is processed normally; everything after it in
        // this direction is teardown.
        if tcp.fin() {
            this.fin_seen = true;
        }
        this.segments += 1;
    }
}

/// Totals over every packet with a network layer, TCP or not.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct IpTotals {
    pub packets: u64,
    pub bytes: u64,
}

/// All statistics state for one run: the v4 and v6 flow tables, IP
/// totals, and the capture time window. One instance lives behind the
/// store lock; readers take the same lock.
#[derive(Debug, Default)]
pub struct FlowStore {
    ip4: AHashMap<Ip4FlowKey, Flow>,
    ip6: AHashMap<Ip6FlowKey, Flow>,
    next_index: u64,
    pub ip: IpTotals,
    pub first_packet_time: Option<Duration>,
    pub last_packet_time: Option<Duration>,
}

impl FlowStore {
    pub fn new() -> Self {
        FlowStore::default()
    }

    pub fn flow_count(&self) -> usize {
        self.ip4.len() + self.ip6.len()
    }

    /// All flows in unspecified order; the report sorts by index.
    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.ip4.values().chain(self.ip6.values())
    }

    /// Apply one decoded packet. `ts` is the capture timestamp as a
    /// duration since the Unix epoch.
    pub fn record(&mut self, ts: Duration, packet: &ParsedPacket<'_>) {
        let net = match &packet.network {
            Some(net) => net,
            None => return,
        };

        if self.first_packet_time.is_none() {
            self.first_packet_time = Some(ts);
        }
        self.last_packet_time = Some(ts);
        self.ip.packets += 1;
        self.ip.bytes += net.ip_len();

        let tcp = match &packet.tcp {
            Some(tcp) => tcp,
            None => return,
        };

        let seg_len = segment_len(net, tcp);
        let ecn = net.ecn();
        let (flow, dir) = match net {
            NetworkHeader::Ipv4(hdr) => {
                let key = Ip4FlowKey {
                    src_ip: hdr.src_addr().octets(),
                    src_port: tcp.src_port(),
                    dst_ip: hdr.dst_addr().octets(),
                    dst_port: tcp.dst_port(),
                };
                lookup_or_create(&mut self.ip4, key, &mut self.next_index, |index| {
                    Flow::new(
                        index,
                        IpAddr::V4(hdr.src_addr()),
                        tcp.src_port(),
                        IpAddr::V4(hdr.dst_addr()),
                        tcp.dst_port(),
                    )
                })
            }
            NetworkHeader::Ipv6(hdr) => {
                let key = Ip6FlowKey {
                    src_ip: hdr.src_addr().octets(),
                    src_port: tcp.src_port(),
                    dst_ip: hdr.dst_addr().octets(),
                    dst_port: tcp.dst_port(),
                };
                lookup_or_create(&mut self.ip6, key, &mut self.next_index, |index| {
                    Flow::new(
                        index,
                        IpAddr::V6(hdr.src_addr()),
                        tcp.src_port(),
                        IpAddr::V6(hdr.dst_addr()),
                        tcp.dst_port(),
                    )
                })
            }
        };
        flow.apply(dir, ts, seg_len, ecn, tcp);
    }
}

/// Find the flow for `key` in either orientation, creating it in the
/// packet's orientation when unseen.
fn lookup_or_create<'a, K: BidirKey>(
    map: &'a mut AHashMap<K, Flow>,
    key: K,
    next_index: &mut u64,
    make: impl FnOnce(u64) -> Flow,
) -> (&'a mut Flow, Direction) {
    let (lookup, dir) = if map.contains_key(&key) {
        (key, Direction::Up)
    } else if map.contains_key(&key.reversed()) {
        (key.reversed(), Direction::Down)
    } else {
        let index = *next_index;
        *next_index += 1;
        map.insert(key, make(index));
        (key, Direction::Up)
    };
    let flow = map.get_mut(&lookup).expect("flow present under lookup key");
    (flow, dir)
}

/// TCP payload length from the header-declared lengths, so a snaplen
/// that truncates the payload does not distort the count.
fn segment_len(net: &NetworkHeader<'_>, tcp: &TcpHeader<'_>) -> u32 {
    match net {
        NetworkHeader::Ipv4(hdr) => (hdr.total_length() as i64
            - hdr.header_len() as i64
            - tcp.header_len() as i64)
            .max(0) as u32,
        // TODO: walk extension headers for the true segment length; a
        // hop-by-hop or routing header currently inflates this figure.
        NetworkHeader::Ipv6(hdr) => {
            (hdr.payload_length() as i64 - tcp.header_len() as i64).max(0) as u32
        }
    }
}
