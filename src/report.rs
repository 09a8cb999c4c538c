//! Final report assembly and emission.
//!
//! Building a report never mutates the flow store, so a report taken
//! mid-capture and one taken at the end of the same trace agree on
//! everything already observed. Raw counters are copied out of each
//! direction; derived percentages and rates are computed here, with
//! zero denominators yielding zero rather than NaN.

use crate::capture::engine::CaptureStats;
use crate::flow::{Flow, FlowStore, IpTotals, OneWayState};
use crate::stats::{DurationSummary, ValueSummary};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock bounds of the parsing run.
#[derive(Debug, Clone, Copy)]
pub struct RunTiming {
    pub parse_start: SystemTime,
    pub parse_end: SystemTime,
}

/// The complete end-of-run report.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub ip: IpTotals,
    pub meta: MetaReport,
    pub flows: Vec<FlowReport>,
}

/// Run-level timing and rate figures. Parse rates measure this tool's
/// processing wall time; capture rates measure the packet-timestamp
/// window of the traffic itself.
#[derive(Debug, Clone, Serialize)]
pub struct MetaReport {
    pub parse_start_time: f64,
    pub parse_end_time: f64,
    pub parse_elapsed_secs: f64,
    pub parse_packets_per_second: f64,
    pub parse_mbit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_start_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_end_time: Option<f64>,
    pub capture_elapsed_secs: f64,
    pub capture_packets_per_second: f64,
    pub capture_mbit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcap: Option<CaptureStats>,
}

/// One flow, endpoints in first-packet orientation.
#[derive(Debug, Clone, Serialize)]
pub struct FlowReport {
    #[serde(skip)]
    pub index: u64,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub ecn_initiated: bool,
    pub ecn_accepted: bool,
    pub up: OneWayReport,
    pub down: OneWayReport,
    /// Sum of the two directions' mean seq-clock RTTs: a full
    /// round-trip estimate for the path.
    pub mean_seq_rtt_ms: f64,
    pub mean_tsval_rtt_ms: f64,
}

/// One direction's counters plus the derived views.
#[derive(Debug, Clone, Serialize)]
pub struct OneWayReport {
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
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_ack_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ack_time: Option<f64>,
    pub elapsed_ack_time_secs: f64,
    pub ack_percent: f64,
    pub sce_percent: f64,
    pub esce_percent: f64,
    pub esce_acked_bytes_percent: f64,
    pub late_percent: f64,
    pub retransmitted_percent: f64,
    pub lost_bytes_percent: f64,
    pub mean_gap_size_bytes: f64,
    pub mean_segment_size_bytes: f64,
    pub goodput_mbit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipg: Option<DurationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sce_ipg: Option<DurationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sce_run_length: Option<ValueSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_rtt: Option<DurationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tsval_rtt: Option<DurationSummary>,
}

/// Assemble the report from a flow store snapshot. Pure read.
pub fn build_report(store: &FlowStore, timing: &RunTiming, pcap: Option<CaptureStats>) -> Report {
    let mut flows: Vec<&Flow> = store.flows().collect();
    flows.sort_by_key(|f| f.index);
    let flows: Vec<FlowReport> = flows.into_iter().map(flow_report).collect();

    let parse_elapsed = timing
        .parse_end
        .duration_since(timing.parse_start)
        .unwrap_or_default()
        .as_secs_f64();
    let capture_elapsed = match (store.first_packet_time, store.last_packet_time) {
        (Some(first), Some(last)) => last.saturating_sub(first).as_secs_f64(),
        _ => 0.0,
    };

    let mut meta = MetaReport {
        parse_start_time: unix_secs(timing.parse_start),
        parse_end_time: unix_secs(timing.parse_end),
        parse_elapsed_secs: parse_elapsed,
        parse_packets_per_second: 0.0,
        parse_mbit: 0.0,
        capture_start_time: store.first_packet_time.map(|d| d.as_secs_f64()),
        capture_end_time: store.last_packet_time.map(|d| d.as_secs_f64()),
        capture_elapsed_secs: capture_elapsed,
        capture_packets_per_second: 0.0,
        capture_mbit: 0.0,
        pcap,
    };
    if parse_elapsed > 0.0 {
        meta.parse_packets_per_second = store.ip.packets as f64 / parse_elapsed;
        meta.parse_mbit = store.ip.bytes as f64 * 8.0 / 1e6 / parse_elapsed;
    }
    if capture_elapsed > 0.0 {
        meta.capture_packets_per_second = store.ip.packets as f64 / capture_elapsed;
        meta.capture_mbit = store.ip.bytes as f64 * 8.0 / 1e6 / capture_elapsed;
    }

    Report {
        ip: store.ip,
        meta,
        flows,
    }
}

fn flow_report(flow: &Flow) -> FlowReport {
    let mut up = one_way_report(&flow.up, &flow.down);
    let mut down = one_way_report(&flow.down, &flow.up);

    // A direction's goodput comes from the bytes the peer acked over
    // the peer's ack window.
    if down.acked_bytes > 0 && down.elapsed_ack_time_secs > 0.0 {
        up.goodput_mbit = down.acked_bytes as f64 * 8.0 / 1e6 / down.elapsed_ack_time_secs;
    }
    if up.acked_bytes > 0 && up.elapsed_ack_time_secs > 0.0 {
        down.goodput_mbit = up.acked_bytes as f64 * 8.0 / 1e6 / up.elapsed_ack_time_secs;
    }

    FlowReport {
        index: flow.index,
        src_ip: flow.src_ip,
        src_port: flow.src_port,
        dst_ip: flow.dst_ip,
        dst_port: flow.dst_port,
        ecn_initiated: flow.ecn_initiated,
        ecn_accepted: flow.ecn_accepted,
        mean_seq_rtt_ms: flow.up.seq_rtt.mean_ms() + flow.down.seq_rtt.mean_ms(),
        mean_tsval_rtt_ms: flow.up.tsval_rtt.mean_ms() + flow.down.tsval_rtt.mean_ms(),
        up,
        down,
    }
}

fn one_way_report(s: &OneWayState, peer: &OneWayState) -> OneWayReport {
    let elapsed_ack = match (s.first_ack_time, s.last_ack_time) {
        (Some(first), Some(last)) => last.saturating_sub(first).as_secs_f64(),
        _ => 0.0,
    };

    let mut r = OneWayReport {
        segments: s.segments,
        data_segments: s.data_segments,
        acks: s.acks,
        acked_bytes: s.acked_bytes,
        sacked_bytes: s.sacked_bytes,
        esce_acked_bytes: s.esce_acked_bytes,
        duplicate_acks: s.duplicate_acks,
        gaps: s.gaps,
        gap_bytes: s.gap_bytes,
        late_segments: s.late_segments,
        retransmitted_segments: s.retransmitted_segments,
        ce: s.ce,
        sce: s.sce,
        esce: s.esce,
        ece: s.ece,
        cwr: s.cwr,
        first_ack_time: s.first_ack_time.map(|d| d.as_secs_f64()),
        last_ack_time: s.last_ack_time.map(|d| d.as_secs_f64()),
        elapsed_ack_time_secs: elapsed_ack,
        ack_percent: 0.0,
        sce_percent: 0.0,
        esce_percent: 0.0,
        esce_acked_bytes_percent: 0.0,
        late_percent: 0.0,
        retransmitted_percent: 0.0,
        lost_bytes_percent: 0.0,
        mean_gap_size_bytes: 0.0,
        mean_segment_size_bytes: 0.0,
        goodput_mbit: 0.0,
        ipg: s.ipg.summary(),
        sce_ipg: s.sce_ipg.summary(),
        sce_run_length: s.sce_run_lengths().summary(),
        seq_rtt: s.seq_rtt.summary(),
        tsval_rtt: s.tsval_rtt.summary(),
    };

    if s.data_segments > 0 {
        r.sce_percent = 100.0 * s.sce as f64 / s.data_segments as f64;
        r.esce_percent = 100.0 * s.esce as f64 / s.data_segments as f64;
        r.mean_segment_size_bytes = peer.acked_bytes as f64 / s.data_segments as f64;
    }
    if s.acked_bytes > 0 {
        r.esce_acked_bytes_percent = 100.0 * s.esce_acked_bytes as f64 / s.acked_bytes as f64;
    }
    if peer.data_segments > 0 {
        r.ack_percent = 100.0 * s.acks as f64 / peer.data_segments as f64;
    }
    if s.segments > 0 {
        r.late_percent = 100.0 * s.late_segments as f64 / s.segments as f64;
        r.retransmitted_percent = 100.0 * s.retransmitted_segments as f64 / s.segments as f64;
    }
    if peer.acked_bytes > 0 {
        r.lost_bytes_percent = 100.0 * s.gap_bytes as f64 / peer.acked_bytes as f64;
    }
    if s.gaps > 0 {
        r.mean_gap_size_bytes = s.gap_bytes as f64 / s.gaps as f64;
    }

    r
}

fn unix_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Report {
    /// Pretty JSON for stdout.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Write the report as pretty JSON to `path`.
pub fn write_report_json(path: &Path, report: &Report) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testpkt::Ip4Tcp;
    use crate::protocol::{parse_packet, tcp::flags};
    use std::time::Duration;

    fn timing(elapsed_ms: u64) -> RunTiming {
        let parse_start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        RunTiming {
            parse_start,
            parse_end: parse_start + Duration::from_millis(elapsed_ms),
        }
    }

    fn rec(store: &mut FlowStore, ms: u64, pkt: &[u8]) {
        let parsed = parse_packet(pkt).unwrap();
        store.record(Duration::from_millis(ms), &parsed);
    }

    /// SYN, SYN-ACK, 1000 bytes of data, and the ack confirming them.
    fn transfer_store() -> FlowStore {
        let mut store = FlowStore::new();
        let syn = Ip4Tcp {
            seq: 100,
            flags: flags::SYN,
            ..Default::default()
        };
        rec(&mut store, 0, &syn.build());
        let syn_ack = Ip4Tcp {
            seq: 500,
            ack: 101,
            flags: flags::SYN | flags::ACK,
            ..Default::default()
        }
        .reversed();
        rec(&mut store, 10, &syn_ack.build());
        let data = Ip4Tcp {
            seq: 101,
            ack: 501,
            flags: flags::ACK,
            payload_len: 1000,
            ..Default::default()
        };
        rec(&mut store, 20, &data.build());
        let ack = Ip4Tcp {
            seq: 501,
            ack: 1101,
            flags: flags::ACK,
            ..Default::default()
        }
        .reversed();
        rec(&mut store, 50, &ack.build());
        store
    }

    #[test]
    fn derived_stats_from_a_small_transfer() {
        let store = transfer_store();
        let report = build_report(&store, &timing(2500), None);

        assert_eq!(report.flows.len(), 1);
        let flow = &report.flows[0];
        assert_eq!(flow.src_ip.to_string(), "10.0.0.1");
        assert_eq!(flow.down.acked_bytes, 1000);
        assert!((flow.mean_seq_rtt_ms - 30.0).abs() < 1e-9);

        // 1000 bytes acked over the server's 40ms ack window.
        assert!((flow.up.goodput_mbit - 0.2).abs() < 1e-9);
        assert_eq!(flow.down.goodput_mbit, 0.0);
        assert!((flow.up.mean_segment_size_bytes - 1000.0).abs() < 1e-9);
        assert!((flow.down.elapsed_ack_time_secs - 0.04).abs() < 1e-9);
        // Two acks from the server against one data segment sent up.
        assert!((flow.down.ack_percent - 200.0).abs() < 1e-9);

        // Meta: 4 packets over a 50ms capture window, 2.5s parse time.
        assert!((report.meta.capture_elapsed_secs - 0.05).abs() < 1e-9);
        assert!((report.meta.capture_packets_per_second - 80.0).abs() < 1e-9);
        assert!((report.meta.parse_elapsed_secs - 2.5).abs() < 1e-9);
        assert!((report.meta.parse_packets_per_second - 1.6).abs() < 1e-9);
    }

    #[test]
    fn empty_store_reports_empty() {
        let store = FlowStore::new();
        let report = build_report(&store, &timing(100), None);
        assert!(report.flows.is_empty());
        assert_eq!(report.ip.packets, 0);
        assert!(report.meta.capture_start_time.is_none());
        assert_eq!(report.meta.capture_elapsed_secs, 0.0);
        assert_eq!(report.meta.capture_packets_per_second, 0.0);
    }

    #[test]
    fn empty_distributions_are_omitted_from_json() {
        let mut store = FlowStore::new();
        rec(&mut store, 0, &Ip4Tcp::default().build());
        let report = build_report(&store, &timing(100), None);
        let json = report.to_json_pretty().unwrap();
        // One packet: no RTT samples, no inter-packet gaps yet.
        assert!(!json.contains("seq_rtt"));
        assert!(!json.contains("ipg"));
        assert!(json.contains("\"segments\": 1"));
    }

    #[test]
    fn open_sce_run_appears_without_disturbing_the_store() {
        let mut store = FlowStore::new();
        let data = |seq: u32, ecn: u8| Ip4Tcp {
            seq,
            ecn,
            payload_len: 100,
            ..Default::default()
        };
        rec(&mut store, 0, &data(0, 0x01).build());
        rec(&mut store, 10, &data(100, 0x01).build());

        let first = build_report(&store, &timing(100), None);
        let runs = first.flows[0].up.sce_run_length.as_ref().unwrap();
        assert_eq!(runs.n, 1);
        assert!((runs.mean - 2.0).abs() < 1e-9);

        // Building the report again yields the same result.
        let second = build_report(&store, &timing(100), None);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn reports_from_identical_captures_agree() {
        let a = build_report(&transfer_store(), &timing(2500), None);
        let b = build_report(&transfer_store(), &timing(2500), None);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
