//! Core capture engine: opens a pcap handle (live interface or trace
//! file) and drains it into the pipeline channel.

use crossbeam_channel::Sender;
use pcap::{Activated, Capture, Device, TimestampType};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::pipeline::OwnedPacket;

/// Errors from the capture engine.
#[derive(Debug)]
pub enum CaptureError {
    /// Failed to find a suitable network device.
    NoDevice(String),
    /// Unrecognized timestamp source name.
    UnknownTimestampType(String),
    /// pcap error.
    Pcap(pcap::Error),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::NoDevice(msg) => write!(f, "no capture device: {}", msg),
            CaptureError::UnknownTimestampType(name) => {
                write!(f, "unknown timestamp source '{}'", name)
            }
            CaptureError::Pcap(e) => write!(f, "pcap error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<pcap::Error> for CaptureError {
    fn from(e: pcap::Error) -> Self {
        CaptureError::Pcap(e)
    }
}

/// Configuration for opening a capture.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Live interface name. `None` falls back to the default device
    /// (unless `file` is set).
    pub interface: Option<String>,
    /// Trace file to read instead of capturing live.
    pub file: Option<PathBuf>,
    pub promiscuous: bool,
    pub immediate: bool,
    /// Bytes captured per packet. The default keeps Ethernet + VLAN +
    /// IP + TCP with options; payload beyond that is not needed.
    pub snaplen: i32,
    pub buffer_size: i32,
    pub timeout_ms: i32,
    /// pcap timestamp type by libpcap name ("host", "adapter", ...).
    pub timestamp_source: Option<String>,
    /// BPF filter expression.
    pub filter: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            interface: None,
            file: None,
            promiscuous: true,
            immediate: false,
            snaplen: 128,
            buffer_size: 10 * 1024 * 1024,
            timeout_ms: 100,
            timestamp_source: None,
            filter: None,
        }
    }
}

/// Kernel-side capture counters, live captures only.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CaptureStats {
    pub received: u32,
    pub dropped: u32,
    pub if_dropped: u32,
}

impl From<pcap::Stat> for CaptureStats {
    fn from(s: pcap::Stat) -> Self {
        CaptureStats {
            received: s.received,
            dropped: s.dropped,
            if_dropped: s.if_dropped,
        }
    }
}

/// Final tally from the capture thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainSummary {
    /// Packets handed to the record thread.
    pub packets: u64,
    /// pcap statistics, when the handle provides them.
    pub stats: Option<CaptureStats>,
}

/// List all available network interfaces.
pub fn list_interfaces() -> Result<Vec<Device>, CaptureError> {
    Device::list().map_err(CaptureError::Pcap)
}

/// Open a capture per the configuration: the trace file when one is
/// set, otherwise a live handle on the named (or default) interface.
pub fn open_capture(config: &CaptureConfig) -> Result<Capture<dyn Activated>, CaptureError> {
    if let Some(path) = &config.file {
        let mut cap: Capture<dyn Activated> = Capture::from_file(path)?.into();
        if let Some(filter) = &config.filter {
            cap.filter(filter, true)?;
        }
        tracing::info!(
            file = %path.display(),
            filter = config.filter.as_deref().unwrap_or("none"),
            "reading capture file"
        );
        return Ok(cap);
    }

    // Select the device
    let device = match &config.interface {
        Some(name) => {
            let devices = Device::list().map_err(CaptureError::Pcap)?;
            devices
                .into_iter()
                .find(|d| d.name == *name)
                .ok_or_else(|| CaptureError::NoDevice(format!("interface '{}' not found", name)))?
        }
        None => Device::lookup()
            .map_err(CaptureError::Pcap)?
            .ok_or_else(|| CaptureError::NoDevice("no default device found".into()))?,
    };

    let device_name = device.name.clone();

    let mut inactive = Capture::from_device(device)?
        .promisc(config.promiscuous)
        .snaplen(config.snaplen)
        .timeout(config.timeout_ms)
        .buffer_size(config.buffer_size);
    if config.immediate {
        inactive = inactive.immediate_mode(true);
    }
    if let Some(name) = &config.timestamp_source {
        inactive = inactive.tstamp_type(parse_timestamp_type(name)?);
    }

    let mut cap: Capture<dyn Activated> = inactive.open()?.into();

    // Apply BPF filter if specified
    if let Some(filter) = &config.filter {
        cap.filter(filter, true)?;
    }

    tracing::info!(
        interface = %device_name,
        promiscuous = config.promiscuous,
        snaplen = config.snaplen,
        filter = config.filter.as_deref().unwrap_or("none"),
        "capture started"
    );

    Ok(cap)
}

/// Read packets until end of trace, a capture error, the packet count
/// limit, or the shutdown flag, sending each into the channel. The
/// bounded send blocks when the record thread falls behind.
pub fn drain(
    mut cap: Capture<dyn Activated>,
    tx: Sender<OwnedPacket>,
    running: &AtomicBool,
    count_limit: u64,
) -> DrainSummary {
    let mut packets: u64 = 0;

    while running.load(Ordering::Relaxed) {
        if count_limit > 0 && packets >= count_limit {
            tracing::info!(count = packets, "packet count limit reached");
            break;
        }
        let pkt = match cap.next_packet() {
            Ok(p) => p,
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => {
                tracing::error!(error = %e, "capture read failed");
                break;
            }
        };
        let owned = OwnedPacket {
            ts: packet_timestamp(pkt.header),
            data: pkt.data.to_vec(),
        };
        if tx.send(owned).is_err() {
            break;
        }
        packets += 1;
    }

    // Savefiles have no kernel counters; stats() errors there.
    let stats = cap.stats().ok().map(CaptureStats::from);
    tracing::debug!(packets, "capture thread shut down");

    DrainSummary { packets, stats }
}

/// pcap header timestamp as a duration since the Unix epoch.
pub fn packet_timestamp(header: &pcap::PacketHeader) -> Duration {
    timestamp_from(header.ts.tv_sec as i64, header.ts.tv_usec as i64)
}

fn timestamp_from(tv_sec: i64, tv_usec: i64) -> Duration {
    Duration::new(tv_sec.max(0) as u64, 0) + Duration::from_micros(tv_usec.max(0) as u64)
}

fn parse_timestamp_type(name: &str) -> Result<TimestampType, CaptureError> {
    match name {
        "host" => Ok(TimestampType::Host),
        "host_lowprec" => Ok(TimestampType::HostLowPrec),
        "host_hiprec" => Ok(TimestampType::HostHighPrec),
        "adapter" => Ok(TimestampType::Adapter),
        "adapter_unsynced" => Ok(TimestampType::AdapterUnsynced),
        other => Err(CaptureError::UnknownTimestampType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_types_by_libpcap_name() {
        assert!(matches!(
            parse_timestamp_type("host"),
            Ok(TimestampType::Host)
        ));
        assert!(matches!(
            parse_timestamp_type("adapter_unsynced"),
            Ok(TimestampType::AdapterUnsynced)
        ));
        assert!(matches!(
            parse_timestamp_type("hardware"),
            Err(CaptureError::UnknownTimestampType(_))
        ));
    }

    #[test]
    fn timestamps_convert_to_durations() {
        assert_eq!(timestamp_from(5, 250_000), Duration::from_millis(5_250));
        assert_eq!(timestamp_from(0, 0), Duration::ZERO);
        // Corrupt headers clamp rather than wrap.
        assert_eq!(timestamp_from(-1, -1), Duration::ZERO);
    }
}
