use clap::Parser;
use std::path::PathBuf;

/// FlowScope: passive TCP flow analyzer reporting per-flow RTT, loss,
/// and ECN/SCE congestion-signal statistics
#[derive(Parser, Debug)]
#[command(name = "flowscope", version, about)]
pub struct Cli {
    /// Network interface to capture on (e.g., "en0", "eth0").
    /// If not specified, the default interface is used.
    #[arg(short, long, conflicts_with = "read_file")]
    pub interface: Option<String>,

    /// Read packets from a pcap trace file instead of capturing live
    #[arg(short = 'r', long)]
    pub read_file: Option<PathBuf>,

    /// BPF filter expression (e.g., "tcp port 5201", "host 192.168.1.1")
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Stop after this many packets (0 = unlimited)
    #[arg(short = 'c', long)]
    pub count: Option<u64>,

    /// Snapshot length (max bytes per packet to capture)
    #[arg(short, long)]
    pub snaplen: Option<i32>,

    /// Capture buffer size in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<i32>,

    /// pcap timestamp source: host, host_lowprec, host_hiprec,
    /// adapter, or adapter_unsynced
    #[arg(short = 't', long)]
    pub timestamp_source: Option<String>,

    /// Deliver packets as they arrive instead of buffering
    #[arg(long, default_value_t = false)]
    pub immediate: bool,

    /// Disable promiscuous mode
    #[arg(long, default_value_t = false)]
    pub no_promiscuous: bool,

    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the JSON report to this file instead of stdout
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Print a periodic [stats] line to stderr while capturing
    #[arg(long, default_value_t = false)]
    pub stats: bool,

    /// Interval between [stats] lines in milliseconds
    #[arg(long)]
    pub stats_interval_ms: Option<u64>,

    /// Suppress the JSON report on stdout
    #[arg(short, long, default_value_t = false)]
    pub quiet: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// List available network interfaces and exit
    #[arg(short, long)]
    pub list_interfaces: bool,
}
