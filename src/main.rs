use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use flowscope::capture;
use flowscope::cli;
use flowscope::config;
use flowscope::flow::FlowStore;
use flowscope::pipeline;
use flowscope::report;

fn main() {
    let args = cli::Cli::parse();

    // Initialize tracing/logging
    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    // stderr, so stdout stays clean for the JSON report.
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Handle --list-interfaces
    if args.list_interfaces {
        list_interfaces();
        return;
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    };

    // Set up Ctrl-C handler
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        running_clone.store(false, Ordering::SeqCst);
        eprintln!("\nInterrupt received, stopping capture...");
    })
    .expect("failed to set Ctrl-C handler");

    if let Err(e) = run(&config, &running) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

/// List available network interfaces and print them.
fn list_interfaces() {
    match capture::engine::list_interfaces() {
        Ok(devices) => {
            println!("Available network interfaces:");
            println!("{:<20} {:<20} {}", "Name", "Description", "Addresses");
            println!("{}", "-".repeat(70));
            for device in &devices {
                let desc = device.desc.as_deref().unwrap_or("");
                let addrs: Vec<String> = device
                    .addresses
                    .iter()
                    .map(|a| format!("{}", a.addr))
                    .collect();
                println!("{:<20} {:<20} {}", device.name, desc, addrs.join(", "));
            }
            if devices.is_empty() {
                println!("  (no interfaces found — try running with sudo)");
            }
        }
        Err(e) => {
            eprintln!("error listing interfaces: {}", e);
            eprintln!("hint: try running with sudo");
        }
    }
}

/// Capture, record, aggregate, emit.
fn run(
    config: &RuntimeConfig,
    running: &Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let capture_config = capture::engine::CaptureConfig {
        interface: config.capture.interface.clone(),
        file: config.capture.read_file.clone(),
        promiscuous: config.capture.promiscuous,
        immediate: config.capture.immediate,
        snaplen: config.capture.snaplen,
        buffer_size: config.capture.buffer_size,
        timeout_ms: config.capture.timeout_ms,
        timestamp_source: config.capture.timestamp_source.clone(),
        filter: config.capture.filter.clone(),
    };
    let cap = capture::engine::open_capture(&capture_config)?;

    let parse_start = SystemTime::now();
    let store = Arc::new(Mutex::new(FlowStore::new()));
    let pipeline_config = pipeline::PipelineConfig {
        queue_capacity: config.run.queue_capacity,
        count_limit: config.run.count,
    };
    let handle = pipeline::spawn(cap, store.clone(), running.clone(), &pipeline_config);

    // Wait for the pipeline, emitting the periodic stats line when
    // enabled. Rates are deltas over the store's running totals.
    let mut stats_last = Instant::now();
    let mut stats_packets: u64 = 0;
    let mut stats_bytes: u64 = 0;
    while !handle.is_finished() {
        std::thread::sleep(Duration::from_millis(100));

        if !config.stats.enabled {
            continue;
        }
        let now = Instant::now();
        if now.duration_since(stats_last).as_millis() as u64 >= config.stats.interval_ms {
            let elapsed = now.duration_since(stats_last).as_secs_f64().max(0.001);
            let (packets, bytes, flows) = {
                let store = store.lock().unwrap();
                (store.ip.packets, store.ip.bytes, store.flow_count())
            };
            let mbps = (bytes - stats_bytes) as f64 * 8.0 / elapsed / 1_000_000.0;
            let pps = (packets - stats_packets) as f64 / elapsed;
            eprintln!("[stats] {:.2} Mbps | {:.0} pps | {} flows", mbps, pps, flows);
            stats_last = now;
            stats_packets = packets;
            stats_bytes = bytes;
        }
    }

    let (drained, consumed) = handle.join();
    let parse_end = SystemTime::now();

    let timing = report::RunTiming {
        parse_start,
        parse_end,
    };
    let report = {
        let store = store.lock().unwrap();
        report::build_report(&store, &timing, drained.stats)
    };

    if let Some(path) = &config.output.export_json {
        report::write_report_json(path, &report)?;
        eprintln!("report written to {}", path.display());
    } else if !config.output.quiet {
        println!("{}", report.to_json_pretty()?);
    }

    if consumed.decode_errors > 0 {
        tracing::warn!(
            errors = consumed.decode_errors,
            "some packets failed to decode"
        );
    }

    let packets = report.ip.packets;
    let flows = report.flows.len();
    match &report.meta.pcap {
        Some(stats) => {
            eprintln!(
                "{} packets with {} TCP flows captured at {:.0} pps",
                packets, flows, report.meta.parse_packets_per_second
            );
            eprintln!("{} packets received by filter", stats.received);
            eprintln!("{} packets dropped by kernel", stats.dropped);
            eprintln!("{} packets dropped by interface", stats.if_dropped);
        }
        None => {
            eprintln!(
                "{} packets with {} TCP flows parsed at {:.0} pps ({:.2} Mbit)",
                packets, flows, report.meta.parse_packets_per_second, report.meta.parse_mbit
            );
        }
    }

    Ok(())
}

#[derive(Debug, Clone)]
struct RuntimeConfig {
    capture: config::CaptureConfig,
    run: config::RunConfig,
    stats: config::StatsConfig,
    output: config::OutputConfig,
}

fn load_config(args: &cli::Cli) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
    let base = match &args.config {
        Some(path) => config::Config::load(path)?,
        None => config::Config::default(),
    };
    merge_config(base, args)
}

/// CLI arguments override file configuration; unset arguments leave
/// the file values in place.
fn merge_config(
    base: config::Config,
    args: &cli::Cli,
) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
    let mut capture = base.capture.clone();
    let mut run = base.run.clone();
    let mut stats = base.stats.clone();
    let mut output = base.output.clone();

    if let Some(value) = &args.interface {
        capture.interface = Some(value.clone());
        capture.read_file = None;
    }
    if let Some(value) = &args.read_file {
        capture.read_file = Some(value.clone());
        capture.interface = None;
    }
    if let Some(value) = &args.filter {
        capture.filter = Some(value.clone());
    }
    if let Some(value) = args.count {
        run.count = value;
    }
    if let Some(value) = args.snaplen {
        capture.snaplen = value;
    }
    if let Some(value) = args.buffer_size {
        capture.buffer_size = value;
    }
    if let Some(value) = &args.timestamp_source {
        capture.timestamp_source = Some(value.clone());
    }
    if let Some(value) = args.stats_interval_ms {
        stats.interval_ms = value;
    }
    if let Some(value) = &args.export_json {
        output.export_json = Some(value.clone());
    }

    if args.immediate {
        capture.immediate = true;
    }
    if args.no_promiscuous {
        capture.promiscuous = false;
    }
    if args.stats {
        stats.enabled = true;
    }
    if args.quiet {
        output.quiet = true;
    }

    if capture.interface.is_some() && capture.read_file.is_some() {
        return Err("interface and read-file are mutually exclusive".into());
    }

    Ok(RuntimeConfig {
        capture,
        run,
        stats,
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_overrides_file_defaults() {
        let args = cli::Cli::parse_from([
            "flowscope",
            "-r",
            "trace.pcap",
            "-c",
            "500",
            "-s",
            "256",
            "--stats",
            "-q",
        ]);
        let config = merge_config(config::Config::default(), &args).unwrap();

        assert_eq!(
            config.capture.read_file.as_deref(),
            Some(std::path::Path::new("trace.pcap"))
        );
        assert_eq!(config.run.count, 500);
        assert_eq!(config.capture.snaplen, 256);
        assert!(config.stats.enabled);
        assert!(config.output.quiet);
        // Untouched settings keep their defaults.
        assert!(config.capture.promiscuous);
        assert_eq!(config.stats.interval_ms, 1000);
    }

    #[test]
    fn read_file_argument_clears_a_configured_interface() {
        let mut base = config::Config::default();
        base.capture.interface = Some("eth0".into());

        let args = cli::Cli::parse_from(["flowscope", "-r", "trace.pcap"]);
        let config = merge_config(base, &args).unwrap();

        assert!(config.capture.interface.is_none());
        assert!(config.capture.read_file.is_some());
    }

    #[test]
    fn file_config_with_both_sources_is_rejected() {
        let mut base = config::Config::default();
        base.capture.interface = Some("eth0".into());
        base.capture.read_file = Some("trace.pcap".into());

        let args = cli::Cli::parse_from(["flowscope"]);
        assert!(merge_config(base, &args).is_err());
    }
}
