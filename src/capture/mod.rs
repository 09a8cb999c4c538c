//! Packet acquisition using libpcap.
//!
//! Wraps the `pcap` crate for opening a live capture on a network
//! interface (with BPF filtering, snaplen/buffer/timestamp control) or
//! replaying a recorded trace file, plus the drain loop that feeds the
//! pipeline.

pub mod engine;
