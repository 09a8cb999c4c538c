//! FlowScope: passive TCP/IP flow analysis.
//!
//! Observes captured traffic (live interface or recorded trace) and
//! produces per-flow, per-direction statistics: goodput, RTT from the
//! seq/ack and TCP timestamp clocks, retransmission/reordering/gap
//! accounting, duplicate-ack and SACK byte counts, and ECN/SCE
//! congestion-marking analysis.

pub mod capture;
pub mod cli;
pub mod config;
pub mod flow;
pub mod pipeline;
pub mod protocol;
pub mod report;
pub mod seq;
pub mod stats;
