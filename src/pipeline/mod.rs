//! Capture pipeline: one producer, one consumer, one lock.
//!
//! ```text
//! pcap handle ("fs-capture" thread)
//!   |
//!   +--[bounded crossbeam channel]--> "fs-record" thread
//!                                       parse -> FlowStore::record
//!                                       (store lock per packet)
//!
//! main thread: waits, ticks stats, then aggregates under the same lock
//! ```
//!
//! The channel is bounded so a slow consumer back-pressures the capture
//! thread instead of growing without limit; kernel-side drops under
//! sustained overload show up in the pcap statistics.

pub mod consumer;

use crossbeam_channel::bounded;
use pcap::{Activated, Capture};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::capture::engine::{self, DrainSummary};
use crate::flow::FlowStore;

pub use consumer::{Consumer, ConsumerSummary};

/// An owned packet buffer sent from the capture thread to the record
/// thread, stamped with the pcap header timestamp.
#[derive(Debug)]
pub struct OwnedPacket {
    /// Capture timestamp as a duration since the Unix epoch.
    pub ts: Duration,
    /// Owned copy of the packet bytes (snaplen-bounded).
    pub data: Vec<u8>,
}

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the capture -> record channel.
    pub queue_capacity: usize,
    /// Stop after this many captured packets (0 = no limit).
    pub count_limit: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            queue_capacity: 10_000,
            count_limit: 0,
        }
    }
}

/// Handle over the two pipeline threads.
pub struct PipelineHandle {
    producer: thread::JoinHandle<DrainSummary>,
    consumer: thread::JoinHandle<ConsumerSummary>,
}

impl PipelineHandle {
    /// True once both threads have exited.
    pub fn is_finished(&self) -> bool {
        self.producer.is_finished() && self.consumer.is_finished()
    }

    /// Join both threads and return their tallies.
    pub fn join(self) -> (DrainSummary, ConsumerSummary) {
        let drained = self.producer.join().unwrap_or_default();
        let consumed = self.consumer.join().unwrap_or_default();
        (drained, consumed)
    }
}

/// Spawn the capture and record threads over an activated pcap handle.
pub fn spawn(
    cap: Capture<dyn Activated>,
    store: Arc<Mutex<FlowStore>>,
    running: Arc<AtomicBool>,
    config: &PipelineConfig,
) -> PipelineHandle {
    let (tx, rx) = bounded::<OwnedPacket>(config.queue_capacity.max(1));
    let count_limit = config.count_limit;

    tracing::debug!(
        queue_capacity = config.queue_capacity,
        count_limit,
        "starting capture pipeline"
    );

    let producer_running = running.clone();
    let producer = thread::Builder::new()
        .name("fs-capture".into())
        .spawn(move || engine::drain(cap, tx, &producer_running, count_limit))
        .expect("failed to spawn capture thread");

    let consumer = thread::Builder::new()
        .name("fs-record".into())
        .spawn(move || Consumer::new(store).run(rx, &running))
        .expect("failed to spawn record thread");

    PipelineHandle { producer, consumer }
}
