//! Record thread: receives owned packets, decodes them, and applies
//! them to the shared flow store.
//!
//! Decode happens before the store lock is taken, so the critical
//! section covers exactly one `FlowStore::record` call per packet.
//! Decode failures are coalesced: a run of identical errors logs once
//! at WARN plus a repeat count when the run ends.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::flow::FlowStore;
use crate::protocol;

use super::OwnedPacket;

/// Final tally from the record thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerSummary {
    /// Packets decoded and applied to the store.
    pub packets: u64,
    /// Packets dropped because the link/IP headers failed to decode.
    pub decode_errors: u64,
}

pub struct Consumer {
    store: Arc<Mutex<FlowStore>>,
    packets: u64,
    decode_errors: u64,
    last_error: Option<String>,
    error_repeats: u64,
}

impl Consumer {
    pub fn new(store: Arc<Mutex<FlowStore>>) -> Self {
        Consumer {
            store,
            packets: 0,
            decode_errors: 0,
            last_error: None,
            error_repeats: 0,
        }
    }

    /// Consume until the producer closes the channel (end of trace,
    /// after draining what remains) or the shutdown flag clears (live
    /// interrupt, abandoning whatever is still queued).
    pub fn run(mut self, rx: Receiver<OwnedPacket>, running: &AtomicBool) -> ConsumerSummary {
        loop {
            if !running.load(Ordering::Relaxed) {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(pkt) => self.process(&pkt),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.flush_error_run();
        tracing::debug!(packets = self.packets, "record thread shut down");

        ConsumerSummary {
            packets: self.packets,
            decode_errors: self.decode_errors,
        }
    }

    fn process(&mut self, pkt: &OwnedPacket) {
        match protocol::parse_packet(&pkt.data) {
            Ok(parsed) => {
                self.flush_error_run();
                let mut store = self.store.lock().unwrap();
                store.record(pkt.ts, &parsed);
                self.packets += 1;
            }
            Err(e) => {
                self.decode_errors += 1;
                let msg = e.to_string();
                match &self.last_error {
                    Some(prev) if *prev == msg => {
                        self.error_repeats += 1;
                        tracing::debug!(error = %msg, "packet decode failed");
                    }
                    _ => {
                        self.flush_error_run();
                        tracing::warn!(error = %msg, "packet decode failed");
                        self.last_error = Some(msg);
                    }
                }
            }
        }
    }

    fn flush_error_run(&mut self) {
        if let Some(err) = self.last_error.take() {
            if self.error_repeats > 0 {
                tracing::warn!(
                    error = %err,
                    repeats = self.error_repeats,
                    "last decode error repeated"
                );
            }
            self.error_repeats = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testpkt::Ip4Tcp;
    use crate::protocol::tcp::flags;
    use crossbeam_channel::bounded;

    fn pkt(ms: u64, data: Vec<u8>) -> OwnedPacket {
        OwnedPacket {
            ts: Duration::from_millis(ms),
            data,
        }
    }

    #[test]
    fn consumes_until_the_channel_closes() {
        let store = Arc::new(Mutex::new(FlowStore::new()));
        let (tx, rx) = bounded(16);
        tx.send(pkt(
            0,
            Ip4Tcp {
                seq: 1,
                flags: flags::SYN,
                ..Default::default()
            }
            .build(),
        ))
        .unwrap();
        tx.send(pkt(
            10,
            Ip4Tcp {
                seq: 2,
                payload_len: 100,
                ..Default::default()
            }
            .build(),
        ))
        .unwrap();
        drop(tx);

        let running = AtomicBool::new(true);
        let summary = Consumer::new(store.clone()).run(rx, &running);

        assert_eq!(summary.packets, 2);
        assert_eq!(summary.decode_errors, 0);
        let store = store.lock().unwrap();
        assert_eq!(store.flow_count(), 1);
        assert_eq!(store.ip.packets, 2);
    }

    #[test]
    fn garbage_counts_as_decode_error_not_a_packet() {
        let store = Arc::new(Mutex::new(FlowStore::new()));
        let (tx, rx) = bounded(16);
        tx.send(pkt(0, vec![0u8; 3])).unwrap();
        tx.send(pkt(1, vec![0u8; 3])).unwrap();
        tx.send(pkt(2, Ip4Tcp::default().build())).unwrap();
        drop(tx);

        let running = AtomicBool::new(true);
        let summary = Consumer::new(store.clone()).run(rx, &running);

        assert_eq!(summary.packets, 1);
        assert_eq!(summary.decode_errors, 2);
        assert_eq!(store.lock().unwrap().flow_count(), 1);
    }

    #[test]
    fn cleared_flag_abandons_queued_packets() {
        let store = Arc::new(Mutex::new(FlowStore::new()));
        let (tx, rx) = bounded(16);
        for i in 0..8 {
            tx.send(pkt(i, Ip4Tcp::default().build())).unwrap();
        }
        drop(tx);

        let running = AtomicBool::new(false);
        let summary = Consumer::new(store.clone()).run(rx, &running);

        assert_eq!(summary.packets, 0);
        assert_eq!(store.lock().unwrap().ip.packets, 0);
    }
}
