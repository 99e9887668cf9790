//! Monitor (C7): turns inbound EVENT_LOG frames into structured log records.

use crate::wire::format_address;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One decoded device log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogRecord {
    pub address: u32,
    pub timestamp: u32,
    pub text: String,
}

impl EventLogRecord {
    /// Build a record from a raw EVENT_LOG payload, decoding its bytes as
    /// UTF-8 with replacement for invalid sequences.
    pub fn new(address: u32, timestamp: u32, data: &[u8]) -> Self {
        Self {
            address,
            timestamp,
            text: String::from_utf8_lossy(data).into_owned(),
        }
    }

    pub fn address_hex(&self) -> String {
        format_address(self.address)
    }
}

/// Emits a structured log record for one event. Isolated in its own
/// function so the controller and tests can both exercise the exact
/// field set independent of the `log` backend in use.
pub fn emit(record: &EventLogRecord) {
    log::info!(
        target: "swarmit::monitor",
        "{} {} {}",
        record.address_hex(),
        record.timestamp,
        record.text
    );
}

/// Drains EVENT_LOG records from the registry's ingress path and logs them,
/// either until cancelled or until an optional deadline passes.
pub struct Monitor {
    receiver: Receiver<EventLogRecord>,
}

impl Monitor {
    pub fn new(receiver: Receiver<EventLogRecord>) -> Self {
        Self { receiver }
    }

    /// Build a channel pair: the sender is handed to the ingress callback,
    /// the `Monitor` drains the receiver.
    pub fn channel() -> (Sender<EventLogRecord>, Self) {
        let (tx, rx) = std::sync::mpsc::channel();
        (tx, Self::new(rx))
    }

    /// Block, logging each record as it arrives, until `stop` is set or
    /// (when `run_forever` is false) `timeout` elapses.
    pub fn run(&self, stop: &Arc<AtomicBool>, run_forever: bool, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            if !run_forever && Instant::now() >= deadline {
                return;
            }
            match self.receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(record) => emit(&record),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_invalid_utf8_with_replacement() {
        let record = EventLogRecord::new(1, 100, &[0xFF, 0xFE, b'h', b'i']);
        assert!(record.text.ends_with("hi"));
        assert_eq!(record.address_hex(), "00000001");
    }

    #[test]
    fn monitor_drains_until_stopped() {
        let (tx, monitor) = Monitor::channel();
        tx.send(EventLogRecord::new(1, 1, b"hello")).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = std::thread::spawn(move || {
            monitor.run(&stop_clone, true, Duration::from_secs(0));
        });
        std::thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
