//! OTA engine (C5): session negotiation, chunked firmware streaming, and
//! per-device ACK/retry accounting across a shared broadcast channel.

use crate::registry::Registry;
use crate::transport::{GatewayAdapter, TransportError};
use crate::wire::{Payload, BROADCAST_ADDRESS};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Firmware payload bytes carried per chunk.
pub const CHUNK_SIZE: usize = 128;
/// Per-send ACK wait, overridable via controller settings.
pub const OTA_ACK_TIMEOUT_DEFAULT: Duration = Duration::from_millis(200);
/// Per-chunk retry budget across the broadcast, overridable via controller settings.
pub const OTA_MAX_RETRIES_DEFAULT: u32 = 3;
/// Attempts for the session-negotiation phase.
pub const START_OTA_RETRIES: u32 = 3;
const START_OTA_ATTEMPT_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Outcome of `start_ota`: negotiation session summary.
#[derive(Debug, Clone)]
pub struct OtaInfo {
    pub fw_hash: [u8; 32],
    pub chunks: u32,
}

#[derive(Debug, Clone)]
pub struct StartOtaData {
    pub acked: Vec<u32>,
    pub missed: Vec<u32>,
    pub ota: OtaInfo,
}

/// Per-chunk delivery record for one device, returned as part of [`TransferResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    pub index: u32,
    pub size: u8,
    pub acked: bool,
    pub retries: u32,
}

/// Final per-device transfer outcome.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub success: bool,
    pub chunks: Vec<ChunkResult>,
}

struct ChunkTracker {
    acked_index: i64,
    failed: bool,
    chunk_records: Vec<ChunkResult>,
}

impl ChunkTracker {
    fn new() -> Self {
        Self {
            acked_index: -1,
            failed: false,
            chunk_records: Vec::new(),
        }
    }
}

struct AckState {
    start_acked: HashSet<u32>,
    chunk_ack_index: HashMap<u32, u32>,
}

/// Routes OTA_START_ACK / OTA_CHUNK_ACK frames from the ingress thread to
/// whichever `start_ota`/`transfer` call is currently waiting on them. Kept
/// separate from the registry's own mutex: per design, session ACK state
/// does not contend with registry reads.
pub struct OtaAckRouter {
    state: Mutex<AckState>,
    condvar: Condvar,
}

impl Default for OtaAckRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl OtaAckRouter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AckState {
                start_acked: HashSet::new(),
                chunk_ack_index: HashMap::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    /// Clear all tracked ACK state; called at the start of a fresh session.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.start_acked.clear();
        state.chunk_ack_index.clear();
    }

    pub fn record_start_ack(&self, address: u32) {
        let mut state = self.state.lock().unwrap();
        state.start_acked.insert(address);
        self.condvar.notify_all();
    }

    pub fn record_chunk_ack(&self, address: u32, index: u32) {
        let mut state = self.state.lock().unwrap();
        state.chunk_ack_index.insert(address, index);
        self.condvar.notify_all();
    }

    /// Block until every address in `targets` has sent OTA_START_ACK, or
    /// `deadline` elapses. Returns the subset that did NOT ack.
    pub fn wait_for_start_acks(&self, targets: &[u32], deadline: Instant) -> Vec<u32> {
        let mut state = self.state.lock().unwrap();
        loop {
            let pending: Vec<u32> = targets
                .iter()
                .copied()
                .filter(|a| !state.start_acked.contains(a))
                .collect();
            if pending.is_empty() {
                return pending;
            }
            let now = Instant::now();
            if now >= deadline {
                return pending;
            }
            let (guard, result) = self.condvar.wait_timeout(state, deadline - now).unwrap();
            state = guard;
            if result.timed_out() {
                return targets
                    .iter()
                    .copied()
                    .filter(|a| !state.start_acked.contains(a))
                    .collect();
            }
        }
    }

    /// Block until every address in `pending` has acked `index`, or
    /// `deadline` elapses. Returns the subset that DID ack `index`
    /// (out-of-range indices from other chunks never count).
    pub fn wait_for_chunk_acks(&self, pending: &HashSet<u32>, index: u32, deadline: Instant) -> Vec<u32> {
        let mut state = self.state.lock().unwrap();
        loop {
            let acked: Vec<u32> = pending
                .iter()
                .copied()
                .filter(|a| state.chunk_ack_index.get(a) == Some(&index))
                .collect();
            if acked.len() == pending.len() {
                return acked;
            }
            let now = Instant::now();
            if now >= deadline {
                return acked;
            }
            let (guard, result) = self.condvar.wait_timeout(state, deadline - now).unwrap();
            state = guard;
            if result.timed_out() {
                return pending
                    .iter()
                    .copied()
                    .filter(|a| state.chunk_ack_index.get(a) == Some(&index))
                    .collect();
            }
        }
    }
}

/// Runs the two OTA phases against the registry and an adapter.
pub struct OtaEngine {
    registry: Arc<Registry>,
    adapter: Arc<dyn GatewayAdapter>,
    ack_router: Arc<OtaAckRouter>,
    ack_timeout: Duration,
    max_retries: u32,
}

impl OtaEngine {
    pub fn new(
        registry: Arc<Registry>,
        adapter: Arc<dyn GatewayAdapter>,
        ack_router: Arc<OtaAckRouter>,
        ack_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            registry,
            adapter,
            ack_router,
            ack_timeout,
            max_retries,
        }
    }

    /// Negotiate an OTA session: announce the firmware to Bootloader
    /// devices and collect OTA_START_ACK responses.
    pub fn start_ota(
        &self,
        firmware: &[u8],
        devices: Option<&[u32]>,
    ) -> Result<StartOtaData, OtaError> {
        if firmware.is_empty() {
            return Err(OtaError::InvalidArgument("firmware must not be empty".into()));
        }
        let chunk_count = firmware.len().div_ceil(CHUNK_SIZE) as u32;
        let fw_hash: [u8; 32] = Sha256::digest(firmware).into();

        let ready = self.registry.ready_devices();
        let target_set: Vec<u32> = match devices {
            Some(requested) => ready
                .iter()
                .copied()
                .filter(|a| requested.contains(a))
                .collect(),
            None => ready.clone(),
        };

        self.ack_router.reset();
        let use_broadcast = !target_set.is_empty() && target_set.len() == ready.len();
        let payload = Payload::OtaStart {
            fw_length: firmware.len() as u32,
            fw_chunk_count: chunk_count,
        };

        let mut pending = target_set.clone();
        for attempt in 0..START_OTA_RETRIES {
            if pending.is_empty() {
                break;
            }
            if attempt == 0 && use_broadcast {
                self.adapter.send_payload(BROADCAST_ADDRESS, &payload)?;
            } else {
                for (i, &addr) in pending.iter().enumerate() {
                    if i > 0 {
                        thread::sleep(START_OTA_ATTEMPT_DELAY);
                    }
                    self.adapter.send_payload(addr, &payload)?;
                }
            }
            let deadline = Instant::now() + self.ack_timeout;
            pending = self.ack_router.wait_for_start_acks(&pending, deadline);
        }

        let missed = pending;
        let acked: Vec<u32> = target_set
            .iter()
            .copied()
            .filter(|a| !missed.contains(a))
            .collect();

        Ok(StartOtaData {
            acked,
            missed,
            ota: OtaInfo {
                fw_hash,
                chunks: chunk_count,
            },
        })
    }

    /// Stream every firmware chunk to `acked_devices`, always broadcasting
    /// chunks even for single-target sessions; tolerate up to `max_retries`
    /// misses per chunk before giving up on the straggling device.
    pub fn transfer(
        &self,
        firmware: &[u8],
        acked_devices: &[u32],
    ) -> Result<HashMap<u32, TransferResult>, OtaError> {
        if firmware.is_empty() {
            return Err(OtaError::InvalidArgument("firmware must not be empty".into()));
        }
        let chunk_count = firmware.len().div_ceil(CHUNK_SIZE);

        let mut trackers: HashMap<u32, ChunkTracker> = acked_devices
            .iter()
            .map(|&addr| (addr, ChunkTracker::new()))
            .collect();
        let mut surviving: HashSet<u32> = acked_devices.iter().copied().collect();

        for index in 0..chunk_count as u32 {
            if surviving.is_empty() {
                break;
            }

            let start = index as usize * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(firmware.len());
            let chunk_bytes = &firmware[start..end];
            let count = chunk_bytes.len() as u8;
            let digest = Sha256::digest(chunk_bytes);
            let mut sha = [0u8; 8];
            sha.copy_from_slice(&digest[..8]);
            let payload = Payload::OtaChunk {
                index,
                count,
                sha,
                chunk: chunk_bytes.to_vec(),
            };

            let mut pending: HashSet<u32> = surviving.clone();
            let mut attempts: u32 = 0;
            loop {
                self.adapter.send_payload(BROADCAST_ADDRESS, &payload)?;
                let deadline = Instant::now() + self.ack_timeout;
                let newly_acked = self.ack_router.wait_for_chunk_acks(&pending, index, deadline);
                for addr in &newly_acked {
                    pending.remove(addr);
                    if let Some(tracker) = trackers.get_mut(addr) {
                        tracker.acked_index = index as i64;
                    }
                }
                if pending.is_empty() {
                    break;
                }
                if attempts >= self.max_retries {
                    break;
                }
                attempts += 1;
            }

            for &addr in &surviving {
                let acked = !pending.contains(&addr);
                trackers.get_mut(&addr).unwrap().chunk_records.push(ChunkResult {
                    index,
                    size: count,
                    acked,
                    retries: attempts,
                });
            }

            if !pending.is_empty() {
                for &addr in &pending {
                    trackers.get_mut(&addr).unwrap().failed = true;
                }
                surviving.retain(|a| !pending.contains(a));
            }
        }

        let last_index = chunk_count as i64 - 1;
        let results = trackers
            .into_iter()
            .map(|(addr, tracker)| {
                let success = !tracker.failed && tracker.acked_index == last_index;
                (
                    addr,
                    TransferResult {
                        success,
                        chunks: tracker.chunk_records,
                    },
                )
            })
            .collect();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockGatewayAdapter, MockNode};
    use crate::transport::GatewayAdapter as _;
    use crate::wire::{DeviceType, StatusType};

    fn setup(
        nodes: Vec<MockNode>,
        max_retries: u32,
    ) -> (Arc<Registry>, Arc<MockGatewayAdapter>, Arc<OtaAckRouter>, OtaEngine) {
        let registry = Registry::new(Duration::from_secs(3));
        let ack_router = Arc::new(OtaAckRouter::new());
        let mut adapter = MockGatewayAdapter::new(nodes);
        let registry_clone = registry.clone();
        let ack_router_clone = ack_router.clone();
        adapter
            .init(Box::new(move |frame| match frame.payload {
                Payload::Status {
                    device,
                    status,
                    battery_mv,
                    pos_x,
                    pos_y,
                } => registry_clone.observe_status(
                    frame.source,
                    device,
                    status,
                    battery_mv,
                    pos_x,
                    pos_y,
                ),
                Payload::OtaStartAck => ack_router_clone.record_start_ack(frame.source),
                Payload::OtaChunkAck { index } => {
                    ack_router_clone.record_chunk_ack(frame.source, index)
                }
                _ => {}
            }))
            .unwrap();
        let adapter = Arc::new(adapter);
        let engine = OtaEngine::new(
            registry.clone(),
            adapter.clone() as Arc<dyn GatewayAdapter>,
            ack_router.clone(),
            Duration::from_millis(50),
            max_retries,
        );
        (registry, adapter, ack_router, engine)
    }

    #[test]
    fn empty_firmware_rejected() {
        let (registry, _adapter, _router, engine) = setup(vec![], 3);
        let result = engine.start_ota(&[], None);
        assert!(matches!(result, Err(OtaError::InvalidArgument(_))));
        registry.stop_sweep();
    }

    #[test]
    fn happy_path_all_chunks_delivered() {
        let (registry, _adapter, _router, engine) = setup(vec![MockNode::new(1), MockNode::new(2)], 3);
        registry.observe_status(1, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);
        registry.observe_status(2, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);

        let firmware = vec![0xABu8; 65536];
        let start = engine.start_ota(&firmware, None).unwrap();
        assert_eq!(start.missed.len(), 0);
        assert_eq!(start.acked.len(), 2);
        assert_eq!(start.ota.chunks, 512);

        let results = engine.transfer(&firmware, &start.acked).unwrap();
        for (_addr, result) in results {
            assert!(result.success);
            assert_eq!(result.chunks.len(), 512);
            assert!(result.chunks.iter().all(|c| c.retries == 0 && c.acked));
        }
        registry.stop_sweep();
    }

    #[test]
    fn selective_loss_one_device_recovers_one_does_not() {
        let nodes = vec![
            MockNode::new(1).dropping_chunk_acks(0, 2),
            MockNode::new(2).dropping_chunk_acks(0, 10),
        ];
        let (registry, _adapter, _router, engine) = setup(nodes, 3);
        registry.observe_status(1, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);
        registry.observe_status(2, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);

        let firmware = vec![0x11u8; 10];
        let start = engine.start_ota(&firmware, None).unwrap();
        let results = engine.transfer(&firmware, &start.acked).unwrap();

        assert!(results[&1].success);
        assert!(!results[&2].success);
        // broadcast side-effect: recorded retries equal across devices for the first chunk
        assert_eq!(results[&1].chunks[0].retries, results[&2].chunks[0].retries);
        registry.stop_sweep();
    }

    #[test]
    fn out_of_range_ack_is_ignored() {
        let (registry, adapter, router, engine) = setup(vec![MockNode::new(1)], 3);
        registry.observe_status(1, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);

        // Manually drive this one: bypass node simulation by injecting a
        // bogus chunk ack with an out-of-range index directly.
        let _ = adapter;
        router.record_chunk_ack(1, 9999);

        let firmware = vec![0x22u8; 10];
        let results = engine.transfer(&firmware, &[1]).unwrap();
        assert!(!results[&1].success);
        assert_eq!(results[&1].chunks[0].retries, 3);
        registry.stop_sweep();
    }
}
