//! Command dispatcher (C4): start/stop/reset/send_message with retry and
//! post-condition verification against the registry.

use crate::registry::Registry;
use crate::transport::{GatewayAdapter, TransportError};
use crate::wire::{Payload, StatusType, BROADCAST_ADDRESS};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const COMMAND_MAX_ATTEMPTS: u32 = 3;
pub const COMMAND_ATTEMPT_DELAY: Duration = Duration::from_millis(200);
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

/// Target coordinates for a RESET command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetLocation {
    pub pos_x: i32,
    pub pos_y: i32,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Sends start/stop/reset/message commands and verifies the expected
/// post-condition against the registry, retrying on a shared broadcast
/// medium up to [`COMMAND_MAX_ATTEMPTS`] times.
pub struct Dispatcher {
    registry: Arc<Registry>,
    adapter: Arc<dyn GatewayAdapter>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, adapter: Arc<dyn GatewayAdapter>) -> Self {
        Self { registry, adapter }
    }

    /// Resolve the target set for a precondition-gated command: either the
    /// caller-provided subset intersected with devices matching
    /// `precondition`, or every device matching `precondition` if no subset
    /// was given.
    fn resolve_targets(&self, devices: Option<&[u32]>, precondition: &[StatusType]) -> Vec<u32> {
        let matching: Vec<u32> = self
            .registry
            .all_snapshots()
            .into_iter()
            .filter(|s| precondition.contains(&s.status))
            .map(|s| s.address)
            .collect();

        match devices {
            Some(requested) => matching
                .into_iter()
                .filter(|addr| requested.contains(addr))
                .collect(),
            None => matching,
        }
    }

    /// Send `payload` to `targets`, broadcasting when `targets` equals the
    /// full known set, unicasting to each target otherwise.
    fn send_targeted(&self, targets: &[u32], payload: &Payload) -> Result<(), TransportError> {
        let known = self.registry.known_devices();
        if !targets.is_empty() && targets.len() == known.len() {
            self.adapter.send_payload(BROADCAST_ADDRESS, payload)
        } else {
            for (i, &addr) in targets.iter().enumerate() {
                if i > 0 {
                    thread::sleep(COMMAND_ATTEMPT_DELAY);
                }
                self.adapter.send_payload(addr, payload)?;
            }
            Ok(())
        }
    }

    /// Shared retry loop for start/stop/reset: send, wait for the
    /// post-condition, retry up to [`COMMAND_MAX_ATTEMPTS`] on whatever
    /// subset hasn't transitioned yet.
    fn dispatch_with_retry(
        &self,
        mut pending: Vec<u32>,
        payload: &Payload,
        expected_status: StatusType,
        timeout: Duration,
    ) -> Result<Vec<u32>, DispatchError> {
        if pending.is_empty() {
            return Ok(pending);
        }

        for _attempt in 0..COMMAND_MAX_ATTEMPTS {
            self.send_targeted(&pending, payload)?;
            let deadline = Instant::now() + timeout;
            pending = self
                .registry
                .wait_for_status(&pending, expected_status, deadline);
            if pending.is_empty() {
                return Ok(pending);
            }
        }
        Ok(pending)
    }

    /// Start every Bootloader device in `devices` (or all Bootloader
    /// devices if omitted). Returns addresses that failed to reach Running.
    pub fn start(
        &self,
        devices: Option<&[u32]>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u32>, DispatchError> {
        let targets = self.resolve_targets(devices, &[StatusType::Bootloader]);
        self.dispatch_with_retry(
            targets,
            &Payload::Start,
            StatusType::Running,
            timeout.unwrap_or(COMMAND_TIMEOUT),
        )
    }

    /// Stop every Running or Resetting device in `devices` (or all such
    /// devices if omitted). Returns addresses that failed to reach Bootloader.
    pub fn stop(
        &self,
        devices: Option<&[u32]>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u32>, DispatchError> {
        let targets = self.resolve_targets(
            devices,
            &[StatusType::Running, StatusType::Resetting],
        );
        self.dispatch_with_retry(
            targets,
            &Payload::Stop,
            StatusType::Bootloader,
            timeout.unwrap_or(COMMAND_TIMEOUT),
        )
    }

    /// Reset each device to its given location. The key set of `locations`
    /// must exactly equal the configured device subset, or this fails with
    /// `InvalidArgument` and sends nothing. Always per-device unicast.
    pub fn reset(
        &self,
        locations: &HashMap<u32, ResetLocation>,
        device_subset: &[u32],
        timeout: Option<Duration>,
    ) -> Result<Vec<u32>, DispatchError> {
        let mut requested: Vec<u32> = locations.keys().copied().collect();
        requested.sort_unstable();
        let mut expected: Vec<u32> = device_subset.to_vec();
        expected.sort_unstable();
        if requested != expected {
            return Err(DispatchError::InvalidArgument(format!(
                "reset locations {requested:?} do not match configured device subset {expected:?}"
            )));
        }

        let timeout = timeout.unwrap_or(COMMAND_TIMEOUT);
        let mut pending = requested;

        for _attempt in 0..COMMAND_MAX_ATTEMPTS {
            for (i, &addr) in pending.iter().enumerate() {
                if i > 0 {
                    thread::sleep(COMMAND_ATTEMPT_DELAY);
                }
                let location = locations[&addr];
                self.adapter.send_payload(
                    addr,
                    &Payload::Reset {
                        pos_x: location.pos_x,
                        pos_y: location.pos_y,
                    },
                )?;
            }
            let deadline = Instant::now() + timeout;
            pending = self
                .registry
                .wait_for_status(&pending, StatusType::Resetting, deadline);
            if pending.is_empty() {
                return Ok(pending);
            }
        }
        Ok(pending)
    }

    /// Fire-and-forget message to Running devices. No retry, no
    /// post-condition check.
    pub fn send_message(
        &self,
        text: &str,
        devices: Option<&[u32]>,
    ) -> Result<(), DispatchError> {
        if text.as_bytes().len() > 255 {
            return Err(DispatchError::InvalidArgument(format!(
                "message too long: {} bytes > 255",
                text.as_bytes().len()
            )));
        }
        let payload = Payload::message(text)
            .map_err(|e| DispatchError::InvalidArgument(e.to_string()))?;

        let running = self.registry.running_devices();
        let targets: Vec<u32> = match devices {
            Some(requested) if !requested.is_empty() => running
                .into_iter()
                .filter(|addr| requested.contains(addr))
                .collect(),
            _ => running,
        };

        if targets.is_empty() {
            return Ok(());
        }

        let running_full = self.registry.running_devices();
        if targets.len() == running_full.len() {
            self.adapter.send_payload(BROADCAST_ADDRESS, &payload)?;
        } else {
            for (i, &addr) in targets.iter().enumerate() {
                if i > 0 {
                    thread::sleep(COMMAND_ATTEMPT_DELAY);
                }
                self.adapter.send_payload(addr, &payload)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockGatewayAdapter, MockNode};
    use crate::transport::GatewayAdapter as _;
    use crate::wire::DeviceType;
    use std::time::Duration;

    fn setup(nodes: Vec<MockNode>) -> (Arc<Registry>, Arc<MockGatewayAdapter>) {
        let registry = Registry::new(Duration::from_secs(3));
        let mut adapter = MockGatewayAdapter::new(nodes);
        let registry_clone = registry.clone();
        adapter
            .init(Box::new(move |frame| {
                if let crate::wire::Payload::Status {
                    device,
                    status,
                    battery_mv,
                    pos_x,
                    pos_y,
                } = frame.payload
                {
                    registry_clone.observe_status(
                        frame.source,
                        device,
                        status,
                        battery_mv,
                        pos_x,
                        pos_y,
                    );
                }
            }))
            .unwrap();
        (registry, Arc::new(adapter))
    }

    #[test]
    fn start_broadcast_when_targeting_full_set() {
        let (registry, adapter) = setup(vec![MockNode::new(1), MockNode::new(2)]);
        registry.observe_status(1, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);
        registry.observe_status(2, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);

        let dispatcher = Dispatcher::new(registry.clone(), adapter.clone());
        let pending = dispatcher.start(None, None).unwrap();
        assert!(pending.is_empty());

        let sent = adapter.sent_log();
        let start_sends: Vec<_> = sent
            .iter()
            .filter(|(_, p)| matches!(p, crate::wire::Payload::Start))
            .collect();
        assert_eq!(start_sends.len(), 1);
        assert_eq!(start_sends[0].0, BROADCAST_ADDRESS);
        registry.stop_sweep();
    }

    #[test]
    fn start_unicast_subset_leaves_others_untouched() {
        let (registry, adapter) = setup(vec![
            MockNode::new(1),
            MockNode::new(2),
            MockNode::new(3),
        ]);
        registry.observe_status(1, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);
        registry.observe_status(2, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);
        registry.observe_status(3, DeviceType::DotBotV3, StatusType::Running, 3000, 0, 0);

        let dispatcher = Dispatcher::new(registry.clone(), adapter.clone());
        let pending = dispatcher.start(Some(&[1, 3]), None).unwrap();
        assert!(pending.is_empty());

        assert_eq!(registry.snapshot(1).unwrap().status, StatusType::Running);
        assert_eq!(registry.snapshot(2).unwrap().status, StatusType::Bootloader);
        assert_eq!(registry.snapshot(3).unwrap().status, StatusType::Running);

        let sent = adapter.sent_log();
        let unicasts: Vec<_> = sent
            .iter()
            .filter(|(dest, p)| *dest != BROADCAST_ADDRESS && matches!(p, crate::wire::Payload::Start))
            .collect();
        assert_eq!(unicasts.len(), 1); // device 3 already Running, not targeted
        registry.stop_sweep();
    }

    #[test]
    fn reset_mismatched_subset_rejected_without_sending() {
        let (registry, adapter) = setup(vec![MockNode::new(1), MockNode::new(2)]);
        registry.observe_status(1, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);
        registry.observe_status(2, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);

        let dispatcher = Dispatcher::new(registry.clone(), adapter.clone());
        let mut locations = HashMap::new();
        locations.insert(3u32, ResetLocation { pos_x: 0, pos_y: 0 });
        let result = dispatcher.reset(&locations, &[1, 2], None);
        assert!(matches!(result, Err(DispatchError::InvalidArgument(_))));
        assert!(adapter.sent_log().is_empty());
        registry.stop_sweep();
    }

    #[test]
    fn message_too_long_rejected() {
        let (registry, adapter) = setup(vec![]);
        let dispatcher = Dispatcher::new(registry.clone(), adapter);
        let text = "a".repeat(256);
        let result = dispatcher.send_message(&text, None);
        assert!(matches!(result, Err(DispatchError::InvalidArgument(_))));
        registry.stop_sweep();
    }
}
