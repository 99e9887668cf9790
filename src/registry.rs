//! Device registry (C3): ingests STATUS/EVENT_LOG frames and maintains an
//! authoritative per-device snapshot with liveness aging.

use crate::wire::{format_address, DeviceType, StatusType};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default window after which a device with no traffic is dropped.
pub const INACTIVE_TIMEOUT: Duration = Duration::from_secs(3);

/// A point-in-time view of a device's reported attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub address: u32,
    pub device_type: DeviceType,
    pub status: StatusType,
    pub battery_mv: u16,
    pub pos_x: i32,
    pub pos_y: i32,
    pub last_seen: Instant,
}

impl DeviceSnapshot {
    /// Canonical 8-hex-digit uppercase address.
    pub fn address_hex(&self) -> String {
        format_address(self.address)
    }
}

struct RegistryState {
    devices: HashMap<u32, DeviceSnapshot>,
}

/// Shared, thread-safe device table. A single background sweep thread ages
/// out stale entries; the adapter's ingress thread is the single writer for
/// live updates. Readers never block writers for longer than it takes to
/// clone a snapshot.
pub struct Registry {
    state: Mutex<RegistryState>,
    condvar: Condvar,
    inactive_timeout: Duration,
    sweep_stop: Arc<std::sync::atomic::AtomicBool>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    /// Build a registry and start its background liveness sweep. Per design
    /// notes, the sweep interval is half the inactive timeout so that a
    /// device is never allowed to linger much past its deadline.
    pub fn new(inactive_timeout: Duration) -> Arc<Self> {
        let registry = Arc::new(Self {
            state: Mutex::new(RegistryState {
                devices: HashMap::new(),
            }),
            condvar: Condvar::new(),
            inactive_timeout,
            sweep_stop: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            sweep_handle: Mutex::new(None),
        });
        registry.clone().spawn_sweep();
        registry
    }

    fn spawn_sweep(self: Arc<Self>) {
        let sweep_interval = self.inactive_timeout / 2;
        let stop = self.sweep_stop.clone();
        let registry = self.clone();
        let handle = thread::spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                thread::sleep(sweep_interval);
                registry.sweep();
            }
        });
        *self.sweep_handle.lock().unwrap() = Some(handle);
    }

    fn sweep(&self) {
        let mut state = self.state.lock().unwrap();
        let timeout = self.inactive_timeout;
        let now = Instant::now();
        let before = state.devices.len();
        state
            .devices
            .retain(|_, snapshot| now.duration_since(snapshot.last_seen) <= timeout);
        if state.devices.len() != before {
            log::debug!(
                "liveness sweep removed {} stale device(s)",
                before - state.devices.len()
            );
        }
    }

    /// Stop the background sweep thread. Idempotent.
    pub fn stop_sweep(&self) {
        self.sweep_stop
            .store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.sweep_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Upsert a snapshot from a STATUS frame. Wakes any waiter so
    /// post-condition polls can observe the change immediately.
    pub fn observe_status(
        &self,
        address: u32,
        device_type: DeviceType,
        status: StatusType,
        battery_mv: u16,
        pos_x: i32,
        pos_y: i32,
    ) {
        let mut state = self.state.lock().unwrap();
        state.devices.insert(
            address,
            DeviceSnapshot {
                address,
                device_type,
                status,
                battery_mv,
                pos_x,
                pos_y,
                last_seen: Instant::now(),
            },
        );
        self.condvar.notify_all();
    }

    /// Record traffic from an EVENT_LOG frame without touching status.
    /// No-op if the device isn't already known (event logs don't create
    /// snapshots on their own; a STATUS frame must have been seen first).
    pub fn observe_event_log_traffic(&self, address: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(snapshot) = state.devices.get_mut(&address) {
            snapshot.last_seen = Instant::now();
        }
    }

    /// Remove a device immediately (explicit leave event).
    pub fn remove(&self, address: u32) {
        let mut state = self.state.lock().unwrap();
        state.devices.remove(&address);
    }

    pub fn snapshot(&self, address: u32) -> Option<DeviceSnapshot> {
        self.state.lock().unwrap().devices.get(&address).cloned()
    }

    /// All known addresses, in canonical-hex sort order.
    pub fn known_devices(&self) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        let mut addrs: Vec<u32> = state.devices.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    /// Snapshot of every known device, in canonical-hex sort order.
    pub fn all_snapshots(&self) -> Vec<DeviceSnapshot> {
        let state = self.state.lock().unwrap();
        let mut snapshots: Vec<DeviceSnapshot> = state.devices.values().cloned().collect();
        snapshots.sort_unstable_by_key(|s| s.address);
        snapshots
    }

    fn devices_with_status(&self, status: StatusType) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        let mut addrs: Vec<u32> = state
            .devices
            .values()
            .filter(|s| s.status == status)
            .map(|s| s.address)
            .collect();
        addrs.sort_unstable();
        addrs
    }

    pub fn ready_devices(&self) -> Vec<u32> {
        self.devices_with_status(StatusType::Bootloader)
    }

    pub fn running_devices(&self) -> Vec<u32> {
        self.devices_with_status(StatusType::Running)
    }

    pub fn resetting_devices(&self) -> Vec<u32> {
        self.devices_with_status(StatusType::Resetting)
    }

    /// Block until every address in `targets` has `status`, or `deadline`
    /// elapses. Returns the subset of `targets` that did NOT transition.
    pub fn wait_for_status(&self, targets: &[u32], status: StatusType, deadline: Instant) -> Vec<u32> {
        let mut state = self.state.lock().unwrap();
        loop {
            let pending: Vec<u32> = targets
                .iter()
                .copied()
                .filter(|addr| {
                    state
                        .devices
                        .get(addr)
                        .map(|s| s.status != status)
                        .unwrap_or(true)
                })
                .collect();
            if pending.is_empty() {
                return pending;
            }
            let now = Instant::now();
            if now >= deadline {
                return pending;
            }
            let (guard, timeout_result) = self
                .condvar
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
            if timeout_result.timed_out() {
                return targets
                    .iter()
                    .copied()
                    .filter(|addr| {
                        state
                            .devices
                            .get(addr)
                            .map(|s| s.status != status)
                            .unwrap_or(true)
                    })
                    .collect();
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.stop_sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_upsert_and_read() {
        let registry = Registry::new(Duration::from_secs(3));
        registry.observe_status(1, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);
        let snap = registry.snapshot(1).unwrap();
        assert_eq!(snap.status, StatusType::Bootloader);
        assert_eq!(registry.known_devices(), vec![1]);
        registry.stop_sweep();
    }

    #[test]
    fn ready_running_resetting_views() {
        let registry = Registry::new(Duration::from_secs(3));
        registry.observe_status(1, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);
        registry.observe_status(2, DeviceType::DotBotV3, StatusType::Running, 3000, 0, 0);
        registry.observe_status(3, DeviceType::DotBotV3, StatusType::Resetting, 3000, 0, 0);
        assert_eq!(registry.ready_devices(), vec![1]);
        assert_eq!(registry.running_devices(), vec![2]);
        assert_eq!(registry.resetting_devices(), vec![3]);
        registry.stop_sweep();
    }

    #[test]
    fn event_log_updates_last_seen_not_status() {
        let registry = Registry::new(Duration::from_secs(3));
        registry.observe_status(1, DeviceType::DotBotV3, StatusType::Running, 3000, 0, 0);
        let before = registry.snapshot(1).unwrap().last_seen;
        thread::sleep(Duration::from_millis(5));
        registry.observe_event_log_traffic(1);
        let after = registry.snapshot(1).unwrap();
        assert_eq!(after.status, StatusType::Running);
        assert!(after.last_seen > before);
        registry.stop_sweep();
    }

    #[test]
    fn unknown_device_event_log_is_noop() {
        let registry = Registry::new(Duration::from_secs(3));
        registry.observe_event_log_traffic(42);
        assert!(registry.snapshot(42).is_none());
        registry.stop_sweep();
    }

    #[test]
    fn wait_for_status_returns_empty_once_satisfied() {
        let registry = Registry::new(Duration::from_secs(3));
        registry.observe_status(1, DeviceType::DotBotV3, StatusType::Running, 3000, 0, 0);
        let pending = registry.wait_for_status(&[1], StatusType::Running, Instant::now() + Duration::from_millis(50));
        assert!(pending.is_empty());
        registry.stop_sweep();
    }

    #[test]
    fn wait_for_status_times_out_with_pending() {
        let registry = Registry::new(Duration::from_secs(3));
        registry.observe_status(1, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);
        let pending = registry.wait_for_status(&[1], StatusType::Running, Instant::now() + Duration::from_millis(30));
        assert_eq!(pending, vec![1]);
        registry.stop_sweep();
    }

    #[test]
    fn known_devices_sorted_ascending() {
        let registry = Registry::new(Duration::from_secs(3));
        registry.observe_status(5, DeviceType::Unknown, StatusType::Bootloader, 0, 0, 0);
        registry.observe_status(1, DeviceType::Unknown, StatusType::Bootloader, 0, 0, 0);
        registry.observe_status(3, DeviceType::Unknown, StatusType::Bootloader, 0, 0, 0);
        assert_eq!(registry.known_devices(), vec![1, 3, 5]);
        registry.stop_sweep();
    }
}
