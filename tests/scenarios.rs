//! End-to-end scenarios exercising the controller against the in-memory
//! mock gateway adapter, covering the behaviors a real mesh deployment
//! must satisfy.

use std::collections::HashMap;
use std::time::Duration;

use swarmit_controller::registry::Registry;
use swarmit_controller::transport::mock::{MockGatewayAdapter, MockNode};
use swarmit_controller::transport::GatewayAdapter;
use swarmit_controller::wire::{DeviceType, StatusType};
use swarmit_controller::{Controller, ControllerSettings, ResetLocation};

fn test_settings() -> ControllerSettings {
    let mut settings = ControllerSettings::default();
    settings.adapter_wait_timeout_secs = 0.0;
    settings.ota_timeout_secs = 0.05;
    settings
}

fn controller_with_nodes(nodes: Vec<MockNode>) -> Controller {
    let adapter: Box<dyn GatewayAdapter> = Box::new(MockGatewayAdapter::new(nodes));
    Controller::with_adapter(adapter, &test_settings()).unwrap()
}

#[test]
fn status_visibility_tracks_join_and_liveness_timeout() {
    // Drive the registry directly with a short inactive timeout so the
    // liveness sweep is observable without a multi-second test.
    let registry = Registry::new(Duration::from_millis(150));
    registry.observe_status(1, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);
    registry.observe_status(2, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);

    assert_eq!(registry.known_devices(), vec![1, 2]);
    assert!(registry
        .all_snapshots()
        .iter()
        .all(|s| s.status == StatusType::Bootloader));

    // Device 1 stops emitting status; device 2 keeps refreshing until the
    // sweep has had several chances to run.
    let deadline = std::time::Instant::now() + Duration::from_millis(450);
    while std::time::Instant::now() < deadline {
        registry.observe_status(2, DeviceType::DotBotV3, StatusType::Bootloader, 3000, 0, 0);
        std::thread::sleep(Duration::from_millis(40));
    }

    assert_eq!(registry.known_devices(), vec![2]);
    registry.stop_sweep();
}

#[test]
fn start_broadcast_when_no_device_subset() {
    let controller = controller_with_nodes(vec![
        MockNode::new(1).bootloader(),
        MockNode::new(2).bootloader(),
    ]);

    let pending = controller.start(Some(Duration::from_millis(500))).unwrap();
    assert!(pending.is_empty());
    assert_eq!(
        controller.running_devices(),
        vec![1, 2],
        "both devices should report Running after a broadcast start"
    );
    controller.terminate();
}

#[test]
fn start_unicast_subset_leaves_other_devices_untouched() {
    let mut settings = test_settings();
    settings.devices = Some(vec!["00000001".to_string(), "00000002".to_string()]);
    let adapter: Box<dyn GatewayAdapter> = Box::new(MockGatewayAdapter::new(vec![
        MockNode::new(1).bootloader(),
        MockNode::new(2).bootloader(),
        MockNode::new(3).bootloader(),
    ]));
    let controller = Controller::with_adapter(adapter, &settings).unwrap();

    let pending = controller.start(Some(Duration::from_millis(500))).unwrap();
    assert!(pending.is_empty());
    assert_eq!(controller.running_devices(), vec![1, 2]);
    assert_eq!(controller.ready_devices(), vec![3], "device 3 was outside the subset and must stay untouched");
    controller.terminate();
}

#[test]
fn ota_happy_path_delivers_every_chunk() {
    let controller = controller_with_nodes(vec![
        MockNode::new(1).bootloader(),
        MockNode::new(2).bootloader(),
    ]);

    let firmware = vec![0x42u8; 65536];
    let start_data = controller.start_ota(&firmware).unwrap();
    assert!(start_data.missed.is_empty());
    assert_eq!(start_data.ota.chunks, 512);

    let results = controller.transfer(&firmware, &start_data.acked).unwrap();
    for (_addr, result) in &results {
        assert!(result.success);
        assert_eq!(result.chunks.len(), 512);
        let total_bytes: usize = result.chunks.iter().map(|c| c.size as usize).sum();
        assert_eq!(total_bytes, 65536);
    }
    controller.terminate();
}

#[test]
fn ota_selective_loss_recovers_one_device_fails_other() {
    let nodes = vec![
        MockNode::new(1).bootloader().dropping_chunk_acks(0, 2),
        MockNode::new(2).bootloader().dropping_chunk_acks(0, 50),
    ];
    let controller = controller_with_nodes(nodes);

    let firmware = vec![0x7Eu8; 256];
    let start_data = controller.start_ota(&firmware).unwrap();
    let results = controller.transfer(&firmware, &start_data.acked).unwrap();

    assert!(results[&1].success);
    assert!(!results[&2].success);
    assert_eq!(
        results[&1].chunks[0].retries, results[&2].chunks[0].retries,
        "the broadcast retry budget for a chunk is shared, so every surviving device records the same count"
    );
    controller.terminate();
}

#[test]
fn reset_rejects_mismatched_device_subset() {
    let adapter: Box<dyn GatewayAdapter> =
        Box::new(MockGatewayAdapter::new(vec![MockNode::new(1).bootloader(), MockNode::new(2).bootloader()]));
    let mut settings = test_settings();
    settings.devices = Some(vec!["00000001".to_string(), "00000002".to_string()]);
    let controller = Controller::with_adapter(adapter, &settings).unwrap();

    let mut locations = HashMap::new();
    locations.insert(3u32, ResetLocation { pos_x: 10, pos_y: 20 });
    let result = controller.reset(&locations, None);
    assert!(result.is_err());
    controller.terminate();
}
