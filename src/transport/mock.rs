//! In-memory gateway adapter used by integration tests: no real link, just
//! simulated devices that react to inbound frames with the same STATUS/ACK
//! traffic a real mesh would produce. Lets the dispatcher, registry and OTA
//! engine be exercised deterministically without hardware.

use super::{FrameCallback, GatewayAdapter, TransportError};
use crate::wire::{DeviceType, MeshFrame, Payload, StatusType, BROADCAST_ADDRESS};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A simulated mesh node. Reacts to frames addressed to it (or broadcast)
/// the way real firmware does, and can be told to misbehave for test
/// scenarios: drop frames, never ack, or go briefly silent.
#[derive(Debug, Clone)]
pub struct MockNode {
    pub address: u32,
    pub device: DeviceType,
    pub status: StatusType,
    pub pos_x: i32,
    pub pos_y: i32,
    pub battery_mv: u16,
    /// If `true`, this node drops every frame sent to it instead of acking.
    pub unresponsive: bool,
    /// Drop exactly this many sends (of any kind) before acking normally.
    /// Used to exercise the dispatcher's command retry path.
    pub drop_next_n: u32,
    /// Drop exactly this many OTA_CHUNK_ACKs for one specific chunk index
    /// before acking it normally. Keyed by chunk index so a node can ack
    /// OTA_START and every other chunk while only misbehaving on one.
    drop_chunk_acks: HashMap<u32, u32>,
    received_chunks: Vec<u32>,
}

impl MockNode {
    pub fn new(address: u32) -> Self {
        Self {
            address,
            device: DeviceType::DotBotV3,
            status: StatusType::Running,
            pos_x: 0,
            pos_y: 0,
            battery_mv: 3700,
            unresponsive: false,
            drop_next_n: 0,
            drop_chunk_acks: HashMap::new(),
            received_chunks: Vec::new(),
        }
    }

    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    /// Drop exactly `n` OTA_CHUNK_ACKs for `index`, then ack it normally.
    /// Start acks and every other chunk index are unaffected.
    pub fn dropping_chunk_acks(mut self, index: u32, n: u32) -> Self {
        self.drop_chunk_acks.insert(index, n);
        self
    }

    /// Start this node in `Bootloader` state instead of the default
    /// `Running`, as a freshly powered-on device would.
    pub fn bootloader(mut self) -> Self {
        self.status = StatusType::Bootloader;
        self
    }

    pub fn dropping_next(mut self, n: u32) -> Self {
        self.drop_next_n = n;
        self
    }

    fn status_payload(&self) -> Payload {
        Payload::Status {
            device: self.device,
            status: self.status,
            battery_mv: self.battery_mv,
            pos_x: self.pos_x,
            pos_y: self.pos_y,
        }
    }

    /// React to an inbound frame, returning the reply frame(s) to deliver
    /// back through the adapter's callback, or none if dropped/unresponsive.
    fn handle(&mut self, payload: &Payload) -> Vec<Payload> {
        if self.unresponsive {
            return vec![];
        }
        if self.drop_next_n > 0 {
            self.drop_next_n -= 1;
            return vec![];
        }
        if let Payload::OtaChunk { index, .. } = payload {
            if let Some(remaining) = self.drop_chunk_acks.get_mut(index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return vec![];
                }
            }
        }

        match payload {
            Payload::Start => {
                self.status = StatusType::Running;
                vec![self.status_payload()]
            }
            Payload::Stop => {
                self.status = StatusType::Stopping;
                vec![self.status_payload()]
            }
            Payload::Reset { pos_x, pos_y } => {
                self.status = StatusType::Resetting;
                self.pos_x = *pos_x;
                self.pos_y = *pos_y;
                vec![self.status_payload()]
            }
            Payload::OtaStart { .. } => {
                self.status = StatusType::Programming;
                self.received_chunks.clear();
                vec![Payload::OtaStartAck]
            }
            Payload::OtaChunk { index, .. } => {
                self.received_chunks.push(*index);
                vec![Payload::OtaChunkAck { index: *index }]
            }
            _ => vec![],
        }
    }
}

struct MockState {
    nodes: HashMap<u32, MockNode>,
    sent: Vec<(u32, Payload)>,
}

/// In-memory stand-in for a real [`GatewayAdapter`]: delivers sent frames
/// straight to the matching [`MockNode`]s and feeds their replies back
/// through the registered callback, synchronously.
pub struct MockGatewayAdapter {
    state: Arc<Mutex<MockState>>,
    callback: Mutex<Option<FrameCallback>>,
    gateway_address: u32,
}

impl MockGatewayAdapter {
    pub fn new(nodes: Vec<MockNode>) -> Self {
        let nodes = nodes.into_iter().map(|n| (n.address, n)).collect();
        Self {
            state: Arc::new(Mutex::new(MockState {
                nodes,
                sent: Vec::new(),
            })),
            callback: Mutex::new(None),
            gateway_address: 0,
        }
    }

    /// Every payload sent through this adapter so far, in order.
    pub fn sent_log(&self) -> Vec<(u32, Payload)> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Directly push a frame through the callback, bypassing node simulation
    /// (used to inject unsolicited EVENT_LOG traffic in tests).
    pub fn inject(&self, frame: MeshFrame) {
        if let Some(cb) = self.callback.lock().unwrap().as_ref() {
            cb(frame);
        }
    }

    pub fn set_node_unresponsive(&self, address: u32, unresponsive: bool) {
        if let Some(node) = self.state.lock().unwrap().nodes.get_mut(&address) {
            node.unresponsive = unresponsive;
        }
    }
}

impl GatewayAdapter for MockGatewayAdapter {
    fn init(&mut self, on_frame_received: FrameCallback) -> Result<(), TransportError> {
        // Simulate each node's first STATUS beacon arriving right after the
        // gateway comes up, the way real firmware announces itself.
        let state = self.state.lock().unwrap();
        for node in state.nodes.values() {
            on_frame_received(MeshFrame::new(self.gateway_address, node.address, node.status_payload()));
        }
        drop(state);
        *self.callback.lock().unwrap() = Some(on_frame_received);
        Ok(())
    }

    fn close(&self) {
        *self.callback.lock().unwrap() = None;
    }

    fn send_payload(&self, destination: u32, payload: &Payload) -> Result<(), TransportError> {
        let mut replies = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.sent.push((destination, payload.clone()));

            if destination == BROADCAST_ADDRESS {
                for node in state.nodes.values_mut() {
                    for reply in node.handle(payload) {
                        replies.push((node.address, reply));
                    }
                }
            } else if let Some(node) = state.nodes.get_mut(&destination) {
                for reply in node.handle(payload) {
                    replies.push((node.address, reply));
                }
            }
        }

        let callback = self.callback.lock().unwrap();
        if let Some(cb) = callback.as_ref() {
            for (source, reply) in replies {
                cb(MeshFrame::new(self.gateway_address, source, reply));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn broadcast_start_acks_from_every_node() {
        let nodes = vec![MockNode::new(1), MockNode::new(2)];
        let mut adapter = MockGatewayAdapter::new(nodes);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        adapter
            .init(Box::new(move |_frame| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        adapter.send_payload(BROADCAST_ADDRESS, &Payload::Start).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unresponsive_node_sends_no_reply() {
        let nodes = vec![MockNode::new(1).unresponsive()];
        let mut adapter = MockGatewayAdapter::new(nodes);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        adapter
            .init(Box::new(move |_frame| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        adapter.send_payload(1, &Payload::Start).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_next_suppresses_exact_count_of_sends() {
        let nodes = vec![MockNode::new(1).dropping_next(2)];
        let mut adapter = MockGatewayAdapter::new(nodes);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        adapter
            .init(Box::new(move |_frame| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        adapter.send_payload(1, &Payload::Start).unwrap();
        adapter.send_payload(1, &Payload::Start).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        adapter.send_payload(1, &Payload::Start).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
