//! Gateway adapter interface (C2): abstracts the transport between the
//! controller and the mesh gateway. The core makes no assumption about
//! ordering or delivery guarantees across sends; reliability is rebuilt on
//! top by the dispatcher and OTA engine.

pub mod cloud;
pub mod serial;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use cloud::CloudGatewayAdapter;
pub use serial::SerialGatewayAdapter;

use crate::wire::{MeshFrame, Payload};
use thiserror::Error;

/// Soft transport failure: the core treats this as recoverable by retry.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport send failed: {0}")]
    SendFailed(String),

    #[error("transport failed to initialize: {0}")]
    InitFailed(String),
}

/// Callback invoked once per inbound decoded frame, on the adapter's own
/// background thread.
pub type FrameCallback = Box<dyn Fn(MeshFrame) + Send + Sync>;

/// Contract implemented by every concrete gateway transport.
///
/// `send_payload` must be safe to call concurrently with an active ingress
/// thread; implementations serialize sends behind an internal mutex.
pub trait GatewayAdapter: Send + Sync {
    /// Register the inbound-frame callback and start the ingress thread.
    /// Called once, before the adapter is shared across threads.
    fn init(&mut self, on_frame_received: FrameCallback) -> Result<(), TransportError>;

    /// Stop the ingress thread and release the transport. Idempotent; no
    /// further callbacks fire after this returns. Takes `&self` so the
    /// controller can call it through a shared `Arc<dyn GatewayAdapter>`
    /// at shutdown while dispatcher/OTA code still hold clones.
    fn close(&self);

    /// Synchronous best-effort send of `payload` to `destination`.
    fn send_payload(&self, destination: u32, payload: &Payload) -> Result<(), TransportError>;
}
