//! Core library for the swarm testbed controller: wire codec, gateway
//! adapter contract, device registry, command dispatcher, OTA engine and
//! the controller façade that composes them. The CLI binary is a thin
//! front end over this crate.

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod monitor;
pub mod ota;
pub mod registry;
pub mod transport;
pub mod wire;

pub use config::{AdapterKind, CliOverrides, ControllerSettings};
pub use controller::{Controller, ControllerError};
pub use dispatcher::{DispatchError, ResetLocation};
pub use monitor::EventLogRecord;
pub use ota::{OtaError, StartOtaData, TransferResult};
pub use registry::DeviceSnapshot;
