//! Wire codec (C1): application payload encoding and link-level byte framing.

pub mod mesh;
pub mod stream;

pub use mesh::{
    format_address, parse_address, DeviceType, MeshFrame, Payload, PayloadError, PayloadType,
    StatusType, BROADCAST_ADDRESS,
};
pub use stream::{encode_stream_frame, StreamDecoder, StreamFrameError};
