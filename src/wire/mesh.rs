//! Mesh-level payload codec.
//!
//! Each application payload is identified by a single PayloadType byte
//! followed by its little-endian fields, per the swarmit wire protocol.
//! This module only deals with that application-level encoding; the raw
//! byte-stream framing (start markers, length, CRC) lives in `wire::stream`.

use thiserror::Error;

/// Reserved destination meaning "every device in the mesh".
pub const BROADCAST_ADDRESS: u32 = 0xFFFF_FFFF;

/// Device hardware variants reported in STATUS frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceType {
    Unknown = 0,
    DotBotV3 = 1,
    DotBotV2 = 2,
    Nrf5340Dk = 3,
    Nrf52840Dk = 4,
}

impl TryFrom<u8> for DeviceType {
    type Error = PayloadError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::DotBotV3),
            2 => Ok(Self::DotBotV2),
            3 => Ok(Self::Nrf5340Dk),
            4 => Ok(Self::Nrf52840Dk),
            other => Err(PayloadError::InvalidPayload(format!(
                "unknown device type: {other}"
            ))),
        }
    }
}

/// Device lifecycle state, as reported in STATUS frames and tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusType {
    Bootloader = 0,
    Running = 1,
    Stopping = 2,
    Resetting = 3,
    Programming = 4,
}

impl TryFrom<u8> for StatusType {
    type Error = PayloadError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Bootloader),
            1 => Ok(Self::Running),
            2 => Ok(Self::Stopping),
            3 => Ok(Self::Resetting),
            4 => Ok(Self::Programming),
            other => Err(PayloadError::InvalidPayload(format!(
                "unknown status type: {other}"
            ))),
        }
    }
}

/// Single-byte discriminant prefixing every application payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    Status = 0x80,
    Start = 0x81,
    Stop = 0x82,
    Reset = 0x83,
    OtaStart = 0x84,
    OtaChunk = 0x85,
    OtaStartAck = 0x86,
    OtaChunkAck = 0x87,
    EventLog = 0x89,
    Message = 0xA0,
}

impl TryFrom<u8> for PayloadType {
    type Error = PayloadError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(Self::Status),
            0x81 => Ok(Self::Start),
            0x82 => Ok(Self::Stop),
            0x83 => Ok(Self::Reset),
            0x84 => Ok(Self::OtaStart),
            0x85 => Ok(Self::OtaChunk),
            0x86 => Ok(Self::OtaStartAck),
            0x87 => Ok(Self::OtaChunkAck),
            0x89 => Ok(Self::EventLog),
            0xA0 => Ok(Self::Message),
            other => Err(PayloadError::UnknownPayloadType(other)),
        }
    }
}

/// Errors raised while encoding or decoding an application payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("unknown payload type: 0x{0:02X}")]
    UnknownPayloadType(u8),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// A decoded application payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Status {
        device: DeviceType,
        status: StatusType,
        battery_mv: u16,
        pos_x: i32,
        pos_y: i32,
    },
    Start,
    Stop,
    Reset {
        pos_x: i32,
        pos_y: i32,
    },
    OtaStart {
        fw_length: u32,
        fw_chunk_count: u32,
    },
    OtaChunk {
        index: u32,
        count: u8,
        sha: [u8; 8],
        chunk: Vec<u8>,
    },
    OtaStartAck,
    OtaChunkAck {
        index: u32,
    },
    EventLog {
        timestamp: u32,
        count: u8,
        data: Vec<u8>,
    },
    Message {
        count: u8,
        message: Vec<u8>,
    },
}

impl Payload {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::Status { .. } => PayloadType::Status,
            Payload::Start => PayloadType::Start,
            Payload::Stop => PayloadType::Stop,
            Payload::Reset { .. } => PayloadType::Reset,
            Payload::OtaStart { .. } => PayloadType::OtaStart,
            Payload::OtaChunk { .. } => PayloadType::OtaChunk,
            Payload::OtaStartAck => PayloadType::OtaStartAck,
            Payload::OtaChunkAck { .. } => PayloadType::OtaChunkAck,
            Payload::EventLog { .. } => PayloadType::EventLog,
            Payload::Message { .. } => PayloadType::Message,
        }
    }

    /// Build a MESSAGE payload, validating the 255-byte text limit.
    pub fn message(text: &str) -> Result<Self, PayloadError> {
        let bytes = text.as_bytes();
        if bytes.len() > 255 {
            return Err(PayloadError::InvalidPayload(format!(
                "message too long: {} bytes > 255",
                bytes.len()
            )));
        }
        Ok(Payload::Message {
            count: bytes.len() as u8,
            message: bytes.to_vec(),
        })
    }

    /// Encode this payload as `[PayloadType][fields...]`.
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let mut out = vec![self.payload_type() as u8];
        match self {
            Payload::Status {
                device,
                status,
                battery_mv,
                pos_x,
                pos_y,
            } => {
                out.push(*device as u8);
                out.push(*status as u8);
                out.extend_from_slice(&battery_mv.to_le_bytes());
                out.extend_from_slice(&pos_x.to_le_bytes());
                out.extend_from_slice(&pos_y.to_le_bytes());
            }
            Payload::Start | Payload::Stop | Payload::OtaStartAck => {}
            Payload::Reset { pos_x, pos_y } => {
                out.extend_from_slice(&pos_x.to_le_bytes());
                out.extend_from_slice(&pos_y.to_le_bytes());
            }
            Payload::OtaStart {
                fw_length,
                fw_chunk_count,
            } => {
                out.extend_from_slice(&fw_length.to_le_bytes());
                out.extend_from_slice(&fw_chunk_count.to_le_bytes());
            }
            Payload::OtaChunk {
                index,
                count,
                sha,
                chunk,
            } => {
                if chunk.len() > 255 {
                    return Err(PayloadError::InvalidPayload(format!(
                        "OTA chunk too large: {} bytes > 255",
                        chunk.len()
                    )));
                }
                if chunk.len() != *count as usize {
                    return Err(PayloadError::InvalidPayload(format!(
                        "OTA chunk count mismatch: count={} actual={}",
                        count,
                        chunk.len()
                    )));
                }
                out.extend_from_slice(&index.to_le_bytes());
                out.push(*count);
                out.extend_from_slice(sha);
                out.extend_from_slice(chunk);
            }
            Payload::OtaChunkAck { index } => {
                out.extend_from_slice(&index.to_le_bytes());
            }
            Payload::EventLog {
                timestamp,
                count,
                data,
            } => {
                if data.len() > 255 || data.len() != *count as usize {
                    return Err(PayloadError::InvalidPayload(format!(
                        "event log length mismatch: count={} actual={}",
                        count,
                        data.len()
                    )));
                }
                out.extend_from_slice(&timestamp.to_le_bytes());
                out.push(*count);
                out.extend_from_slice(data);
            }
            Payload::Message { count, message } => {
                if message.len() > 255 || message.len() != *count as usize {
                    return Err(PayloadError::InvalidPayload(format!(
                        "message length mismatch: count={} actual={}",
                        count,
                        message.len()
                    )));
                }
                out.push(*count);
                out.extend_from_slice(message);
            }
        }
        Ok(out)
    }

    /// Decode `[PayloadType][fields...]` produced by [`Payload::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let (type_byte, rest) = bytes
            .split_first()
            .ok_or_else(|| PayloadError::InvalidPayload("empty payload".into()))?;
        let payload_type = PayloadType::try_from(*type_byte)?;

        fn need(rest: &[u8], len: usize) -> Result<(), PayloadError> {
            if rest.len() < len {
                return Err(PayloadError::InvalidPayload(format!(
                    "expected at least {len} bytes, got {}",
                    rest.len()
                )));
            }
            Ok(())
        }

        Ok(match payload_type {
            PayloadType::Status => {
                need(rest, 1 + 1 + 2 + 4 + 4)?;
                let device = DeviceType::try_from(rest[0])?;
                let status = StatusType::try_from(rest[1])?;
                let battery_mv = u16::from_le_bytes([rest[2], rest[3]]);
                let pos_x = i32::from_le_bytes(rest[4..8].try_into().unwrap());
                let pos_y = i32::from_le_bytes(rest[8..12].try_into().unwrap());
                Payload::Status {
                    device,
                    status,
                    battery_mv,
                    pos_x,
                    pos_y,
                }
            }
            PayloadType::Start => Payload::Start,
            PayloadType::Stop => Payload::Stop,
            PayloadType::Reset => {
                need(rest, 8)?;
                let pos_x = i32::from_le_bytes(rest[0..4].try_into().unwrap());
                let pos_y = i32::from_le_bytes(rest[4..8].try_into().unwrap());
                Payload::Reset { pos_x, pos_y }
            }
            PayloadType::OtaStart => {
                need(rest, 8)?;
                let fw_length = u32::from_le_bytes(rest[0..4].try_into().unwrap());
                let fw_chunk_count = u32::from_le_bytes(rest[4..8].try_into().unwrap());
                Payload::OtaStart {
                    fw_length,
                    fw_chunk_count,
                }
            }
            PayloadType::OtaChunk => {
                need(rest, 4 + 1 + 8)?;
                let index = u32::from_le_bytes(rest[0..4].try_into().unwrap());
                let count = rest[4];
                let mut sha = [0u8; 8];
                sha.copy_from_slice(&rest[5..13]);
                let chunk_start = 13;
                need(rest, chunk_start + count as usize)?;
                let chunk = rest[chunk_start..chunk_start + count as usize].to_vec();
                Payload::OtaChunk {
                    index,
                    count,
                    sha,
                    chunk,
                }
            }
            PayloadType::OtaStartAck => Payload::OtaStartAck,
            PayloadType::OtaChunkAck => {
                need(rest, 4)?;
                let index = u32::from_le_bytes(rest[0..4].try_into().unwrap());
                Payload::OtaChunkAck { index }
            }
            PayloadType::EventLog => {
                need(rest, 4 + 1)?;
                let timestamp = u32::from_le_bytes(rest[0..4].try_into().unwrap());
                let count = rest[4];
                need(rest, 5 + count as usize)?;
                let data = rest[5..5 + count as usize].to_vec();
                Payload::EventLog {
                    timestamp,
                    count,
                    data,
                }
            }
            PayloadType::Message => {
                need(rest, 1)?;
                let count = rest[0];
                need(rest, 1 + count as usize)?;
                let message = rest[1..1 + count as usize].to_vec();
                Payload::Message { count, message }
            }
        })
    }
}

/// Generic mesh packet header. `packet_type` is carried for wire fidelity
/// with the gateway's own framing but is not interpreted by the controller:
/// every frame the controller sends or receives is an application frame.
const MESH_PACKET_TYPE: u8 = 0;

/// A fully addressed mesh frame: header plus a decoded application payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshFrame {
    pub destination: u32,
    pub source: u32,
    pub payload: Payload,
}

impl MeshFrame {
    pub fn new(destination: u32, source: u32, payload: Payload) -> Self {
        Self {
            destination,
            source,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let mut out = Vec::with_capacity(9 + 16);
        out.extend_from_slice(&self.destination.to_le_bytes());
        out.extend_from_slice(&self.source.to_le_bytes());
        out.push(MESH_PACKET_TYPE);
        out.extend_from_slice(&self.payload.encode()?);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        if bytes.len() < 9 {
            return Err(PayloadError::InvalidPayload(format!(
                "mesh header truncated: {} bytes < 9",
                bytes.len()
            )));
        }
        let destination = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let source = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        // bytes[8] is the packet type tag; unused beyond framing parity.
        let payload = Payload::decode(&bytes[9..])?;
        Ok(MeshFrame {
            destination,
            source,
            payload,
        })
    }
}

/// Render a device address in the canonical 8-hex-digit uppercase form.
pub fn format_address(address: u32) -> String {
    format!("{address:08X}")
}

/// Parse a canonical 8-hex-digit uppercase address string.
pub fn parse_address(text: &str) -> Result<u32, PayloadError> {
    u32::from_str_radix(text, 16)
        .map_err(|_| PayloadError::InvalidPayload(format!("invalid device address: {text}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        let payload = Payload::Status {
            device: DeviceType::DotBotV3,
            status: StatusType::Running,
            battery_mv: 3300,
            pos_x: -42,
            pos_y: 1000,
        };
        let encoded = payload.encode().unwrap();
        assert_eq!(Payload::decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn ota_chunk_roundtrip() {
        let payload = Payload::OtaChunk {
            index: 7,
            count: 4,
            sha: [1, 2, 3, 4, 5, 6, 7, 8],
            chunk: vec![0xAA, 0xBB, 0xCC, 0xDD],
        };
        let encoded = payload.encode().unwrap();
        assert_eq!(Payload::decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn message_too_long_rejected() {
        let text: String = "a".repeat(256);
        assert!(Payload::message(&text).is_err());
    }

    #[test]
    fn unknown_payload_type_rejected() {
        assert_eq!(
            Payload::decode(&[0x7F]).unwrap_err(),
            PayloadError::UnknownPayloadType(0x7F)
        );
    }

    #[test]
    fn mesh_frame_roundtrip() {
        let frame = MeshFrame::new(BROADCAST_ADDRESS, 0x01, Payload::Start);
        let encoded = frame.encode().unwrap();
        assert_eq!(MeshFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn truncated_variable_length_field_rejected() {
        // EventLog claims 5 bytes of data but only provides 2.
        let bytes = [PayloadType::EventLog as u8, 0, 0, 0, 0, 5, 0xAA, 0xBB];
        assert!(Payload::decode(&bytes).is_err());
    }

    #[test]
    fn address_formatting() {
        assert_eq!(format_address(0xAB), "000000AB");
        assert_eq!(parse_address("000000AB").unwrap(), 0xAB);
        assert!(parse_address("zz").is_err());
    }
}
