//! Byte-stream framing for the gateway link.
//!
//! Frame format: `[0xAA][0x55][LenLE16][MeshFrame bytes][CRC32LE]`
//! - Start bytes: 0xAA 0x55
//! - Length: 2 bytes little-endian, length of the mesh frame bytes that follow
//! - CRC32: 4 bytes little-endian, calculated over the mesh frame bytes
//!
//! This is the physical link's byte framing; it wraps the mesh-level
//! `[destination][source][type][payload...]` bytes produced by
//! `wire::mesh::MeshFrame::encode`.

use crc32fast::Hasher;
use thiserror::Error;

const START_BYTE_0: u8 = 0xAA;
const START_BYTE_1: u8 = 0x55;

/// Largest mesh frame the link will carry (header + largest OTA chunk payload).
pub const MAX_FRAME_SIZE: usize = 1024;

/// Stream framing overhead: 2 start + 2 len + 4 crc = 8 bytes.
pub const FRAME_OVERHEAD: usize = 8;

#[derive(Debug, Error)]
pub enum StreamFrameError {
    #[error("frame too large: {0} > {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    #[error("invalid length: {0}")]
    InvalidLength(u16),

    #[error("CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    CrcMismatch { expected: u32, actual: u32 },
}

/// Wrap mesh frame bytes in the link's start/length/CRC envelope.
pub fn encode_stream_frame(mesh_bytes: &[u8]) -> Result<Vec<u8>, StreamFrameError> {
    if mesh_bytes.len() > MAX_FRAME_SIZE {
        return Err(StreamFrameError::FrameTooLarge(mesh_bytes.len()));
    }

    let mut hasher = Hasher::new();
    hasher.update(mesh_bytes);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + mesh_bytes.len());
    frame.push(START_BYTE_0);
    frame.push(START_BYTE_1);
    frame.extend_from_slice(&(mesh_bytes.len() as u16).to_le_bytes());
    frame.extend_from_slice(mesh_bytes);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecoderState {
    WaitStart0,
    WaitStart1,
    WaitLenLow,
    WaitLenHigh,
    WaitPayload,
    WaitCrc,
}

/// Streaming decoder: feed it bytes as they arrive off the link; it yields a
/// complete mesh-frame payload whenever a valid envelope closes.
pub struct StreamDecoder {
    state: DecoderState,
    length: u16,
    payload: Vec<u8>,
    crc_bytes: [u8; 4],
    crc_index: usize,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::WaitStart0,
            length: 0,
            payload: Vec::new(),
            crc_bytes: [0; 4],
            crc_index: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed a single byte. Returns `Some` once a frame completes (valid or not).
    pub fn feed_byte(&mut self, byte: u8) -> Option<Result<Vec<u8>, StreamFrameError>> {
        match self.state {
            DecoderState::WaitStart0 => {
                if byte == START_BYTE_0 {
                    self.state = DecoderState::WaitStart1;
                }
                None
            }
            DecoderState::WaitStart1 => {
                if byte == START_BYTE_1 {
                    self.state = DecoderState::WaitLenLow;
                } else if byte != START_BYTE_0 {
                    self.state = DecoderState::WaitStart0;
                }
                None
            }
            DecoderState::WaitLenLow => {
                self.length = byte as u16;
                self.state = DecoderState::WaitLenHigh;
                None
            }
            DecoderState::WaitLenHigh => {
                self.length |= (byte as u16) << 8;
                if self.length == 0 || self.length as usize > MAX_FRAME_SIZE {
                    self.reset();
                    return Some(Err(StreamFrameError::InvalidLength(self.length)));
                }
                self.payload = Vec::with_capacity(self.length as usize);
                self.state = DecoderState::WaitPayload;
                None
            }
            DecoderState::WaitPayload => {
                self.payload.push(byte);
                if self.payload.len() >= self.length as usize {
                    self.state = DecoderState::WaitCrc;
                    self.crc_index = 0;
                }
                None
            }
            DecoderState::WaitCrc => {
                self.crc_bytes[self.crc_index] = byte;
                self.crc_index += 1;
                if self.crc_index < 4 {
                    return None;
                }

                let received_crc = u32::from_le_bytes(self.crc_bytes);
                let mut hasher = Hasher::new();
                hasher.update(&self.payload);
                let calculated_crc = hasher.finalize();

                let result = if received_crc != calculated_crc {
                    Err(StreamFrameError::CrcMismatch {
                        expected: calculated_crc,
                        actual: received_crc,
                    })
                } else {
                    Ok(std::mem::take(&mut self.payload))
                };
                self.reset();
                Some(result)
            }
        }
    }
}
