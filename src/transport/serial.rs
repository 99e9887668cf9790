//! Serial ("edge") gateway adapter: talks to a local USB/UART-attached gateway.

use super::{FrameCallback, GatewayAdapter, TransportError};
use crate::wire::{encode_stream_frame, MeshFrame, Payload, StreamDecoder};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial transport for communicating with the mesh gateway over USB/UART.
pub struct SerialGatewayAdapter {
    write_port: Mutex<Box<dyn SerialPort>>,
    read_port: Option<Box<dyn SerialPort>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    gateway_address: u32,
}

impl SerialGatewayAdapter {
    /// Open a serial connection to the gateway.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let write_port = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| TransportError::InitFailed(format!("{port_name}: {e}")))?;
        let read_port = write_port
            .try_clone()
            .map_err(|e| TransportError::InitFailed(format!("failed to clone port: {e}")))?;

        Ok(Self {
            write_port: Mutex::new(write_port),
            read_port: Some(read_port),
            reader_handle: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            gateway_address: 0,
        })
    }

    /// List available serial ports on the host.
    pub fn list_ports() -> Result<Vec<String>, TransportError> {
        let ports = serialport::available_ports()
            .map_err(|e| TransportError::InitFailed(format!("failed to enumerate ports: {e}")))?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}

impl GatewayAdapter for SerialGatewayAdapter {
    fn init(&mut self, on_frame_received: FrameCallback) -> Result<(), TransportError> {
        let mut read_port = self
            .read_port
            .take()
            .ok_or_else(|| TransportError::InitFailed("adapter already initialized".into()))?;
        let stop = self.stop.clone();

        let handle = thread::spawn(move || {
            let mut decoder = StreamDecoder::new();
            let mut buf = [0u8; 256];
            while !stop.load(Ordering::Relaxed) {
                match read_port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        for &byte in &buf[..n] {
                            if let Some(result) = decoder.feed_byte(byte) {
                                match result {
                                    Ok(mesh_bytes) => match MeshFrame::decode(&mesh_bytes) {
                                        Ok(frame) => on_frame_received(frame),
                                        Err(e) => {
                                            log::warn!("dropping undecodable mesh frame: {e}")
                                        }
                                    },
                                    Err(e) => log::warn!("dropping malformed stream frame: {e}"),
                                }
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        log::warn!("serial read error: {e}");
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        });
        *self.reader_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn close(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn send_payload(&self, destination: u32, payload: &Payload) -> Result<(), TransportError> {
        let frame = MeshFrame::new(destination, self.gateway_address, payload.clone());
        let mesh_bytes = frame
            .encode()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let stream_bytes = encode_stream_frame(&mesh_bytes)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let mut port = self
            .write_port
            .lock()
            .map_err(|_| TransportError::SendFailed("write lock poisoned".into()))?;
        port.write_all(&stream_bytes)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        port.flush()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }
}
