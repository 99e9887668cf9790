//! Cloud ("cloud") gateway adapter: reaches the gateway over a remote
//! message bus. The concrete transport used here is a TCP socket, standing
//! in for the MQTT broker connection the production gateway bridges to; the
//! controller only depends on the `GatewayAdapter` contract, not on MQTT
//! specifically.

use super::{FrameCallback, GatewayAdapter, TransportError};
use crate::wire::{encode_stream_frame, MeshFrame, Payload, StreamDecoder};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Cloud transport for communicating with the mesh gateway over a remote
/// message bus endpoint.
pub struct CloudGatewayAdapter {
    write_stream: Mutex<TcpStream>,
    read_stream: Option<TcpStream>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    network_id: u16,
    use_tls: bool,
}

impl CloudGatewayAdapter {
    /// Connect to the cloud endpoint at `host:port`.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        network_id: u16,
        use_tls: bool,
    ) -> Result<Self, TransportError> {
        let write_stream = TcpStream::connect(addr)
            .map_err(|e| TransportError::InitFailed(format!("connect failed: {e}")))?;
        write_stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| TransportError::InitFailed(format!("set_read_timeout: {e}")))?;
        write_stream
            .set_nodelay(true)
            .map_err(|e| TransportError::InitFailed(format!("set_nodelay: {e}")))?;
        let read_stream = write_stream
            .try_clone()
            .map_err(|e| TransportError::InitFailed(format!("try_clone: {e}")))?;

        if use_tls {
            log::warn!(
                "cloud adapter TLS requested but this build uses a plain TCP socket as the \
                 MQTT-bridge stand-in; continuing without TLS"
            );
        }

        Ok(Self {
            write_stream: Mutex::new(write_stream),
            read_stream: Some(read_stream),
            reader_handle: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            network_id,
            use_tls,
        })
    }

    pub fn network_id(&self) -> u16 {
        self.network_id
    }
}

impl GatewayAdapter for CloudGatewayAdapter {
    fn init(&mut self, on_frame_received: FrameCallback) -> Result<(), TransportError> {
        let mut read_stream = self
            .read_stream
            .take()
            .ok_or_else(|| TransportError::InitFailed("adapter already initialized".into()))?;
        let stop = self.stop.clone();

        let handle = thread::spawn(move || {
            let mut decoder = StreamDecoder::new();
            let mut buf = [0u8; 512];
            while !stop.load(Ordering::Relaxed) {
                match read_stream.read(&mut buf) {
                    Ok(0) => break, // peer closed the connection
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
                    Err(e)
                        if e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::WouldBlock =>
                    {
                        continue
                    }
                    Err(e) => {
                        log::warn!("cloud read error: {e}");
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
        // Gateway's own address on the mesh is implicit to the cloud bridge (0).
        let frame = MeshFrame::new(destination, 0, payload.clone());
        let mesh_bytes = frame
            .encode()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let stream_bytes = encode_stream_frame(&mesh_bytes)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let mut stream = self
            .write_stream
            .lock()
            .map_err(|_| TransportError::SendFailed("write lock poisoned".into()))?;
        stream
            .write_all(&stream_bytes)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        stream
            .flush()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }
}
