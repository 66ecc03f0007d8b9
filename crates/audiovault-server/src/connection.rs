//! One connected device: receive loop, command channel, teardown
//!
//! Devices stream raw PCM over the socket; reads are re-aligned to
//! whole sample frames before they become chunks. Commands flow the
//! other way as newline-delimited JSON envelopes. Teardown is
//! idempotent: the stop flag plus a socket shutdown unblocks the
//! receive loop, and the owning thread is joined exactly once.

use crate::pipeline::AudioPipeline;
use audiovault_core::chunk::{AudioChunk, AudioFormat};
use audiovault_core::device::{DeviceInfo, DeviceStatus};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Socket error for device {device_id}: {source}")]
    Socket {
        device_id: String,
        source: std::io::Error,
    },

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Server-to-device command envelope
#[derive(Debug, Serialize)]
pub struct CommandEnvelope<'a> {
    pub command: &'a str,
    pub timestamp: chrono::DateTime<Utc>,
    pub data: Value,
}

/// Handle to a live device connection.
///
/// The receive loop runs on its own thread; this handle is what the
/// server keeps in its registry.
pub struct DeviceConnection {
    device_id: String,
    stream: Mutex<TcpStream>,
    info: Arc<Mutex<DeviceInfo>>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceConnection {
    /// Spawn the receive loop for an accepted socket.
    ///
    /// `on_close` runs exactly once when the loop exits, after the
    /// device's final state is recorded.
    pub fn spawn(
        stream: TcpStream,
        device_id: String,
        chunk_size: usize,
        format: AudioFormat,
        pipeline: Arc<AudioPipeline>,
        on_close: impl FnOnce(&str) + Send + 'static,
    ) -> Result<Arc<Self>, ConnectionError> {
        let peer = stream
            .peer_addr()
            .map_err(|source| ConnectionError::Socket {
                device_id: device_id.clone(),
                source,
            })?;

        let mut info = DeviceInfo::new(&device_id, peer.ip().to_string(), peer.port());
        info.status = DeviceStatus::Connected;
        let info = Arc::new(Mutex::new(info));

        let reader = stream.try_clone().map_err(|source| ConnectionError::Socket {
            device_id: device_id.clone(),
            source,
        })?;

        let connection = Arc::new(Self {
            device_id: device_id.clone(),
            stream: Mutex::new(stream),
            info: Arc::clone(&info),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        });

        let stop = Arc::clone(&connection.stop);
        let thread_info = Arc::clone(&info);
        let handle = std::thread::Builder::new()
            .name(format!("recv-{device_id}"))
            .spawn(move || {
                receive_loop(reader, &device_id, chunk_size, format, &pipeline, &stop, &thread_info);
                on_close(&device_id);
            })
            .map_err(|source| ConnectionError::Socket {
                device_id: connection.device_id.clone(),
                source,
            })?;

        *lock(&connection.handle) = Some(handle);
        Ok(connection)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn info(&self) -> DeviceInfo {
        lock(&self.info).clone()
    }

    /// Send one command envelope, newline terminated
    pub fn send_command(&self, command: &str, data: Value) -> Result<(), ConnectionError> {
        let envelope = CommandEnvelope {
            command,
            timestamp: Utc::now(),
            data,
        };
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let mut stream = lock(&self.stream);
        stream
            .write_all(&line)
            .map_err(|source| ConnectionError::Socket {
                device_id: self.device_id.clone(),
                source,
            })
    }

    /// Idempotent teardown: raise the stop flag, shut the socket to
    /// unblock the reader, and join the thread
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = lock(&self.stream).shutdown(Shutdown::Both) {
            // Already closed by the peer
            tracing::debug!(device_id = %self.device_id, error = %err, "Socket shutdown");
        }
        if let Some(handle) = lock(&self.handle).take() {
            if handle.join().is_err() {
                tracing::error!(device_id = %self.device_id, "Receive thread panicked");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn receive_loop(
    mut reader: TcpStream,
    device_id: &str,
    chunk_size: usize,
    format: AudioFormat,
    pipeline: &AudioPipeline,
    stop: &AtomicBool,
    info: &Mutex<DeviceInfo>,
) {
    let mut buffer = vec![0u8; chunk_size];
    // TCP reads split anywhere; carry partial frames to the next chunk
    let mut pending: Vec<u8> = Vec::new();
    let frame = format.bytes_per_sample().unwrap_or(1);
    let mut sequence = 0u64;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::info!(device_id, "Device closed connection");
                break;
            }
            Ok(n) => {
                let first_audio = {
                    let mut info = lock(info);
                    let first = info.status != DeviceStatus::Streaming;
                    info.status = DeviceStatus::Streaming;
                    info.last_activity = Utc::now();
                    info.bytes_received += n as u64;
                    info.chunks_received += 1;
                    first
                };
                if first_audio {
                    pipeline.device_streaming(device_id);
                }

                pending.extend_from_slice(&buffer[..n]);
                let aligned = pending.len() - pending.len() % frame;
                if aligned == 0 {
                    continue;
                }
                let data: Vec<u8> = pending.drain(..aligned).collect();

                let chunk = AudioChunk::with_format(device_id, data, sequence, format);
                sequence += 1;

                if let Err(err) = pipeline.handle_chunk(&chunk) {
                    lock(info).errors += 1;
                    tracing::warn!(device_id, error = %err, "Chunk rejected");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {
                tracing::info!(device_id, "Device idle past timeout, disconnecting");
                break;
            }
            Err(err) => {
                if !stop.load(Ordering::SeqCst) {
                    lock(info).errors += 1;
                    lock(info).status = DeviceStatus::Error;
                    tracing::warn!(device_id, error = %err, "Socket read failed");
                }
                break;
            }
        }
    }

    if !pending.is_empty() {
        tracing::warn!(device_id, bytes = pending.len(), "Trailing partial frame discarded");
    }

    let mut info = lock(info);
    if info.status != DeviceStatus::Error {
        info.status = DeviceStatus::Disconnected;
    }
}
