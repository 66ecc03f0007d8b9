//! TCP accept loop and the connection registry
//!
//! One listener thread accepts sockets and spawns a receive thread per
//! device. The registry maps device id to its live connection; commands
//! and disconnects go through it. Past the connection limit, sockets
//! are dropped immediately without a handshake.

use crate::connection::{ConnectionError, DeviceConnection};
use crate::pipeline::AudioPipeline;
use audiovault_core::chunk::AudioFormat;
use audiovault_core::config::Config;
use audiovault_core::device::DeviceInfo;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Listener error: {0}")]
    Listener(#[from] std::io::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Point-in-time server statistics
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub active_connections: usize,
    pub max_connections: usize,
    pub total_connections: u64,
    pub refused_connections: u64,
    pub uptime_secs: u64,
    pub devices: Vec<DeviceInfo>,
}

type Registry = Arc<Mutex<HashMap<String, Arc<DeviceConnection>>>>;

/// The receiver daemon: listener thread plus connection registry
pub struct ReceiverServer {
    config: Config,
    pipeline: Arc<AudioPipeline>,
    connections: Registry,
    running: Arc<AtomicBool>,
    accepted: Arc<AtomicU64>,
    refused: Arc<AtomicU64>,
    started_at: Instant,
    local_addr: Option<SocketAddr>,
    accept_handle: Option<JoinHandle<()>>,
}

impl ReceiverServer {
    pub fn new(config: Config, pipeline: Arc<AudioPipeline>) -> Self {
        Self {
            config,
            pipeline,
            connections: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            accepted: Arc::new(AtomicU64::new(0)),
            refused: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
            local_addr: None,
            accept_handle: None,
        }
    }

    /// Bind the listener and start accepting connections
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let addr = format!("{}:{}", self.config.receiver.host, self.config.receiver.port);
        let listener = TcpListener::bind(&addr).map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        // Non-blocking accept so the loop can observe the stop flag
        listener.set_nonblocking(true)?;
        self.local_addr = Some(listener.local_addr()?);
        self.started_at = Instant::now();

        tracing::info!(
            addr = %self.local_addr.map(|a| a.to_string()).unwrap_or(addr),
            max_connections = self.config.receiver.max_connections,
            "Receiver listening"
        );
        self.pipeline.events().publish(
            "server.started",
            json!({
                "addr": self.local_addr.map(|a| a.to_string()),
                "max_connections": self.config.receiver.max_connections,
            }),
            "server",
        );

        let config = self.config.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let connections = Arc::clone(&self.connections);
        let running = Arc::clone(&self.running);
        let accepted = Arc::clone(&self.accepted);
        let refused = Arc::clone(&self.refused);

        self.accept_handle = Some(std::thread::spawn(move || {
            accept_loop(
                listener, config, pipeline, connections, running, accepted, refused,
            );
        }));
        Ok(())
    }

    /// Stop accepting, tear down every connection, finalize segments
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.accept_handle.take() {
            if handle.join().is_err() {
                tracing::error!("Accept thread panicked");
            }
        }

        // Stopping joins each receive thread, whose close hook finalizes
        // the device's segment and publishes the disconnect event
        let targets: Vec<Arc<DeviceConnection>> =
            lock(&self.connections).values().cloned().collect();
        for connection in targets {
            connection.stop();
        }
        self.pipeline.events().publish(
            "server.stopped",
            json!({
                "total_connections": self.accepted.load(Ordering::Relaxed),
                "refused_connections": self.refused.load(Ordering::Relaxed),
            }),
            "server",
        );
        tracing::info!("Receiver stopped");
    }

    /// Actual bound address; differs from config when port 0 was requested
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Send a command to every connected device; returns how many sends
    /// succeeded
    pub fn broadcast_command(&self, command: &str, data: Value) -> usize {
        let targets: Vec<Arc<DeviceConnection>> =
            lock(&self.connections).values().cloned().collect();

        let mut sent = 0;
        for connection in targets {
            match connection.send_command(command, data.clone()) {
                Ok(()) => sent += 1,
                Err(err) => {
                    tracing::warn!(
                        device_id = connection.device_id(),
                        error = %err,
                        "Command send failed"
                    );
                }
            }
        }
        tracing::debug!(command, sent, "Command broadcast");
        sent
    }

    /// Send a command to one device; returns false if unknown
    pub fn send_command(&self, device_id: &str, command: &str, data: Value) -> bool {
        let connection = lock(&self.connections).get(device_id).cloned();
        match connection {
            Some(connection) => match connection.send_command(command, data) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(device_id, error = %err, "Command send failed");
                    false
                }
            },
            None => false,
        }
    }

    /// Disconnect one device; returns false if unknown
    pub fn disconnect_device(&self, device_id: &str) -> bool {
        let connection = lock(&self.connections).get(device_id).cloned();
        match connection {
            Some(connection) => {
                // The close hook removes the registry entry and notifies
                // the pipeline
                connection.stop();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> ServerStats {
        let registry = lock(&self.connections);
        ServerStats {
            active_connections: registry.len(),
            max_connections: self.config.receiver.max_connections,
            total_connections: self.accepted.load(Ordering::Relaxed),
            refused_connections: self.refused.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
            devices: registry.values().map(|c| c.info()).collect(),
        }
    }

    /// Healthy while the pipeline is healthy and the registry has room
    pub fn health_check(&self) -> bool {
        let active = lock(&self.connections).len();
        active < self.config.receiver.max_connections && self.pipeline.health_check()
    }
}

impl Drop for ReceiverServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn accept_loop(
    listener: TcpListener,
    config: Config,
    pipeline: Arc<AudioPipeline>,
    connections: Registry,
    running: Arc<AtomicBool>,
    accepted: Arc<AtomicU64>,
    refused: Arc<AtomicU64>,
) {
    while running.load(Ordering::SeqCst) {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => {
                tracing::error!(error = %err, "Accept failed");
                continue;
            }
        };

        let active = lock(&connections).len();
        if active >= config.receiver.max_connections {
            refused.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%peer, active, "Connection limit reached, socket dropped");
            drop(stream);
            continue;
        }

        match register(&stream, &config, &pipeline, &connections) {
            Ok(()) => {
                accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::error!(%peer, error = %err, "Connection setup failed");
            }
        }
    }
}

fn register(
    stream: &TcpStream,
    config: &Config,
    pipeline: &Arc<AudioPipeline>,
    connections: &Registry,
) -> Result<(), ServerError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    // std exposes no SO_RCVBUF setter, so the kernel default receive
    // buffer applies
    stream.set_read_timeout(Some(Duration::from_secs(config.receiver.timeout_secs)))?;

    let device_id = uuid::Uuid::new_v4().to_string();
    let peer = stream.peer_addr()?.to_string();
    // Config validation admits only 16- and 24-bit PCM
    let format = AudioFormat::from_bits_per_sample(config.receiver.bits_per_sample)
        .unwrap_or(AudioFormat::Pcm16);

    let registry = Arc::clone(connections);
    let close_pipeline = Arc::clone(pipeline);
    let on_close = move |id: &str| {
        let (removed, remaining) = {
            let mut registry = lock(&registry);
            let removed = registry.remove(id);
            (removed, registry.len())
        };
        if let Some(connection) = removed {
            let info = connection.info();
            tracing::info!(
                device_id = %id,
                bytes_received = info.bytes_received,
                chunks_received = info.chunks_received,
                errors = info.errors,
                "Device disconnected"
            );
        }
        close_pipeline.device_disconnected(id, remaining);
    };

    let connection = DeviceConnection::spawn(
        stream.try_clone()?,
        device_id.clone(),
        config.receiver.tcp_chunk_size,
        format,
        Arc::clone(pipeline),
        on_close,
    )?;

    let active = {
        let mut registry = lock(connections);
        registry.insert(device_id.clone(), connection);
        registry.len()
    };

    tracing::info!(device_id = %device_id, peer = %peer, active, "Device connected");
    pipeline.device_connected(&device_id, &peer, active);
    Ok(())
}
