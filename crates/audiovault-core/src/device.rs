//! Per-device connection state
//!
//! `DeviceInfo` is owned by the connection that created it; everything else
//! sees read-only snapshots (clones).

use crate::chunk::AudioFormat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Device connection lifecycle.
///
/// `Connected → Streaming` happens on receipt of the first audio chunk.
/// `Error` always leads to teardown; reconnection is client-initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error,
}

/// One device's connection-level state and cumulative counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub ip_address: String,
    pub port: u16,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: DeviceStatus,
    pub audio_format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub bytes_received: u64,
    pub chunks_received: u64,
    pub errors: u64,
}

impl DeviceInfo {
    /// New device record with default audio parameters (16kHz/16-bit/mono)
    pub fn new(device_id: impl Into<String>, ip_address: impl Into<String>, port: u16) -> Self {
        let now = Utc::now();
        Self {
            device_id: device_id.into(),
            ip_address: ip_address.into(),
            port,
            connected_at: now,
            last_activity: now,
            status: DeviceStatus::Disconnected,
            audio_format: AudioFormat::Pcm16,
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            channels: 1,
            bits_per_sample: 16,
            bytes_received: 0,
            chunks_received: 0,
            errors: 0,
        }
    }

    /// Placeholder record for the headless write path (no prior connection)
    pub fn placeholder(device_id: impl Into<String>) -> Self {
        Self::new(device_id, "unknown", 0)
    }

    /// Bytes per second of PCM at the negotiated parameters
    pub fn byte_rate(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * (self.bits_per_sample as u64 / 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_device_defaults() {
        let info = DeviceInfo::new("abc", "10.0.0.5", 9000);
        assert_eq!(info.status, DeviceStatus::Disconnected);
        assert_eq!(info.sample_rate, 16000);
        assert_eq!(info.byte_rate(), 32000);
    }

    #[test]
    fn test_placeholder() {
        let info = DeviceInfo::placeholder("abc");
        assert_eq!(info.ip_address, "unknown");
        assert_eq!(info.port, 0);
    }
}
