//! Raw audio chunk data model
//!
//! A chunk is one discrete delivery of bytes from a device, as returned by a
//! single socket read. Chunk boundaries carry no semantic meaning; consumers
//! may only assume simple concatenation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audio sample formats a device may negotiate.
///
/// Only the PCM variants are convertible by the processing pipeline; `Opus`
/// and `Flac` streams are stored verbatim and rejected by the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Pcm16,
    Pcm24,
    Opus,
    Flac,
}

impl AudioFormat {
    /// PCM format for a configured bit depth
    pub fn from_bits_per_sample(bits: u16) -> Option<Self> {
        match bits {
            16 => Some(AudioFormat::Pcm16),
            24 => Some(AudioFormat::Pcm24),
            _ => None,
        }
    }

    /// Bytes per sample per channel, where fixed
    pub fn bytes_per_sample(&self) -> Option<usize> {
        match self {
            AudioFormat::Pcm16 => Some(2),
            AudioFormat::Pcm24 => Some(3),
            AudioFormat::Opus | AudioFormat::Flac => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Pcm16 => "pcm_16bit",
            AudioFormat::Pcm24 => "pcm_24bit",
            AudioFormat::Opus => "opus",
            AudioFormat::Flac => "flac",
        }
    }
}

/// Raw bytes received from one device at one instant.
///
/// Immutable once created; owned exclusively by the pipeline stage currently
/// processing it.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Originating device identifier
    pub device_id: String,
    /// Raw audio bytes as delivered by the socket
    pub data: Vec<u8>,
    /// Receipt timestamp
    pub timestamp: DateTime<Utc>,
    /// Per-device monotonic sequence number
    pub sequence_number: u64,
    /// Negotiated sample format
    pub format: AudioFormat,
}

impl AudioChunk {
    /// Create a chunk stamped with the current time
    pub fn new(device_id: impl Into<String>, data: Vec<u8>, sequence_number: u64) -> Self {
        Self {
            device_id: device_id.into(),
            data,
            timestamp: Utc::now(),
            sequence_number,
            format: AudioFormat::Pcm16,
        }
    }

    /// Create a chunk with an explicit sample format
    pub fn with_format(
        device_id: impl Into<String>,
        data: Vec<u8>,
        sequence_number: u64,
        format: AudioFormat,
    ) -> Self {
        Self {
            format,
            ..Self::new(device_id, data, sequence_number)
        }
    }

    /// Chunk payload size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sample_width() {
        assert_eq!(AudioFormat::Pcm16.bytes_per_sample(), Some(2));
        assert_eq!(AudioFormat::Pcm24.bytes_per_sample(), Some(3));
        assert_eq!(AudioFormat::Opus.bytes_per_sample(), None);
    }

    #[test]
    fn test_format_from_bit_depth() {
        assert_eq!(AudioFormat::from_bits_per_sample(16), Some(AudioFormat::Pcm16));
        assert_eq!(AudioFormat::from_bits_per_sample(24), Some(AudioFormat::Pcm24));
        assert_eq!(AudioFormat::from_bits_per_sample(32), None);
    }

    #[test]
    fn test_chunk_creation() {
        let chunk = AudioChunk::new("dev-1", vec![0u8; 640], 7);
        assert_eq!(chunk.device_id, "dev-1");
        assert_eq!(chunk.len(), 640);
        assert_eq!(chunk.sequence_number, 7);
        assert_eq!(chunk.format, AudioFormat::Pcm16);
    }
}
