//! Configuration loading and validation
//!
//! All tunables live in one TOML document with serde defaults, so a partial
//! file (or none at all) yields a working configuration. Validation happens
//! once at load time; invalid values are hard errors, not warnings.

use crate::compression::CompressionType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

/// TCP receiver tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Device sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
    /// Bits per sample
    pub bits_per_sample: u16,
    /// Maximum bytes requested per socket read
    pub tcp_chunk_size: usize,
    /// Maximum simultaneous device connections
    pub max_connections: usize,
    /// Socket read timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            channels: 1,
            bits_per_sample: 16,
            tcp_chunk_size: 19200,
            max_connections: 100,
            timeout_secs: 30,
        }
    }
}

/// Segment storage tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for date-partitioned segment files
    pub data_dir: PathBuf,
    /// Segment duration threshold in seconds before rotation
    pub segment_duration_secs: u64,
    /// Days of history kept by retention cleanup
    pub retention_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data/audio"),
            segment_duration_secs: 600,
            retention_days: 30,
        }
    }
}

/// Compression engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Default codec when callers do not specify one
    pub default_codec: CompressionType,
    /// Deflate-family compression level (0-9)
    pub level: u32,
    /// Minimum acceptable quality score for optimal-codec selection
    pub quality_threshold: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            default_codec: CompressionType::Zlib,
            level: 6,
            quality_threshold: 0.8,
        }
    }
}

/// Monitoring loop and alert thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling interval in seconds
    pub metrics_interval_secs: f64,
    /// Bounded length of metric histories
    pub history_size: usize,
    /// Minimum seconds between two raised alerts for the same metric
    pub alert_cooldown_secs: f64,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub disk_threshold: f64,
    /// Processing latency threshold in milliseconds
    pub latency_threshold: f64,
    /// Buffer utilization threshold in percent
    pub buffer_threshold: f64,
    /// Quality score floor (lower-is-worse metric)
    pub quality_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 1.0,
            history_size: 1000,
            alert_cooldown_secs: 60.0,
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            disk_threshold: 90.0,
            latency_threshold: 100.0,
            buffer_threshold: 80.0,
            quality_threshold: 0.7,
        }
    }
}

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub receiver: ReceiverConfig,
    pub storage: StorageConfig,
    pub compression: CompressionConfig,
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receiver.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "receiver.port",
                message: "port must be non-zero".to_string(),
            });
        }
        if self.receiver.sample_rate == 0 {
            return Err(ConfigError::InvalidValue {
                key: "receiver.sample_rate",
                message: "sample rate must be non-zero".to_string(),
            });
        }
        if self.receiver.tcp_chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "receiver.tcp_chunk_size",
                message: "chunk size must be non-zero".to_string(),
            });
        }
        if !(self.receiver.bits_per_sample == 16 || self.receiver.bits_per_sample == 24) {
            return Err(ConfigError::InvalidValue {
                key: "receiver.bits_per_sample",
                message: format!("unsupported bit depth {}", self.receiver.bits_per_sample),
            });
        }
        if self.compression.level > 9 {
            return Err(ConfigError::InvalidValue {
                key: "compression.level",
                message: format!("level {} out of range 0-9", self.compression.level),
            });
        }
        if !(0.0..=1.0).contains(&self.compression.quality_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "compression.quality_threshold",
                message: "quality threshold must be within [0, 1]".to_string(),
            });
        }
        if self.monitor.metrics_interval_secs <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "monitor.metrics_interval_secs",
                message: "interval must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.receiver.port, 9000);
        assert_eq!(config.storage.segment_duration_secs, 600);
        assert_eq!(config.compression.level, 6);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[receiver]\nport = 9100\n\n[storage]\nsegment_duration_secs = 300").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.receiver.port, 9100);
        assert_eq!(config.receiver.max_connections, 100);
        assert_eq!(config.storage.segment_duration_secs, 300);
    }

    #[test]
    fn test_invalid_port_rejected() {
        let mut config = Config::default();
        config.receiver.port = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key: "receiver.port", .. })
        ));
    }

    #[test]
    fn test_invalid_sample_rate_rejected() {
        let mut config = Config::default();
        config.receiver.sample_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(matches!(
            Config::load("/nonexistent/audiovault.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
