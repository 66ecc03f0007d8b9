//! Audiovault Core - Audio pipeline, compression, storage, and monitoring
//!
//! This library provides the core functionality for receiving streaming audio
//! from embedded devices: per-chunk DSP processing (filtering and feature
//! analysis), segment storage in RIFF/WAVE containers, a multi-codec
//! compression engine, and a threshold-based monitoring/alerting system.

pub mod chunk;
pub mod compression;
pub mod config;
pub mod device;
pub mod dsp;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod storage;

pub use chunk::{AudioChunk, AudioFormat};
pub use compression::{AudioCompressor, CompressionMetrics, CompressionType};
pub use config::Config;
pub use device::{DeviceInfo, DeviceStatus};
pub use dsp::analyzer::{AudioAnalyzer, AudioMetrics};
pub use dsp::processor::{AudioProcessor, ProcessingResult};
pub use events::EventBus;
pub use metrics::MetricsRegistry;
pub use monitor::Monitor;
pub use storage::StorageManager;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sample rate for device audio (16kHz speech-band capture)
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;
