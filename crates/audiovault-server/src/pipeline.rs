//! Chunk routing from connections into processing and storage
//!
//! One pipeline serves every connection. It keeps a per-device DSP
//! processor (filters carry state across chunks), forwards processed
//! audio to storage, and feeds the metrics registry the gauges the
//! monitor alerts on.

use audiovault_core::chunk::AudioChunk;
use audiovault_core::compression::AudioCompressor;
use audiovault_core::config::Config;
use audiovault_core::dsp::processor::{chunk_to_samples, AudioProcessor};
use audiovault_core::events::EventBus;
use audiovault_core::metrics::MetricsRegistry;
use audiovault_core::storage::StorageManager;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Every Nth chunk is round-tripped through the compressor to keep the
/// quality and ratio gauges current without paying for every chunk
const QUALITY_SAMPLE_INTERVAL: u64 = 50;

pub struct AudioPipeline {
    sample_rate: u32,
    processors: Mutex<HashMap<String, AudioProcessor>>,
    compressor: Mutex<AudioCompressor>,
    storage: Arc<StorageManager>,
    registry: MetricsRegistry,
    events: Arc<EventBus>,
}

impl AudioPipeline {
    pub fn new(
        config: &Config,
        storage: Arc<StorageManager>,
        registry: MetricsRegistry,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            sample_rate: config.receiver.sample_rate,
            processors: Mutex::new(HashMap::new()),
            compressor: Mutex::new(AudioCompressor::from_config(&config.compression)),
            storage,
            registry,
            events,
        }
    }

    fn lock_processors(&self) -> MutexGuard<'_, HashMap<String, AudioProcessor>> {
        self.processors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Process one received chunk and persist the result
    pub fn handle_chunk(&self, chunk: &AudioChunk) -> anyhow::Result<()> {
        let _timer = self.registry.start_timer("chunk_processing");
        self.registry
            .inc_counter("bytes_received", chunk.len() as f64);
        self.events.publish(
            "audio.chunk_received",
            json!({
                "device_id": chunk.device_id,
                "sequence_number": chunk.sequence_number,
                "bytes": chunk.len(),
            }),
            "pipeline",
        );

        let result = {
            let mut processors = self.lock_processors();
            let processor = processors
                .entry(chunk.device_id.clone())
                .or_insert_with(|| AudioProcessor::new(self.sample_rate));
            processor.process(chunk)
        };

        self.registry
            .set_gauge("processing_latency_ms", result.duration_ms);

        let Some(processed) = result.processed else {
            self.registry.inc_counter("dropped_packets", 1.0);
            self.events.publish(
                "audio.chunk_dropped",
                json!({
                    "device_id": chunk.device_id,
                    "sequence_number": chunk.sequence_number,
                    "error": result.error,
                }),
                "pipeline",
            );
            anyhow::bail!(
                "chunk {} from {} dropped: {}",
                chunk.sequence_number,
                chunk.device_id,
                result.error.unwrap_or_default()
            );
        };

        self.registry
            .inc_counter("bytes_processed", processed.len() as f64);
        self.storage.write_chunk(&processed, result.metrics.as_ref())?;

        self.events.publish(
            "audio.chunk_processed",
            json!({
                "device_id": chunk.device_id,
                "sequence_number": chunk.sequence_number,
                "duration_ms": result.duration_ms,
            }),
            "pipeline",
        );

        if chunk.sequence_number % QUALITY_SAMPLE_INTERVAL == 0 {
            self.sample_compression(&processed);
        }

        Ok(())
    }

    /// Round-trip one chunk through the compressor for the quality gauges
    fn sample_compression(&self, chunk: &AudioChunk) {
        let samples = match chunk_to_samples(chunk) {
            Ok(samples) => samples,
            Err(err) => {
                tracing::warn!(device_id = %chunk.device_id, error = %err, "Quality sample skipped");
                return;
            }
        };

        let mut compressor = self
            .compressor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match compressor.compress(&samples, None) {
            Ok((_, metrics)) => {
                self.registry
                    .set_gauge("quality_score", metrics.quality_score);
                self.registry
                    .set_gauge("compression_ratio", metrics.compression_ratio);
            }
            Err(err) => {
                tracing::warn!(device_id = %chunk.device_id, error = %err, "Quality sample failed");
            }
        }
    }

    /// Device joined: publish the event and bump the active gauge
    pub fn device_connected(&self, device_id: &str, peer: &str, active: usize) {
        self.registry.set_gauge("devices_active", active as f64);
        self.events.publish(
            "device.connected",
            json!({"device_id": device_id, "peer": peer}),
            "server",
        );
    }

    /// First audio from a device after connecting
    pub fn device_streaming(&self, device_id: &str) {
        self.events.publish(
            "device.streaming_started",
            json!({"device_id": device_id}),
            "server",
        );
    }

    /// Device left: finalize its segment and drop its processor state
    pub fn device_disconnected(&self, device_id: &str, active: usize) {
        self.registry.set_gauge("devices_active", active as f64);
        self.lock_processors().remove(device_id);

        match self.storage.complete_segment(device_id) {
            Ok(_) => {}
            // No segment means the device never sent audio
            Err(audiovault_core::storage::StorageError::NoActiveSegment(_)) => {}
            Err(err) => {
                tracing::error!(device_id, error = %err, "Segment finalize failed");
            }
        }

        self.events.publish(
            "device.disconnected",
            json!({"device_id": device_id}),
            "server",
        );
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn health_check(&self) -> bool {
        let processors_healthy = self
            .lock_processors()
            .values()
            .all(|p| p.health_check());
        processors_healthy && self.storage.health_check()
    }
}
