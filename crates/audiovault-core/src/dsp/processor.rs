//! Per-chunk processing pipeline
//!
//! One `AudioProcessor` per stream: decodes PCM bytes to normalized f32,
//! runs the filter chain, extracts features, and re-encodes. A failed
//! chunk produces an error result naming the stage that failed rather
//! than tearing the stream down.

use crate::chunk::{AudioChunk, AudioFormat};
use crate::dsp::analyzer::{AudioAnalyzer, AudioMetrics};
use crate::dsp::filters::FilterChain;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(&'static str),

    #[error("Truncated sample data: {len} bytes is not a whole number of {width}-byte frames")]
    Truncated { len: usize, width: usize },
}

/// Pipeline stage a chunk was in when a result was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Input,
    Filtering,
    Enhancement,
    Analysis,
    Output,
}

/// Outcome of processing one chunk
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub device_id: String,
    pub sequence_number: u64,
    pub success: bool,
    pub stage: ProcessingStage,
    /// Stages that ran to completion, in order
    pub stages_completed: Vec<ProcessingStage>,
    /// Re-encoded chunk; present only on success
    pub processed: Option<AudioChunk>,
    /// Extracted features; present only on success
    pub metrics: Option<AudioMetrics>,
    pub duration_ms: f64,
    pub error: Option<String>,
}

/// Cumulative pipeline counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub chunks_processed: u64,
    pub chunks_failed: u64,
    pub total_duration_ms: f64,
}

impl ProcessorStats {
    pub fn average_duration_ms(&self) -> f64 {
        if self.chunks_processed == 0 {
            0.0
        } else {
            self.total_duration_ms / self.chunks_processed as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.chunks_processed + self.chunks_failed;
        if total == 0 {
            0.0
        } else {
            self.chunks_failed as f64 / total as f64
        }
    }
}

/// Full per-stream DSP pipeline
pub struct AudioProcessor {
    sample_rate: u32,
    filters: FilterChain,
    analyzer: AudioAnalyzer,
    stats: ProcessorStats,
}

impl AudioProcessor {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            filters: FilterChain::with_defaults(),
            analyzer: AudioAnalyzer::new(sample_rate),
            stats: ProcessorStats::default(),
        }
    }

    pub fn with_filters(sample_rate: u32, filters: FilterChain) -> Self {
        Self {
            sample_rate,
            filters,
            analyzer: AudioAnalyzer::new(sample_rate),
            stats: ProcessorStats::default(),
        }
    }

    pub fn filters_mut(&mut self) -> &mut FilterChain {
        &mut self.filters
    }

    /// Run one chunk through decode, filtering, analysis, and re-encode
    pub fn process(&mut self, chunk: &AudioChunk) -> ProcessingResult {
        let started = Instant::now();

        let samples = match chunk_to_samples(chunk) {
            Ok(samples) => samples,
            Err(err) => return self.fail(chunk, ProcessingStage::Input, err, started),
        };

        let filtered = self.filters.apply(&samples, self.sample_rate);
        let metrics = self.analyzer.analyze(&filtered);

        let processed = match samples_to_chunk(chunk, &filtered) {
            Ok(processed) => processed,
            Err(err) => return self.fail(chunk, ProcessingStage::Output, err, started),
        };

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.chunks_processed += 1;
        self.stats.total_duration_ms += duration_ms;

        tracing::trace!(
            device_id = %chunk.device_id,
            sequence = chunk.sequence_number,
            duration_ms,
            rms = metrics.rms,
            "Chunk processed"
        );

        ProcessingResult {
            device_id: chunk.device_id.clone(),
            sequence_number: chunk.sequence_number,
            success: true,
            stage: ProcessingStage::Output,
            stages_completed: vec![
                ProcessingStage::Input,
                ProcessingStage::Filtering,
                ProcessingStage::Enhancement,
                ProcessingStage::Analysis,
                ProcessingStage::Output,
            ],
            processed: Some(processed),
            metrics: Some(metrics),
            duration_ms,
            error: None,
        }
    }

    fn fail(
        &mut self,
        chunk: &AudioChunk,
        stage: ProcessingStage,
        err: ProcessingError,
        started: Instant,
    ) -> ProcessingResult {
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.chunks_failed += 1;
        tracing::warn!(
            device_id = %chunk.device_id,
            sequence = chunk.sequence_number,
            ?stage,
            error = %err,
            "Chunk processing failed"
        );
        let stages_completed = match stage {
            ProcessingStage::Input => Vec::new(),
            _ => vec![
                ProcessingStage::Input,
                ProcessingStage::Filtering,
                ProcessingStage::Enhancement,
                ProcessingStage::Analysis,
            ],
        };
        ProcessingResult {
            device_id: chunk.device_id.clone(),
            sequence_number: chunk.sequence_number,
            success: false,
            stage,
            stages_completed,
            processed: None,
            metrics: None,
            duration_ms,
            error: Some(err.to_string()),
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats.clone()
    }

    pub fn reset_stats(&mut self) {
        self.stats = ProcessorStats::default();
    }

    /// Healthy while average latency stays under 100ms and the error
    /// rate under 5%
    pub fn health_check(&self) -> bool {
        self.stats.average_duration_ms() <= 100.0 && self.stats.error_rate() <= 0.05
    }
}

/// Decode PCM bytes into normalized f32 samples in [-1, 1]
pub fn chunk_to_samples(chunk: &AudioChunk) -> Result<Vec<f32>, ProcessingError> {
    match chunk.format {
        AudioFormat::Pcm16 => {
            if chunk.data.len() % 2 != 0 {
                return Err(ProcessingError::Truncated {
                    len: chunk.data.len(),
                    width: 2,
                });
            }
            Ok(chunk
                .data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
                .collect())
        }
        AudioFormat::Pcm24 => {
            if chunk.data.len() % 3 != 0 {
                return Err(ProcessingError::Truncated {
                    len: chunk.data.len(),
                    width: 3,
                });
            }
            Ok(chunk
                .data
                .chunks_exact(3)
                .map(|b| {
                    let mut value = (b[0] as i32) | ((b[1] as i32) << 8) | ((b[2] as i32) << 16);
                    if value >= 1 << 23 {
                        value -= 1 << 24;
                    }
                    value as f32 / 8_388_608.0
                })
                .collect())
        }
        AudioFormat::Opus => Err(ProcessingError::UnsupportedFormat("opus")),
        AudioFormat::Flac => Err(ProcessingError::UnsupportedFormat("flac")),
    }
}

/// Re-encode normalized samples into a chunk with the source's metadata
pub fn samples_to_chunk(
    source: &AudioChunk,
    samples: &[f32],
) -> Result<AudioChunk, ProcessingError> {
    let data = match source.format {
        AudioFormat::Pcm16 => {
            let mut data = Vec::with_capacity(samples.len() * 2);
            for &sample in samples {
                let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                data.extend_from_slice(&value.to_le_bytes());
            }
            data
        }
        AudioFormat::Pcm24 => {
            let mut data = Vec::with_capacity(samples.len() * 3);
            for &sample in samples {
                let value = (sample.clamp(-1.0, 1.0) * 8_388_607.0) as i32;
                let bytes = value.to_le_bytes();
                data.extend_from_slice(&bytes[..3]);
            }
            data
        }
        AudioFormat::Opus => return Err(ProcessingError::UnsupportedFormat("opus")),
        AudioFormat::Flac => return Err(ProcessingError::UnsupportedFormat("flac")),
    };

    let mut chunk = AudioChunk::with_format(
        source.device_id.clone(),
        data,
        source.sequence_number,
        source.format,
    );
    chunk.timestamp = source.timestamp;
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pcm16_chunk(samples: &[f32]) -> AudioChunk {
        let mut data = Vec::new();
        for &s in samples {
            data.extend_from_slice(&((s * 32767.0) as i16).to_le_bytes());
        }
        AudioChunk::with_format("dev-1", data, 0, AudioFormat::Pcm16)
    }

    fn sine(freq: f64, rate: f64, n: usize, amplitude: f32) -> Vec<f32> {
        (0..n)
            .map(|i| {
                amplitude * (2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin() as f32
            })
            .collect()
    }

    #[test]
    fn test_pcm16_decode_normalizes() {
        let chunk = AudioChunk::with_format(
            "dev-1",
            vec![0x00, 0x80, 0xFF, 0x7F, 0x00, 0x00],
            0,
            AudioFormat::Pcm16,
        );
        let samples = chunk_to_samples(&chunk).unwrap();
        assert_relative_eq!(samples[0], -1.0);
        assert_relative_eq!(samples[1], 32767.0 / 32768.0);
        assert_relative_eq!(samples[2], 0.0);
    }

    #[test]
    fn test_pcm24_decode_sign_extension() {
        // 0x800000 is the most negative 24-bit value, 0x7FFFFF the most positive
        let chunk = AudioChunk::with_format(
            "dev-1",
            vec![0x00, 0x00, 0x80, 0xFF, 0xFF, 0x7F],
            0,
            AudioFormat::Pcm24,
        );
        let samples = chunk_to_samples(&chunk).unwrap();
        assert_relative_eq!(samples[0], -1.0);
        assert_relative_eq!(samples[1], 8_388_607.0 / 8_388_608.0);
    }

    #[test]
    fn test_truncated_data_rejected() {
        let chunk = AudioChunk::with_format("dev-1", vec![0x01, 0x02, 0x03], 0, AudioFormat::Pcm16);
        assert!(matches!(
            chunk_to_samples(&chunk),
            Err(ProcessingError::Truncated { len: 3, width: 2 })
        ));
    }

    #[test]
    fn test_pcm16_round_trip() {
        let original = sine(440.0, 16000.0, 256, 0.5);
        let chunk = pcm16_chunk(&original);
        let decoded = chunk_to_samples(&chunk).unwrap();
        let reencoded = samples_to_chunk(&chunk, &decoded).unwrap();
        let redecoded = chunk_to_samples(&reencoded).unwrap();

        for (a, b) in decoded.iter().zip(redecoded.iter()) {
            assert!((a - b).abs() < 1.0 / 32000.0);
        }
    }

    #[test]
    fn test_encode_clips_out_of_range() {
        let source = pcm16_chunk(&[0.0]);
        let chunk = samples_to_chunk(&source, &[1.5, -1.5]).unwrap();
        let samples = chunk_to_samples(&chunk).unwrap();
        assert_relative_eq!(samples[0], 32767.0 / 32768.0);
        assert!((samples[1] + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_process_success_path() {
        let mut processor = AudioProcessor::new(16000);
        let chunk = pcm16_chunk(&sine(440.0, 16000.0, 2048, 0.5));

        let result = processor.process(&chunk);
        assert!(result.success);
        assert_eq!(result.stage, ProcessingStage::Output);
        assert_eq!(result.stages_completed.len(), 5);
        let processed = result.processed.unwrap();
        assert_eq!(processed.data.len(), chunk.data.len());
        assert!(result.metrics.unwrap().rms > 0.1);

        let stats = processor.stats();
        assert_eq!(stats.chunks_processed, 1);
        assert_eq!(stats.chunks_failed, 0);
    }

    #[test]
    fn test_process_unsupported_format() {
        let mut processor = AudioProcessor::new(16000);
        let chunk = AudioChunk::with_format("dev-1", vec![0u8; 64], 0, AudioFormat::Opus);

        let result = processor.process(&chunk);
        assert!(!result.success);
        assert_eq!(result.stage, ProcessingStage::Input);
        assert!(result.error.is_some());
        assert_eq!(processor.stats().chunks_failed, 1);
    }

    #[test]
    fn test_health_check_flags_error_rate() {
        let mut processor = AudioProcessor::new(16000);
        assert!(processor.health_check());

        let bad = AudioChunk::with_format("dev-1", vec![0u8; 64], 0, AudioFormat::Opus);
        for _ in 0..10 {
            processor.process(&bad);
        }
        assert!(!processor.health_check());

        processor.reset_stats();
        assert!(processor.health_check());
    }
}
