//! Multi-codec audio compression engine
//!
//! Encodes normalized PCM (`&[f32]`) with one of several interchangeable
//! codecs and scores each call by round-tripping the result:
//!
//! - `none` - identity passthrough
//! - `zlib` / `gzip` - lossless deflate-family byte compression
//! - `adpcm` - 4-bit adaptive differential coding (lossy, deterministic)
//! - `dct` - orthonormal DCT-II with percentile sparsification (lossy)
//! - `lpc` - Levinson-Durbin linear prediction with residual (near-lossless)
//!
//! Per-call metrics land in a bounded history used for aggregate stats.

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Instant;
use thiserror::Error;

/// Metrics history depth used for aggregate statistics
const METRICS_HISTORY_SIZE: usize = 100;

/// ADPCM adaptive step ceiling (full 16-bit range)
const ADPCM_STEP_MAX: i32 = 32768;

/// Errors from compression or decompression calls
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Deflate stream error: {0}")]
    Deflate(#[from] std::io::Error),

    #[error("Codec payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Truncated codec data: expected {expected} samples, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Supported compression codecs, each independently selectable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Zlib,
    Gzip,
    Adpcm,
    Dct,
    Lpc,
}

impl CompressionType {
    /// Parse a codec name as used in config files and command payloads
    pub fn from_name(name: &str) -> Result<Self, CompressionError> {
        match name {
            "none" => Ok(CompressionType::None),
            "zlib" => Ok(CompressionType::Zlib),
            "gzip" => Ok(CompressionType::Gzip),
            "adpcm" => Ok(CompressionType::Adpcm),
            "dct" => Ok(CompressionType::Dct),
            "lpc" => Ok(CompressionType::Lpc),
            other => Err(CompressionError::UnsupportedCodec(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Zlib => "zlib",
            CompressionType::Gzip => "gzip",
            CompressionType::Adpcm => "adpcm",
            CompressionType::Dct => "dct",
            CompressionType::Lpc => "lpc",
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Performance metrics for one compression call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionMetrics {
    pub original_size: usize,
    pub compressed_size: usize,
    pub compression_ratio: f64,
    pub compression_time_ms: f64,
    pub decompression_time_ms: f64,
    /// Round-trip quality score in [0, 1]; 1.0 for a bit-exact reconstruction
    pub quality_score: f64,
}

/// Aggregate statistics over the recent metrics history
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressionStats {
    pub total_compressions: u64,
    pub average_compression_ratio: f64,
    pub average_quality_score: f64,
    pub average_compression_time_ms: f64,
    pub average_decompression_time_ms: f64,
    /// Original minus compressed bytes summed over the recent window
    pub bandwidth_saved_bytes: i64,
}

/// Sparse DCT coefficient payload
#[derive(Serialize, Deserialize)]
struct DctPayload {
    len: u32,
    indices: Vec<u32>,
    values: Vec<f64>,
}

/// LPC coefficients plus prediction residual
#[derive(Serialize, Deserialize)]
struct LpcPayload {
    coeffs: Vec<f64>,
    residual: Vec<f32>,
    len: u32,
}

/// Audio compression engine with per-call quality scoring
pub struct AudioCompressor {
    default_codec: CompressionType,
    level: u32,
    quality_threshold: f64,
    total_compressions: u64,
    history: VecDeque<CompressionMetrics>,
}

impl AudioCompressor {
    pub fn new(default_codec: CompressionType, level: u32, quality_threshold: f64) -> Self {
        tracing::info!(codec = %default_codec, level, "AudioCompressor initialized");
        Self {
            default_codec,
            level,
            quality_threshold,
            total_compressions: 0,
            history: VecDeque::with_capacity(METRICS_HISTORY_SIZE),
        }
    }

    /// Build from the compression section of the config
    pub fn from_config(config: &crate::config::CompressionConfig) -> Self {
        Self::new(config.default_codec, config.level, config.quality_threshold)
    }

    /// Compress a buffer, score its round-trip quality, and record metrics
    ///
    /// # Arguments
    /// * `samples` - Normalized PCM in [-1, 1]
    /// * `codec` - Codec override; `None` uses the configured default
    pub fn compress(
        &mut self,
        samples: &[f32],
        codec: Option<CompressionType>,
    ) -> Result<(Vec<u8>, CompressionMetrics), CompressionError> {
        let codec = codec.unwrap_or(self.default_codec);
        let original_size = samples.len() * std::mem::size_of::<f32>();
        let start = Instant::now();

        let compressed = self.encode(samples, codec)?;

        let compression_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        let compressed_size = compressed.len();
        let compression_ratio = if compressed_size > 0 {
            original_size as f64 / compressed_size as f64
        } else {
            1.0
        };

        let quality_score = self.quality_score(samples, &compressed, codec);

        let metrics = CompressionMetrics {
            original_size,
            compressed_size,
            compression_ratio,
            compression_time_ms,
            decompression_time_ms: 0.0,
            quality_score,
        };

        if self.history.len() >= METRICS_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(metrics.clone());
        self.total_compressions += 1;

        tracing::debug!(
            codec = %codec,
            ratio = format_args!("{:.2}", compression_ratio),
            quality = format_args!("{:.2}", quality_score),
            "Audio compressed"
        );

        Ok((compressed, metrics))
    }

    /// Decompress a buffer back to normalized PCM
    ///
    /// # Arguments
    /// * `sample_count` - Original sample count (the codec shape)
    pub fn decompress(
        &mut self,
        data: &[u8],
        codec: CompressionType,
        sample_count: usize,
    ) -> Result<Vec<f32>, CompressionError> {
        let start = Instant::now();
        let samples = Self::decode(data, codec, sample_count)?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        if let Some(last) = self.history.back_mut() {
            last.decompression_time_ms = elapsed_ms;
        }

        tracing::debug!(
            codec = %codec,
            elapsed_ms = format_args!("{:.3}", elapsed_ms),
            "Audio decompressed"
        );

        Ok(samples)
    }

    /// Trial-compress with the candidate set and pick the best ratio that
    /// meets the quality floor; falls back to zlib.
    pub fn optimal_codec(
        &mut self,
        samples: &[f32],
        target_quality: Option<f64>,
    ) -> CompressionType {
        let target = target_quality.unwrap_or(self.quality_threshold);
        let candidates = [
            CompressionType::Zlib,
            CompressionType::Gzip,
            CompressionType::Adpcm,
        ];

        let mut best = CompressionType::Zlib;
        let mut best_ratio = 0.0;

        for codec in candidates {
            match self.compress(samples, Some(codec)) {
                Ok((_, metrics)) => {
                    if metrics.quality_score >= target && metrics.compression_ratio > best_ratio {
                        best = codec;
                        best_ratio = metrics.compression_ratio;
                    }
                }
                Err(e) => {
                    tracing::warn!(codec = %codec, error = %e, "Compression trial failed");
                }
            }
        }

        best
    }

    /// Aggregate statistics over the recent metrics window
    pub fn stats(&self) -> CompressionStats {
        if self.history.is_empty() {
            return CompressionStats {
                total_compressions: self.total_compressions,
                ..Default::default()
            };
        }

        let n = self.history.len() as f64;
        CompressionStats {
            total_compressions: self.total_compressions,
            average_compression_ratio: self.history.iter().map(|m| m.compression_ratio).sum::<f64>() / n,
            average_quality_score: self.history.iter().map(|m| m.quality_score).sum::<f64>() / n,
            average_compression_time_ms: self.history.iter().map(|m| m.compression_time_ms).sum::<f64>() / n,
            average_decompression_time_ms: self
                .history
                .iter()
                .map(|m| m.decompression_time_ms)
                .sum::<f64>()
                / n,
            bandwidth_saved_bytes: self
                .history
                .iter()
                .map(|m| m.original_size as i64 - m.compressed_size as i64)
                .sum(),
        }
    }

    fn encode(&self, samples: &[f32], codec: CompressionType) -> Result<Vec<u8>, CompressionError> {
        match codec {
            CompressionType::None => Ok(samples_to_bytes(samples)),
            CompressionType::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
                encoder.write_all(&samples_to_bytes(samples))?;
                Ok(encoder.finish()?)
            }
            CompressionType::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
                encoder.write_all(&samples_to_bytes(samples))?;
                Ok(encoder.finish()?)
            }
            CompressionType::Adpcm => Ok(adpcm_encode(samples)),
            CompressionType::Dct => dct_encode(samples),
            CompressionType::Lpc => lpc_encode(samples),
        }
    }

    fn decode(
        data: &[u8],
        codec: CompressionType,
        sample_count: usize,
    ) -> Result<Vec<f32>, CompressionError> {
        match codec {
            CompressionType::None => bytes_to_samples(data, sample_count),
            CompressionType::Zlib => {
                let mut bytes = Vec::new();
                ZlibDecoder::new(data).read_to_end(&mut bytes)?;
                bytes_to_samples(&bytes, sample_count)
            }
            CompressionType::Gzip => {
                let mut bytes = Vec::new();
                GzDecoder::new(data).read_to_end(&mut bytes)?;
                bytes_to_samples(&bytes, sample_count)
            }
            CompressionType::Adpcm => adpcm_decode(data, sample_count),
            CompressionType::Dct => dct_decode(data, sample_count),
            CompressionType::Lpc => lpc_decode(data, sample_count),
        }
    }

    /// Round-trip SNR mapped from [20dB, 100dB] onto [0, 1].
    ///
    /// A codec whose round-trip fails yields the fixed fallback 0.5 rather
    /// than propagating the error.
    fn quality_score(&self, original: &[f32], compressed: &[u8], codec: CompressionType) -> f64 {
        if original.is_empty() {
            return 1.0;
        }

        let decoded = match Self::decode(compressed, codec, original.len()) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(codec = %codec, error = %e, "Quality calculation failed");
                return 0.5;
            }
        };

        let n = original.len() as f64;
        let signal_power: f64 = original.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>() / n;
        let noise_power: f64 = original
            .iter()
            .zip(&decoded)
            .map(|(&x, &y)| {
                let d = x as f64 - y as f64;
                d * d
            })
            .sum::<f64>()
            / n;

        let snr_db = if noise_power > 0.0 {
            10.0 * (signal_power / noise_power).log10()
        } else {
            // Exact reconstruction caps at the 100dB equivalent
            100.0
        };

        ((snr_db - 20.0) / 80.0).clamp(0.0, 1.0)
    }
}

fn samples_to_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

fn bytes_to_samples(bytes: &[u8], sample_count: usize) -> Result<Vec<f32>, CompressionError> {
    if bytes.len() < sample_count * 4 {
        return Err(CompressionError::Truncated {
            expected: sample_count,
            actual: bytes.len() / 4,
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .take(sample_count)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// 4-bit ADPCM with an adaptive step size.
///
/// Predictor and step start at 0 and 1; the decoder mirrors the encoder's
/// state transitions exactly, so the scheme is deterministic for a given
/// input. Two codes pack per byte, high nibble first.
fn adpcm_encode(samples: &[f32]) -> Vec<u8> {
    let mut predictor: i32 = 0;
    let mut step: i32 = 1;
    let mut codes = Vec::with_capacity(samples.len());

    for &sample in samples {
        let value = (sample as f64 * 32767.0) as i32;
        let value = value.clamp(-32768, 32767);

        let diff = value - predictor;
        let code = (diff / step).clamp(-8, 7);

        predictor = (predictor + code * step).clamp(-32768, 32767);

        if diff.abs() > step * 2 {
            step = (step * 2).min(ADPCM_STEP_MAX);
        } else if diff.abs() < step / 2 {
            step = (step / 2).max(1);
        }

        codes.push((code & 0x0F) as u8);
    }

    let mut packed = Vec::with_capacity(codes.len().div_ceil(2));
    for pair in codes.chunks(2) {
        if pair.len() == 2 {
            packed.push((pair[0] << 4) | pair[1]);
        } else {
            packed.push(pair[0] << 4);
        }
    }
    packed
}

fn adpcm_decode(data: &[u8], sample_count: usize) -> Result<Vec<f32>, CompressionError> {
    let available = data.len() * 2;
    if available < sample_count {
        return Err(CompressionError::Truncated {
            expected: sample_count,
            actual: available,
        });
    }

    let mut predictor: i32 = 0;
    let mut step: i32 = 1;
    let mut decoded = Vec::with_capacity(sample_count);

    'outer: for byte in data {
        for nibble in [(byte >> 4) & 0x0F, byte & 0x0F] {
            if decoded.len() >= sample_count {
                break 'outer;
            }

            let mut code = nibble as i32;
            if code >= 8 {
                code -= 16;
            }

            let sample = (predictor + code * step).clamp(-32768, 32767);
            decoded.push(sample as f32 / 32767.0);

            if code.abs() > 2 {
                step = (step * 2).min(ADPCM_STEP_MAX);
            } else if code == 0 {
                step = (step / 2).max(1);
            }

            predictor = sample;
        }
    }

    Ok(decoded)
}

/// Orthonormal DCT-II sparsified at the 90th-percentile magnitude
fn dct_encode(samples: &[f32]) -> Result<Vec<u8>, CompressionError> {
    let input: Vec<f64> = samples.iter().map(|&x| x as f64).collect();
    let mut coeffs = dct2_ortho(&input);

    if !coeffs.is_empty() {
        let mut magnitudes: Vec<f64> = coeffs.iter().map(|c| c.abs()).collect();
        magnitudes.sort_by(|a, b| a.total_cmp(b));
        let threshold = percentile(&magnitudes, 90.0);
        for c in coeffs.iter_mut() {
            if c.abs() < threshold {
                *c = 0.0;
            }
        }
    }

    let mut indices = Vec::new();
    let mut values = Vec::new();
    for (i, &c) in coeffs.iter().enumerate() {
        if c != 0.0 {
            indices.push(i as u32);
            values.push(c);
        }
    }

    let payload = DctPayload {
        len: samples.len() as u32,
        indices,
        values,
    };
    Ok(serde_json::to_vec(&payload)?)
}

fn dct_decode(data: &[u8], sample_count: usize) -> Result<Vec<f32>, CompressionError> {
    let payload: DctPayload = serde_json::from_slice(data)?;
    if payload.len as usize != sample_count {
        return Err(CompressionError::Truncated {
            expected: sample_count,
            actual: payload.len as usize,
        });
    }

    let mut coeffs = vec![0.0f64; sample_count];
    for (&index, &value) in payload.indices.iter().zip(&payload.values) {
        if (index as usize) < sample_count {
            coeffs[index as usize] = value;
        }
    }

    let output = dct3_ortho(&coeffs);
    Ok(output.into_iter().map(|x| x as f32).collect())
}

/// Orthonormal type-II DCT
fn dct2_ortho(input: &[f64]) -> Vec<f64> {
    let n = input.len();
    if n == 0 {
        return Vec::new();
    }
    let scale0 = (1.0 / n as f64).sqrt();
    let scale = (2.0 / n as f64).sqrt();

    (0..n)
        .map(|k| {
            let sum: f64 = input
                .iter()
                .enumerate()
                .map(|(i, &x)| x * (std::f64::consts::PI * (2 * i + 1) as f64 * k as f64 / (2 * n) as f64).cos())
                .sum();
            if k == 0 {
                sum * scale0
            } else {
                sum * scale
            }
        })
        .collect()
}

/// Orthonormal type-III DCT (inverse of [`dct2_ortho`])
fn dct3_ortho(coeffs: &[f64]) -> Vec<f64> {
    let n = coeffs.len();
    if n == 0 {
        return Vec::new();
    }
    let scale0 = (1.0 / n as f64).sqrt();
    let scale = (2.0 / n as f64).sqrt();

    (0..n)
        .map(|i| {
            coeffs
                .iter()
                .enumerate()
                .map(|(k, &c)| {
                    let basis =
                        (std::f64::consts::PI * (2 * i + 1) as f64 * k as f64 / (2 * n) as f64).cos();
                    if k == 0 {
                        c * scale0 * basis
                    } else {
                        c * scale * basis
                    }
                })
                .sum()
        })
        .collect()
}

/// Linear interpolation percentile over an ascending-sorted slice
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

/// LPC analysis: autocorrelation, Levinson-Durbin, FIR residual
fn lpc_encode(samples: &[f32]) -> Result<Vec<u8>, CompressionError> {
    let order = (samples.len() / 4).min(10);

    let payload = if order < 2 {
        // Too short to predict; serialize a passthrough payload
        LpcPayload {
            coeffs: vec![1.0],
            residual: samples.to_vec(),
            len: samples.len() as u32,
        }
    } else {
        let input: Vec<f64> = samples.iter().map(|&x| x as f64).collect();
        let autocorr = autocorrelate(&input, order);

        let coeffs = if autocorr[0] > 0.0 {
            levinson_durbin(&autocorr)
        } else {
            vec![1.0]
        };

        let residual: Vec<f32> = (0..input.len())
            .map(|n| {
                let mut acc = 0.0f64;
                for (k, &a) in coeffs.iter().enumerate() {
                    if n >= k {
                        acc += a * input[n - k];
                    }
                }
                acc as f32
            })
            .collect();

        LpcPayload {
            coeffs,
            residual,
            len: samples.len() as u32,
        }
    };

    Ok(serde_json::to_vec(&payload)?)
}

/// Inverse-filter the residual through the all-pole synthesis filter
fn lpc_decode(data: &[u8], sample_count: usize) -> Result<Vec<f32>, CompressionError> {
    let payload: LpcPayload = serde_json::from_slice(data)?;
    if payload.len as usize != sample_count || payload.residual.len() != sample_count {
        return Err(CompressionError::Truncated {
            expected: sample_count,
            actual: payload.residual.len(),
        });
    }

    let mut output = vec![0.0f64; sample_count];
    for n in 0..sample_count {
        let mut acc = payload.residual[n] as f64;
        for (k, &a) in payload.coeffs.iter().enumerate().skip(1) {
            if n >= k {
                acc -= a * output[n - k];
            }
        }
        output[n] = acc;
    }

    Ok(output.into_iter().map(|x| x as f32).collect())
}

fn autocorrelate(input: &[f64], order: usize) -> Vec<f64> {
    (0..=order)
        .map(|lag| {
            input
                .iter()
                .zip(input.iter().skip(lag))
                .map(|(&a, &b)| a * b)
                .sum()
        })
        .collect()
}

/// Levinson-Durbin recursion; `coeffs[0]` is fixed at 1.0
fn levinson_durbin(autocorr: &[f64]) -> Vec<f64> {
    let n = autocorr.len();
    let mut coeffs = vec![0.0f64; n];
    let mut error = autocorr[0];

    for i in 1..n {
        if error.abs() < f64::EPSILON {
            break;
        }

        let mut acc = 0.0;
        for j in 0..i {
            acc += coeffs[j] * autocorr[i - j];
        }
        let reflection = -acc / error;

        coeffs[i] = reflection;
        for j in (1..i).rev() {
            coeffs[j] += reflection * coeffs[i - j];
        }

        error *= 1.0 - reflection * reflection;
    }

    coeffs[0] = 1.0;
    coeffs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, rate: f64, n: usize, amplitude: f32) -> Vec<f32> {
        (0..n)
            .map(|i| {
                amplitude * (2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin() as f32
            })
            .collect()
    }

    fn correlation(a: &[f32], b: &[f32]) -> f64 {
        let n = a.len().min(b.len()) as f64;
        let mean_a = a.iter().map(|&x| x as f64).sum::<f64>() / n;
        let mean_b = b.iter().map(|&x| x as f64).sum::<f64>() / n;
        let mut cov = 0.0;
        let mut var_a = 0.0;
        let mut var_b = 0.0;
        for (&x, &y) in a.iter().zip(b.iter()) {
            let dx = x as f64 - mean_a;
            let dy = y as f64 - mean_b;
            cov += dx * dy;
            var_a += dx * dx;
            var_b += dy * dy;
        }
        cov / (var_a.sqrt() * var_b.sqrt())
    }

    fn compressor() -> AudioCompressor {
        AudioCompressor::new(CompressionType::Zlib, 6, 0.8)
    }

    #[test]
    fn test_lossless_roundtrip_bit_exact() {
        let signal = sine(440.0, 16000.0, 1024, 0.5);
        let mut comp = compressor();

        for codec in [
            CompressionType::None,
            CompressionType::Zlib,
            CompressionType::Gzip,
        ] {
            let (bytes, metrics) = comp.compress(&signal, Some(codec)).unwrap();
            let decoded = comp.decompress(&bytes, codec, signal.len()).unwrap();
            assert_eq!(signal, decoded, "codec {codec} not bit-exact");
            assert!(metrics.quality_score > 0.99, "codec {codec} quality too low");
        }
    }

    #[test]
    fn test_adpcm_sine_correlation() {
        let signal = sine(440.0, 16000.0, 2048, 0.3);
        let mut comp = compressor();

        let (bytes, _) = comp.compress(&signal, Some(CompressionType::Adpcm)).unwrap();
        let decoded = comp
            .decompress(&bytes, CompressionType::Adpcm, signal.len())
            .unwrap();

        assert_eq!(decoded.len(), signal.len());
        assert!(
            correlation(&signal, &decoded) > 0.9,
            "ADPCM reconstruction correlation too low"
        );
    }

    #[test]
    fn test_adpcm_halves_size() {
        let signal = sine(440.0, 16000.0, 1000, 0.3);
        let mut comp = compressor();
        let (bytes, metrics) = comp.compress(&signal, Some(CompressionType::Adpcm)).unwrap();
        assert_eq!(bytes.len(), 500);
        assert!(metrics.compression_ratio > 7.0);
    }

    #[test]
    fn test_dct_sine_correlation() {
        let signal = sine(440.0, 16000.0, 512, 0.3);
        let mut comp = compressor();

        let (bytes, _) = comp.compress(&signal, Some(CompressionType::Dct)).unwrap();
        let decoded = comp
            .decompress(&bytes, CompressionType::Dct, signal.len())
            .unwrap();

        assert!(
            correlation(&signal, &decoded) > 0.9,
            "DCT reconstruction correlation too low"
        );
    }

    #[test]
    fn test_lpc_sine_correlation() {
        let signal = sine(440.0, 16000.0, 512, 0.3);
        let mut comp = compressor();

        let (bytes, _) = comp.compress(&signal, Some(CompressionType::Lpc)).unwrap();
        let decoded = comp
            .decompress(&bytes, CompressionType::Lpc, signal.len())
            .unwrap();

        assert!(
            correlation(&signal, &decoded) > 0.9,
            "LPC reconstruction correlation too low"
        );
    }

    #[test]
    fn test_lpc_tiny_buffer_passthrough() {
        let signal = vec![0.1f32, -0.2, 0.3];
        let mut comp = compressor();
        let (bytes, _) = comp.compress(&signal, Some(CompressionType::Lpc)).unwrap();
        let decoded = comp
            .decompress(&bytes, CompressionType::Lpc, signal.len())
            .unwrap();
        assert_eq!(signal, decoded);
    }

    #[test]
    fn test_empty_buffer_does_not_fail() {
        let mut comp = compressor();
        for codec in [
            CompressionType::None,
            CompressionType::Zlib,
            CompressionType::Gzip,
            CompressionType::Adpcm,
            CompressionType::Dct,
            CompressionType::Lpc,
        ] {
            let (_, metrics) = comp.compress(&[], Some(codec)).unwrap();
            assert_eq!(metrics.original_size, 0, "codec {codec}");
            assert_eq!(metrics.quality_score, 1.0, "codec {codec}");
        }
    }

    #[test]
    fn test_all_zero_buffer_ratio() {
        let signal = vec![0.0f32; 16000];
        let mut comp = compressor();

        for codec in [CompressionType::Zlib, CompressionType::Gzip] {
            let (_, metrics) = comp.compress(&signal, Some(codec)).unwrap();
            assert!(
                metrics.compression_ratio > 10.0,
                "codec {codec} ratio {:.1} too low",
                metrics.compression_ratio
            );
        }
    }

    #[test]
    fn test_quality_score_bounds() {
        let signal = sine(1000.0, 16000.0, 1024, 0.8);
        let mut comp = compressor();

        for codec in [
            CompressionType::None,
            CompressionType::Zlib,
            CompressionType::Adpcm,
            CompressionType::Dct,
            CompressionType::Lpc,
        ] {
            let (_, metrics) = comp.compress(&signal, Some(codec)).unwrap();
            assert!(
                (0.0..=1.0).contains(&metrics.quality_score),
                "codec {codec} quality out of range"
            );
        }
    }

    #[test]
    fn test_unsupported_codec_name() {
        assert!(matches!(
            CompressionType::from_name("opus"),
            Err(CompressionError::UnsupportedCodec(_))
        ));
        assert_eq!(
            CompressionType::from_name("adpcm").unwrap(),
            CompressionType::Adpcm
        );
    }

    #[test]
    fn test_optimal_codec_meets_quality_floor() {
        let signal = sine(440.0, 16000.0, 2048, 0.3);
        let mut comp = compressor();

        let codec = comp.optimal_codec(&signal, Some(0.99));
        // Only the lossless deflate codecs reach 0.99 on a dense sine
        assert!(codec == CompressionType::Zlib || codec == CompressionType::Gzip);
    }

    #[test]
    fn test_stats_window() {
        let signal = sine(440.0, 16000.0, 256, 0.3);
        let mut comp = compressor();

        for _ in 0..120 {
            comp.compress(&signal, Some(CompressionType::Zlib)).unwrap();
        }

        let stats = comp.stats();
        assert_eq!(stats.total_compressions, 120);
        assert!(stats.average_compression_ratio > 1.0);
        assert!(stats.average_quality_score > 0.99);
    }

    #[test]
    fn test_dct_percentile_interpolation() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 100.0), 5.0);
        assert_eq!(percentile(&sorted, 50.0), 3.0);
    }
}
