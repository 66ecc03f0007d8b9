//! Segment storage in RIFF/WAVE containers
//!
//! Incoming chunks append to one active segment per device. Files live
//! under date-partitioned directories (`YYYY-MM-DD/`) with names that
//! encode start time, device, and segment id. The WAVE header is written
//! with placeholder sizes and rewritten when the segment completes, so a
//! crash leaves a recoverable (if mis-sized) file rather than none.

use crate::chunk::AudioChunk;
use crate::config::Config;
use crate::device::DeviceInfo;
use crate::dsp::analyzer::AudioMetrics;
use crate::events::EventBus;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No active segment for device {0}")]
    NoActiveSegment(String),

    #[error("Segment file not found: {0}")]
    NotFound(PathBuf),
}

/// PCM parameters baked into a WAVE header
#[derive(Debug, Clone, Copy)]
pub struct WavSpec {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavSpec {
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * (self.bits_per_sample as u32 / 8)
    }

    pub fn block_align(&self) -> u16 {
        self.channels * (self.bits_per_sample / 8)
    }
}

/// Streaming PCM writer for one WAVE file.
///
/// The 44-byte header goes out first with zero sizes; `finalize`
/// rewrites the RIFF and data chunk sizes in place.
pub struct WavWriter {
    file: BufWriter<File>,
    path: PathBuf,
    data_bytes: u32,
}

impl WavWriter {
    pub fn create(path: impl AsRef<Path>, spec: WavSpec) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;

        let mut writer = Self {
            file: BufWriter::new(file),
            path,
            data_bytes: 0,
        };
        writer.write_header(spec)?;
        Ok(writer)
    }

    fn write_header(&mut self, spec: WavSpec) -> Result<(), StorageError> {
        let mut header = Vec::with_capacity(44);
        header.extend_from_slice(b"RIFF");
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(b"WAVE");
        header.extend_from_slice(b"fmt ");
        header.extend_from_slice(&16u32.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes()); // PCM
        header.extend_from_slice(&spec.channels.to_le_bytes());
        header.extend_from_slice(&spec.sample_rate.to_le_bytes());
        header.extend_from_slice(&spec.byte_rate().to_le_bytes());
        header.extend_from_slice(&spec.block_align().to_le_bytes());
        header.extend_from_slice(&spec.bits_per_sample.to_le_bytes());
        header.extend_from_slice(b"data");
        header.extend_from_slice(&0u32.to_le_bytes());
        self.write_raw(&header)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.write_raw(data)?;
        self.data_bytes = self.data_bytes.saturating_add(data.len() as u32);
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.file.write_all(data).map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Rewrite the size fields and flush; returns data bytes written
    pub fn finalize(mut self) -> Result<u32, StorageError> {
        let path = self.path.clone();
        let io_err = |source| StorageError::Io {
            path: path.clone(),
            source,
        };

        self.file.flush().map_err(io_err)?;
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(4)).map_err(io_err)?;
        file.write_all(&(36 + self.data_bytes).to_le_bytes())
            .map_err(io_err)?;
        file.seek(SeekFrom::Start(40)).map_err(io_err)?;
        file.write_all(&self.data_bytes.to_le_bytes())
            .map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(self.data_bytes)
    }
}

/// Metadata for one stored segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSegment {
    pub segment_id: String,
    pub device_id: String,
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub bytes_written: u64,
    pub chunk_count: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Per-chunk analysis features accumulated while the segment was active
    #[serde(default)]
    pub metrics: Vec<AudioMetrics>,
}

impl AudioSegment {
    /// Segment duration derived from written bytes, not wall clock
    pub fn duration_secs(&self) -> f64 {
        let byte_rate = self.sample_rate as u64
            * self.channels as u64
            * (self.bits_per_sample as u64 / 8);
        if byte_rate == 0 {
            0.0
        } else {
            self.bytes_written as f64 / byte_rate as f64
        }
    }
}

struct ActiveSegment {
    meta: AudioSegment,
    writer: WavWriter,
}

/// Entry returned by `list_segments`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSegment {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Cumulative storage counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub active_segments: usize,
    pub segments_started: u64,
    pub segments_completed: u64,
    pub bytes_written: u64,
    pub write_errors: u64,
}

/// Owns the active-segment map and the on-disk layout.
///
/// Thread safe; connections share one manager behind an `Arc`.
pub struct StorageManager {
    data_dir: PathBuf,
    segment_duration_secs: u64,
    retention_days: i64,
    spec: WavSpec,
    active: Mutex<HashMap<String, ActiveSegment>>,
    events: Option<Arc<EventBus>>,
    segments_started: AtomicU64,
    segments_completed: AtomicU64,
    bytes_written: AtomicU64,
    writes: AtomicU64,
    write_errors: AtomicU64,
}

impl StorageManager {
    pub fn new(config: &Config) -> Self {
        Self {
            data_dir: config.storage.data_dir.clone(),
            segment_duration_secs: config.storage.segment_duration_secs,
            retention_days: config.storage.retention_days,
            spec: WavSpec {
                channels: config.receiver.channels,
                sample_rate: config.receiver.sample_rate,
                bits_per_sample: config.receiver.bits_per_sample,
            },
            active: Mutex::new(HashMap::new()),
            events: None,
            segments_started: AtomicU64::new(0),
            segments_completed: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        }
    }

    /// Manager that publishes `storage.*` lifecycle events
    pub fn with_events(config: &Config, events: Arc<EventBus>) -> Self {
        Self {
            events: Some(events),
            ..Self::new(config)
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, ActiveSegment>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Begin a new segment for a device, completing any existing one
    pub fn start_segment(&self, device: &DeviceInfo) -> Result<AudioSegment, StorageError> {
        let mut active = self.lock_active();
        if let Some(existing) = active.remove(&device.device_id) {
            self.finish(existing)?;
        }
        let segment = self.open_segment(device)?;
        let meta = segment.meta.clone();
        active.insert(device.device_id.clone(), segment);
        Ok(meta)
    }

    /// Append one chunk to the device's active segment.
    ///
    /// Starts a segment automatically if none is active, and rotates
    /// once the byte-derived duration reaches the configured threshold.
    /// Analysis features, when given, accumulate on the segment's
    /// metadata.
    pub fn write_chunk(
        &self,
        chunk: &AudioChunk,
        metrics: Option<&AudioMetrics>,
    ) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let result = self.write_chunk_inner(chunk, metrics);
        if result.is_err() {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn write_chunk_inner(
        &self,
        chunk: &AudioChunk,
        metrics: Option<&AudioMetrics>,
    ) -> Result<(), StorageError> {
        let mut active = self.lock_active();

        if !active.contains_key(&chunk.device_id) {
            let device = DeviceInfo::placeholder(&chunk.device_id);
            let segment = self.open_segment(&device)?;
            tracing::info!(
                device_id = %chunk.device_id,
                path = %segment.meta.path.display(),
                "Segment started"
            );
            active.insert(chunk.device_id.clone(), segment);
        }

        let rotate = {
            let segment = active
                .get_mut(&chunk.device_id)
                .ok_or_else(|| StorageError::NoActiveSegment(chunk.device_id.clone()))?;
            segment.writer.write_bytes(&chunk.data)?;
            segment.meta.bytes_written += chunk.data.len() as u64;
            segment.meta.chunk_count += 1;
            if let Some(metrics) = metrics {
                segment.meta.metrics.push(metrics.clone());
            }
            self.bytes_written
                .fetch_add(chunk.data.len() as u64, Ordering::Relaxed);
            segment.meta.duration_secs() >= self.segment_duration_secs as f64
        };

        if rotate {
            if let Some(segment) = active.remove(&chunk.device_id) {
                let meta = self.finish(segment)?;
                tracing::info!(
                    device_id = %chunk.device_id,
                    duration_secs = meta.duration_secs(),
                    "Segment rotated"
                );
            }
        }

        Ok(())
    }

    /// Finalize the device's active segment
    pub fn complete_segment(&self, device_id: &str) -> Result<AudioSegment, StorageError> {
        let segment = self
            .lock_active()
            .remove(device_id)
            .ok_or_else(|| StorageError::NoActiveSegment(device_id.to_string()))?;
        self.finish(segment)
    }

    /// Finalize every active segment; used at shutdown
    pub fn complete_all(&self) -> Vec<AudioSegment> {
        let drained: Vec<ActiveSegment> = {
            let mut active = self.lock_active();
            active.drain().map(|(_, segment)| segment).collect()
        };

        let mut completed = Vec::with_capacity(drained.len());
        for segment in drained {
            let device_id = segment.meta.device_id.clone();
            match self.finish(segment) {
                Ok(meta) => completed.push(meta),
                Err(err) => {
                    tracing::error!(device_id = %device_id, error = %err, "Segment finalize failed")
                }
            }
        }
        completed
    }

    fn open_segment(&self, device: &DeviceInfo) -> Result<ActiveSegment, StorageError> {
        let started_at = Utc::now();
        let segment_id = Uuid::new_v4().simple().to_string();

        let day_dir = self.data_dir.join(started_at.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&day_dir).map_err(|source| StorageError::Io {
            path: day_dir.clone(),
            source,
        })?;

        let file_name = format!(
            "{}_{}_{}.wav",
            started_at.format("%Y%m%d_%H%M%S"),
            short_id(&device.device_id),
            short_id(&segment_id),
        );
        let path = day_dir.join(file_name);
        let writer = WavWriter::create(&path, self.spec)?;
        self.segments_started.fetch_add(1, Ordering::Relaxed);

        let meta = AudioSegment {
            segment_id,
            device_id: device.device_id.clone(),
            path,
            started_at,
            completed_at: None,
            bytes_written: 0,
            chunk_count: 0,
            sample_rate: self.spec.sample_rate,
            channels: self.spec.channels,
            bits_per_sample: self.spec.bits_per_sample,
            metrics: Vec::new(),
        };

        if let Some(events) = &self.events {
            events.publish(
                "storage.segment_started",
                json!({
                    "device_id": meta.device_id,
                    "segment_id": meta.segment_id,
                    "path": meta.path,
                }),
                "storage",
            );
        }

        Ok(ActiveSegment { meta, writer })
    }

    fn finish(&self, segment: ActiveSegment) -> Result<AudioSegment, StorageError> {
        let mut meta = segment.meta;
        segment.writer.finalize()?;
        meta.completed_at = Some(Utc::now());
        self.segments_completed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            device_id = %meta.device_id,
            segment_id = %meta.segment_id,
            bytes = meta.bytes_written,
            "Segment completed"
        );

        if let Some(events) = &self.events {
            events.publish(
                "storage.segment_completed",
                json!({
                    "device_id": meta.device_id,
                    "segment_id": meta.segment_id,
                    "path": meta.path,
                    "bytes": meta.bytes_written,
                    "chunks": meta.chunk_count,
                    "duration_secs": meta.duration_secs(),
                }),
                "storage",
            );
        }
        Ok(meta)
    }

    /// All stored segment files, optionally filtered by device
    pub fn list_segments(&self, device_id: Option<&str>) -> Result<Vec<StoredSegment>, StorageError> {
        let mut segments = Vec::new();
        if !self.data_dir.exists() {
            return Ok(segments);
        }

        let read_dir = |path: &Path| {
            fs::read_dir(path).map_err(|source| StorageError::Io {
                path: path.to_path_buf(),
                source,
            })
        };

        for day in read_dir(&self.data_dir)?.flatten() {
            if !day.path().is_dir() {
                continue;
            }
            for entry in read_dir(&day.path())?.flatten() {
                let path = entry.path();
                if path.extension().map_or(true, |ext| ext != "wav") {
                    continue;
                }
                if let Some(device_id) = device_id {
                    let wanted = format!("_{}_", short_id(device_id));
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if !name.contains(&wanted) {
                        continue;
                    }
                }
                let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
                segments.push(StoredSegment { path, size_bytes });
            }
        }

        segments.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(segments)
    }

    pub fn delete_segment(&self, path: &Path) -> Result<(), StorageError> {
        if !path.exists() {
            return Err(StorageError::NotFound(path.to_path_buf()));
        }
        fs::remove_file(path).map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(events) = &self.events {
            events.publish("storage.segment_deleted", json!({"path": path}), "storage");
        }
        Ok(())
    }

    /// Delete date directories older than the retention window; returns
    /// the number of files removed
    pub fn cleanup_old_segments(&self) -> Result<usize, StorageError> {
        if !self.data_dir.exists() {
            return Ok(0);
        }
        let cutoff = (Utc::now() - Duration::days(self.retention_days)).date_naive();

        let entries = fs::read_dir(&self.data_dir).map_err(|source| StorageError::Io {
            path: self.data_dir.clone(),
            source,
        })?;

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(date) = NaiveDate::parse_from_str(&name, "%Y-%m-%d") else {
                continue;
            };
            if date >= cutoff {
                continue;
            }

            let file_count = fs::read_dir(&path)
                .map(|dir| dir.flatten().count())
                .unwrap_or(0);
            fs::remove_dir_all(&path).map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
            removed += file_count;
            tracing::info!(dir = %path.display(), files = file_count, "Expired segments removed");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            active_segments: self.lock_active().len(),
            segments_started: self.segments_started.load(Ordering::Relaxed),
            segments_completed: self.segments_completed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }

    /// Total on-disk size of stored segment files
    pub fn disk_usage_bytes(&self) -> u64 {
        self.list_segments(None)
            .map(|segments| segments.iter().map(|s| s.size_bytes).sum())
            .unwrap_or(0)
    }

    /// Healthy while the data directory is writable and fewer than 5% of
    /// writes fail
    pub fn health_check(&self) -> bool {
        if fs::create_dir_all(&self.data_dir).is_err() {
            return false;
        }
        let writes = self.writes.load(Ordering::Relaxed);
        if writes == 0 {
            return true;
        }
        let errors = self.write_errors.load(Ordering::Relaxed);
        (errors as f64 / writes as f64) <= 0.05
    }
}

/// First eight characters of an identifier, for compact filenames
fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
