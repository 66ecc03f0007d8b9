//! System and pipeline monitoring with threshold alerts
//!
//! A background thread samples host metrics (CPU, memory, disk, network,
//! thread count) and reads pipeline gauges from the shared registry at a
//! fixed interval. Each sample runs through the alert rules: a metric
//! past its threshold raises an alert (subject to a per-metric cooldown),
//! and a metric back inside its threshold resolves the outstanding alert.
//! Registered callbacks receive every combined sample.

use crate::config::MonitorConfig;
use crate::events::EventBus;
use crate::metrics::{MetricsRegistry, TimerStats};
use serde_json::json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use sysinfo::{Disks, Networks, System};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Failed to write metrics export: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize metrics: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One sample of host-level resource usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    /// Bytes received across all interfaces since boot
    pub network_rx_bytes: u64,
    /// Bytes transmitted across all interfaces since boot
    pub network_tx_bytes: u64,
    /// Threads in this process; 0 where the platform exposes no count
    pub thread_count: usize,
}

/// One sample of pipeline-level gauges and counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub timestamp: DateTime<Utc>,
    pub devices_active: f64,
    pub bytes_received: f64,
    pub bytes_processed: f64,
    pub processing_latency_ms: f64,
    pub buffer_utilization: f64,
    pub dropped_packets: f64,
    pub quality_score: f64,
    pub compression_ratio: f64,
}

impl PipelineMetrics {
    /// Snapshot the registry into one pipeline sample.
    ///
    /// Missing gauges default to healthy values so a fresh registry does
    /// not raise alerts.
    pub fn from_registry(registry: &MetricsRegistry) -> Self {
        Self {
            timestamp: Utc::now(),
            devices_active: registry.gauge("devices_active").unwrap_or(0.0),
            bytes_received: registry.counter("bytes_received"),
            bytes_processed: registry.counter("bytes_processed"),
            processing_latency_ms: registry.gauge("processing_latency_ms").unwrap_or(0.0),
            buffer_utilization: registry.gauge("buffer_utilization").unwrap_or(0.0),
            dropped_packets: registry.counter("dropped_packets"),
            quality_score: registry.gauge("quality_score").unwrap_or(1.0),
            compression_ratio: registry.gauge("compression_ratio").unwrap_or(1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// One raised threshold breach
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub id: String,
    pub metric: String,
    pub level: AlertLevel,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Mean and max over a metric history window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricAggregate {
    pub mean: f64,
    pub max: f64,
}

fn aggregate(values: impl Iterator<Item = f64>) -> Option<MetricAggregate> {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        return None;
    }
    Some(MetricAggregate {
        mean: values.iter().sum::<f64>() / values.len() as f64,
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    })
}

/// Rolling monitoring summary for export and health endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSummary {
    pub timestamp: DateTime<Utc>,
    pub system: Option<SystemMetrics>,
    pub pipeline: Option<PipelineMetrics>,
    pub cpu: Option<MetricAggregate>,
    pub memory: Option<MetricAggregate>,
    pub disk: Option<MetricAggregate>,
    pub latency_ms: Option<MetricAggregate>,
    pub devices: Option<MetricAggregate>,
    pub quality_mean: Option<f64>,
    pub quality_min: Option<f64>,
    /// Lifetime byte counter from the latest pipeline sample
    pub bytes_received: f64,
    /// Lifetime dropped-packet counter from the latest pipeline sample
    pub dropped_packets: f64,
    pub active_alerts: usize,
    pub total_alerts: usize,
    pub timers: HashMap<String, TimerStats>,
}

type SampleCallback = Arc<dyn Fn(&SystemMetrics, &PipelineMetrics) + Send + Sync>;

struct MonitorState {
    system_history: VecDeque<SystemMetrics>,
    pipeline_history: VecDeque<PipelineMetrics>,
    alerts: Vec<PerformanceAlert>,
    last_alert_times: HashMap<String, Instant>,
    callbacks: Vec<SampleCallback>,
}

impl MonitorState {
    fn new() -> Self {
        Self {
            system_history: VecDeque::new(),
            pipeline_history: VecDeque::new(),
            alerts: Vec::new(),
            last_alert_times: HashMap::new(),
            callbacks: Vec::new(),
        }
    }
}

/// Monitoring loop owner.
///
/// `start` spawns the sampling thread; `stop` is idempotent and also
/// runs on drop. All evaluation logic is callable without the thread so
/// callers can push synthetic samples through it.
pub struct Monitor {
    config: MonitorConfig,
    registry: MetricsRegistry,
    events: Option<Arc<EventBus>>,
    state: Arc<Mutex<MonitorState>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, registry: MetricsRegistry) -> Self {
        Self {
            config,
            registry,
            events: None,
            state: Arc::new(Mutex::new(MonitorState::new())),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Monitor that publishes `monitoring.*` events on the bus
    pub fn with_events(
        config: MonitorConfig,
        registry: MetricsRegistry,
        events: Arc<EventBus>,
    ) -> Self {
        let mut monitor = Self::new(config, registry);
        monitor.events = Some(events);
        monitor
    }

    /// Spawn the periodic sampling thread
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let config = self.config.clone();
        let registry = self.registry.clone();
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let running = Arc::clone(&self.running);
        let interval = Duration::from_secs_f64(self.config.metrics_interval_secs);

        if let Some(events) = &self.events {
            events.publish(
                "monitoring.started",
                json!({"interval_secs": self.config.metrics_interval_secs}),
                "monitor",
            );
        }

        self.handle = Some(std::thread::spawn(move || {
            tracing::info!(interval_secs = config.metrics_interval_secs, "Monitor started");
            let mut system = System::new();

            while running.load(Ordering::SeqCst) {
                let sample = sample_system(&mut system);
                let pipeline = PipelineMetrics::from_registry(&registry);
                evaluate_sample(&state, &config, events.as_deref(), &sample, &pipeline);
                std::thread::sleep(interval);
            }
            tracing::info!("Monitor stopped");
        }));
    }

    /// Stop the sampling thread; safe to call repeatedly
    pub fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Monitor thread panicked");
            }
        }
        if was_running {
            if let Some(events) = &self.events {
                events.publish("monitoring.stopped", json!({}), "monitor");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one synthetic sample through the alert rules
    pub fn evaluate(&self, system: &SystemMetrics, pipeline: &PipelineMetrics) {
        evaluate_sample(&self.state, &self.config, self.events.as_deref(), system, pipeline);
    }

    /// Register a callback invoked with every combined sample, from the
    /// sampling thread
    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(&SystemMetrics, &PipelineMetrics) + Send + Sync + 'static,
    {
        self.lock().callbacks.push(Arc::new(callback));
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn active_alerts(&self) -> Vec<PerformanceAlert> {
        self.lock()
            .alerts
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    pub fn all_alerts(&self) -> Vec<PerformanceAlert> {
        self.lock().alerts.clone()
    }

    /// Manually resolve an alert by id; returns false if unknown
    pub fn resolve_alert(&self, id: &str) -> bool {
        let mut state = self.lock();
        for alert in state.alerts.iter_mut() {
            if alert.id == id && !alert.resolved {
                alert.resolved = true;
                alert.resolved_at = Some(Utc::now());
                tracing::info!(alert_id = id, metric = %alert.metric, "Alert resolved manually");
                if let Some(events) = &self.events {
                    events.publish(
                        "monitoring.alert_resolved",
                        json!({"alert_id": id, "metric": alert.metric}),
                        "monitor",
                    );
                }
                return true;
            }
        }
        false
    }

    /// Drop resolved alerts from history; returns how many were removed
    pub fn clear_resolved_alerts(&self) -> usize {
        let mut state = self.lock();
        let before = state.alerts.len();
        state.alerts.retain(|a| !a.resolved);
        before - state.alerts.len()
    }

    /// Clear histories, alerts, and the backing registry
    pub fn reset_metrics(&self) {
        let mut state = self.lock();
        state.system_history.clear();
        state.pipeline_history.clear();
        state.alerts.clear();
        state.last_alert_times.clear();
        drop(state);
        self.registry.reset();
    }

    pub fn summary(&self) -> MonitorSummary {
        let state = self.lock();
        let timers = self
            .registry
            .timer_names()
            .into_iter()
            .filter_map(|name| {
                self.registry
                    .timer_stats(&name)
                    .map(|stats| (name, stats))
            })
            .collect();

        let quality: Vec<f64> = state
            .pipeline_history
            .iter()
            .map(|p| p.quality_score)
            .collect();

        MonitorSummary {
            timestamp: Utc::now(),
            system: state.system_history.back().cloned(),
            pipeline: state.pipeline_history.back().cloned(),
            cpu: aggregate(state.system_history.iter().map(|s| s.cpu_percent)),
            memory: aggregate(state.system_history.iter().map(|s| s.memory_percent)),
            disk: aggregate(state.system_history.iter().map(|s| s.disk_percent)),
            latency_ms: aggregate(
                state.pipeline_history.iter().map(|p| p.processing_latency_ms),
            ),
            devices: aggregate(state.pipeline_history.iter().map(|p| p.devices_active)),
            quality_mean: (!quality.is_empty())
                .then(|| quality.iter().sum::<f64>() / quality.len() as f64),
            quality_min: quality.iter().copied().reduce(f64::min),
            bytes_received: state
                .pipeline_history
                .back()
                .map_or(0.0, |p| p.bytes_received),
            dropped_packets: state
                .pipeline_history
                .back()
                .map_or(0.0, |p| p.dropped_packets),
            active_alerts: state.alerts.iter().filter(|a| !a.resolved).count(),
            total_alerts: state.alerts.len(),
            timers,
        }
    }

    /// Write the current summary and alert history as pretty JSON
    pub fn export_metrics(&self, path: impl AsRef<Path>) -> Result<(), MonitorError> {
        #[derive(Serialize)]
        struct Export {
            summary: MonitorSummary,
            alerts: Vec<PerformanceAlert>,
        }

        let export = Export {
            summary: self.summary(),
            alerts: self.all_alerts(),
        };
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, &export)?;
        tracing::info!(path = %path.as_ref().display(), "Metrics exported");
        Ok(())
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read one host sample
fn sample_system(system: &mut System) -> SystemMetrics {
    system.refresh_cpu_usage();
    system.refresh_memory();

    let memory_percent = if system.total_memory() > 0 {
        system.used_memory() as f64 / system.total_memory() as f64 * 100.0
    } else {
        0.0
    };

    // Fullest mounted disk drives the disk alert
    let disks = Disks::new_with_refreshed_list();
    let disk_percent = disks
        .iter()
        .filter(|d| d.total_space() > 0)
        .map(|d| {
            let used = d.total_space() - d.available_space();
            used as f64 / d.total_space() as f64 * 100.0
        })
        .fold(0.0, f64::max);

    let networks = Networks::new_with_refreshed_list();
    let (network_rx_bytes, network_tx_bytes) =
        networks.iter().fold((0u64, 0u64), |(rx, tx), (_, data)| {
            (rx + data.total_received(), tx + data.total_transmitted())
        });

    SystemMetrics {
        timestamp: Utc::now(),
        cpu_percent: system.global_cpu_usage() as f64,
        memory_percent,
        disk_percent,
        network_rx_bytes,
        network_tx_bytes,
        thread_count: current_thread_count(system),
    }
}

/// Threads in the current process
#[cfg(any(target_os = "linux", target_os = "android"))]
fn current_thread_count(system: &mut System) -> usize {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .and_then(|process| process.tasks())
        .map_or(0, |tasks| tasks.len())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn current_thread_count(_system: &mut System) -> usize {
    0
}

fn evaluate_sample(
    state: &Mutex<MonitorState>,
    config: &MonitorConfig,
    events: Option<&EventBus>,
    system: &SystemMetrics,
    pipeline: &PipelineMetrics,
) {
    let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    state.system_history.push_back(system.clone());
    if state.system_history.len() > config.history_size {
        state.system_history.pop_front();
    }
    state.pipeline_history.push_back(pipeline.clone());
    if state.pipeline_history.len() > config.history_size {
        state.pipeline_history.pop_front();
    }

    let checks: [(&str, f64, f64, bool); 6] = [
        ("cpu_percent", system.cpu_percent, config.cpu_threshold, false),
        ("memory_percent", system.memory_percent, config.memory_threshold, false),
        ("disk_percent", system.disk_percent, config.disk_threshold, false),
        (
            "processing_latency_ms",
            pipeline.processing_latency_ms,
            config.latency_threshold,
            false,
        ),
        (
            "buffer_utilization",
            pipeline.buffer_utilization,
            config.buffer_threshold,
            false,
        ),
        ("quality_score", pipeline.quality_score, config.quality_threshold, true),
    ];

    let now = Instant::now();
    for (metric, value, threshold, lower_better) in checks {
        check_metric(&mut state, config, events, metric, value, threshold, lower_better, now);
    }

    // Callbacks run without the state lock so they may call back into
    // the monitor
    let callbacks = state.callbacks.clone();
    drop(state);
    for callback in callbacks {
        callback(system, pipeline);
    }
}

#[allow(clippy::too_many_arguments)]
fn check_metric(
    state: &mut MonitorState,
    config: &MonitorConfig,
    events: Option<&EventBus>,
    metric: &str,
    value: f64,
    threshold: f64,
    lower_better: bool,
    now: Instant,
) {
    let breached = if lower_better {
        value < threshold
    } else {
        value > threshold
    };

    if breached {
        let already_active = state
            .alerts
            .iter()
            .any(|a| a.metric == metric && !a.resolved);
        if already_active {
            return;
        }

        if let Some(last) = state.last_alert_times.get(metric) {
            if now.duration_since(*last).as_secs_f64() < config.alert_cooldown_secs {
                return;
            }
        }

        let level = alert_level(metric, value, threshold, lower_better);
        let direction = if lower_better { "below" } else { "above" };
        let alert = PerformanceAlert {
            id: Uuid::new_v4().simple().to_string(),
            metric: metric.to_string(),
            level,
            message: format!("{metric} {direction} threshold: {value:.2} vs {threshold:.2}"),
            value,
            threshold,
            timestamp: Utc::now(),
            resolved: false,
            resolved_at: None,
        };
        tracing::warn!(metric, value, threshold, ?level, "Alert raised");
        if let Some(events) = events {
            events.publish(
                "monitoring.alert",
                json!({
                    "alert_id": alert.id,
                    "metric": metric,
                    "level": level,
                    "value": value,
                    "threshold": threshold,
                }),
                "monitor",
            );
        }
        state.last_alert_times.insert(metric.to_string(), now);
        state.alerts.push(alert);
    } else {
        for alert in state.alerts.iter_mut() {
            if alert.metric == metric && !alert.resolved {
                alert.resolved = true;
                alert.resolved_at = Some(Utc::now());
                tracing::info!(metric, value, "Alert cleared");
                if let Some(events) = events {
                    events.publish(
                        "monitoring.alert_resolved",
                        json!({"alert_id": alert.id, "metric": metric, "value": value}),
                        "monitor",
                    );
                }
            }
        }
    }
}

/// Severity tiers: resource exhaustion escalates to critical past 1.2x
/// its threshold, latency-class metrics to error past 1.5x.
fn alert_level(metric: &str, value: f64, threshold: f64, lower_better: bool) -> AlertLevel {
    if lower_better {
        return AlertLevel::Warning;
    }
    match metric {
        "cpu_percent" | "memory_percent" | "disk_percent" => {
            if value > threshold * 1.2 {
                AlertLevel::Critical
            } else {
                AlertLevel::Error
            }
        }
        "processing_latency_ms" | "buffer_utilization" => {
            if value > threshold * 1.5 {
                AlertLevel::Error
            } else {
                AlertLevel::Warning
            }
        }
        _ => AlertLevel::Warning,
    }
}
