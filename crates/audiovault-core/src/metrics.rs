//! Lightweight in-process metrics registry
//!
//! Counters, gauges, and timer samples keyed by name. The registry is
//! cheap to clone (shared interior) so every pipeline component can hold
//! one. Timer histories are bounded; old samples are discarded in bulk
//! once a series grows past its cap.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

const TIMER_CAP: usize = 1000;
const TIMER_KEEP: usize = 500;

/// Aggregate view of one timer series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerStats {
    pub count: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// 95th percentile when enough samples exist, otherwise the max
    pub p95_ms: f64,
}

#[derive(Default)]
struct Inner {
    counters: HashMap<String, f64>,
    gauges: HashMap<String, f64>,
    timers: HashMap<String, Vec<f64>>,
}

/// Shared registry of named counters, gauges, and timers
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn inc_counter(&self, name: &str, delta: f64) {
        let mut inner = self.lock();
        *inner.counters.entry(name.to_string()).or_insert(0.0) += delta;
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.lock().gauges.insert(name.to_string(), value);
    }

    pub fn record_timer(&self, name: &str, duration_ms: f64) {
        let mut inner = self.lock();
        let series = inner.timers.entry(name.to_string()).or_default();
        series.push(duration_ms);
        if series.len() > TIMER_CAP {
            let excess = series.len() - TIMER_KEEP;
            series.drain(..excess);
        }
    }

    /// RAII timer; records elapsed milliseconds when dropped
    pub fn start_timer(&self, name: &str) -> TimerGuard {
        TimerGuard {
            registry: self.clone(),
            name: name.to_string(),
            started: Instant::now(),
        }
    }

    pub fn counter(&self, name: &str) -> f64 {
        self.lock().counters.get(name).copied().unwrap_or(0.0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.lock().gauges.get(name).copied()
    }

    pub fn counters(&self) -> HashMap<String, f64> {
        self.lock().counters.clone()
    }

    pub fn gauges(&self) -> HashMap<String, f64> {
        self.lock().gauges.clone()
    }

    pub fn timer_stats(&self, name: &str) -> Option<TimerStats> {
        let inner = self.lock();
        let series = inner.timers.get(name)?;
        if series.is_empty() {
            return None;
        }

        let count = series.len();
        let sum: f64 = series.iter().sum();
        let min = series.iter().copied().fold(f64::INFINITY, f64::min);
        let max = series.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        // p95 is noisy on short series; report the max instead
        let p95 = if count > 20 {
            let mut sorted = series.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            sorted[(count as f64 * 0.95) as usize]
        } else {
            max
        };

        Some(TimerStats {
            count,
            mean_ms: sum / count as f64,
            min_ms: min,
            max_ms: max,
            p95_ms: p95,
        })
    }

    pub fn timer_names(&self) -> Vec<String> {
        self.lock().timers.keys().cloned().collect()
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.counters.clear();
        inner.gauges.clear();
        inner.timers.clear();
    }
}

pub struct TimerGuard {
    registry: MetricsRegistry,
    name: String,
    started: Instant,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.registry.record_timer(&self.name, elapsed_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_counter_accumulates() {
        let registry = MetricsRegistry::new();
        registry.inc_counter("chunks", 1.0);
        registry.inc_counter("chunks", 2.0);
        assert_relative_eq!(registry.counter("chunks"), 3.0);
        assert_relative_eq!(registry.counter("missing"), 0.0);
    }

    #[test]
    fn test_gauge_overwrites() {
        let registry = MetricsRegistry::new();
        registry.set_gauge("cpu", 40.0);
        registry.set_gauge("cpu", 55.0);
        assert_eq!(registry.gauge("cpu"), Some(55.0));
        assert_eq!(registry.gauge("missing"), None);
    }

    #[test]
    fn test_timer_stats_small_series_uses_max() {
        let registry = MetricsRegistry::new();
        for v in [1.0, 2.0, 10.0] {
            registry.record_timer("latency", v);
        }
        let stats = registry.timer_stats("latency").unwrap();
        assert_eq!(stats.count, 3);
        assert_relative_eq!(stats.mean_ms, 13.0 / 3.0);
        assert_relative_eq!(stats.p95_ms, 10.0);
    }

    #[test]
    fn test_timer_stats_large_series_uses_p95() {
        let registry = MetricsRegistry::new();
        for i in 0..100 {
            registry.record_timer("latency", i as f64);
        }
        let stats = registry.timer_stats("latency").unwrap();
        assert_relative_eq!(stats.p95_ms, 95.0);
        assert_relative_eq!(stats.max_ms, 99.0);
    }

    #[test]
    fn test_timer_history_is_bounded() {
        let registry = MetricsRegistry::new();
        for i in 0..(TIMER_CAP + 1) {
            registry.record_timer("latency", i as f64);
        }
        let stats = registry.timer_stats("latency").unwrap();
        assert_eq!(stats.count, TIMER_KEEP);
        // Oldest samples were discarded
        assert_relative_eq!(stats.min_ms, (TIMER_CAP + 1 - TIMER_KEEP) as f64);
    }

    #[test]
    fn test_timer_guard_records_on_drop() {
        let registry = MetricsRegistry::new();
        {
            let _guard = registry.start_timer("scoped");
        }
        assert_eq!(registry.timer_stats("scoped").unwrap().count, 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let registry = MetricsRegistry::new();
        registry.inc_counter("a", 1.0);
        registry.set_gauge("b", 2.0);
        registry.record_timer("c", 3.0);
        registry.reset();
        assert_relative_eq!(registry.counter("a"), 0.0);
        assert_eq!(registry.gauge("b"), None);
        assert!(registry.timer_stats("c").is_none());
    }
}
