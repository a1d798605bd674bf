//! Metrics collection and export.
//!
//! Built-in atomic metrics for local tracking, mirrored into OpenTelemetry
//! instruments when the `otel` feature is enabled.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[cfg(feature = "otel")]
use super::otel::{OtelConfig, OtelMetricsBridge, SERVICE_NAME_DEFAULT};
#[cfg(feature = "otel")]
use opentelemetry::global;

/// Metrics configuration.
#[derive(Clone, Default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub export_interval: Option<Duration>,
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self {
            enabled: true,
            export_interval: Some(Duration::from_secs(60)),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            export_interval: None,
        }
    }
}

/// Thread-safe atomic counter.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram.
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets sized for accounting round-trips, from tens of milliseconds to
    /// a few minutes.
    pub fn unit_latency() -> Self {
        Self::new(vec![
            25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 15000.0, 60000.0, 300000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    /// Sum in milliseconds; stored internally scaled by 1000.
    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// Reconciliation metrics.
///
/// Recording never fails and never blocks a unit.
pub struct MetricsRegistry {
    pub passes_total: Counter,
    pub units_started: Counter,
    pub units_succeeded: Counter,
    pub units_failed: Counter,
    pub units_skipped: Counter,
    pub units_timed_out: Counter,
    pub cluster_failures: Counter,
    pub allocations_closed: Counter,
    pub close_conflicts: Counter,
    pub orphans_locked: Counter,
    pub limits_pushed: Counter,
    pub su_apportioned: Counter,
    pub units_in_flight: Gauge,
    pub unit_latency_ms: Histogram,
    #[cfg(feature = "otel")]
    otel_bridge: Option<OtelMetricsBridge>,
}

impl MetricsRegistry {
    pub fn new(_config: &MetricsConfig) -> Self {
        Self {
            passes_total: Counter::new(),
            units_started: Counter::new(),
            units_succeeded: Counter::new(),
            units_failed: Counter::new(),
            units_skipped: Counter::new(),
            units_timed_out: Counter::new(),
            cluster_failures: Counter::new(),
            allocations_closed: Counter::new(),
            close_conflicts: Counter::new(),
            orphans_locked: Counter::new(),
            limits_pushed: Counter::new(),
            su_apportioned: Counter::new(),
            units_in_flight: Gauge::new(),
            unit_latency_ms: Histogram::unit_latency(),
            #[cfg(feature = "otel")]
            otel_bridge: None,
        }
    }

    #[cfg(feature = "otel")]
    pub fn otel(config: &MetricsConfig, _otel_config: &OtelConfig) -> Self {
        let meter = global::meter(SERVICE_NAME_DEFAULT);
        Self {
            otel_bridge: Some(OtelMetricsBridge::new(&meter)),
            ..Self::new(config)
        }
    }

    pub fn record_pass(&self) {
        self.passes_total.inc();

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_pass();
        }
    }

    pub fn record_unit_start(&self) {
        self.units_started.inc();
        self.units_in_flight.inc();

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_unit_start();
        }
    }

    pub fn record_unit_end(&self, success: bool, latency_ms: f64) {
        self.units_in_flight.dec();
        self.unit_latency_ms.observe(latency_ms);
        if success {
            self.units_succeeded.inc();
        } else {
            self.units_failed.inc();
        }

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_unit_end(success, latency_ms);
        }
    }

    /// A unit abandoned on its overall timeout.
    pub fn record_unit_timeout(&self, latency_ms: f64) {
        self.units_in_flight.dec();
        self.unit_latency_ms.observe(latency_ms);
        self.units_timed_out.inc();

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_unit_timeout(latency_ms);
        }
    }

    pub fn record_unit_skipped(&self) {
        self.units_in_flight.dec();
        self.units_skipped.inc();
    }

    pub fn record_cluster_failure(&self) {
        self.cluster_failures.inc();
    }

    pub fn record_close(&self, final_usage: u64) {
        self.allocations_closed.inc();
        self.su_apportioned.add(final_usage);

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_close(final_usage);
        }
    }

    pub fn record_close_conflict(&self) {
        self.close_conflicts.inc();
    }

    pub fn record_orphan_locked(&self) {
        self.orphans_locked.inc();
    }

    pub fn record_limit_pushed(&self) {
        self.limits_pushed.inc();

        #[cfg(feature = "otel")]
        if let Some(ref bridge) = self.otel_bridge {
            bridge.record_limit_pushed();
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(&MetricsConfig::default())
    }
}

/// Point-in-time snapshot of a [`MetricsRegistry`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub passes: u64,
    pub units_started: u64,
    pub units_succeeded: u64,
    pub units_failed: u64,
    pub units_skipped: u64,
    pub units_timed_out: u64,
    pub cluster_failures: u64,
    pub allocations_closed: u64,
    pub close_conflicts: u64,
    pub orphans_locked: u64,
    pub limits_pushed: u64,
    pub su_apportioned: u64,
    pub avg_unit_latency_ms: f64,
}

impl MetricsSummary {
    pub fn from_registry(registry: &MetricsRegistry) -> Self {
        let count = registry.unit_latency_ms.count();
        let avg_latency = if count > 0 {
            registry.unit_latency_ms.sum_ms() / count as f64
        } else {
            0.0
        };

        Self {
            passes: registry.passes_total.get(),
            units_started: registry.units_started.get(),
            units_succeeded: registry.units_succeeded.get(),
            units_failed: registry.units_failed.get(),
            units_skipped: registry.units_skipped.get(),
            units_timed_out: registry.units_timed_out.get(),
            cluster_failures: registry.cluster_failures.get(),
            allocations_closed: registry.allocations_closed.get(),
            close_conflicts: registry.close_conflicts.get(),
            orphans_locked: registry.orphans_locked.get(),
            limits_pushed: registry.limits_pushed.get(),
            su_apportioned: registry.su_apportioned.get(),
            avg_unit_latency_ms: avg_latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge_can_go_negative() {
        let gauge = Gauge::new();
        gauge.set(1);
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), -1);
    }

    #[test]
    fn test_histogram_buckets() {
        let hist = Histogram::new(vec![10.0, 100.0]);
        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(500.0);
        assert_eq!(hist.count(), 3);
        assert_eq!(hist.bucket_counts(), vec![1, 1, 1]);
        assert_eq!(hist.sum_ms(), 555.0);
    }

    #[test]
    fn test_unit_lifecycle() {
        let registry = MetricsRegistry::default();
        registry.record_pass();
        registry.record_unit_start();
        registry.record_close(500);
        registry.record_limit_pushed();
        registry.record_unit_end(true, 40.0);
        registry.record_unit_start();
        registry.record_unit_timeout(300.0);
        registry.record_unit_start();
        registry.record_unit_skipped();

        let summary = MetricsSummary::from_registry(&registry);
        assert_eq!(summary.passes, 1);
        assert_eq!(summary.units_started, 3);
        assert_eq!(summary.units_succeeded, 1);
        assert_eq!(summary.units_timed_out, 1);
        assert_eq!(summary.units_skipped, 1);
        assert_eq!(summary.su_apportioned, 500);
        assert_eq!(summary.avg_unit_latency_ms, 170.0);
        assert_eq!(registry.units_in_flight.get(), 0);
    }
}
