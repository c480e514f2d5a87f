//! Prometheus metrics instrumentation for flock.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `flock_leases_acquired_total` - Acquire calls by outcome (acquired, timeout, unavailable)
//! - `flock_status_changes_total` - Worker status transitions
//! - `flock_worker_inits_total` - Initialisation attempts by outcome
//! - `flock_generations_total` - Dispatched units by outcome
//!
//! ## Gauges
//! - `flock_leases_active` - Leases currently held
//!
//! ## Histograms
//! - `flock_lease_wait_seconds` - Time spent waiting in acquire
//! - `flock_generation_duration_seconds` - Time from lease to result per unit
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

/// Global Prometheus registry for flock metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Acquire calls by outcome.
pub static LEASES_ACQUIRED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flock_leases_acquired_total", "Acquire calls by outcome");
    CounterVec::new(opts, &["outcome"]).expect("flock_leases_acquired_total metric creation failed")
});

/// Leases currently held.
pub static LEASES_ACTIVE: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("flock_leases_active", "Leases currently held")
        .expect("flock_leases_active metric creation failed")
});

/// Time spent waiting for a lease.
pub static LEASE_WAIT_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 16).expect("bucket creation failed");
    let opts = HistogramOpts::new("flock_lease_wait_seconds", "Time spent waiting for a lease")
        .buckets(buckets);
    Histogram::with_opts(opts).expect("flock_lease_wait_seconds metric creation failed")
});

/// Worker status transitions.
///
/// Labels:
/// - `from`: Previous status
/// - `to`: New status
pub static STATUS_CHANGES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flock_status_changes_total", "Worker status transitions");
    CounterVec::new(opts, &["from", "to"]).expect("flock_status_changes_total metric creation failed")
});

/// Initialisation attempts by outcome (ready, deferred, retry, errored, config_invalid).
pub static WORKER_INITS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flock_worker_inits_total", "Worker initialisation attempts by outcome");
    CounterVec::new(opts, &["outcome"]).expect("flock_worker_inits_total metric creation failed")
});

/// Dispatched units by outcome (completed, failed, cancelled).
pub static GENERATIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flock_generations_total", "Dispatched generation units by outcome");
    CounterVec::new(opts, &["outcome"]).expect("flock_generations_total metric creation failed")
});

/// Per-unit generation time.
pub static GENERATION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 15).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "flock_generation_duration_seconds",
        "Generation unit duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["outcome"])
        .expect("flock_generation_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(LEASES_ACQUIRED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(LEASES_ACTIVE.clone()),
        Box::new(LEASE_WAIT_SECONDS.clone()),
        Box::new(STATUS_CHANGES_TOTAL.clone()),
        Box::new(WORKER_INITS_TOTAL.clone()),
        Box::new(GENERATIONS_TOTAL.clone()),
        Box::new(GENERATION_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_lease_acquired(outcome: &str, waited_secs: f64) {
    LEASES_ACQUIRED_TOTAL.with_label_values(&[outcome]).inc();
    LEASE_WAIT_SECONDS.observe(waited_secs);
    if outcome == "acquired" {
        LEASES_ACTIVE.inc();
    }
}

pub fn record_lease_released() {
    LEASES_ACTIVE.dec();
}

pub fn record_status_change(from: &str, to: &str) {
    STATUS_CHANGES_TOTAL.with_label_values(&[from, to]).inc();
}

pub fn record_worker_init(outcome: &str) {
    WORKER_INITS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_generation(outcome: &str, duration_secs: f64) {
    GENERATIONS_TOTAL.with_label_values(&[outcome]).inc();
    GENERATION_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should be a no-op");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_lease_acquired("acquired", 0.01);
        record_lease_released();
        record_worker_init("ready");
        record_generation("completed", 1.5);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("flock_leases_acquired_total"));
        assert!(output.contains("flock_worker_inits_total"));
        assert!(output.contains("flock_generations_total"));
    }
}
