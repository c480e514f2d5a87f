//! Tracing and telemetry instrumentation for flock.
//!
//! Helper functions for creating tracing spans and recording pool and
//! dispatch events. All functions work both with and without the `metrics`
//! feature flag; with it enabled they also update the Prometheus collectors in
//! [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use flock::telemetry::{dispatch_span, init_tracing};
//!
//! init_tracing("flock=info");
//! let span = dispatch_span(session.id(), 4);
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{Instrument, Span, info_span};
use tracing_subscriber::EnvFilter;

use crate::error::PoolError;
use crate::lease::BackendLease;
use crate::worker::{BackendStatus, WorkerId};

/// Install a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Does nothing if a subscriber is already installed.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Span around a lease acquisition.
#[must_use]
pub fn acquire_span(max_wait: Option<Duration>) -> Span {
    info_span!(
        "flock.acquire",
        max_wait_ms = max_wait.map(|wait| wait.as_millis() as u64),
    )
}

/// Span around one batch dispatch.
#[must_use]
pub fn dispatch_span(session_id: impl AsRef<str>, count: u32) -> Span {
    info_span!(
        "flock.dispatch",
        session_id = %session_id.as_ref(),
        count,
    )
}

/// Span around one unit's generation call on a leased worker.
#[must_use]
pub fn generate_span(batch_index: u32, worker_id: WorkerId) -> Span {
    info_span!(
        "flock.generate",
        batch_index,
        worker_id = %worker_id,
    )
}

/// Span around one initialisation attempt.
#[must_use]
pub fn init_span(worker_id: WorkerId, type_id: impl AsRef<str>, attempt: u32) -> Span {
    info_span!(
        "flock.init",
        worker_id = %worker_id,
        type_id = %type_id.as_ref(),
        attempt,
    )
}

/// Span around a peer connection's reconciliation work.
#[must_use]
pub fn peer_span(worker_id: WorkerId, address: impl AsRef<str>) -> Span {
    info_span!(
        "flock.peer",
        worker_id = %worker_id,
        address = %address.as_ref(),
    )
}

/// Instrument a future with a dispatch span.
pub fn instrument_dispatch<F>(
    session_id: impl AsRef<str>,
    count: u32,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(dispatch_span(session_id, count))
}

/// Record the outcome of an acquire call.
pub fn record_lease_acquired(result: &Result<BackendLease, PoolError>, waited: Duration) {
    let outcome = match result {
        Ok(lease) => {
            tracing::debug!(
                worker_id = %lease.worker_id(),
                lease_id = %lease.id(),
                waited_ms = waited.as_millis() as u64,
                "lease acquired"
            );
            "acquired"
        }
        Err(PoolError::Timeout) => {
            tracing::info!(waited_ms = waited.as_millis() as u64, "lease wait timed out");
            "timeout"
        }
        Err(err) => {
            tracing::debug!("lease unavailable: {err}");
            "unavailable"
        }
    };

    #[cfg(feature = "metrics")]
    crate::metrics::record_lease_acquired(outcome, waited.as_secs_f64());
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}

/// Record a lease being handed back.
pub fn record_lease_released(worker_id: WorkerId, held: Duration) {
    tracing::debug!(
        worker_id = %worker_id,
        held_ms = held.as_millis() as u64,
        "lease released"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_lease_released();
}

/// Record a worker status change.
pub fn record_status_change(worker_id: WorkerId, from: BackendStatus, to: BackendStatus) {
    if to == BackendStatus::Errored {
        tracing::warn!(worker_id = %worker_id, %from, "worker errored");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_status_change(from.as_str(), to.as_str());
}

/// Record the result of one initialisation attempt.
pub fn record_init(worker_id: WorkerId, outcome: &str) {
    tracing::debug!(worker_id = %worker_id, outcome, "worker init attempt finished");

    #[cfg(feature = "metrics")]
    crate::metrics::record_worker_init(outcome);
}

/// Record the result of one dispatched unit.
pub fn record_generation(batch_index: u32, outcome: &str, elapsed: Duration) {
    tracing::debug!(
        batch_index,
        outcome,
        elapsed_ms = elapsed.as_millis() as u64,
        "generation unit finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_generation(outcome, elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_test_subscriber(f: impl FnOnce()) {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn test_acquire_span() {
        with_test_subscriber(|| {
            let span = acquire_span(Some(Duration::from_secs(1)));
            assert_eq!(span.metadata().unwrap().name(), "flock.acquire");
        });
    }

    #[test]
    fn test_dispatch_span() {
        with_test_subscriber(|| {
            let span = dispatch_span("session-1", 4);
            assert_eq!(span.metadata().unwrap().name(), "flock.dispatch");
        });
    }

    #[test]
    fn test_generate_span() {
        with_test_subscriber(|| {
            let span = generate_span(2, WorkerId(7));
            assert_eq!(span.metadata().unwrap().name(), "flock.generate");
        });
    }

    #[test]
    fn test_init_span() {
        with_test_subscriber(|| {
            let span = init_span(WorkerId(1), "auto_webui_api", 1);
            assert_eq!(span.metadata().unwrap().name(), "flock.init");
        });
    }

    #[test]
    fn test_peer_span() {
        with_test_subscriber(|| {
            let span = peer_span(WorkerId(1), "http://peer:7801");
            assert_eq!(span.metadata().unwrap().name(), "flock.peer");
        });
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_lease_acquired(&Err(PoolError::Timeout), Duration::from_millis(5));
        record_lease_acquired(&Err(PoolError::Unavailable), Duration::ZERO);
        record_lease_released(WorkerId(1), Duration::from_millis(3));
        record_status_change(WorkerId(1), BackendStatus::Loading, BackendStatus::Errored);
        record_init(WorkerId(1), "retry");
        record_generation(0, "completed", Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_instrument_dispatch() {
        let value = instrument_dispatch("session-1", 1, async { 42 }).await;
        assert_eq!(value, 42);
    }
}
