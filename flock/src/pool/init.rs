use std::sync::Weak;

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::backends::InitOutcome;
use crate::error::PoolError;
use crate::pool::{PoolInner, WorkerContext};
use crate::telemetry;
use crate::worker::{BackendStatus, WorkerId};

/// Background loop initialising queued workers one at a time.
pub(crate) async fn run(pool: Weak<PoolInner>, mut queue: mpsc::UnboundedReceiver<WorkerId>) {
    let Some(draining) = pool.upgrade().map(|p| p.draining().clone()) else {
        return;
    };
    loop {
        tokio::select! {
            _ = draining.cancelled() => {
                tracing::info!("init worker shutting down");
                break;
            }
            next = queue.recv() => match next {
                Some(id) => {
                    let Some(inner) = pool.upgrade() else { break };
                    init_worker(&inner, &pool, id).await;
                }
                None => break,
            }
        }
    }
}

async fn init_worker(inner: &std::sync::Arc<PoolInner>, weak: &Weak<PoolInner>, id: WorkerId) {
    let Some(record) = inner.get(id) else {
        return;
    };
    if !record.is_enabled() {
        inner.set_status(&record, BackendStatus::Disabled);
        return;
    }
    // Stale entry: the worker was toggled, edited or restarted meanwhile.
    if !inner.transition(&record, &[BackendStatus::Waiting], BackendStatus::Loading) {
        return;
    }
    let attempt = {
        let mut state = record.state.lock();
        state.init_attempts += 1;
        state.init_attempts
    };

    let ctx = WorkerContext::new(record.clone(), weak.clone());
    let adapter = record.adapter();
    let span = telemetry::init_span(id, record.type_id(), attempt);
    let outcome = adapter.init(&ctx).instrument(span).await;

    match outcome {
        Ok(InitOutcome::Ready) => {
            ctx.set_features(adapter.supported_features());
            if inner.transition(&record, &[BackendStatus::Loading], BackendStatus::Running) {
                tracing::info!(worker_id = %id, type_id = record.type_id(), "worker running");
            }
            telemetry::record_init(id, "ready");
        }
        Ok(InitOutcome::Deferred) => {
            tracing::debug!(worker_id = %id, status = %record.status(), "worker init continues in background");
            telemetry::record_init(id, "deferred");
        }
        Err(err) => {
            let max_attempts = inner.config().max_init_attempts;
            if is_connection_refused(&err) {
                tracing::warn!(worker_id = %id, "connection refused; is the backend server running?");
            }
            if matches!(PoolError::find(&err), Some(PoolError::ConfigInvalid(_))) {
                tracing::error!(worker_id = %id, "worker configuration rejected: {err:#}");
                inner.set_status(&record, BackendStatus::Errored);
                telemetry::record_init(id, "config_invalid");
            } else if attempt < max_attempts && !inner.draining().is_cancelled() {
                tracing::warn!(
                    worker_id = %id,
                    attempt,
                    max_attempts,
                    "worker init failed, retrying: {err:#}"
                );
                inner.set_status(&record, BackendStatus::Waiting);
                telemetry::record_init(id, "retry");
                let delay = inner.config().init_retry_delay();
                let retry_pool = weak.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(pool) = retry_pool.upgrade() {
                        pool.enqueue_init(id);
                    }
                });
            } else {
                tracing::error!(worker_id = %id, attempt, "worker init failed: {err:#}");
                inner.set_status(&record, BackendStatus::Errored);
                telemetry::record_init(id, "errored");
            }
        }
    }
}

fn is_connection_refused(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .is_some_and(|e| e.is_connect())
            || cause
                .downcast_ref::<std::io::Error>()
                .is_some_and(|e| e.kind() == std::io::ErrorKind::ConnectionRefused)
    })
}
