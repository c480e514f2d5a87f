//! Fan a batch of generation units out over the pool.
//!
//! A batch opens one claim on the caller's session for all of its units and
//! keeps at most `max_degree` of them in flight. Images are forwarded as they
//! arrive. The first failure is reported and stops further units from
//! starting; units already running finish on their own. Interrupting the
//! session or claim stops new units the same way, without reporting an error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::Result;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use crate::backends::StreamContext;
use crate::config::DispatchConfig;
use crate::error::PoolError;
use crate::lease::BackendLease;
use crate::pool::PoolManager;
use crate::request::{GeneratedImage, GenerationEvent, GenerationRequest, RANDOM_SEED};
use crate::session::{Claim, ClaimCounts, Session};
use crate::telemetry;
use crate::worker::WorkerId;

/// Reported for adapter failures whose details are not meant for the user.
pub const GENERIC_FAILURE: &str = "Something went wrong while generating images.";

/// Output of a running batch, in completion order.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchEvent {
    Image {
        batch_index: u32,
        worker_id: WorkerId,
        image: GeneratedImage,
    },
    Progress {
        batch_index: u32,
        worker_id: WorkerId,
        data: Value,
    },
    /// The batch failed. Sent at most once per batch.
    Error {
        message: String,
        error: Option<PoolError>,
    },
}

/// How a batch ended.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DispatchSummary {
    pub requested: u32,
    /// Units that finished without error.
    pub completed: u32,
    pub images: usize,
    /// The message reported to the caller, if the batch failed.
    pub error: Option<String>,
    /// The batch stopped early because it was interrupted.
    pub cancelled: bool,
}

impl DispatchSummary {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.cancelled && self.completed == self.requested
    }
}

struct Batch {
    pool: PoolManager,
    config: DispatchConfig,
    claim: Claim,
    events: mpsc::Sender<DispatchEvent>,
    failed: AtomicBool,
    error: Mutex<Option<String>>,
    completed: AtomicU32,
    images: AtomicUsize,
}

impl Batch {
    fn stopped(&self) -> bool {
        self.failed.load(Ordering::SeqCst) || self.claim.should_cancel()
    }

    async fn emit(&self, event: DispatchEvent) {
        // A caller that stopped listening does not stop the batch.
        let _ = self.events.send(event).await;
    }

    /// Record a failure. Only the first one reaches the caller.
    async fn fail(&self, err: &anyhow::Error) {
        if self.failed.swap(true, Ordering::SeqCst) {
            tracing::debug!("suppressing further batch error: {err:#}");
            return;
        }
        let (message, error) = user_message(err);
        *self.error.lock() = Some(message.clone());
        self.emit(DispatchEvent::Error { message, error }).await;
    }
}

fn user_message(err: &anyhow::Error) -> (String, Option<PoolError>) {
    match PoolError::find(err) {
        Some(pool_err) if pool_err.is_user_facing() => (pool_err.to_string(), Some(pool_err.clone())),
        other => {
            tracing::error!("internal error processing generation: {err:#}");
            (GENERIC_FAILURE.to_string(), other.cloned())
        }
    }
}

/// Runs batches against one pool.
#[derive(Clone, Debug)]
pub struct DispatchEngine {
    pool: PoolManager,
    config: DispatchConfig,
}

impl DispatchEngine {
    pub fn new(pool: PoolManager, config: DispatchConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }

    /// Run `count` units of `request` for `session`, sending output to `events`.
    ///
    /// Returns once every started unit has finished.
    pub async fn dispatch(
        &self,
        session: &Session,
        request: GenerationRequest,
        count: u32,
        events: mpsc::Sender<DispatchEvent>,
    ) -> DispatchSummary {
        telemetry::instrument_dispatch(session.id(), count, self.run(session, request, count, events))
            .await
    }

    /// Run a batch in the background, returning its event stream and summary.
    pub fn spawn(
        &self,
        session: Session,
        request: GenerationRequest,
        count: u32,
    ) -> (mpsc::Receiver<DispatchEvent>, JoinHandle<DispatchSummary>) {
        let (tx, rx) = mpsc::channel(count.clamp(1, 64) as usize);
        let engine = self.clone();
        let handle =
            tokio::spawn(async move { engine.dispatch(&session, request, count, tx).await });
        (rx, handle)
    }

    async fn run(
        &self,
        session: &Session,
        request: GenerationRequest,
        count: u32,
        events: mpsc::Sender<DispatchEvent>,
    ) -> DispatchSummary {
        let batch = Arc::new(Batch {
            pool: self.pool.clone(),
            config: self.config.clone(),
            claim: session.claim(ClaimCounts::generations(u64::from(count))),
            events,
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
            completed: AtomicU32::new(0),
            images: AtomicUsize::new(0),
        });
        let base_seed = if request.seed == RANDOM_SEED {
            rand::thread_rng().gen_range(0..i64::from(i32::MAX))
        } else {
            request.seed
        };
        let max_degree = self.config.max_degree.max(1);
        let mut tasks = JoinSet::new();

        for index in 0..count {
            while tasks.len() >= max_degree {
                join_one(&mut tasks).await;
            }
            if batch.stopped() {
                break;
            }
            let batch = Arc::clone(&batch);
            let unit = request.for_unit(base_seed, index);
            tasks.spawn(run_unit(batch, index, unit));
        }
        while !tasks.is_empty() {
            join_one(&mut tasks).await;
        }

        batch.claim.dispose();
        let error = batch.error.lock().clone();
        let completed = batch.completed.load(Ordering::SeqCst);
        let summary = DispatchSummary {
            requested: count,
            completed,
            images: batch.images.load(Ordering::SeqCst),
            cancelled: error.is_none() && completed < count,
            error,
        };
        tracing::info!(
            requested = summary.requested,
            completed = summary.completed,
            images = summary.images,
            cancelled = summary.cancelled,
            failed = summary.error.is_some(),
            "batch finished"
        );
        summary
    }
}

async fn join_one(tasks: &mut JoinSet<()>) {
    if let Some(Err(err)) = tasks.join_next().await {
        tracing::error!("generation unit task failed: {err}");
    }
}

enum UnitOutcome {
    Completed(usize),
    Cancelled,
    Failed,
}

impl UnitOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            UnitOutcome::Completed(_) => "completed",
            UnitOutcome::Cancelled => "cancelled",
            UnitOutcome::Failed => "failed",
        }
    }
}

async fn run_unit(batch: Arc<Batch>, index: u32, request: GenerationRequest) {
    let started = Instant::now();
    let outcome = if batch.stopped() {
        UnitOutcome::Cancelled
    } else {
        run_unit_inner(&batch, index, &request).await
    };
    if let UnitOutcome::Completed(images) = outcome {
        batch.completed.fetch_add(1, Ordering::SeqCst);
        batch.images.fetch_add(images, Ordering::SeqCst);
    }
    batch.claim.complete(ClaimCounts::generations(1));
    telemetry::record_generation(index, outcome.as_str(), started.elapsed());
}

async fn run_unit_inner(batch: &Batch, index: u32, request: &GenerationRequest) -> UnitOutcome {
    let mut excluded: Vec<WorkerId> = Vec::new();
    let mut redirects = 0;
    loop {
        let lease = match acquire(batch, request, &excluded).await {
            Some(Ok(lease)) => lease,
            Some(Err(err)) => {
                batch.fail(&anyhow::Error::new(err)).await;
                return UnitOutcome::Failed;
            }
            None => return UnitOutcome::Cancelled,
        };
        if batch.claim.should_cancel() {
            return UnitOutcome::Cancelled;
        }

        let worker_id = lease.worker_id();
        batch.claim.extend(ClaimCounts::live_generations(1));
        let result = generate(batch, &lease, index, request)
            .instrument(telemetry::generate_span(index, worker_id))
            .await;
        batch.claim.complete(ClaimCounts::live_generations(1));
        lease.release();

        match result {
            Ok(images) => return UnitOutcome::Completed(images),
            Err(err)
                if matches!(PoolError::find(&err), Some(PoolError::Redirect))
                    && redirects < batch.config.max_redirects =>
            {
                redirects += 1;
                excluded.push(worker_id);
                tracing::debug!(batch_index = index, %worker_id, redirects, "unit redirected to another worker");
            }
            Err(err) if batch.claim.should_cancel() => {
                tracing::debug!(batch_index = index, "unit ended after interrupt: {err:#}");
                return UnitOutcome::Cancelled;
            }
            Err(err) => {
                batch.fail(&err).await;
                return UnitOutcome::Failed;
            }
        }
    }
}

/// Wait for a lease, giving up if the claim is interrupted first.
async fn acquire(
    batch: &Batch,
    request: &GenerationRequest,
    excluded: &[WorkerId],
) -> Option<Result<BackendLease, PoolError>> {
    batch.claim.extend(ClaimCounts::backend_waits(1));
    let max_wait = batch.config.lease_timeout();
    let lease = batch.pool.acquire_for_model(max_wait, request.model.as_deref(), |record| {
        !excluded.contains(&record.id())
    });
    let result = tokio::select! {
        lease = lease => Some(lease),
        _ = batch.claim.cancelled() => None,
    };
    batch.claim.complete(ClaimCounts::backend_waits(1));
    result
}

async fn generate(
    batch: &Batch,
    lease: &BackendLease,
    index: u32,
    request: &GenerationRequest,
) -> Result<usize> {
    let worker_id = lease.worker_id();
    let adapter = Arc::clone(lease.adapter());

    if !batch.config.streaming {
        let images = adapter.generate(request).await?;
        let count = images.len();
        for image in images {
            batch
                .emit(DispatchEvent::Image {
                    batch_index: index,
                    worker_id,
                    image,
                })
                .await;
        }
        return Ok(count);
    }

    let (tx, mut rx) = mpsc::channel(16);
    let stream = StreamContext::new(index, batch.claim.interrupt_signal(), tx);
    let produce = adapter.generate_streaming(request, stream);
    let forward = async {
        let mut images = 0;
        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Image(image) => {
                    images += 1;
                    batch
                        .emit(DispatchEvent::Image {
                            batch_index: index,
                            worker_id,
                            image,
                        })
                        .await;
                }
                GenerationEvent::Progress { batch_index, data } => {
                    batch
                        .emit(DispatchEvent::Progress {
                            batch_index,
                            worker_id,
                            data,
                        })
                        .await;
                }
            }
        }
        images
    };
    let (result, images) = tokio::join!(produce, forward);
    result.map(|()| images)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::backends::{BackendEnvironment, BackendRegistry};
    use crate::config::PoolConfig;
    use crate::session::User;

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[test]
    fn user_facing_errors_pass_through() {
        let err = anyhow::Error::new(PoolError::Timeout).context("waiting for lease");
        let (message, error) = user_message(&err);
        assert_eq!(message, "Timeout! All backends are occupied with other tasks.");
        assert_eq!(error, Some(PoolError::Timeout));

        let err: anyhow::Error = PoolError::InvalidData("steps must be positive".into()).into();
        assert_eq!(user_message(&err).0, "Invalid data: steps must be positive");
    }

    #[test]
    fn internal_errors_are_masked() {
        let err = anyhow::anyhow!("connection reset by peer");
        assert_eq!(user_message(&err), (GENERIC_FAILURE.to_string(), None));

        let err: anyhow::Error = PoolError::RemoteProtocol("bad frame".into()).into();
        let (message, error) = user_message(&err);
        assert_eq!(message, GENERIC_FAILURE);
        assert_eq!(error, Some(PoolError::RemoteProtocol("bad frame".into())));
    }

    #[test]
    fn summary_success_requires_every_unit() {
        let mut summary = DispatchSummary {
            requested: 2,
            completed: 2,
            images: 2,
            ..DispatchSummary::default()
        };
        assert!(summary.is_success());
        summary.completed = 1;
        assert!(!summary.is_success());
    }

    #[tokio::test]
    async fn only_the_first_failure_is_reported_and_logged() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::ERROR)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let pool = PoolManager::new(
            PoolConfig::default(),
            BackendRegistry::new(BackendEnvironment::new()),
        );
        let session = Session::new(Arc::new(User::new("tester")));
        let (tx, mut rx) = mpsc::channel(4);
        let batch = Batch {
            pool,
            config: DispatchConfig::default(),
            claim: session.claim(ClaimCounts::generations(2)),
            events: tx,
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
            completed: AtomicU32::new(0),
            images: AtomicUsize::new(0),
        };

        batch.fail(&anyhow::anyhow!("disk full on worker one")).await;
        batch.fail(&anyhow::anyhow!("socket closed on worker two")).await;
        drop(batch);

        assert!(matches!(
            rx.recv().await,
            Some(DispatchEvent::Error { message, .. }) if message == GENERIC_FAILURE
        ));
        assert_eq!(rx.recv().await, None);
        let output = logs.contents();
        assert!(output.contains("disk full on worker one"), "missing log: {output}");
        assert!(!output.contains("socket closed on worker two"), "extra log: {output}");
    }
}
