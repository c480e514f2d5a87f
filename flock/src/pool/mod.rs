//! The pool manager: worker registration, exclusive leasing and
//! administrative control.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::backends::{BackendAdapter, BackendRegistry, BackendTypeInfo};
use crate::config::{BackendEntry, BackendsFile, PoolConfig, SelectionPolicy};
use crate::error::PoolError;
use crate::events::{InProcEventBus, PoolEvent, PoolEventPayload, PoolEventPublisher};
use crate::lease::{BackendLease, LeaseId};
use crate::signal::CancelToken;
use crate::telemetry;
use crate::worker::{
    BackendStatus, Settings, StatusSummary, WorkerId, WorkerRecord, WorkerSnapshot,
};

mod context;
mod init;

pub use context::WorkerContext;

/// Value passed to [`PoolManager::load_model_on_all`] meaning "no model".
pub const NO_MODEL: &str = "(none)";

pub(crate) struct PoolInner {
    config: PoolConfig,
    registry: BackendRegistry,
    // Pool-wide lock: every `in_use`/`reserved` change happens while it is held.
    records: Mutex<BTreeMap<WorkerId, Arc<WorkerRecord>>>,
    next_id: AtomicI64,
    changed: Notify,
    draining: CancelToken,
    has_shutdown: AtomicBool,
    init_tx: mpsc::UnboundedSender<WorkerId>,
    init_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerId>>>,
    events: InProcEventBus,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PoolInner {
    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn draining(&self) -> &CancelToken {
        &self.draining
    }

    pub(crate) fn get(&self, id: WorkerId) -> Option<Arc<WorkerRecord>> {
        self.records.lock().get(&id).cloned()
    }

    fn allocate_id(&self) -> WorkerId {
        WorkerId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn emit(&self, worker_id: WorkerId, payload: PoolEventPayload) {
        self.events.emit(PoolEvent::new(worker_id, payload));
    }

    /// Wake every task waiting on a pool change.
    pub(crate) fn signal(&self) {
        self.changed.notify_waiters();
    }

    pub(crate) fn status_changed(
        &self,
        record: &WorkerRecord,
        from: BackendStatus,
        to: BackendStatus,
    ) {
        if from == to {
            return;
        }
        tracing::debug!(worker_id = %record.id(), %from, %to, "worker status changed");
        telemetry::record_status_change(record.id(), from, to);
        self.emit(record.id(), PoolEventPayload::StatusChanged { from, to });
        self.signal();
    }

    pub(crate) fn set_status(&self, record: &WorkerRecord, status: BackendStatus) {
        let previous = record.set_status(status);
        self.status_changed(record, previous, status);
    }

    pub(crate) fn transition(
        &self,
        record: &WorkerRecord,
        from: &[BackendStatus],
        to: BackendStatus,
    ) -> bool {
        match record.transition(from, to) {
            Some(previous) => {
                self.status_changed(record, previous, to);
                true
            }
            None => false,
        }
    }

    pub(crate) fn enqueue_init(&self, id: WorkerId) {
        if self.draining.is_cancelled() {
            return;
        }
        if self.init_tx.send(id).is_err() {
            tracing::warn!(worker_id = %id, "init queue closed; worker not initialized");
        }
    }

    fn insert(&self, record: Arc<WorkerRecord>) {
        let id = record.id();
        let type_id = record.type_id().to_string();
        let is_real = record.is_real();
        self.records.lock().insert(id, record);
        self.emit(id, PoolEventPayload::Registered { type_id, is_real });
    }

    pub(crate) fn register_shadow(
        &self,
        parent: &WorkerRecord,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Result<WorkerId, PoolError> {
        if self.draining.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }
        let id = self.allocate_id();
        let record = Arc::new(WorkerRecord::new_shadow(id, parent, adapter));
        self.insert(record);
        self.enqueue_init(id);
        tracing::info!(worker_id = %id, parent_id = %parent.id(), "registered shadow worker");
        Ok(id)
    }

    /// Drop a record from the pool without shutting its adapter down.
    pub(crate) fn remove(&self, id: WorkerId) -> bool {
        let removed = self.records.lock().remove(&id).is_some();
        if removed {
            self.emit(id, PoolEventPayload::Deleted);
            self.signal();
        }
        removed
    }

    /// Pick and lease an eligible worker. Workers whose current model is
    /// `preferred_model` win over the selection policy.
    /// Stop handing out `id`, wait for its lease to come back, then drop it.
    ///
    /// Once the pool is draining the wait is skipped; shutdown has already
    /// given leases their grace period.
    pub(crate) async fn retire(self: &Arc<Self>, id: WorkerId) -> bool {
        let Some(record) = self.get(id) else {
            return false;
        };
        self.set_status(&record, BackendStatus::Disabled);
        if !self.draining.is_cancelled() {
            if let Err(err) = self.reserve(&record).await {
                tracing::warn!(worker_id = %id, "removing worker that did not drain: {err}");
            }
        }
        self.remove(id)
    }

    fn try_acquire(
        self: &Arc<Self>,
        preferred_model: Option<&str>,
        filter: &(dyn Fn(&WorkerRecord) -> bool + Send + Sync),
    ) -> Result<Option<BackendLease>, PoolError> {
        if self.draining.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }
        let records = self.records.lock();
        let mut any_live = false;
        let mut chosen: Option<(&Arc<WorkerRecord>, bool, Option<chrono::DateTime<Utc>>)> = None;

        for record in records.values() {
            if !filter(record) {
                continue;
            }
            let state = record.state.lock();
            if state.enabled && state.status.is_live() {
                any_live = true;
            }
            if !state.status.is_leasable() || state.in_use || state.reserved {
                continue;
            }
            let has_model =
                preferred_model.is_some_and(|model| state.current_model.as_deref() == Some(model));
            let better = match &chosen {
                None => true,
                Some((_, best_has_model, _)) if has_model != *best_has_model => has_model,
                Some((_, _, best)) => match self.config.selection_policy {
                    SelectionPolicy::FirstEligible => false,
                    SelectionPolicy::LeastRecentlyReleased => match (state.last_released, best) {
                        (None, Some(_)) => true,
                        (Some(at), Some(best_at)) => at < *best_at,
                        _ => false,
                    },
                },
            };
            if better {
                chosen = Some((record, has_model, state.last_released));
            }
            if self.config.selection_policy == SelectionPolicy::FirstEligible
                && (preferred_model.is_none() || has_model)
            {
                break;
            }
        }

        let Some((record, _, _)) = chosen else {
            return if any_live {
                Ok(None)
            } else {
                Err(PoolError::Unavailable)
            };
        };

        let adapter = {
            let mut state = record.state.lock();
            state.in_use = true;
            Arc::clone(&state.adapter)
        };
        let lease = BackendLease::new(Arc::clone(record), adapter, Arc::downgrade(self));
        drop(records);

        self.emit(
            lease.worker_id(),
            PoolEventPayload::LeaseAcquired {
                lease_id: lease.id(),
            },
        );
        Ok(Some(lease))
    }

    pub(crate) fn release_record(&self, record: &WorkerRecord, lease_id: LeaseId, held: Duration) {
        {
            let _records = self.records.lock();
            let mut state = record.state.lock();
            state.in_use = false;
            state.usages += 1;
            state.last_released = Some(Utc::now());
        }
        telemetry::record_lease_released(record.id(), held);
        self.emit(record.id(), PoolEventPayload::LeaseReleased { lease_id });
        self.signal();
    }

    /// Block new leases on `record` and wait until the current one is returned.
    async fn reserve(self: &Arc<Self>, record: &Arc<WorkerRecord>) -> Result<Reservation, PoolError> {
        let deadline = Instant::now() + self.config.drain_timeout();
        let poll = self.config.acquire_poll_interval().min(Duration::from_millis(500));

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let _records = self.records.lock();
                let mut state = record.state.lock();
                if !state.reserved {
                    state.reserved = true;
                    break;
                }
            }
            if Instant::now() >= deadline {
                return Err(PoolError::Timeout);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }

        let reservation = Reservation {
            pool: Arc::clone(self),
            record: Arc::clone(record),
        };
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !record.is_in_use() {
                return Ok(reservation);
            }
            if Instant::now() >= deadline {
                tracing::warn!(worker_id = %record.id(), "timed out waiting for worker to drain");
                return Err(PoolError::Timeout);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

/// Clears `reserved` when dropped.
struct Reservation {
    pool: Arc<PoolInner>,
    record: Arc<WorkerRecord>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        {
            let _records = self.pool.records.lock();
            self.record.state.lock().reserved = false;
        }
        self.pool.signal();
    }
}

/// Owns the set of workers and hands out exclusive leases on them.
///
/// Cloning is cheap; all clones share one pool.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let workers = self
            .inner
            .records
            .try_lock()
            .map(|records| records.len())
            .unwrap_or_default();
        f.debug_struct("PoolManager")
            .field("config", &self.inner.config)
            .field("workers", &workers)
            .field("draining", &self.inner.draining.is_cancelled())
            .finish()
    }
}

impl PoolManager {
    /// Create a pool. Call [`start`](Self::start) to begin initialising workers.
    pub fn new(config: PoolConfig, registry: BackendRegistry) -> Self {
        let (init_tx, init_rx) = mpsc::unbounded_channel();
        let events = InProcEventBus::new(config.event_capacity);
        Self {
            inner: Arc::new(PoolInner {
                config,
                registry,
                records: Mutex::new(BTreeMap::new()),
                next_id: AtomicI64::new(0),
                changed: Notify::new(),
                draining: CancelToken::new(),
                has_shutdown: AtomicBool::new(false),
                init_tx,
                init_rx: Mutex::new(Some(init_rx)),
                events,
                tasks: tokio::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.inner.registry
    }

    /// Start the background init worker. Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        let Some(rx) = self.inner.init_rx.lock().take() else {
            return Ok(());
        };
        let handle = tokio::spawn(init::run(Arc::downgrade(&self.inner), rx));
        self.inner.tasks.lock().await.push(handle);
        tracing::info!("backend pool started");
        Ok(())
    }

    pub fn events(&self) -> &InProcEventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.is_cancelled()
    }

    /// Register a worker of `type_id` and queue it for initialisation.
    pub fn register(&self, type_id: &str, settings: Settings) -> Result<Arc<WorkerRecord>> {
        self.register_with(type_id, "", settings, true)
    }

    pub fn register_with(
        &self,
        type_id: &str,
        title: &str,
        settings: Settings,
        enabled: bool,
    ) -> Result<Arc<WorkerRecord>> {
        let adapter = self.inner.registry.create(type_id, &settings)?;
        self.register_adapter(type_id, title, settings, enabled, adapter)
    }

    /// Register a worker around an adapter that was built elsewhere.
    pub fn register_adapter(
        &self,
        type_id: &str,
        title: &str,
        settings: Settings,
        enabled: bool,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Result<Arc<WorkerRecord>> {
        let id = self.inner.allocate_id();
        self.insert_record(id, type_id, title, settings, enabled, adapter)
    }

    fn insert_record(
        &self,
        id: WorkerId,
        type_id: &str,
        title: &str,
        settings: Settings,
        enabled: bool,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Result<Arc<WorkerRecord>> {
        if self.inner.draining.is_cancelled() {
            return Err(PoolError::ShuttingDown.into());
        }
        let title = if title.is_empty() {
            format!("{type_id} #{id}")
        } else {
            title.to_string()
        };
        let record = Arc::new(WorkerRecord::new(id, type_id, title, settings, enabled, adapter));
        self.inner.insert(Arc::clone(&record));
        tracing::info!(worker_id = %id, type_id, enabled, "registered worker");
        if enabled {
            self.inner.enqueue_init(id);
        }
        Ok(record)
    }

    /// Lease any running worker, waiting up to `max_wait` (`None` waits forever).
    pub async fn acquire(&self, max_wait: Option<Duration>) -> Result<BackendLease, PoolError> {
        self.acquire_matching(max_wait, |_| true).await
    }

    /// Lease a running worker accepted by `filter`.
    ///
    /// Fails immediately with [`PoolError::Unavailable`] when no accepted
    /// worker is running or on its way up, and with
    /// [`PoolError::ShuttingDown`] once the pool drains.
    pub async fn acquire_matching<F>(
        &self,
        max_wait: Option<Duration>,
        filter: F,
    ) -> Result<BackendLease, PoolError>
    where
        F: Fn(&WorkerRecord) -> bool + Send + Sync,
    {
        let started = Instant::now();
        let deadline = max_wait.map(|wait| started + wait);
        let result = self
            .wait_for_lease(deadline, None, &filter)
            .instrument(telemetry::acquire_span(max_wait))
            .await;
        telemetry::record_lease_acquired(&result, started.elapsed());
        result
    }

    /// Lease a worker that has `model` loaded, or load it on one.
    ///
    /// Workers already holding the model are preferred. Otherwise the chosen
    /// worker is asked to load it while leased; workers that cannot are
    /// skipped. When no accepted worker can provide the model the call fails
    /// with [`PoolError::InvalidData`]. `None` and [`NO_MODEL`] behave like
    /// [`acquire_matching`](Self::acquire_matching).
    pub async fn acquire_for_model<F>(
        &self,
        max_wait: Option<Duration>,
        model: Option<&str>,
        filter: F,
    ) -> Result<BackendLease, PoolError>
    where
        F: Fn(&WorkerRecord) -> bool + Send + Sync,
    {
        let Some(model) = model.filter(|model| *model != NO_MODEL) else {
            return self.acquire_matching(max_wait, filter).await;
        };
        let started = Instant::now();
        let deadline = max_wait.map(|wait| started + wait);
        let mut skipped: Vec<WorkerId> = Vec::new();

        let result = async {
            loop {
                let accept = |record: &WorkerRecord| !skipped.contains(&record.id()) && filter(record);
                let lease = match self.wait_for_lease(deadline, Some(model), &accept).await {
                    Ok(lease) => lease,
                    Err(PoolError::Unavailable) if !skipped.is_empty() => {
                        return Err(PoolError::InvalidData(format!(
                            "model '{model}' is not available on any backend"
                        )));
                    }
                    Err(err) => return Err(err),
                };
                let record = Arc::clone(lease.worker());
                if record.current_model().as_deref() == Some(model) {
                    return Ok(lease);
                }
                match lease.adapter().load_model(model).await {
                    Ok(true) => {
                        record.state.lock().current_model = Some(model.to_string());
                        tracing::info!(worker_id = %record.id(), model, "loaded model for request");
                        return Ok(lease);
                    }
                    Ok(false) => {
                        tracing::debug!(worker_id = %record.id(), model, "worker does not have model");
                    }
                    Err(err) => {
                        tracing::warn!(worker_id = %record.id(), model, "model load failed: {err:#}");
                    }
                }
                skipped.push(record.id());
            }
        }
        .instrument(telemetry::acquire_span(max_wait))
        .await;

        telemetry::record_lease_acquired(&result, started.elapsed());
        result
    }

    async fn wait_for_lease(
        &self,
        deadline: Option<Instant>,
        preferred_model: Option<&str>,
        filter: &(dyn Fn(&WorkerRecord) -> bool + Send + Sync),
    ) -> Result<BackendLease, PoolError> {
        let poll = self.inner.config.acquire_poll_interval();
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.inner.try_acquire(preferred_model, filter)? {
                return Ok(lease);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Timeout);
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
                _ = self.inner.draining.cancelled() => {}
            }
        }
    }

    /// Hand a lease back. Equivalent to dropping it.
    pub fn release(&self, lease: &BackendLease) {
        lease.release();
    }

    pub fn get(&self, id: WorkerId) -> Option<Arc<WorkerRecord>> {
        self.inner.get(id)
    }

    fn require(&self, id: WorkerId) -> Result<Arc<WorkerRecord>, PoolError> {
        self.inner.get(id).ok_or(PoolError::UnknownWorker(id))
    }

    /// Snapshots of every worker in registration order.
    pub fn list(&self) -> Vec<WorkerSnapshot> {
        self.records().iter().map(|record| record.snapshot()).collect()
    }

    fn records(&self) -> Vec<Arc<WorkerRecord>> {
        self.inner.records.lock().values().cloned().collect()
    }

    pub fn backend_types(&self) -> Vec<BackendTypeInfo> {
        self.inner.registry.types()
    }

    fn context(&self, record: &Arc<WorkerRecord>) -> WorkerContext {
        WorkerContext::new(Arc::clone(record), Arc::downgrade(&self.inner))
    }

    /// Enable or disable a worker. Returns false when it was already in that state.
    pub async fn toggle(&self, id: WorkerId, enabled: bool) -> Result<bool> {
        let record = self.require(id)?;
        if record.is_enabled() == enabled {
            return Ok(false);
        }
        let _reservation = self.inner.reserve(&record).await?;

        if !matches!(record.status(), BackendStatus::Disabled | BackendStatus::Errored) {
            record.adapter().shutdown(&self.context(&record)).await;
        }
        {
            let mut state = record.state.lock();
            state.enabled = enabled;
            state.init_attempts = 0;
        }
        if enabled {
            self.inner.set_status(&record, BackendStatus::Waiting);
            self.inner.enqueue_init(id);
        } else {
            self.inner.set_status(&record, BackendStatus::Disabled);
        }
        tracing::info!(worker_id = %id, enabled, "worker toggled");
        Ok(true)
    }

    /// Shut a worker down and remove it. Returns false when it did not exist.
    pub async fn delete(&self, id: WorkerId) -> Result<bool> {
        let Some(record) = self.inner.get(id) else {
            return Ok(false);
        };
        let reservation = self.inner.reserve(&record).await?;
        record.adapter().shutdown(&self.context(&record)).await;
        self.inner.set_status(&record, BackendStatus::Disabled);
        self.inner.remove(id);
        drop(reservation);

        let orphans: Vec<WorkerId> = self
            .records()
            .into_iter()
            .filter(|r| r.parent() == Some(id))
            .map(|r| r.id())
            .collect();
        for orphan in orphans {
            self.inner.remove(orphan);
        }
        tracing::info!(worker_id = %id, "worker deleted");
        Ok(true)
    }

    /// Replace a worker's title and settings and initialise it again.
    pub async fn edit(&self, id: WorkerId, title: Option<String>, settings: Settings) -> Result<()> {
        let record = self.require(id)?;
        let adapter = self.inner.registry.create(record.type_id(), &settings)?;
        let _reservation = self.inner.reserve(&record).await?;
        record.adapter().shutdown(&self.context(&record)).await;

        let (enabled, modcount) = {
            let mut state = record.state.lock();
            if let Some(title) = title {
                state.title = title;
            }
            state.settings = settings;
            state.adapter = adapter;
            state.modcount += 1;
            state.init_attempts = 0;
            state.features.clear();
            state.current_model = None;
            (state.enabled, state.modcount)
        };
        self.inner.emit(id, PoolEventPayload::Edited { modcount });
        if enabled {
            self.inner.set_status(&record, BackendStatus::Waiting);
            self.inner.enqueue_init(id);
        } else {
            self.inner.set_status(&record, BackendStatus::Disabled);
        }
        tracing::info!(worker_id = %id, modcount, "worker edited");
        Ok(())
    }

    /// Shut down and re-initialise a running or errored worker.
    pub async fn restart(&self, id: WorkerId) -> Result<bool> {
        let record = self.require(id)?;
        if !matches!(record.status(), BackendStatus::Running | BackendStatus::Errored) {
            return Ok(false);
        }
        let _reservation = self.inner.reserve(&record).await?;
        record.adapter().shutdown(&self.context(&record)).await;
        record.state.lock().init_attempts = 0;
        self.inner.set_status(&record, BackendStatus::Waiting);
        self.inner.enqueue_init(id);
        tracing::info!(worker_id = %id, "worker restarting");
        Ok(true)
    }

    /// Restart every real worker that is running or errored.
    pub async fn restart_all(&self) -> Result<usize> {
        let mut restarted = 0;
        for record in self.records().into_iter().filter(|r| r.is_real()) {
            if self.restart(record.id()).await? {
                restarted += 1;
            }
        }
        Ok(restarted)
    }

    /// Union of features offered by running workers.
    pub fn supported_features(&self) -> BTreeSet<String> {
        self.records()
            .iter()
            .filter(|record| record.status() == BackendStatus::Running)
            .flat_map(|record| record.features())
            .collect()
    }

    pub fn status_summary(&self) -> StatusSummary {
        let statuses: Vec<BackendStatus> = self
            .records()
            .iter()
            .filter(|record| record.is_real())
            .map(|record| record.status())
            .collect();
        StatusSummary::from_statuses(&statuses)
    }

    /// Load `model` on every running worker. True if any worker loaded it.
    pub async fn load_model_on_all(&self, model: &str) -> Result<bool> {
        if model == NO_MODEL {
            return Ok(true);
        }
        let running: Vec<_> = self
            .records()
            .into_iter()
            .filter(|record| record.status() == BackendStatus::Running)
            .collect();

        let loads = running.iter().map(|record| async move {
            let _reservation = match self.inner.reserve(record).await {
                Ok(reservation) => reservation,
                Err(err) => {
                    tracing::warn!(worker_id = %record.id(), "cannot reserve worker for model load: {err}");
                    return false;
                }
            };
            if record.status() != BackendStatus::Running {
                return false;
            }
            match record.adapter().load_model(model).await {
                Ok(true) => {
                    record.state.lock().current_model = Some(model.to_string());
                    true
                }
                Ok(false) => {
                    tracing::debug!(worker_id = %record.id(), model, "worker does not have model");
                    false
                }
                Err(err) => {
                    tracing::warn!(worker_id = %record.id(), model, "model load failed: {err:#}");
                    false
                }
            }
        });
        let results = futures::future::join_all(loads).await;
        Ok(results.into_iter().any(|loaded| loaded))
    }

    /// Ask every running worker to free memory. Returns how many did.
    pub async fn free_memory_all(&self, system_ram: bool) -> usize {
        let mut freed = 0;
        for record in self.records() {
            if record.status() != BackendStatus::Running {
                continue;
            }
            match record.adapter().free_memory(system_ram).await {
                Ok(true) => freed += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(worker_id = %record.id(), "free memory failed: {err:#}")
                }
            }
        }
        freed
    }

    /// Write every real worker to the backends file.
    pub fn save_backends(&self, path: impl AsRef<Path>) -> Result<()> {
        let backends = self
            .records()
            .iter()
            .filter(|record| record.is_real())
            .map(|record| {
                let snapshot = record.snapshot();
                BackendEntry {
                    id: snapshot.id,
                    type_id: snapshot.type_id,
                    title: snapshot.title,
                    enabled: snapshot.enabled,
                    settings: snapshot.settings,
                }
            })
            .collect();
        BackendsFile { backends }.write(path)
    }

    /// Register every backend in the file, keeping their ids. Unknown types and
    /// entries whose settings do not parse are skipped. Returns how many were
    /// registered.
    pub fn load_backends(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let file = BackendsFile::read(path)
            .with_context(|| format!("loading backends from {}", path.display()))?;
        let mut loaded = 0;
        for entry in file.backends {
            self.inner
                .next_id
                .fetch_max(entry.id.0 + 1, Ordering::SeqCst);
            if !self.inner.registry.contains(&entry.type_id) {
                tracing::warn!(worker_id = %entry.id, type_id = %entry.type_id, "skipping backend of unknown type");
                continue;
            }
            if self.inner.get(entry.id).is_some() {
                tracing::warn!(worker_id = %entry.id, "skipping backend with duplicate id");
                continue;
            }
            let adapter = match self.inner.registry.create(&entry.type_id, &entry.settings) {
                Ok(adapter) => adapter,
                Err(err) => {
                    tracing::warn!(worker_id = %entry.id, "skipping backend: {err:#}");
                    continue;
                }
            };
            self.insert_record(
                entry.id,
                &entry.type_id,
                &entry.title,
                entry.settings,
                entry.enabled,
                adapter,
            )?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Drain the pool and shut every adapter down. Later calls are no-ops.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.has_shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("shutting down backend pool");
        self.inner.draining.cancel();
        self.inner.signal();

        let deadline = Instant::now() + self.inner.config.shutdown_grace();
        let mut last_report = Instant::now();
        loop {
            // Enabled before the check so a release in between is not missed.
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let in_use = self.records().iter().filter(|r| r.is_in_use()).count();
            if in_use == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(in_use, "shutting down with workers still in use");
                break;
            }
            if last_report.elapsed() >= Duration::from_secs(2) {
                tracing::info!(in_use, "waiting for in-use workers before shutdown");
                last_report = Instant::now();
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline.min(last_report + Duration::from_secs(2))) => {}
            }
        }

        for record in self.records() {
            let ctx = self.context(&record);
            record.adapter().shutdown(&ctx).await;
            self.inner.set_status(&record, BackendStatus::Disabled);
        }

        let handles = {
            let mut guard = self.inner.tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("pool task failed: {:?}", e),
                Err(_) => tracing::warn!("pool task timed out during shutdown"),
            }
        }
        tracing::info!("backend pool shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
