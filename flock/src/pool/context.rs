use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::backends::BackendAdapter;
use crate::error::PoolError;
use crate::pool::PoolInner;
use crate::signal::CancelToken;
use crate::worker::{BackendStatus, Settings, WorkerId, WorkerRecord};

/// The view of its worker and pool that an adapter gets.
///
/// Adapters report status through the context so waiters in the pool are
/// woken and events are published. Background tasks may keep a clone; once
/// the pool is gone, pool-level operations become no-ops.
#[derive(Clone)]
pub struct WorkerContext {
    record: Arc<WorkerRecord>,
    pool: Weak<PoolInner>,
}

impl WorkerContext {
    pub(crate) fn new(record: Arc<WorkerRecord>, pool: Weak<PoolInner>) -> Self {
        Self { record, pool }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.record.id()
    }

    pub fn record(&self) -> &Arc<WorkerRecord> {
        &self.record
    }

    /// Identity of the owning pool, once it is still alive.
    pub fn instance_id(&self) -> Option<Uuid> {
        self.pool.upgrade().map(|pool| pool.config().instance_id)
    }

    pub fn settings(&self) -> Settings {
        self.record.settings()
    }

    pub fn status(&self) -> BackendStatus {
        self.record.status()
    }

    pub fn set_status(&self, status: BackendStatus) {
        match self.pool.upgrade() {
            Some(pool) => pool.set_status(&self.record, status),
            None => {
                self.record.set_status(status);
            }
        }
    }

    /// Move to `to` only from one of `from`. Returns whether it moved.
    pub fn transition(&self, from: &[BackendStatus], to: BackendStatus) -> bool {
        match self.pool.upgrade() {
            Some(pool) => pool.transition(&self.record, from, to),
            None => self.record.transition(from, to).is_some(),
        }
    }

    pub fn set_features(&self, features: BTreeSet<String>) {
        let changed = {
            let mut state = self.record.state.lock();
            if state.features == features {
                false
            } else {
                state.features = features;
                true
            }
        };
        if changed {
            if let Some(pool) = self.pool.upgrade() {
                pool.signal();
            }
        }
    }

    pub fn set_current_model(&self, model: Option<String>) {
        self.record.state.lock().current_model = model;
    }

    /// Signal that fires when the pool starts draining. Already fired if the
    /// pool is gone.
    pub fn shutdown_token(&self) -> CancelToken {
        match self.pool.upgrade() {
            Some(pool) => pool.draining().clone(),
            None => {
                let token = CancelToken::new();
                token.cancel();
                token
            }
        }
    }

    pub fn is_draining(&self) -> bool {
        self.pool
            .upgrade()
            .is_none_or(|pool| pool.draining().is_cancelled())
    }

    /// Add a shadow worker delegating to `adapter`, parented to this worker.
    pub fn register_shadow(&self, adapter: Arc<dyn BackendAdapter>) -> Result<WorkerId, PoolError> {
        let pool = self.pool.upgrade().ok_or(PoolError::ShuttingDown)?;
        pool.register_shadow(&self.record, adapter)
    }

    /// Remove another worker once its current lease, if any, is returned.
    pub async fn retire_worker(&self, id: WorkerId) -> bool {
        match self.pool.upgrade() {
            Some(pool) => pool.retire(id).await,
            None => false,
        }
    }

    /// Put this worker back in the init queue.
    pub fn requeue(&self) -> bool {
        let Some(pool) = self.pool.upgrade() else {
            return false;
        };
        if pool.draining().is_cancelled() || pool.get(self.worker_id()).is_none() {
            return false;
        }
        pool.set_status(&self.record, BackendStatus::Waiting);
        pool.enqueue_init(self.worker_id());
        true
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("worker_id", &self.record.id())
            .field("pool_alive", &(self.pool.strong_count() > 0))
            .finish()
    }
}
