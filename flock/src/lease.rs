use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backends::BackendAdapter;
use crate::pool::PoolInner;
use crate::worker::{WorkerId, WorkerRecord};

/// Unique identifier for a backend lease.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    /// Create a new lease ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exclusive hold on one worker.
///
/// Only [`PoolManager::acquire`](crate::PoolManager::acquire) creates leases.
/// The worker is handed back when [`release`](Self::release) is called or the
/// lease is dropped, whichever comes first; further releases are no-ops.
pub struct BackendLease {
    lease_id: LeaseId,
    record: Arc<WorkerRecord>,
    adapter: Arc<dyn BackendAdapter>,
    pool: Weak<PoolInner>,
    acquired_at: Instant,
    released: AtomicBool,
}

impl BackendLease {
    pub(crate) fn new(
        record: Arc<WorkerRecord>,
        adapter: Arc<dyn BackendAdapter>,
        pool: Weak<PoolInner>,
    ) -> Self {
        Self {
            lease_id: LeaseId::new(),
            record,
            adapter,
            pool,
            acquired_at: Instant::now(),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> LeaseId {
        self.lease_id
    }

    pub fn worker_id(&self) -> WorkerId {
        self.record.id()
    }

    pub fn worker(&self) -> &Arc<WorkerRecord> {
        &self.record
    }

    pub fn adapter(&self) -> &Arc<dyn BackendAdapter> {
        &self.adapter
    }

    /// Time since the lease was handed out.
    pub fn held_for(&self) -> std::time::Duration {
        self.acquired_at.elapsed()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Hand the worker back to the pool.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.pool.upgrade() {
            Some(pool) => pool.release_record(&self.record, self.lease_id, self.held_for()),
            None => {
                self.record.state.lock().in_use = false;
            }
        }
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for BackendLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLease")
            .field("lease_id", &self.lease_id)
            .field("worker_id", &self.record.id())
            .field("released", &self.is_released())
            .finish()
    }
}
