use thiserror::Error;

use crate::worker::WorkerId;

/// Error conditions raised by the pool, its adapters and the dispatch engine.
///
/// Adapter and administrative operations return `anyhow::Result`; callers that
/// need to branch on one of these conditions recover it with
/// [`PoolError::find`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Settings or a start script were rejected. Never retried.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    /// Backend initialisation failed; the init worker retries it.
    #[error("backend failed to initialize: {0}")]
    InitFailed(String),
    /// No worker is running and none is on its way up.
    #[error("No backends available!")]
    Unavailable,
    /// The pool is draining; no further leases will be handed out.
    #[error("The backend pool is shutting down.")]
    ShuttingDown,
    /// A lease wait exceeded its deadline.
    #[error("Timeout! All backends are occupied with other tasks.")]
    Timeout,
    /// A peer answered with something that does not fit the protocol.
    #[error("remote protocol error: {0}")]
    RemoteProtocol(String),
    /// The peer no longer recognises our session id.
    #[error("remote session is no longer valid")]
    SessionInvalid,
    /// A self-started backend process died.
    #[error("backend process exited: {0}")]
    ProcessExited(String),
    /// The request parameters were rejected.
    #[error("Invalid data: {0}")]
    InvalidData(String),
    /// The operation is not valid in the current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    /// The peer reported a failure of its own.
    #[error("remote backend error: {0}")]
    Remote(String),
    /// The adapter cannot serve this request and asks for another worker.
    #[error("backend asked for the request to be redirected")]
    Redirect,
    /// No worker with this id is registered.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),
}

impl PoolError {
    /// Find a `PoolError` anywhere in an `anyhow` error chain.
    pub fn find(err: &anyhow::Error) -> Option<&PoolError> {
        err.chain().find_map(|cause| cause.downcast_ref::<PoolError>())
    }

    /// True for conditions where no lease can currently be handed out.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PoolError::Unavailable | PoolError::ShuttingDown)
    }

    /// True when the message is safe to show to the requesting user as-is.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            PoolError::Unavailable
                | PoolError::ShuttingDown
                | PoolError::Timeout
                | PoolError::InvalidData(_)
                | PoolError::InvalidOperation(_)
        )
    }
}
