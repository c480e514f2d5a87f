//! Flock - backend pool manager and generation dispatch engine.
//!
//! Flock keeps a set of heterogeneous image-generation backends (workers)
//! behind one pool, hands out exclusive leases on them, and fans batches of
//! generation requests out over whatever is running.
//!
//! # Core Concepts
//!
//! - **Worker**: A registered backend. Its [`WorkerRecord`] carries lifecycle
//!   status, features and usage counters; the actual talking is done by a
//!   [`BackendAdapter`].
//!
//! - **Adapters**: Three standard variants ship in [`backends`]: a direct HTTP
//!   client for web-ui style servers, a self-start variant that launches and
//!   supervises a local server process, and a remote peer that exposes another
//!   instance's workers through local shadow workers.
//!
//! - **Pool**: The [`PoolManager`] registers workers, initialises them in the
//!   background and guarantees that at most one [`BackendLease`] exists per
//!   worker at any time.
//!
//! - **Sessions**: A [`Session`] tracks outstanding work through [`Claim`]s
//!   and can interrupt it.
//!
//! - **Dispatch**: The [`DispatchEngine`] runs a batch of units for a session
//!   with bounded parallelism, forwarding images as they complete.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use flock::*;
//!
//! let registry = BackendRegistry::standard(BackendEnvironment::new());
//! let pool = PoolManager::new(PoolConfig::default(), registry);
//! pool.start().await?;
//! pool.load_backends("backends.json")?;
//!
//! let engine = DispatchEngine::new(pool.clone(), DispatchConfig::default());
//! let session = Session::new(std::sync::Arc::new(User::new("local")));
//! let (mut events, summary) = engine.spawn(session, GenerationRequest::new("a red fox"), 4);
//! while let Some(event) = events.recv().await {
//!     // forward images to the client
//! }
//! ```

/// Backend adapters and their registry.
///
/// The `backends` module defines the [`BackendAdapter`] trait every worker
/// type implements, the [`BackendRegistry`] that builds adapters from
/// settings, and the three standard adapters:
/// - [`HttpAdapter`] - a web-ui style server reached by URL
/// - [`SelfStartAdapter`] - a local server process the pool launches
/// - [`PeerAdapter`] - another instance of this system
pub mod backends;

/// Configuration structures for the pool and dispatch engine.
///
/// Includes [`PoolConfig`], [`DispatchConfig`], the TOML-loadable
/// [`FlockConfig`] and the JSON [`BackendsFile`] of saved registrations.
pub mod config;

/// Batch fan-out over the pool.
pub mod dispatch;

/// The [`PoolError`] taxonomy.
pub mod error;

/// Pool lifecycle events.
///
/// The `events` module provides [`PoolEvent`] and [`PoolEventPayload`] for
/// registration, status and lease changes, and [`InProcEventBus`] for
/// in-process broadcasting.
pub mod events;

/// Exclusive leases on workers.
pub mod lease;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
///
/// Counters, gauges and histograms for leases, worker initialisation and
/// generation units, registered in a crate-level registry.
pub mod metrics;

/// The pool manager.
///
/// The `pool` module provides [`PoolManager`], which owns every worker,
/// serialises lease hand-out under one pool-wide lock, runs the background
/// init worker and implements the administrative operations (toggle, edit,
/// delete, restart, model loading, persistence).
pub mod pool;

/// Generation parameters and results.
pub mod request;

/// Sessions, claims and interrupts.
///
/// The `session` module provides [`Session`], [`Claim`] and [`ClaimCounts`]
/// for accounting outstanding work, plus [`SessionStore`].
pub mod session;

/// One-shot cancellation signal.
pub mod signal;

/// Tracing spans and telemetry helpers.
pub mod telemetry;

/// Worker identity, status and records.
pub mod worker;

pub use backends::{
    BackendAdapter, BackendEnvironment, BackendRegistry, BackendType, BackendTypeInfo,
    HttpAdapter, InitOutcome, PeerAdapter, SelfStartAdapter, SettingDescription, StreamContext,
};
pub use config::*;
pub use dispatch::*;
pub use error::*;
pub use events::*;
pub use lease::*;
pub use pool::{NO_MODEL, PoolManager, WorkerContext};
pub use request::*;
pub use session::*;
pub use signal::*;
pub use worker::*;
