//! Test doubles for flock pools.
//!
//! - [`MockAdapter`] - scripted in-memory backend that records its calls
//! - [`ScriptedTransport`] - fake server for the HTTP and peer adapters
//! - [`running_pool`] and the `wait_*` helpers for pool setup

pub mod mock;
pub mod pool;
pub mod transport;

pub use mock::*;
pub use pool::*;
pub use transport::*;
