use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::{Settings, WorkerId};

/// How `acquire` picks among several eligible workers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// First eligible worker in registration order.
    #[default]
    FirstEligible,
    /// Eligible worker whose last lease ended longest ago; never-used workers first.
    LeastRecentlyReleased,
}

/// Configuration for the pool manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Initialisation attempts before a worker is left errored.
    pub max_init_attempts: u32,
    /// Delay before a failed initialisation is re-queued, in milliseconds.
    pub init_retry_delay_ms: u64,
    /// Upper bound between eligibility re-checks while waiting for a lease, in milliseconds.
    pub acquire_poll_interval_ms: u64,
    /// Longest an administrative operation waits for a worker to drain, in seconds.
    pub drain_timeout_secs: u64,
    /// Time shutdown waits for in-flight leases before stopping adapters, in seconds.
    pub shutdown_grace_secs: u64,
    /// Lease selection policy.
    pub selection_policy: SelectionPolicy,
    /// Identity of this instance, used to refuse peer connections to ourselves.
    pub instance_id: Uuid,
    /// Capacity of the pool event broadcast channel.
    pub event_capacity: usize,
}

impl PoolConfig {
    pub fn with_max_init_attempts(mut self, attempts: u32) -> Self {
        self.max_init_attempts = attempts;
        self
    }

    pub fn with_init_retry_delay(mut self, ms: u64) -> Self {
        self.init_retry_delay_ms = ms;
        self
    }

    pub fn with_acquire_poll_interval(mut self, ms: u64) -> Self {
        self.acquire_poll_interval_ms = ms;
        self
    }

    pub fn with_drain_timeout(mut self, secs: u64) -> Self {
        self.drain_timeout_secs = secs;
        self
    }

    pub fn with_shutdown_grace(mut self, secs: u64) -> Self {
        self.shutdown_grace_secs = secs;
        self
    }

    pub fn with_selection_policy(mut self, policy: SelectionPolicy) -> Self {
        self.selection_policy = policy;
        self
    }

    pub fn with_instance_id(mut self, id: Uuid) -> Self {
        self.instance_id = id;
        self
    }

    pub fn init_retry_delay(&self) -> Duration {
        Duration::from_millis(self.init_retry_delay_ms)
    }

    pub fn acquire_poll_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_poll_interval_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_init_attempts: 3,
            init_retry_delay_ms: 1000,
            acquire_poll_interval_ms: 1000,
            drain_timeout_secs: 120,
            shutdown_grace_secs: 5,
            selection_policy: SelectionPolicy::FirstEligible,
            instance_id: Uuid::new_v4(),
            event_capacity: 256,
        }
    }
}

/// Configuration for the dispatch engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum units of one batch in flight at once.
    pub max_degree: usize,
    /// Lease wait per unit in seconds; `None` waits without limit.
    pub lease_timeout_secs: Option<u64>,
    /// Times a unit may be moved to another worker on a redirect.
    pub max_redirects: u32,
    /// Use the adapters' streaming path and forward progress events.
    pub streaming: bool,
}

impl DispatchConfig {
    pub fn with_max_degree(mut self, degree: usize) -> Self {
        self.max_degree = degree;
        self
    }

    pub fn with_lease_timeout(mut self, secs: Option<u64>) -> Self {
        self.lease_timeout_secs = secs;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn lease_timeout(&self) -> Option<Duration> {
        self.lease_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_degree: 4,
            lease_timeout_secs: Some(120),
            max_redirects: 3,
            streaming: false,
        }
    }
}

/// Top-level configuration file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlockConfig {
    pub pool: PoolConfig,
    pub dispatch: DispatchConfig,
    /// Where registered backends are saved and loaded from.
    pub backends_file: Option<PathBuf>,
}

impl FlockConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("parsing flock configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&raw)
    }
}

/// One saved backend registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendEntry {
    pub id: WorkerId,
    #[serde(rename = "type")]
    pub type_id: String,
    pub title: String,
    pub enabled: bool,
    #[serde(default)]
    pub settings: Settings,
}

/// The saved set of registered backends.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendsFile {
    #[serde(default)]
    pub backends: Vec<BackendEntry>,
}

impl BackendsFile {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self).context("serializing backends")?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, raw).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("replacing {}", path.display()))
    }
}
