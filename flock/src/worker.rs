use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backends::BackendAdapter;

/// Opaque adapter settings, parsed by each adapter into its own settings type.
pub type Settings = serde_json::Map<String, serde_json::Value>;

/// Stable identifier of a registered worker, unique for the pool's lifetime.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerId(pub i64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// Turned off by an administrator, or nothing to run.
    Disabled,
    /// Failed and will not recover without intervention.
    Errored,
    /// Queued for initialisation.
    Waiting,
    /// Initialisation in progress.
    Loading,
    /// Reachable peer that is temporarily unavailable; not an error.
    Idle,
    /// Ready to serve leases.
    Running,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Disabled => "disabled",
            BackendStatus::Errored => "errored",
            BackendStatus::Waiting => "waiting",
            BackendStatus::Loading => "loading",
            BackendStatus::Idle => "idle",
            BackendStatus::Running => "running",
        }
    }

    /// Only running workers may be leased.
    pub fn is_leasable(&self) -> bool {
        matches!(self, BackendStatus::Running)
    }

    /// Running, or on its way to running.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            BackendStatus::Running | BackendStatus::Loading | BackendStatus::Waiting
        )
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) struct WorkerState {
    pub(crate) title: String,
    pub(crate) settings: Settings,
    pub(crate) status: BackendStatus,
    pub(crate) enabled: bool,
    pub(crate) modcount: u64,
    pub(crate) init_attempts: u32,
    pub(crate) features: BTreeSet<String>,
    pub(crate) current_model: Option<String>,
    // `in_use` and `reserved` are only written while the pool's record lock is held.
    pub(crate) in_use: bool,
    pub(crate) reserved: bool,
    pub(crate) last_released: Option<DateTime<Utc>>,
    pub(crate) usages: u64,
    pub(crate) adapter: Arc<dyn BackendAdapter>,
}

/// One registered backend instance.
///
/// Records are shared between the pool, leases, adapter background tasks and
/// the init worker. Identity fields are immutable; everything else lives
/// behind a short-lived lock.
pub struct WorkerRecord {
    id: WorkerId,
    type_id: String,
    is_real: bool,
    parent: Option<WorkerId>,
    pub(crate) state: Mutex<WorkerState>,
}

impl WorkerRecord {
    pub(crate) fn new(
        id: WorkerId,
        type_id: impl Into<String>,
        title: impl Into<String>,
        settings: Settings,
        enabled: bool,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Self {
        Self {
            id,
            type_id: type_id.into(),
            is_real: true,
            parent: None,
            state: Mutex::new(WorkerState {
                title: title.into(),
                settings,
                status: if enabled {
                    BackendStatus::Waiting
                } else {
                    BackendStatus::Disabled
                },
                enabled,
                modcount: 0,
                init_attempts: 0,
                features: BTreeSet::new(),
                current_model: None,
                in_use: false,
                reserved: false,
                last_released: None,
                usages: 0,
                adapter,
            }),
        }
    }

    pub(crate) fn new_shadow(
        id: WorkerId,
        parent: &WorkerRecord,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Self {
        let (title, settings) = {
            let state = parent.state.lock();
            (
                format!("{} (shadow {})", state.title, id),
                state.settings.clone(),
            )
        };
        let mut record =
            Self::new(id, parent.type_id.clone(), title, settings, true, adapter);
        record.is_real = false;
        record.parent = Some(parent.id);
        record
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    /// False for shadow records spawned by a remote-peer adapter.
    pub fn is_real(&self) -> bool {
        self.is_real
    }

    pub fn parent(&self) -> Option<WorkerId> {
        self.parent
    }

    pub fn status(&self) -> BackendStatus {
        self.state.lock().status
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn is_in_use(&self) -> bool {
        self.state.lock().in_use
    }

    pub fn title(&self) -> String {
        self.state.lock().title.clone()
    }

    pub fn settings(&self) -> Settings {
        self.state.lock().settings.clone()
    }

    pub fn features(&self) -> BTreeSet<String> {
        self.state.lock().features.clone()
    }

    pub fn current_model(&self) -> Option<String> {
        self.state.lock().current_model.clone()
    }

    pub(crate) fn adapter(&self) -> Arc<dyn BackendAdapter> {
        Arc::clone(&self.state.lock().adapter)
    }

    /// Set the status, returning the previous one.
    pub(crate) fn set_status(&self, status: BackendStatus) -> BackendStatus {
        std::mem::replace(&mut self.state.lock().status, status)
    }

    /// Move to `to` only if the current status is one of `from`.
    pub(crate) fn transition(
        &self,
        from: &[BackendStatus],
        to: BackendStatus,
    ) -> Option<BackendStatus> {
        let mut state = self.state.lock();
        if from.contains(&state.status) {
            Some(std::mem::replace(&mut state.status, to))
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let state = self.state.lock();
        WorkerSnapshot {
            id: self.id,
            type_id: self.type_id.clone(),
            title: state.title.clone(),
            status: state.status,
            enabled: state.enabled,
            is_real: self.is_real,
            parent: self.parent,
            settings: state.settings.clone(),
            modcount: state.modcount,
            features: state.features.clone(),
            current_model: state.current_model.clone(),
            in_use: state.in_use,
            reserved: state.reserved,
            usages: state.usages,
            seconds_since_used: state
                .last_released
                .map(|at| (Utc::now() - at).num_seconds().max(0)),
        }
    }
}

impl fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("WorkerRecord");
        debug
            .field("id", &self.id)
            .field("type_id", &self.type_id)
            .field("is_real", &self.is_real);
        match self.state.try_lock() {
            Some(state) => {
                debug
                    .field("status", &state.status)
                    .field("in_use", &state.in_use)
                    .field("reserved", &state.reserved);
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

/// Point-in-time view of a worker for listings and routing filters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    #[serde(rename = "type")]
    pub type_id: String,
    pub title: String,
    pub status: BackendStatus,
    pub enabled: bool,
    pub is_real: bool,
    pub parent: Option<WorkerId>,
    pub settings: Settings,
    pub modcount: u64,
    pub features: BTreeSet<String>,
    pub current_model: Option<String>,
    pub in_use: bool,
    pub reserved: bool,
    pub usages: u64,
    pub seconds_since_used: Option<i64>,
}

/// Overall pool health as shown to an operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub status: &'static str,
    pub class: &'static str,
    pub message: String,
}

impl StatusSummary {
    /// Summarise a set of worker statuses, most severe condition first.
    pub fn from_statuses(statuses: &[BackendStatus]) -> Self {
        let count = |wanted: BackendStatus| {
            statuses.iter().filter(|status| **status == wanted).count()
        };
        let running = count(BackendStatus::Running);
        let loading = count(BackendStatus::Loading) + count(BackendStatus::Waiting);
        let errored = count(BackendStatus::Errored);
        let disabled = count(BackendStatus::Disabled);
        let idle = count(BackendStatus::Idle);

        let (status, class, message) = if statuses.is_empty() {
            ("empty", "warn", "No backends present. You must configure backends.".to_string())
        } else if disabled == statuses.len() {
            ("all_disabled", "warn", "All backends are disabled.".to_string())
        } else if errored > 0 && running == 0 && loading == 0 {
            ("errored", "error", "Backends have errored. Check the server logs.".to_string())
        } else if running > 0 && loading > 0 {
            (
                "some_loading",
                "soft",
                format!("{running} backends running, {loading} still loading."),
            )
        } else if running > 0 {
            ("running", "ok", String::new())
        } else if loading > 0 {
            ("loading", "soft", "Backends are still loading.".to_string())
        } else if idle > 0 {
            ("idle", "soft", "All available backends are idle.".to_string())
        } else if disabled > 0 {
            ("disabled", "warn", "All usable backends are disabled.".to_string())
        } else {
            ("unknown", "warn", "Backend status is unknown.".to_string())
        };

        Self {
            status,
            class,
            message,
        }
    }
}
