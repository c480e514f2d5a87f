//! Per-session accounting of outstanding generation work.
//!
//! A [`Session`] owns any number of [`Claim`]s. Each claim carries four
//! counters; the session keeps running totals that always equal the sum over
//! its live claims. Claims release whatever they still hold when dropped, so a
//! caller that bails out early cannot leak counts into the session.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signal::CancelToken;

/// Identifier of a claim within its session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimId(pub Uuid);

impl ClaimId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work counters tracked by a claim and aggregated per session.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCounts {
    /// Generations still owed to the caller. This is the claim's amount.
    pub generations: u64,
    pub model_loads: u64,
    /// Units currently waiting for a lease.
    pub backend_waits: u64,
    /// Units currently running on a backend.
    pub live_generations: u64,
}

impl ClaimCounts {
    pub fn generations(n: u64) -> Self {
        Self {
            generations: n,
            ..Self::default()
        }
    }

    pub fn backend_waits(n: u64) -> Self {
        Self {
            backend_waits: n,
            ..Self::default()
        }
    }

    pub fn live_generations(n: u64) -> Self {
        Self {
            live_generations: n,
            ..Self::default()
        }
    }

    pub fn model_loads(n: u64) -> Self {
        Self {
            model_loads: n,
            ..Self::default()
        }
    }

    fn add(&mut self, other: ClaimCounts) {
        self.generations += other.generations;
        self.model_loads += other.model_loads;
        self.backend_waits += other.backend_waits;
        self.live_generations += other.live_generations;
    }

    /// Subtract up to `other`, clamped at zero per counter. Returns what was
    /// actually removed.
    fn take(&mut self, other: ClaimCounts) -> ClaimCounts {
        let removed = ClaimCounts {
            generations: other.generations.min(self.generations),
            model_loads: other.model_loads.min(self.model_loads),
            backend_waits: other.backend_waits.min(self.backend_waits),
            live_generations: other.live_generations.min(self.live_generations),
        };
        self.generations -= removed.generations;
        self.model_loads -= removed.model_loads;
        self.backend_waits -= removed.backend_waits;
        self.live_generations -= removed.live_generations;
        removed
    }

    fn subtract_saturating(&mut self, other: ClaimCounts) {
        self.generations = self.generations.saturating_sub(other.generations);
        self.model_loads = self.model_loads.saturating_sub(other.model_loads);
        self.backend_waits = self.backend_waits.saturating_sub(other.backend_waits);
        self.live_generations =
            self.live_generations.saturating_sub(other.live_generations);
    }
}

/// The account a session belongs to. Only permission flags matter here.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub permissions: HashSet<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            permissions: HashSet::new(),
        }
    }

    pub fn with_permission(mut self, flag: impl Into<String>) -> Self {
        self.permissions.insert(flag.into());
        self
    }

    pub fn has_permission(&self, flag: &str) -> bool {
        self.permissions.contains(flag)
    }
}

#[derive(Default)]
struct Ledger {
    claims: HashMap<ClaimId, ClaimCounts>,
    totals: ClaimCounts,
}

struct SessionInner {
    id: String,
    user: Arc<User>,
    interrupt: Mutex<CancelToken>,
    ledger: Mutex<Ledger>,
}

/// A client's logical connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(user: Arc<User>) -> Self {
        Self::with_id(random_session_id(), user)
    }

    pub fn with_id(id: impl Into<String>, user: Arc<User>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                user,
                interrupt: Mutex::new(CancelToken::new()),
                ledger: Mutex::new(Ledger::default()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn user(&self) -> &Arc<User> {
        &self.inner.user
    }

    /// Open a claim for the given amount of work.
    pub fn claim(&self, counts: ClaimCounts) -> Claim {
        let id = ClaimId::new();
        {
            let mut ledger = self.inner.ledger.lock();
            ledger.claims.insert(id, counts);
            ledger.totals.add(counts);
        }
        Claim {
            id,
            session: Arc::clone(&self.inner),
            interrupt: InterruptSignal::new(self.inner.interrupt.lock().clone()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Sum of all live claims' generation amounts.
    pub fn waiting_generations(&self) -> u64 {
        self.inner.ledger.lock().totals.generations
    }

    /// Aggregate of every counter over live claims.
    pub fn totals(&self) -> ClaimCounts {
        self.inner.ledger.lock().totals
    }

    pub fn active_claims(&self) -> usize {
        self.inner.ledger.lock().claims.len()
    }

    /// Interrupt every claim opened so far. Claims opened afterwards start
    /// with a fresh signal.
    pub fn interrupt_all(&self) {
        let previous = {
            let mut interrupt = self.inner.interrupt.lock();
            std::mem::take(&mut *interrupt)
        };
        previous.cancel();
        tracing::info!(session_id = %self.inner.id, "session interrupted");
    }

    /// The signal new claims will inherit.
    pub fn interrupt_token(&self) -> CancelToken {
        self.inner.interrupt.lock().clone()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Session");
        debug
            .field("id", &self.inner.id)
            .field("user", &self.inner.user.id);
        match self.inner.ledger.try_lock() {
            Some(ledger) => {
                debug
                    .field("claims", &ledger.claims.len())
                    .field("totals", &ledger.totals);
            }
            None => {
                debug.field("ledger", &"<locked>");
            }
        }
        debug.finish()
    }
}

/// Interrupt seen by one claim: the session's signal at claim creation plus a
/// claim-local one.
#[derive(Clone, Debug, Default)]
pub struct InterruptSignal {
    session: CancelToken,
    local: CancelToken,
}

impl InterruptSignal {
    pub fn new(session: CancelToken) -> Self {
        Self {
            session,
            local: CancelToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.session.is_cancelled() || self.local.is_cancelled()
    }

    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.session.cancelled() => {}
            _ = self.local.cancelled() => {}
        }
    }
}

fn random_session_id() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Outstanding work registered on a session.
///
/// Dropping a claim disposes it. Disposal removes whatever the claim still
/// holds from the session totals and is idempotent.
pub struct Claim {
    id: ClaimId,
    session: Arc<SessionInner>,
    interrupt: InterruptSignal,
    disposed: AtomicBool,
}

impl Claim {
    pub fn id(&self) -> ClaimId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// Add work to the claim.
    pub fn extend(&self, counts: ClaimCounts) {
        let mut ledger = self.session.ledger.lock();
        let Some(held) = ledger.claims.get_mut(&self.id) else {
            return;
        };
        held.add(counts);
        ledger.totals.add(counts);
    }

    /// Mark work as finished. Counters never drop below zero.
    pub fn complete(&self, counts: ClaimCounts) {
        let mut ledger = self.session.ledger.lock();
        let Some(held) = ledger.claims.get_mut(&self.id) else {
            return;
        };
        let removed = held.take(counts);
        ledger.totals.subtract_saturating(removed);
    }

    /// What the claim still holds. Zero once disposed.
    pub fn counts(&self) -> ClaimCounts {
        self.session
            .ledger
            .lock()
            .claims
            .get(&self.id)
            .copied()
            .unwrap_or_default()
    }

    /// The claim's amount of outstanding generations.
    pub fn amount(&self) -> u64 {
        self.counts().generations
    }

    /// Trip the claim-local interrupt, leaving the session untouched.
    pub fn interrupt(&self) {
        self.interrupt.local.cancel();
    }

    /// True once the session or this claim was interrupted.
    pub fn should_cancel(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Wait for either interrupt.
    pub async fn cancelled(&self) {
        self.interrupt.cancelled().await
    }

    /// The claim's interrupt, for handing to adapters.
    pub fn interrupt_signal(&self) -> InterruptSignal {
        self.interrupt.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Release everything the claim still holds.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut ledger = self.session.ledger.lock();
        if let Some(remaining) = ledger.claims.remove(&self.id) {
            ledger.totals.subtract_saturating(remaining);
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("id", &self.id)
            .field("session_id", &self.session.id)
            .field("disposed", &self.is_disposed())
            .field("should_cancel", &self.should_cancel())
            .finish()
    }
}

/// Live sessions keyed by id.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, user: Arc<User>) -> Session {
        let session = Session::new(user);
        self.sessions
            .lock()
            .insert(session.id().to_string(), session.clone());
        session
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().get(id).cloned()
    }

    /// Forget a session and interrupt whatever it still has running.
    pub fn remove(&self, id: &str) -> Option<Session> {
        let removed = self.sessions.lock().remove(id);
        if let Some(session) = &removed {
            session.interrupt_all();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.len())
            .finish()
    }
}
