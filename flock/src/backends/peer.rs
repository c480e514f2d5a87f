//! Remote-peer adapter: another instance of this system used as a set of
//! pooled workers.
//!
//! The real worker owns the peer connection. For every additional backend the
//! peer reports as running, a shadow worker is registered locally; shadows
//! share the connection, so the local pool can keep as many requests in
//! flight as the peer can serve.
//!
//! Every remote call goes through [`PeerShared::with_session`], which
//! re-validates and retries when the peer reports that our session is gone.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::Instrument;
use uuid::Uuid;

use crate::backends::transport::{HttpTransport, PeerTransport};
use crate::backends::{
    BackendAdapter, BackendType, InitOutcome, SettingDescription, StreamContext, parse_settings,
};
use crate::error::PoolError;
use crate::pool::WorkerContext;
use crate::request::{GeneratedImage, GenerationEvent, GenerationRequest, ImageSet};
use crate::signal::CancelToken;
use crate::telemetry;
use crate::worker::{BackendStatus, WorkerId};

pub const TYPE_ID: &str = "peer";

/// Re-validations one call may trigger before giving up.
const MAX_REVALIDATIONS: u32 = 3;

/// Settings of a `peer` worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    /// Address of the other instance, usually `http://host:7801`.
    pub address: String,
    /// Go idle instead of errored while the peer is unreachable.
    pub allow_idle: bool,
    /// Stream progress over a websocket; otherwise block until images arrive.
    pub allow_websocket: bool,
    /// Re-check interval while loading or idle, in milliseconds.
    pub poll_interval_ms: u64,
    /// Re-check interval while running, in seconds.
    pub refresh_interval_secs: u64,
    /// Per-request timeout, in seconds.
    pub timeout_secs: u64,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            address: String::new(),
            allow_idle: false,
            allow_websocket: true,
            poll_interval_ms: 1000,
            refresh_interval_secs: 30,
            timeout_secs: 120,
        }
    }
}

impl PeerSettings {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

/// Raise the error a peer response carries, if any.
pub fn check_response(data: &Value) -> Result<(), PoolError> {
    if data.get("error_id").and_then(Value::as_str) == Some("invalid_session_id") {
        return Err(PoolError::SessionInvalid);
    }
    let Some(error) = data.get("error") else {
        return Ok(());
    };
    let text = error
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    Err(if let Some(rest) = text.strip_prefix("Invalid data: ") {
        PoolError::InvalidData(rest.to_string())
    } else if let Some(rest) = text.strip_prefix("Invalid operation: ") {
        PoolError::InvalidOperation(rest.to_string())
    } else {
        PoolError::Remote(text)
    })
}

/// What the peer reported about its backends.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteSummary {
    pub features: BTreeSet<String>,
    pub running: usize,
    pub any_loading: bool,
}

#[derive(Debug, Default)]
struct Connection {
    session_id: Option<String>,
    summary: RemoteSummary,
}

/// Connection state shared by a real peer worker and its shadows.
pub struct PeerShared {
    settings: PeerSettings,
    // Identity of the local pool, taken from the worker context on init.
    instance_id: parking_lot::Mutex<Option<Uuid>>,
    transport: Option<Arc<dyn PeerTransport>>,
    conn: parking_lot::Mutex<Connection>,
    validate_lock: tokio::sync::Mutex<()>,
    shadows: parking_lot::Mutex<Vec<WorkerId>>,
    stop: parking_lot::Mutex<CancelToken>,
}

impl PeerShared {
    fn transport(&self) -> Result<&Arc<dyn PeerTransport>> {
        self.transport.as_ref().ok_or_else(|| {
            PoolError::InvalidOperation("peer has no address configured".into()).into()
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.conn.lock().session_id.clone()
    }

    pub fn summary(&self) -> RemoteSummary {
        self.conn.lock().summary.clone()
    }

    /// Ask for a new session and refresh the backend list under it.
    ///
    /// Fails with [`PoolError::ConfigInvalid`] when the peer turns out to be
    /// this very instance.
    async fn validate_and_build(&self) -> Result<RemoteSummary> {
        let _guard = self.validate_lock.lock().await;
        self.validate_locked().await
    }

    async fn validate_locked(&self) -> Result<RemoteSummary> {
        let transport = self.transport()?;
        let data = transport.post_json("API/GetNewSession", &json!({})).await?;
        check_response(&data)?;
        let session_id = data
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| PoolError::RemoteProtocol("new session response has no session_id".into()))?
            .to_string();
        let own_id = *self.instance_id.lock();
        let server_id = data.get("server_id").and_then(Value::as_str);
        if own_id.is_some_and(|own| server_id == Some(own.to_string().as_str())) {
            tracing::error!(
                address = %self.settings.address,
                "peer is this instance; check the address being used"
            );
            return Err(PoolError::ConfigInvalid(format!(
                "peer at {} is this instance",
                self.settings.address
            ))
            .into());
        }
        let count_running = data
            .get("count_running")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        {
            let mut conn = self.conn.lock();
            conn.session_id = Some(session_id.clone());
            conn.summary.running = count_running as usize;
        }
        tracing::debug!(address = %self.settings.address, count_running, "peer session established");
        self.revise_once(&session_id).await
    }

    /// Replace `stale` with a fresh session unless another caller already did.
    async fn revalidate(&self, stale: &str) -> Result<()> {
        let _guard = self.validate_lock.lock().await;
        if self.session_id().as_deref() != Some(stale) {
            return Ok(());
        }
        tracing::debug!(address = %self.settings.address, "peer session invalid, re-validating");
        self.validate_locked().await.map(|_| ())
    }

    async fn current_session(&self) -> Result<String> {
        if let Some(session) = self.session_id() {
            return Ok(session);
        }
        let _guard = self.validate_lock.lock().await;
        if let Some(session) = self.session_id() {
            return Ok(session);
        }
        self.validate_locked().await?;
        self.session_id()
            .ok_or_else(|| PoolError::RemoteProtocol("peer session was not established".into()).into())
    }

    /// Run `call` with the current session id, re-validating and retrying
    /// when the peer reports the session as invalid.
    pub async fn with_session<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut(String) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut revalidations = 0;
        loop {
            let session = self.current_session().await?;
            match call(session.clone()).await {
                Err(err) if matches!(PoolError::find(&err), Some(PoolError::SessionInvalid)) => {
                    if revalidations >= MAX_REVALIDATIONS {
                        return Err(err.context(format!(
                            "peer rejected {MAX_REVALIDATIONS} fresh sessions in a row"
                        )));
                    }
                    revalidations += 1;
                    self.revalidate(&session).await?;
                }
                other => return other,
            }
        }
    }

    async fn revise_once(&self, session_id: &str) -> Result<RemoteSummary> {
        let data = self
            .transport()?
            .post_json(
                "API/ListBackends",
                &json!({ "session_id": session_id, "nonreal": true, "full_data": true }),
            )
            .await?;
        check_response(&data)?;
        let backends = data
            .as_object()
            .ok_or_else(|| PoolError::RemoteProtocol("backend list is not an object".into()))?;

        let mut summary = RemoteSummary::default();
        for backend in backends.values() {
            match backend.get("status").and_then(Value::as_str) {
                Some("running") => {
                    summary.running += 1;
                    if let Some(features) = backend.get("features").and_then(Value::as_array) {
                        summary
                            .features
                            .extend(features.iter().filter_map(Value::as_str).map(str::to_string));
                    }
                }
                Some("loading") => summary.any_loading = true,
                _ => {}
            }
        }
        self.conn.lock().summary = summary.clone();
        Ok(summary)
    }

    /// Refresh the peer's backend list, re-validating if needed.
    pub async fn revise(&self) -> Result<RemoteSummary> {
        self.with_session(|session| async move { self.revise_once(&session).await })
            .await
    }

    async fn interrupt_remote(&self, session_id: &str) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let body = json!({ "session_id": session_id, "other_sessions": false });
        match transport.post_json("API/InterruptAll", &body).await {
            Ok(response) => {
                if let Err(err) = check_response(&response) {
                    tracing::warn!(address = %self.settings.address, "peer refused interrupt: {err}");
                }
            }
            Err(err) => tracing::warn!(address = %self.settings.address, "peer interrupt failed: {err:#}"),
        }
    }

    fn forget_session(&self) {
        self.conn.lock().session_id = None;
    }
}

fn build_request(request: &GenerationRequest, session_id: &str) -> Result<Value> {
    let mut body: Map<String, Value> = request.to_json()?;
    body.insert("images".into(), json!(1));
    body.insert("session_id".into(), json!(session_id));
    body.insert("donotsave".into(), json!(true));
    Ok(Value::Object(body))
}

/// Local batch index for a progress frame the peer tagged with `remote`.
fn remap_batch_index(local: u32, remote: Option<&Value>) -> u32 {
    let remote = remote.and_then(|value| {
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    });
    match remote {
        Some(remote) if remote > 0 => local.saturating_add(remote as u32),
        _ => local,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Role {
    Real,
    Shadow,
}

/// A worker backed by a peer instance.
pub struct PeerAdapter {
    shared: Arc<PeerShared>,
    role: Role,
}

impl PeerAdapter {
    pub fn new(settings: PeerSettings) -> Result<Self> {
        let transport: Option<Arc<dyn PeerTransport>> = if settings.address.trim().is_empty() {
            None
        } else {
            Some(Arc::new(HttpTransport::new(
                &settings.address,
                Duration::from_secs(settings.timeout_secs),
            )?))
        };
        Ok(Self::build(settings, transport))
    }

    /// A peer adapter whose calls go through `transport`.
    pub fn with_transport(settings: PeerSettings, transport: Arc<dyn PeerTransport>) -> Self {
        Self::build(settings, Some(transport))
    }

    fn build(settings: PeerSettings, transport: Option<Arc<dyn PeerTransport>>) -> Self {
        Self {
            shared: Arc::new(PeerShared {
                settings,
                instance_id: parking_lot::Mutex::new(None),
                transport,
                conn: parking_lot::Mutex::new(Connection::default()),
                validate_lock: tokio::sync::Mutex::new(()),
                shadows: parking_lot::Mutex::new(Vec::new()),
                stop: parking_lot::Mutex::new(CancelToken::new()),
            }),
            role: Role::Real,
        }
    }

    fn shadow_of(shared: &Arc<PeerShared>) -> Self {
        Self {
            shared: Arc::clone(shared),
            role: Role::Shadow,
        }
    }

    pub fn shared(&self) -> &Arc<PeerShared> {
        &self.shared
    }

    pub fn is_shadow(&self) -> bool {
        self.role == Role::Shadow
    }

    /// Shadow workers currently registered for this peer.
    pub fn shadow_ids(&self) -> Vec<WorkerId> {
        self.shared.shadows.lock().clone()
    }

    async fn init_real(&self, ctx: &WorkerContext) -> Result<InitOutcome> {
        let stop = CancelToken::new();
        std::mem::replace(&mut *self.shared.stop.lock(), stop.clone()).cancel();
        *self.shared.instance_id.lock() = ctx.instance_id();
        let settings = &self.shared.settings;

        match self.shared.validate_and_build().await {
            Ok(summary) => {
                ctx.set_features(summary.features.clone());
                sync_shadows(&self.shared, ctx, summary.running);
                spawn_reconcile(Arc::clone(&self.shared), ctx.clone(), stop);
                tracing::info!(
                    worker_id = %ctx.worker_id(),
                    address = %settings.address,
                    running = summary.running,
                    any_loading = summary.any_loading,
                    "connected to peer"
                );
                Ok(if summary.any_loading {
                    InitOutcome::Deferred
                } else {
                    InitOutcome::Ready
                })
            }
            Err(err) if matches!(PoolError::find(&err), Some(PoolError::ConfigInvalid(_))) => Err(err),
            Err(err) if settings.allow_idle => {
                tracing::warn!(
                    worker_id = %ctx.worker_id(),
                    address = %settings.address,
                    "peer unreachable, idling: {err:#}"
                );
                ctx.set_status(BackendStatus::Idle);
                spawn_reconcile(Arc::clone(&self.shared), ctx.clone(), stop);
                Ok(InitOutcome::Deferred)
            }
            Err(err) => Err(err),
        }
    }

    async fn init_shadow(&self, ctx: &WorkerContext) -> Result<InitOutcome> {
        match self.shared.current_session().await {
            Ok(_) => Ok(InitOutcome::Ready),
            Err(err) if self.shared.settings.allow_idle => {
                tracing::debug!(worker_id = %ctx.worker_id(), "shadow peer idling: {err:#}");
                ctx.set_status(BackendStatus::Idle);
                Ok(InitOutcome::Deferred)
            }
            Err(err) => Err(err),
        }
    }
}

/// Keep one shadow per running peer backend beyond the first.
fn sync_shadows(shared: &Arc<PeerShared>, ctx: &WorkerContext, running: usize) {
    let wanted = running.saturating_sub(1);
    let mut shadows = shared.shadows.lock();
    while shadows.len() < wanted {
        match ctx.register_shadow(Arc::new(PeerAdapter::shadow_of(shared))) {
            Ok(id) => shadows.push(id),
            Err(err) => {
                tracing::debug!(worker_id = %ctx.worker_id(), "cannot add shadow worker: {err}");
                break;
            }
        }
    }
    while shadows.len() > wanted {
        if let Some(id) = shadows.pop() {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if ctx.retire_worker(id).await {
                    tracing::debug!(worker_id = %ctx.worker_id(), shadow_id = %id, "removed shadow worker");
                }
            });
        }
    }
}

fn spawn_reconcile(shared: Arc<PeerShared>, ctx: WorkerContext, stop: CancelToken) {
    let span = telemetry::peer_span(ctx.worker_id(), &shared.settings.address);
    tokio::spawn(reconcile(shared, ctx, stop).instrument(span));
}

/// Background loop keeping status, features and shadows in line with the peer.
async fn reconcile(shared: Arc<PeerShared>, ctx: WorkerContext, stop: CancelToken) {
    let draining = ctx.shutdown_token();
    let settings = shared.settings.clone();
    loop {
        let wait = match ctx.status() {
            BackendStatus::Loading | BackendStatus::Idle => settings.poll_interval(),
            BackendStatus::Running => settings.refresh_interval(),
            _ => break,
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop.cancelled() => break,
            _ = draining.cancelled() => break,
        }
        let status = ctx.status();
        if !matches!(
            status,
            BackendStatus::Loading | BackendStatus::Idle | BackendStatus::Running
        ) {
            break;
        }

        match shared.revise().await {
            Ok(summary) => {
                if stop.is_cancelled() {
                    break;
                }
                ctx.set_features(summary.features.clone());
                sync_shadows(&shared, &ctx, summary.running);
                if summary.any_loading {
                    tracing::debug!(running = summary.running, "waiting for peer backends to load");
                } else if ctx.transition(
                    &[BackendStatus::Loading, BackendStatus::Idle],
                    BackendStatus::Running,
                ) {
                    tracing::info!(running = summary.running, "peer is running");
                }
            }
            Err(err) if matches!(PoolError::find(&err), Some(PoolError::ConfigInvalid(_))) => {
                tracing::error!("peer rejected: {err:#}");
                ctx.set_status(BackendStatus::Errored);
                sync_shadows(&shared, &ctx, 0);
                break;
            }
            Err(err) if settings.allow_idle => {
                if ctx.transition(
                    &[BackendStatus::Loading, BackendStatus::Running],
                    BackendStatus::Idle,
                ) {
                    tracing::warn!("peer unreachable, idling: {err:#}");
                    sync_shadows(&shared, &ctx, 0);
                }
            }
            Err(err) if status == BackendStatus::Running => {
                tracing::warn!("peer refresh failed, keeping last known state: {err:#}");
            }
            Err(err) => {
                tracing::error!("peer failed to load: {err:#}");
                ctx.transition(&[BackendStatus::Loading], BackendStatus::Errored);
                sync_shadows(&shared, &ctx, 0);
                break;
            }
        }
    }
    tracing::debug!("peer reconcile loop ending");
}

#[async_trait]
impl BackendAdapter for PeerAdapter {
    async fn init(&self, ctx: &WorkerContext) -> Result<InitOutcome> {
        if self.shared.transport.is_none() {
            ctx.set_status(BackendStatus::Disabled);
            return Ok(InitOutcome::Deferred);
        }
        match self.role {
            Role::Real => self.init_real(ctx).await,
            Role::Shadow => self.init_shadow(ctx).await,
        }
    }

    async fn shutdown(&self, ctx: &WorkerContext) {
        if self.role == Role::Real {
            tracing::info!(worker_id = %ctx.worker_id(), address = %self.shared.settings.address, "disconnecting from peer");
            self.shared.stop.lock().cancel();
            let shadows = std::mem::take(&mut *self.shared.shadows.lock());
            futures::future::join_all(shadows.into_iter().map(|id| ctx.retire_worker(id))).await;
            self.shared.forget_session();
        }
        ctx.set_status(BackendStatus::Disabled);
    }

    async fn load_model(&self, model: &str) -> Result<bool> {
        let transport = self.shared.transport()?;
        self.shared
            .with_session(|session| async move {
                let response = transport
                    .post_json(
                        "API/SelectModel",
                        &json!({ "session_id": session, "model": model }),
                    )
                    .await?;
                check_response(&response)?;
                Ok(response
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false))
            })
            .await
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<ImageSet> {
        let transport = self.shared.transport()?;
        self.shared
            .with_session(|session| async move {
                let body = build_request(request, &session)?;
                let response = transport.post_json("API/GenerateText2Image", &body).await?;
                check_response(&response)?;
                let images = response
                    .get("images")
                    .and_then(Value::as_array)
                    .ok_or_else(|| PoolError::RemoteProtocol("generate response has no images".into()))?;
                images
                    .iter()
                    .map(|image| {
                        let uri = image.as_str().ok_or_else(|| {
                            PoolError::RemoteProtocol("generated image is not a data URI".into())
                        })?;
                        GeneratedImage::from_data_uri(uri)
                    })
                    .collect()
            })
            .await
    }

    async fn generate_streaming(
        &self,
        request: &GenerationRequest,
        stream: StreamContext,
    ) -> Result<()> {
        if !self.shared.settings.allow_websocket {
            let images = self.generate(request).await?;
            stream.emit_images(images).await;
            return Ok(());
        }
        let shared = &self.shared;
        let transport = shared.transport()?;
        let stream = &stream;
        // A fresh session only helps while nothing has reached the caller yet.
        let forwarded = &AtomicBool::new(false);
        shared
            .with_session(|session| async move {
                let body = build_request(request, &session)?;
                let mut frames = transport
                    .open_stream("API/GenerateText2ImageWS", &body)
                    .await?;
                let mut interrupted = false;
                loop {
                    let frame = tokio::select! {
                        biased;
                        _ = stream.interrupt.cancelled(), if !interrupted => {
                            interrupted = true;
                            shared.interrupt_remote(&session).await;
                            continue;
                        }
                        frame = frames.next() => frame,
                    };
                    let Some(frame) = frame else {
                        break;
                    };
                    let frame = frame?;
                    if let Err(err) = check_response(&frame) {
                        if err == PoolError::SessionInvalid && forwarded.load(Ordering::SeqCst) {
                            return Err(PoolError::Remote(
                                "peer session was lost after output was forwarded".into(),
                            )
                            .into());
                        }
                        return Err(err.into());
                    }
                    if let Some(progress) = frame.get("gen_progress").and_then(Value::as_object) {
                        let batch_index =
                            remap_batch_index(stream.batch_index, progress.get("batch_index"));
                        let mut data = progress.clone();
                        data.insert("batch_index".into(), json!(batch_index.to_string()));
                        stream
                            .emit(GenerationEvent::Progress {
                                batch_index,
                                data: Value::Object(data),
                            })
                            .await;
                        forwarded.store(true, Ordering::SeqCst);
                    } else if let Some(image) = frame.get("image").and_then(Value::as_str) {
                        stream
                            .emit(GenerationEvent::Image(GeneratedImage::from_data_uri(image)?))
                            .await;
                        forwarded.store(true, Ordering::SeqCst);
                    } else {
                        tracing::trace!("ignoring peer frame: {frame}");
                    }
                }
                Ok(())
            })
            .await
    }

    async fn free_memory(&self, system_ram: bool) -> Result<bool> {
        let transport = self.shared.transport()?;
        self.shared
            .with_session(|session| async move {
                let response = transport
                    .post_json(
                        "API/FreeBackendMemory",
                        &json!({ "session_id": session, "system_ram": system_ram }),
                    )
                    .await?;
                check_response(&response)?;
                Ok(response
                    .get("result")
                    .and_then(Value::as_bool)
                    .unwrap_or(false))
            })
            .await
    }

    fn supported_features(&self) -> BTreeSet<String> {
        self.shared.summary().features
    }
}

pub(crate) fn backend_type() -> BackendType {
    BackendType::new(
        TYPE_ID,
        "Peer Instance",
        "Another instance of this server, used as a pool of remote workers.",
        |settings, _env| {
            let settings: PeerSettings = parse_settings(TYPE_ID, settings)?;
            Ok(Arc::new(PeerAdapter::new(settings)?) as Arc<dyn BackendAdapter>)
        },
    )
    .with_setting(SettingDescription::new(
        "address",
        "The network address of the other instance, usually ending in ':7801'.",
        "",
    ))
    .with_setting(SettingDescription::new(
        "allow_idle",
        "Go idle instead of errored while the peer is unreachable, and reconnect when it returns.",
        false,
    ))
    .with_setting(SettingDescription::new(
        "allow_websocket",
        "Stream progress over a websocket. Disable for networks that block websockets.",
        true,
    ))
    .standard()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_errors_map_to_taxonomy() {
        assert_eq!(check_response(&json!({ "images": [] })), Ok(()));
        assert_eq!(
            check_response(&json!({ "error_id": "invalid_session_id", "error": "x" })),
            Err(PoolError::SessionInvalid)
        );
        assert_eq!(
            check_response(&json!({ "error": "Invalid data: steps too high" })),
            Err(PoolError::InvalidData("steps too high".into()))
        );
        assert_eq!(
            check_response(&json!({ "error": "Invalid operation: no model" })),
            Err(PoolError::InvalidOperation("no model".into()))
        );
        assert_eq!(
            check_response(&json!({ "error": "out of memory" })),
            Err(PoolError::Remote("out of memory".into()))
        );
    }

    #[test]
    fn batch_indices_offset_by_positive_remote_index() {
        assert_eq!(remap_batch_index(3, None), 3);
        assert_eq!(remap_batch_index(3, Some(&json!("0"))), 3);
        assert_eq!(remap_batch_index(3, Some(&json!("2"))), 5);
        assert_eq!(remap_batch_index(3, Some(&json!(4))), 7);
        assert_eq!(remap_batch_index(3, Some(&json!("preview"))), 3);
    }

    #[test]
    fn request_carries_session_and_no_save_flag() {
        let body = build_request(&GenerationRequest::new("owl").with_seed(9), "abc").unwrap();
        assert_eq!(body["images"], 1);
        assert_eq!(body["session_id"], "abc");
        assert_eq!(body["donotsave"], true);
        assert_eq!(body["seed"], 9);
    }

    #[test]
    fn empty_address_builds_without_transport() {
        let adapter = PeerAdapter::new(PeerSettings::default()).unwrap();
        assert!(adapter.shared.transport.is_none());
        assert!(!adapter.is_shadow());
        assert!(PeerAdapter::shadow_of(adapter.shared()).is_shadow());
    }

    #[test]
    fn settings_defaults() {
        let settings: PeerSettings =
            parse_settings(TYPE_ID, &crate::worker::Settings::new()).unwrap();
        assert!(settings.allow_websocket);
        assert!(!settings.allow_idle);
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));
        assert_eq!(settings.refresh_interval(), Duration::from_secs(30));
    }
}
