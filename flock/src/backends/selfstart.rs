//! Self-start adapter: launches a local inference server process and, once it
//! answers, behaves like the direct-HTTP adapter against it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::backends::http::{HttpAdapter, HttpSettings};
use crate::backends::{BackendAdapter, BackendType, InitOutcome, SettingDescription, parse_settings};
use crate::error::PoolError;
use crate::pool::WorkerContext;
use crate::request::{GenerationRequest, ImageSet};
use crate::signal::CancelToken;
use crate::worker::{BackendStatus, WorkerId};

pub const TYPE_ID: &str = "self_start";

/// Launcher that must not be started directly; it is sourced by the real one.
pub const RESERVED_SCRIPT_STEM: &str = "webui-user";

const DEFAULT_FIRST_PORT: u16 = 7820;
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const FORBIDDEN_PATH_CHARS: &[char] = &['"', '\'', ';', '&', '|', '<', '>', '$', '`', '*', '?', ':'];

/// Hands out local ports, one per launch.
#[derive(Debug)]
pub struct PortAllocator {
    next: AtomicU16,
}

impl PortAllocator {
    pub fn starting_at(port: u16) -> Self {
        Self {
            next: AtomicU16::new(port),
        }
    }

    pub fn next(&self) -> u16 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::starting_at(DEFAULT_FIRST_PORT)
    }
}

/// Settings of a `self_start` worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfStartSettings {
    /// The `webui.sh` or `webui.bat` to run. Empty leaves the worker disabled.
    pub start_script: String,
    /// GPU exposed to the process through `CUDA_VISIBLE_DEVICES`.
    pub gpu_id: u32,
    /// Extra launch arguments. `{port}` is replaced by the assigned port;
    /// without it `--api --port <port>` is appended.
    pub extra_args: String,
    /// Directory to run in. Defaults to the script's directory.
    pub working_dir: Option<PathBuf>,
    /// Delay before launching, in seconds.
    pub start_delay_secs: u64,
    /// Re-queue the worker when a process that was running exits.
    pub auto_restart: bool,
    /// Per-request timeout against the launched server, in seconds.
    pub timeout_secs: u64,
}

impl Default for SelfStartSettings {
    fn default() -> Self {
        Self {
            start_script: String::new(),
            gpu_id: 0,
            extra_args: String::new(),
            working_dir: None,
            start_delay_secs: 0,
            auto_restart: false,
            timeout_secs: 120,
        }
    }
}

impl SelfStartSettings {
    pub fn new(start_script: impl Into<String>) -> Self {
        Self {
            start_script: start_script.into(),
            ..Self::default()
        }
    }
}

fn invalid(message: String) -> PoolError {
    PoolError::ConfigInvalid(message)
}

/// Check a start script path before anything is launched.
pub fn validate_start_script(raw: &str) -> Result<PathBuf, PoolError> {
    let path = raw.trim().replace('\\', "/");
    if path.chars().count() < 5 {
        return Err(invalid(format!("start script path '{raw}' is too short")));
    }
    let file_name = path.rsplit('/').next().unwrap_or(&path);
    let (stem, extension) = file_name.rsplit_once('.').unwrap_or((file_name, ""));
    if extension != "sh" && extension != "bat" {
        return Err(invalid(format!(
            "refusing non-script target '{raw}'; expected a .sh or .bat file"
        )));
    }
    if stem == RESERVED_SCRIPT_STEM {
        return Err(invalid(format!(
            "refusing the '{RESERVED_SCRIPT_STEM}' launcher; use the 'webui' script instead"
        )));
    }
    // A drive letter is the one place a colon is allowed.
    let checked = if path.as_bytes().get(1) == Some(&b':') {
        &path[2..]
    } else {
        path.as_str()
    };
    let forbidden: String = checked
        .chars()
        .filter(|c| FORBIDDEN_PATH_CHARS.contains(c) || c.is_control())
        .collect();
    if !forbidden.is_empty() {
        return Err(invalid(format!(
            "start script path '{raw}' contains invalid characters ( {forbidden} )"
        )));
    }
    let path = PathBuf::from(path);
    if !path.is_file() {
        return Err(invalid(format!("start script '{raw}' does not exist")));
    }
    Ok(path)
}

fn launch_args(extra_args: &str, port: u16) -> Vec<String> {
    let port = port.to_string();
    if extra_args.contains("{port}") {
        extra_args
            .replace("{port}", &port)
            .split_whitespace()
            .map(str::to_string)
            .collect()
    } else {
        extra_args
            .split_whitespace()
            .map(str::to_string)
            .chain(["--api".to_string(), "--port".to_string(), port])
            .collect()
    }
}

/// One launched server process.
///
/// Its output is forwarded to the log. When the output ends the process is
/// considered gone: unless it was being stopped, the worker is marked errored.
pub struct SelfStartSupervisor {
    worker_id: WorkerId,
    port: u16,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
    stopping: Arc<AtomicBool>,
}

impl SelfStartSupervisor {
    pub fn launch(
        ctx: &WorkerContext,
        script: &Path,
        settings: &SelfStartSettings,
        port: u16,
    ) -> Result<Self> {
        let worker_id = ctx.worker_id();
        let is_batch = script.extension().is_some_and(|ext| ext == "bat");
        let mut command = if is_batch {
            let mut command = Command::new("cmd");
            command.arg("/C").arg(script);
            command
        } else {
            let mut command = Command::new("bash");
            command.arg(script);
            command
        };
        let working_dir = settings
            .working_dir
            .clone()
            .or_else(|| script.parent().map(Path::to_path_buf))
            .filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }
        command
            .args(launch_args(&settings.extra_args, port))
            .env("CUDA_VISIBLE_DEVICES", settings.gpu_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .with_context(|| format!("launching {}", script.display()))?;
        tracing::info!(worker_id = %worker_id, port, pid = child.id(), "self-started backend is loading");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let supervisor = Self {
            worker_id,
            port,
            child: Arc::new(tokio::sync::Mutex::new(Some(child))),
            stopping: Arc::new(AtomicBool::new(false)),
        };

        let monitor_ctx = ctx.clone();
        let child = Arc::clone(&supervisor.child);
        let stopping = Arc::clone(&supervisor.stopping);
        let auto_restart = settings.auto_restart;
        tokio::spawn(async move {
            tokio::join!(
                drain_output(stdout, worker_id, "stdout"),
                drain_output(stderr, worker_id, "stderr"),
            );
            let status = match child.lock().await.as_mut() {
                Some(child) => child.try_wait().ok().flatten(),
                None => None,
            };
            if stopping.load(Ordering::SeqCst) {
                tracing::debug!(worker_id = %worker_id, port, "self-started backend stopped");
                return;
            }
            let exited = PoolError::ProcessExited(match status {
                Some(status) => format!("self-started backend on port {port} exited with {status}"),
                None => format!("self-started backend on port {port} closed its output"),
            });
            let was_running = monitor_ctx.status() == BackendStatus::Running;
            if monitor_ctx.transition(
                &[BackendStatus::Loading, BackendStatus::Running],
                BackendStatus::Errored,
            ) {
                tracing::error!(worker_id = %worker_id, "{exited}");
                if auto_restart && was_running && monitor_ctx.requeue() {
                    tracing::info!(worker_id = %worker_id, "restarting self-started backend");
                }
            } else {
                tracing::info!(worker_id = %worker_id, "{exited}");
            }
        });

        Ok(supervisor)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn has_exited(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Stop the process: no-op if it already exited, otherwise terminate
    /// gracefully and kill if it is still alive after a grace period.
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(worker_id = %self.worker_id, %status, "self-started backend already exited");
                guard.take();
                return;
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(worker_id = %self.worker_id, "cannot poll backend process: {err}"),
        }
        tracing::info!(worker_id = %self.worker_id, port = self.port, pid = child.id(), "stopping self-started backend");

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
            tracing::warn!(worker_id = %self.worker_id, "backend process did not terminate gracefully, forcing kill");
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                use nix::sys::signal::{Signal, killpg};
                use nix::unistd::Pid;

                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            if let Err(err) = child.start_kill() {
                tracing::warn!(worker_id = %self.worker_id, "failed to kill backend process: {err}");
            }
            let _ = child.wait().await;
        }
        guard.take();
    }
}

impl std::fmt::Debug for SelfStartSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfStartSupervisor")
            .field("worker_id", &self.worker_id)
            .field("port", &self.port)
            .field("stopping", &self.stopping.load(Ordering::SeqCst))
            .finish()
    }
}

async fn drain_output<R>(output: Option<R>, worker_id: WorkerId, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let Some(output) = output else {
        return;
    };
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(worker_id = %worker_id, stream, "{line}"),
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(worker_id = %worker_id, stream, "backend output read failed: {err}");
                break;
            }
        }
    }
}

/// Builds the adapter used against the launched server, given its port.
pub type InnerFactory = Arc<dyn Fn(u16, &SelfStartSettings) -> Result<Arc<dyn BackendAdapter>> + Send + Sync>;

fn http_inner() -> InnerFactory {
    Arc::new(|port, settings| {
        let mut http = HttpSettings::new(format!("http://localhost:{port}"));
        http.timeout_secs = settings.timeout_secs;
        Ok(Arc::new(HttpAdapter::from_settings(&http)?) as Arc<dyn BackendAdapter>)
    })
}

/// Owns a [`SelfStartSupervisor`] and delegates generation to an inner
/// adapter pointed at the launched server.
pub struct SelfStartAdapter {
    settings: SelfStartSettings,
    ports: Arc<PortAllocator>,
    inner_factory: InnerFactory,
    health_interval: Duration,
    inner: parking_lot::Mutex<Option<Arc<dyn BackendAdapter>>>,
    supervisor: Arc<tokio::sync::Mutex<Option<SelfStartSupervisor>>>,
    stop: parking_lot::Mutex<CancelToken>,
}

impl SelfStartAdapter {
    pub fn new(settings: SelfStartSettings, ports: Arc<PortAllocator>) -> Self {
        Self {
            settings,
            ports,
            inner_factory: http_inner(),
            health_interval: HEALTH_POLL_INTERVAL,
            inner: parking_lot::Mutex::new(None),
            supervisor: Arc::new(tokio::sync::Mutex::new(None)),
            stop: parking_lot::Mutex::new(CancelToken::new()),
        }
    }

    /// Replace the adapter used against the launched server.
    pub fn with_inner_factory(mut self, factory: InnerFactory) -> Self {
        self.inner_factory = factory;
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn settings(&self) -> &SelfStartSettings {
        &self.settings
    }

    /// Port of the current process, if one was launched.
    pub async fn port(&self) -> Option<u16> {
        self.supervisor.lock().await.as_ref().map(SelfStartSupervisor::port)
    }

    fn inner(&self) -> Result<Arc<dyn BackendAdapter>> {
        self.inner.lock().clone().ok_or_else(|| {
            PoolError::InvalidOperation("self-started backend is not running".into()).into()
        })
    }
}

#[async_trait]
impl BackendAdapter for SelfStartAdapter {
    async fn init(&self, ctx: &WorkerContext) -> Result<InitOutcome> {
        if self.settings.start_script.trim().is_empty() {
            ctx.set_status(BackendStatus::Disabled);
            return Ok(InitOutcome::Deferred);
        }
        let script = validate_start_script(&self.settings.start_script)?;
        let port = self.ports.next();
        let inner = (self.inner_factory)(port, &self.settings)?;
        *self.inner.lock() = Some(Arc::clone(&inner));

        let stop = CancelToken::new();
        std::mem::replace(&mut *self.stop.lock(), stop.clone()).cancel();

        let ctx = ctx.clone();
        let settings = self.settings.clone();
        let slot = Arc::clone(&self.supervisor);
        let interval = self.health_interval;
        let draining = ctx.shutdown_token();
        tokio::spawn(async move {
            let delay = Duration::from_secs(settings.start_delay_secs);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.cancelled() => return,
                    _ = draining.cancelled() => return,
                }
            }
            {
                let mut slot = slot.lock().await;
                if stop.is_cancelled() {
                    return;
                }
                match SelfStartSupervisor::launch(&ctx, &script, &settings, port) {
                    Ok(supervisor) => *slot = Some(supervisor),
                    Err(err) => {
                        tracing::error!(worker_id = %ctx.worker_id(), "failed to launch backend: {err:#}");
                        ctx.transition(&[BackendStatus::Loading], BackendStatus::Errored);
                        return;
                    }
                }
            }

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.cancelled() => return,
                    _ = draining.cancelled() => return,
                }
                if ctx.status() != BackendStatus::Loading {
                    break;
                }
                tracing::debug!(worker_id = %ctx.worker_id(), port, "checking for self-started server");
                match inner.init(&ctx).await {
                    Ok(_) => {
                        ctx.set_features(inner.supported_features());
                        if ctx.transition(&[BackendStatus::Loading], BackendStatus::Running) {
                            tracing::info!(worker_id = %ctx.worker_id(), port, "self-started backend is running");
                        }
                        break;
                    }
                    Err(err) => {
                        tracing::trace!(worker_id = %ctx.worker_id(), "server not up yet: {err:#}")
                    }
                }
            }
            tracing::debug!(worker_id = %ctx.worker_id(), port, "self-start health loop ending");
        });

        Ok(InitOutcome::Deferred)
    }

    async fn shutdown(&self, ctx: &WorkerContext) {
        self.stop.lock().cancel();
        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }
        let inner = self.inner.lock().take();
        if let Some(inner) = inner {
            inner.shutdown(ctx).await;
        }
    }

    async fn load_model(&self, model: &str) -> Result<bool> {
        self.inner()?.load_model(model).await
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<ImageSet> {
        self.inner()?.generate(request).await
    }

    async fn free_memory(&self, system_ram: bool) -> Result<bool> {
        self.inner()?.free_memory(system_ram).await
    }

    fn supported_features(&self) -> std::collections::BTreeSet<String> {
        self.inner
            .lock()
            .as_ref()
            .map(|inner| inner.supported_features())
            .unwrap_or_default()
    }
}

pub(crate) fn backend_type() -> BackendType {
    BackendType::new(
        TYPE_ID,
        "Self-Starting Web-UI",
        "Launches a local web-ui server from its start script and uses it once it answers.",
        |settings, env| {
            let settings: SelfStartSettings = parse_settings(TYPE_ID, settings)?;
            Ok(Arc::new(SelfStartAdapter::new(settings, Arc::clone(&env.ports))) as Arc<dyn BackendAdapter>)
        },
    )
    .with_setting(SettingDescription::new(
        "start_script",
        "The location of the 'webui.sh' or 'webui.bat' file.",
        "",
    ))
    .with_setting(SettingDescription::new(
        "extra_args",
        "Extra launch arguments; '{port}' is replaced by the assigned port.",
        "",
    ))
    .with_setting(SettingDescription::new(
        "gpu_id",
        "Which GPU to use, if multiple are available.",
        0,
    ))
    .with_setting(SettingDescription::new(
        "start_delay_secs",
        "Delay in seconds before starting the server.",
        0,
    ))
    .with_setting(SettingDescription::new(
        "auto_restart",
        "Restart the server if it exits after starting.",
        false,
    ))
    .standard()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{body}").unwrap();
        path
    }

    fn config_invalid(result: Result<PathBuf, PoolError>) -> bool {
        matches!(result, Err(PoolError::ConfigInvalid(_)))
    }

    #[test]
    fn ports_are_handed_out_once() {
        let ports = PortAllocator::starting_at(9000);
        assert_eq!(ports.next(), 9000);
        assert_eq!(ports.next(), 9001);
        assert_eq!(PortAllocator::default().next(), 7820);
    }

    #[test]
    fn rejects_implausible_paths() {
        assert!(config_invalid(validate_start_script("a.sh")));
        assert!(config_invalid(validate_start_script("/opt/webui/webui.py")));
        assert!(config_invalid(validate_start_script("/opt/webui/webui-user.sh")));
        assert!(config_invalid(validate_start_script("C:\\webui\\webui-user.bat")));
        assert!(config_invalid(validate_start_script("/opt/web;rm -rf/webui.sh")));
        assert!(config_invalid(validate_start_script("/opt/$HOME/webui.sh")));
        assert!(config_invalid(validate_start_script("/definitely/missing/webui.sh")));
    }

    #[test]
    fn accepts_existing_script_and_drive_letters() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "webui.sh", "exit 0");
        let validated = validate_start_script(path.to_str().unwrap()).unwrap();
        assert_eq!(validated, path);

        // The drive colon is allowed, so this fails on existence rather than characters.
        let err = validate_start_script("C:/nowhere/webui.bat").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn port_placeholder_or_appended_flag() {
        assert_eq!(
            launch_args("--xformers --port={port}", 7821),
            vec!["--xformers", "--port=7821"]
        );
        assert_eq!(
            launch_args("--xformers", 7822),
            vec!["--xformers", "--api", "--port", "7822"]
        );
        assert_eq!(launch_args("", 7823), vec!["--api", "--port", "7823"]);
    }

    #[test]
    fn settings_parse_with_defaults() {
        let mut raw = crate::worker::Settings::new();
        raw.insert("start_script".into(), "/opt/webui/webui.sh".into());
        raw.insert("gpu_id".into(), 1.into());
        let settings: SelfStartSettings = parse_settings(TYPE_ID, &raw).unwrap();
        assert_eq!(settings.gpu_id, 1);
        assert_eq!(settings.timeout_secs, 120);
        assert!(!settings.auto_restart);
    }
}
