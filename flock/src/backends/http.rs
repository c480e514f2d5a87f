//! Direct-HTTP adapter for web-ui style inference servers (`/sdapi/v1`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::backends::transport::{HttpTransport, JsonTransport};
use crate::backends::{BackendAdapter, BackendType, InitOutcome, SettingDescription, parse_settings};
use crate::error::PoolError;
use crate::pool::WorkerContext;
use crate::request::{GeneratedImage, GenerationRequest, ImageSet};
use crate::worker::BackendStatus;

pub const TYPE_ID: &str = "auto_webui_api";

/// Settings of an `auto_webui_api` worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Base address of the server, eg `http://localhost:7860`.
    pub address: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            address: String::new(),
            timeout_secs: 120,
        }
    }
}

impl HttpSettings {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
}

/// Talks to an inference server someone else runs.
pub struct HttpAdapter {
    address: String,
    // `None` when no address is configured; the worker stays disabled.
    transport: Option<Arc<dyn JsonTransport>>,
}

impl HttpAdapter {
    pub fn from_settings(settings: &HttpSettings) -> Result<Self> {
        let address = settings.address.trim().trim_end_matches('/').to_string();
        if address.is_empty() {
            return Ok(Self {
                address,
                transport: None,
            });
        }
        let transport = HttpTransport::new(
            &format!("{address}/sdapi/v1"),
            Duration::from_secs(settings.timeout_secs),
        )?;
        Ok(Self {
            address,
            transport: Some(Arc::new(transport)),
        })
    }

    /// An adapter whose calls go through `transport`, rooted at `/sdapi/v1`.
    pub fn with_transport(address: impl Into<String>, transport: Arc<dyn JsonTransport>) -> Self {
        Self {
            address: address.into(),
            transport: Some(transport),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn transport(&self) -> Result<&Arc<dyn JsonTransport>> {
        self.transport.as_ref().ok_or_else(|| {
            PoolError::InvalidOperation("backend has no address configured".into()).into()
        })
    }

    /// Title of the checkpoint the server has loaded, without its hash suffix.
    pub async fn loaded_model(&self) -> Result<Option<String>> {
        let options = self.transport()?.get_json("options").await?;
        Ok(options
            .get("sd_model_checkpoint")
            .and_then(Value::as_str)
            .map(|title| strip_hash(title).to_string()))
    }
}

#[async_trait]
impl BackendAdapter for HttpAdapter {
    async fn init(&self, ctx: &WorkerContext) -> Result<InitOutcome> {
        if self.transport.is_none() {
            ctx.set_status(BackendStatus::Disabled);
            return Ok(InitOutcome::Deferred);
        }
        let model = self.loaded_model().await?;
        ctx.set_current_model(model);
        Ok(InitOutcome::Ready)
    }

    async fn shutdown(&self, _ctx: &WorkerContext) {}

    async fn load_model(&self, model: &str) -> Result<bool> {
        let transport = self.transport()?;
        let listing = transport.get_json("sd-models").await?;
        let titles: Vec<String> = listing
            .as_array()
            .ok_or_else(|| PoolError::RemoteProtocol("sd-models did not return a list".into()))?
            .iter()
            .filter_map(|entry| entry.get("title").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        let Some(title) = match_model(model, &titles) else {
            return Ok(false);
        };
        tracing::debug!(model, title = %title, address = %self.address, "switching checkpoint");
        transport
            .post_json("options", &json!({ "sd_model_checkpoint": title }))
            .await?;
        Ok(true)
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<ImageSet> {
        let mut payload = request.to_json()?;
        payload.remove("model");
        let response = self
            .transport()?
            .post_json("txt2img", &Value::Object(payload))
            .await?;
        let images = response
            .get("images")
            .and_then(Value::as_array)
            .ok_or_else(|| PoolError::RemoteProtocol("txt2img response has no images".into()))?;
        images
            .iter()
            .map(|image| {
                let encoded = image.as_str().ok_or_else(|| {
                    PoolError::RemoteProtocol("txt2img image is not a string".into())
                })?;
                GeneratedImage::from_base64_png(encoded)
            })
            .collect()
    }
}

fn strip_hash(title: &str) -> &str {
    if title.ends_with(']') {
        if let Some((name, _)) = title.rsplit_once(" [") {
            return name;
        }
    }
    title
}

fn normalize(name: &str) -> String {
    strip_hash(name)
        .replace('\\', "/")
        .to_lowercase()
        .trim_matches('/')
        .to_string()
}

/// File name without directories or extension.
fn stem(normalized: &str) -> &str {
    let file = normalized.rsplit('/').next().unwrap_or(normalized);
    match file.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => file,
    }
}

fn without_extension(normalized: &str) -> &str {
    let file_start = normalized.rfind('/').map_or(0, |i| i + 1);
    match normalized[file_start..].rfind('.') {
        Some(dot) => &normalized[..file_start + dot],
        None => normalized,
    }
}

/// Trailing path components two names share, ignoring extensions.
fn shared_suffix(a: &str, b: &str) -> usize {
    without_extension(a)
        .split('/')
        .rev()
        .zip(without_extension(b).split('/').rev())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Pick the server's title for `target` among `titles`.
///
/// Names are compared normalized (hash suffix dropped, `\` as `/`, case
/// folded). An exact match wins; otherwise titles with the same file stem are
/// ranked by how many trailing path components they share with `target`.
pub fn match_model(target: &str, titles: &[String]) -> Option<String> {
    let wanted = normalize(target);
    let wanted_stem = stem(&wanted);
    let mut best: Option<(usize, &str)> = None;

    for title in titles {
        let candidate = normalize(title);
        if candidate == wanted {
            return Some(strip_hash(title).to_string());
        }
        if stem(&candidate) == wanted_stem {
            let score = shared_suffix(&candidate, &wanted);
            if best.is_none_or(|(best_score, _)| score > best_score) {
                best = Some((score, strip_hash(title)));
            }
        }
    }
    best.map(|(_, title)| title.to_string())
}

pub(crate) fn backend_type() -> BackendType {
    BackendType::new(
        TYPE_ID,
        "Web-UI API by URL",
        "A running web-ui style API server, reached by its URL.",
        |settings, _env| {
            let settings: HttpSettings = parse_settings(TYPE_ID, settings)?;
            Ok(Arc::new(HttpAdapter::from_settings(&settings)?) as Arc<dyn BackendAdapter>)
        },
    )
    .with_setting(SettingDescription::new(
        "address",
        "The address of the server, eg 'http://localhost:7860'.",
        "",
    ))
    .with_setting(SettingDescription::new(
        "timeout_secs",
        "Per-request timeout in seconds.",
        120,
    ))
    .standard()
}
