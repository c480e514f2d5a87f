//! Backend adapters and the registry that builds them from settings.
//!
//! Every backend type implements [`BackendAdapter`]. The pool never talks to a
//! backend any other way, and at most one generation call reaches a given
//! adapter instance at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::PoolError;
use crate::pool::WorkerContext;
use crate::request::{GenerationEvent, GenerationRequest, ImageSet};
use crate::session::InterruptSignal;
use crate::worker::Settings;

pub mod http;
pub mod peer;
pub mod selfstart;
pub mod transport;

pub use http::{HttpAdapter, HttpSettings, match_model};
pub use peer::{PeerAdapter, PeerSettings};
pub use selfstart::{
    InnerFactory, PortAllocator, SelfStartAdapter, SelfStartSettings, SelfStartSupervisor,
    validate_start_script,
};
pub use transport::{FrameStream, HttpTransport, JsonTransport, PeerTransport, StreamTransport};

/// Result of a successful [`BackendAdapter::init`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InitOutcome {
    /// The backend is ready; the pool marks it running.
    Ready,
    /// The adapter has started work that will set the final status itself.
    Deferred,
}

/// Where a streaming generation sends its output.
pub struct StreamContext {
    /// Index of the unit within its batch.
    pub batch_index: u32,
    /// Interrupt of the claim that owns the unit.
    pub interrupt: InterruptSignal,
    events: mpsc::Sender<GenerationEvent>,
}

impl StreamContext {
    pub fn new(
        batch_index: u32,
        interrupt: InterruptSignal,
        events: mpsc::Sender<GenerationEvent>,
    ) -> Self {
        Self {
            batch_index,
            interrupt,
            events,
        }
    }

    /// Forward an event. A receiver that went away is not an error.
    pub async fn emit(&self, event: GenerationEvent) {
        let _ = self.events.send(event).await;
    }

    pub async fn emit_images(&self, images: ImageSet) {
        for image in images {
            self.emit(GenerationEvent::Image(image)).await;
        }
    }
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("batch_index", &self.batch_index)
            .field("interrupted", &self.interrupt.is_cancelled())
            .finish()
    }
}

/// Uniform interface to one backend instance.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Bring the backend up. Errors are retried by the pool unless they are
    /// [`PoolError::ConfigInvalid`].
    async fn init(&self, ctx: &WorkerContext) -> Result<InitOutcome>;

    /// Release the backend. Best effort; must not fail.
    async fn shutdown(&self, ctx: &WorkerContext);

    /// Switch the backend to `model`. `Ok(false)` when the backend has no such model.
    async fn load_model(&self, model: &str) -> Result<bool>;

    /// Produce the images for one request.
    async fn generate(&self, request: &GenerationRequest) -> Result<ImageSet>;

    /// Produce images incrementally. The default runs [`generate`](Self::generate)
    /// and emits each image.
    async fn generate_streaming(
        &self,
        request: &GenerationRequest,
        stream: StreamContext,
    ) -> Result<()> {
        let images = self.generate(request).await?;
        stream.emit_images(images).await;
        Ok(())
    }

    /// Ask the backend to free memory. `Ok(false)` when unsupported.
    async fn free_memory(&self, _system_ram: bool) -> Result<bool> {
        Ok(false)
    }

    /// Capability tags this backend offers.
    fn supported_features(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }
}

/// Shared state handed to adapter factories.
#[derive(Clone, Debug)]
pub struct BackendEnvironment {
    /// Local ports for self-started backends.
    pub ports: Arc<PortAllocator>,
}

impl BackendEnvironment {
    pub fn new() -> Self {
        Self {
            ports: Arc::new(PortAllocator::default()),
        }
    }

    pub fn with_ports(mut self, ports: Arc<PortAllocator>) -> Self {
        self.ports = ports;
        self
    }
}

impl Default for BackendEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds an adapter from its settings.
pub type AdapterFactory = Arc<
    dyn Fn(&Settings, &BackendEnvironment) -> Result<Arc<dyn BackendAdapter>> + Send + Sync,
>;

/// Describes one setting of a backend type for the admin surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettingDescription {
    pub name: String,
    pub description: String,
    pub default: Value,
}

impl SettingDescription {
    pub fn new(name: &str, description: &str, default: impl Into<Value>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            default: default.into(),
        }
    }
}

/// Serializable description of a registered backend type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendTypeInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub settings: Vec<SettingDescription>,
    pub is_standard: bool,
}

/// A backend type: its description plus the factory that builds it.
#[derive(Clone)]
pub struct BackendType {
    pub info: BackendTypeInfo,
    factory: AdapterFactory,
}

impl BackendType {
    pub fn new<F>(id: &str, name: &str, description: &str, factory: F) -> Self
    where
        F: Fn(&Settings, &BackendEnvironment) -> Result<Arc<dyn BackendAdapter>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            info: BackendTypeInfo {
                id: id.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                settings: Vec::new(),
                is_standard: false,
            },
            factory: Arc::new(factory),
        }
    }

    pub fn with_setting(mut self, setting: SettingDescription) -> Self {
        self.info.settings.push(setting);
        self
    }

    pub fn standard(mut self) -> Self {
        self.info.is_standard = true;
        self
    }
}

impl fmt::Debug for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendType")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Maps type tags to backend types. Resolved once when a worker is registered
/// or edited.
#[derive(Clone, Debug)]
pub struct BackendRegistry {
    environment: BackendEnvironment,
    types: BTreeMap<String, BackendType>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new(environment: BackendEnvironment) -> Self {
        Self {
            environment,
            types: BTreeMap::new(),
        }
    }

    /// A registry with the direct-HTTP, self-start and peer types.
    pub fn standard(environment: BackendEnvironment) -> Self {
        Self::new(environment)
            .with_type(http::backend_type())
            .with_type(selfstart::backend_type())
            .with_type(peer::backend_type())
    }

    pub fn with_type(mut self, backend_type: BackendType) -> Self {
        self.register(backend_type);
        self
    }

    /// Add or replace a type.
    pub fn register(&mut self, backend_type: BackendType) {
        self.types.insert(backend_type.info.id.clone(), backend_type);
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.types.contains_key(type_id)
    }

    pub fn environment(&self) -> &BackendEnvironment {
        &self.environment
    }

    pub fn types(&self) -> Vec<BackendTypeInfo> {
        self.types.values().map(|t| t.info.clone()).collect()
    }

    /// Build an adapter of the given type.
    pub fn create(&self, type_id: &str, settings: &Settings) -> Result<Arc<dyn BackendAdapter>> {
        let backend_type = self.types.get(type_id).ok_or_else(|| {
            PoolError::ConfigInvalid(format!("unknown backend type '{type_id}'"))
        })?;
        (backend_type.factory)(settings, &self.environment)
    }
}

/// Parse adapter settings into their typed form.
pub(crate) fn parse_settings<T: serde::de::DeserializeOwned>(
    type_id: &str,
    settings: &Settings,
) -> Result<T> {
    serde_json::from_value(Value::Object(settings.clone())).map_err(|err| {
        PoolError::ConfigInvalid(format!("bad settings for {type_id}: {err}")).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub;

    #[async_trait]
    impl BackendAdapter for Stub {
        async fn init(&self, _ctx: &WorkerContext) -> Result<InitOutcome> {
            Ok(InitOutcome::Ready)
        }

        async fn shutdown(&self, _ctx: &WorkerContext) {}

        async fn load_model(&self, _model: &str) -> Result<bool> {
            Ok(false)
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<ImageSet> {
            Ok(vec![crate::request::GeneratedImage::new("image/png", vec![0])])
        }
    }

    #[test]
    fn standard_registry_lists_builtin_types() {
        let registry = BackendRegistry::standard(BackendEnvironment::new());
        let ids: Vec<_> = registry.types().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["auto_webui_api", "peer", "self_start"]);
        assert!(registry.types().iter().all(|t| t.is_standard));
    }

    #[test]
    fn unknown_type_is_config_error() {
        let registry = BackendRegistry::new(BackendEnvironment::new());
        let err = registry.create("nope", &Settings::new()).err().unwrap();
        assert!(matches!(
            PoolError::find(&err),
            Some(PoolError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn custom_types_build_through_factory() {
        let registry = BackendRegistry::new(BackendEnvironment::new())
            .with_type(
                BackendType::new("stub", "Stub", "test stub", |_, _| Ok(Arc::new(Stub)))
                    .with_setting(SettingDescription::new("x", "unused", 1)),
            );
        assert!(registry.contains("stub"));
        assert!(registry.create("stub", &Settings::new()).is_ok());
        assert_eq!(registry.types()[0].settings[0].name, "x");
    }

    #[tokio::test]
    async fn default_streaming_emits_generated_images() {
        let (tx, mut rx) = mpsc::channel(4);
        let stream = StreamContext::new(0, InterruptSignal::default(), tx);
        Stub.generate_streaming(&GenerationRequest::new("x"), stream)
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(GenerationEvent::Image(_))));
        assert!(rx.recv().await.is_none());
    }
}
