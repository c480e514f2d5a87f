use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use flock::backends::{BackendAdapter, InitOutcome, StreamContext};
use flock::pool::WorkerContext;
use flock::request::{GeneratedImage, GenerationEvent, GenerationRequest, ImageSet};
use flock::{PoolError, Settings};
use parking_lot::Mutex;
use serde_json::{Value, json};

/// What the next `generate` call does.
#[derive(Clone, Debug)]
pub enum GenerateBehavior {
    /// Return this many images.
    Images(usize),
    /// Fail with an internal error carrying this text.
    Fail(String),
    /// Fail with a pool error.
    Error(PoolError),
}

/// Counts how many generations run at once, across any number of adapters.
#[derive(Clone, Debug, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ProbeGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ProbeGuard(self)
    }

    pub fn assert_peak_at_most(&self, limit: usize) {
        assert!(
            self.peak() <= limit,
            "Expected at most {} concurrent generations, saw {}",
            limit,
            self.peak()
        );
    }
}

struct ProbeGuard<'a>(&'a ConcurrencyProbe);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory backend with scripted behavior and recorded calls.
///
/// Images carry the request seed as little-endian bytes so tests can tell
/// which unit produced them.
pub struct MockAdapter {
    init_failures: AtomicU32,
    init_error: Mutex<Option<PoolError>>,
    script: Mutex<VecDeque<GenerateBehavior>>,
    delay: Duration,
    models: Vec<String>,
    features: BTreeSet<String>,
    progress_steps: u32,
    requests: Arc<Mutex<Vec<GenerationRequest>>>,
    inits: AtomicU32,
    shutdowns: AtomicU32,
    probe: ConcurrencyProbe,
    shared_probe: Option<ConcurrencyProbe>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            init_failures: AtomicU32::new(0),
            init_error: Mutex::new(None),
            script: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            models: Vec::new(),
            features: BTreeSet::new(),
            progress_steps: 0,
            requests: Arc::new(Mutex::new(Vec::new())),
            inits: AtomicU32::new(0),
            shutdowns: AtomicU32::new(0),
            probe: ConcurrencyProbe::new(),
            shared_probe: None,
        }
    }

    /// Build from registration settings: `models`, `features` and `delay_ms`.
    pub fn from_settings(settings: &Settings) -> Self {
        let strings = |key: &str| -> Vec<String> {
            settings
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let delay = settings
            .get("delay_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Self::new()
            .with_models(strings("models"))
            .with_features(strings("features"))
            .with_delay(Duration::from_millis(delay))
    }

    /// Fail the first `times` init attempts.
    pub fn with_init_failures(self, times: u32) -> Self {
        self.init_failures.store(times, Ordering::SeqCst);
        self
    }

    /// Fail every init attempt with `error`.
    pub fn with_init_error(self, error: PoolError) -> Self {
        *self.init_error.lock() = Some(error);
        self
    }

    /// Queue behaviors for upcoming `generate` calls. Once the queue is empty
    /// every call returns one image.
    pub fn with_script(self, behaviors: impl IntoIterator<Item = GenerateBehavior>) -> Self {
        self.script.lock().extend(behaviors);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    /// Emit this many progress events before the images when streaming.
    pub fn with_progress(mut self, steps: u32) -> Self {
        self.progress_steps = steps;
        self
    }

    /// Also report concurrency to a probe shared with other adapters.
    pub fn with_probe(mut self, probe: ConcurrencyProbe) -> Self {
        self.shared_probe = Some(probe);
        self
    }

    pub fn push(&self, behavior: GenerateBehavior) {
        self.script.lock().push_back(behavior);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    pub fn generate_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn inits(&self) -> u32 {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Most generations this adapter ran at once.
    pub fn peak_in_flight(&self) -> usize {
        self.probe.peak()
    }

    pub fn assert_generate_count_eq(&self, expected: usize) {
        assert_eq!(
            self.generate_count(),
            expected,
            "Expected {} generate calls, got {}",
            expected,
            self.generate_count()
        );
    }

    pub fn image_for(seed: i64) -> GeneratedImage {
        GeneratedImage::new("image/png", seed.to_le_bytes().to_vec())
    }

    async fn run(&self, request: &GenerationRequest) -> Result<ImageSet> {
        self.requests.lock().push(request.clone());
        let _local = self.probe.enter();
        let _shared = self.shared_probe.as_ref().map(ConcurrencyProbe::enter);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let behavior = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(GenerateBehavior::Images(1));
        match behavior {
            GenerateBehavior::Images(count) => {
                Ok((0..count).map(|_| Self::image_for(request.seed)).collect())
            }
            GenerateBehavior::Fail(message) => Err(anyhow::anyhow!(message)),
            GenerateBehavior::Error(error) => Err(error.into()),
        }
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
    async fn init(&self, _ctx: &WorkerContext) -> Result<InitOutcome> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.init_error.lock().clone() {
            return Err(error.into());
        }
        let failing = self
            .init_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("mock init failure");
        }
        Ok(InitOutcome::Ready)
    }

    async fn shutdown(&self, _ctx: &WorkerContext) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    async fn load_model(&self, model: &str) -> Result<bool> {
        Ok(self.models.iter().any(|known| known == model))
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<ImageSet> {
        self.run(request).await
    }

    async fn generate_streaming(
        &self,
        request: &GenerationRequest,
        stream: StreamContext,
    ) -> Result<()> {
        for step in 0..self.progress_steps {
            stream
                .emit(GenerationEvent::Progress {
                    batch_index: stream.batch_index,
                    data: json!({ "step": step, "steps": self.progress_steps }),
                })
                .await;
        }
        let images = self.run(request).await?;
        stream.emit_images(images).await;
        Ok(())
    }

    fn supported_features(&self) -> BTreeSet<String> {
        self.features.clone()
    }
}
