use std::collections::HashSet;
use std::sync::atomic::AtomicU32;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::timeout;

use super::*;
use crate::backends::{BackendEnvironment, BackendType, InitOutcome};
use crate::request::{GeneratedImage, GenerationRequest, ImageSet};

#[derive(Default)]
struct StubAdapter {
    failures_left: AtomicU32,
    config_invalid: bool,
    init_delay: Duration,
    models: Vec<String>,
    features: BTreeSet<String>,
    shadows: usize,
    inits: AtomicU32,
    shutdowns: AtomicU32,
}

impl StubAdapter {
    fn from_settings(settings: &Settings) -> Self {
        let models = settings
            .get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            models,
            ..Self::default()
        }
    }

    fn failing(times: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(times),
            ..Self::default()
        }
    }

    fn inits(&self) -> u32 {
        self.inits.load(Ordering::SeqCst)
    }

    fn shutdowns(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendAdapter for StubAdapter {
    async fn init(&self, ctx: &WorkerContext) -> Result<InitOutcome> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        if self.config_invalid {
            return Err(PoolError::ConfigInvalid("stub rejects its settings".into()).into());
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("stub init failure");
        }
        for _ in 0..self.shadows {
            ctx.register_shadow(Arc::new(StubAdapter::default()))?;
        }
        Ok(InitOutcome::Ready)
    }

    async fn shutdown(&self, _ctx: &WorkerContext) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    async fn load_model(&self, model: &str) -> Result<bool> {
        Ok(self.models.iter().any(|m| m == model))
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<ImageSet> {
        Ok(vec![GeneratedImage::new("image/png", vec![1])])
    }

    async fn free_memory(&self, _system_ram: bool) -> Result<bool> {
        Ok(!self.models.is_empty())
    }

    fn supported_features(&self) -> BTreeSet<String> {
        self.features.clone()
    }
}

fn test_config() -> PoolConfig {
    PoolConfig::default()
        .with_init_retry_delay(5)
        .with_acquire_poll_interval(20)
        .with_drain_timeout(2)
        .with_shutdown_grace(1)
}

fn stub_registry() -> BackendRegistry {
    BackendRegistry::new(BackendEnvironment::new()).with_type(BackendType::new(
        "stub",
        "Stub",
        "In-memory test backend",
        |settings, _| Ok(Arc::new(StubAdapter::from_settings(settings)) as Arc<dyn BackendAdapter>),
    ))
}

async fn started_pool(config: PoolConfig) -> PoolManager {
    let pool = PoolManager::new(config, stub_registry());
    pool.start().await.unwrap();
    pool
}

fn add(pool: &PoolManager, adapter: StubAdapter) -> (WorkerId, Arc<StubAdapter>) {
    let adapter = Arc::new(adapter);
    let record = pool
        .register_adapter("stub", "", Settings::new(), true, adapter.clone())
        .unwrap();
    (record.id(), adapter)
}

async fn wait_for_status(pool: &PoolManager, id: WorkerId, status: BackendStatus) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while pool.get(id).map(|record| record.status()) != Some(status) {
        assert!(
            Instant::now() < deadline,
            "worker {id} never reached {status}, last seen {:?}",
            pool.get(id).map(|record| record.status())
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn settings(value: Value) -> Settings {
    match value {
        Value::Object(map) => map,
        _ => Settings::new(),
    }
}

#[tokio::test]
async fn empty_pool_is_unavailable_immediately() {
    let pool = started_pool(test_config()).await;
    let started = Instant::now();
    let err = pool.acquire(Some(Duration::from_secs(5))).await.unwrap_err();
    assert_eq!(err, PoolError::Unavailable);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn leases_are_exclusive_and_bounded_by_timeout() {
    let pool = started_pool(test_config()).await;
    let (id, _) = add(&pool, StubAdapter::default());
    wait_for_status(&pool, id, BackendStatus::Running).await;

    let first = pool.acquire(Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(first.worker_id(), id);
    assert!(pool.get(id).unwrap().is_in_use());

    let started = Instant::now();
    let err = pool
        .acquire(Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert_eq!(err, PoolError::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(1));

    drop(first);
    let second = pool.acquire(Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(second.worker_id(), id);
}

#[tokio::test]
async fn concurrent_acquires_never_share_a_worker() {
    let pool = started_pool(test_config()).await;
    let ids: Vec<_> = (0..3).map(|_| add(&pool, StubAdapter::default()).0).collect();
    for id in &ids {
        wait_for_status(&pool, *id, BackendStatus::Running).await;
    }

    let active = Arc::new(Mutex::new(HashSet::new()));
    let peak = Arc::new(AtomicU32::new(0));
    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        let active = active.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            let lease = pool.acquire(Some(Duration::from_secs(5))).await.unwrap();
            {
                let mut active = active.lock();
                assert!(active.insert(lease.worker_id()), "worker leased twice");
                peak.fetch_max(active.len() as u32, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            active.lock().remove(&lease.worker_id());
            lease.release();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(pool.list().iter().all(|w| !w.in_use));
    assert_eq!(pool.list().iter().map(|w| w.usages).sum::<u64>(), 12);
}

#[tokio::test]
async fn waiter_wakes_when_lease_is_released() {
    let pool = started_pool(test_config().with_acquire_poll_interval(5_000)).await;
    let (id, _) = add(&pool, StubAdapter::default());
    wait_for_status(&pool, id, BackendStatus::Running).await;

    let held = pool.acquire(None).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(Some(Duration::from_secs(10))).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let released_at = Instant::now();
    held.release();

    let lease = timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter should wake on release")
        .unwrap()
        .unwrap();
    assert_eq!(lease.worker_id(), id);
    assert!(released_at.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn release_is_idempotent() {
    let pool = started_pool(test_config()).await;
    let (id, _) = add(&pool, StubAdapter::default());
    wait_for_status(&pool, id, BackendStatus::Running).await;

    let lease = pool.acquire(None).await.unwrap();
    pool.release(&lease);
    lease.release();
    assert!(lease.is_released());
    drop(lease);

    let snapshot = pool.get(id).unwrap().snapshot();
    assert_eq!(snapshot.usages, 1);
    assert!(!snapshot.in_use);
}

#[tokio::test]
async fn shutdown_fails_waiters_and_new_requests() {
    let pool = started_pool(test_config()).await;
    let (id, adapter) = add(&pool, StubAdapter::default());
    wait_for_status(&pool, id, BackendStatus::Running).await;

    let held = pool.acquire(None).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let shutdown = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.shutdown().await })
    };
    let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), PoolError::ShuttingDown);

    drop(held);
    shutdown.await.unwrap().unwrap();
    assert_eq!(adapter.shutdowns(), 1);
    assert_eq!(pool.get(id).unwrap().status(), BackendStatus::Disabled);

    assert_eq!(pool.acquire(None).await.unwrap_err(), PoolError::ShuttingDown);
    let err = pool.register("stub", Settings::new()).unwrap_err();
    assert_eq!(PoolError::find(&err), Some(&PoolError::ShuttingDown));
    pool.shutdown().await.unwrap();
    assert_eq!(adapter.shutdowns(), 1);
}

#[tokio::test]
async fn shutdown_returns_once_held_leases_are_released() {
    let pool = started_pool(test_config().with_shutdown_grace(3)).await;
    let (id, adapter) = add(&pool, StubAdapter::default());
    wait_for_status(&pool, id, BackendStatus::Running).await;

    let held = pool.acquire(None).await.unwrap();
    let holder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
    });

    let started = Instant::now();
    timeout(Duration::from_secs(5), pool.shutdown())
        .await
        .unwrap()
        .unwrap();
    let took = started.elapsed();
    holder.await.unwrap();

    assert!(took < Duration::from_secs(1), "shutdown took {took:?}");
    assert_eq!(adapter.shutdowns(), 1);
    assert!(!pool.get(id).unwrap().is_in_use());
}

#[tokio::test]
async fn init_failures_retry_then_error() {
    let pool = started_pool(test_config()).await;
    let (flaky, flaky_adapter) = add(&pool, StubAdapter::failing(1));
    let (broken, broken_adapter) = add(&pool, StubAdapter::failing(u32::MAX));

    wait_for_status(&pool, flaky, BackendStatus::Running).await;
    wait_for_status(&pool, broken, BackendStatus::Errored).await;
    assert_eq!(flaky_adapter.inits(), 2);
    assert_eq!(broken_adapter.inits(), pool.config().max_init_attempts);
}

#[tokio::test]
async fn config_errors_are_not_retried() {
    let pool = started_pool(test_config()).await;
    let (id, adapter) = add(
        &pool,
        StubAdapter {
            config_invalid: true,
            ..StubAdapter::default()
        },
    );
    wait_for_status(&pool, id, BackendStatus::Errored).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(adapter.inits(), 1);
}

#[tokio::test]
async fn loading_workers_are_waited_for() {
    let pool = started_pool(test_config()).await;
    let (id, _) = add(
        &pool,
        StubAdapter {
            init_delay: Duration::from_millis(100),
            ..StubAdapter::default()
        },
    );
    let lease = pool.acquire(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(lease.worker_id(), id);
}

#[tokio::test]
async fn toggle_disables_and_reenables() {
    let pool = started_pool(test_config()).await;
    let (id, adapter) = add(&pool, StubAdapter::default());
    wait_for_status(&pool, id, BackendStatus::Running).await;

    assert!(pool.toggle(id, false).await.unwrap());
    assert_eq!(pool.get(id).unwrap().status(), BackendStatus::Disabled);
    assert_eq!(adapter.shutdowns(), 1);
    assert_eq!(pool.acquire(None).await.unwrap_err(), PoolError::Unavailable);
    assert!(!pool.toggle(id, false).await.unwrap());

    assert!(pool.toggle(id, true).await.unwrap());
    wait_for_status(&pool, id, BackendStatus::Running).await;
    assert_eq!(adapter.inits(), 2);
}

#[tokio::test]
async fn toggle_waits_for_the_current_lease() {
    let pool = started_pool(test_config()).await;
    let (id, _) = add(&pool, StubAdapter::default());
    wait_for_status(&pool, id, BackendStatus::Running).await;

    let lease = pool.acquire(None).await.unwrap();
    let toggle = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.toggle(id, false).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!toggle.is_finished());
    assert_eq!(pool.get(id).unwrap().status(), BackendStatus::Running);
    assert!(pool.get(id).unwrap().snapshot().reserved);

    drop(lease);
    assert!(toggle.await.unwrap().unwrap());
    assert_eq!(pool.get(id).unwrap().status(), BackendStatus::Disabled);
    assert!(!pool.get(id).unwrap().snapshot().reserved);
}

#[tokio::test]
async fn delete_removes_worker_and_its_shadows() {
    let pool = started_pool(test_config()).await;
    let (id, adapter) = add(
        &pool,
        StubAdapter {
            shadows: 2,
            ..StubAdapter::default()
        },
    );
    wait_for_status(&pool, id, BackendStatus::Running).await;
    assert_eq!(pool.list().len(), 3);

    let shadows: Vec<_> = pool.list().into_iter().filter(|w| !w.is_real).collect();
    assert!(shadows.iter().all(|w| w.parent == Some(id)));
    for shadow in &shadows {
        wait_for_status(&pool, shadow.id, BackendStatus::Running).await;
    }
    assert_eq!(pool.status_summary().status, "running");

    assert!(pool.delete(id).await.unwrap());
    assert_eq!(adapter.shutdowns(), 1);
    assert!(pool.list().is_empty());
    assert!(!pool.delete(id).await.unwrap());
    assert_eq!(pool.acquire(None).await.unwrap_err(), PoolError::Unavailable);
}

#[tokio::test]
async fn edit_replaces_settings_and_reinitialises() {
    let pool = started_pool(test_config()).await;
    let record = pool
        .register("stub", settings(json!({ "models": ["a"] })))
        .unwrap();
    let id = record.id();
    wait_for_status(&pool, id, BackendStatus::Running).await;
    assert!(pool.load_model_on_all("a").await.unwrap());

    pool.edit(id, Some("renamed".into()), settings(json!({ "models": ["b"] })))
        .await
        .unwrap();
    wait_for_status(&pool, id, BackendStatus::Running).await;

    let snapshot = record.snapshot();
    assert_eq!(snapshot.title, "renamed");
    assert_eq!(snapshot.modcount, 1);
    assert_eq!(snapshot.current_model, None);
    assert_eq!(snapshot.settings["models"], json!(["b"]));
    assert!(!pool.load_model_on_all("a").await.unwrap());
    assert!(pool.load_model_on_all("b").await.unwrap());

    let err = pool
        .edit(WorkerId(99), None, Settings::new())
        .await
        .unwrap_err();
    assert_eq!(PoolError::find(&err), Some(&PoolError::UnknownWorker(WorkerId(99))));
}

#[tokio::test]
async fn restart_reinitialises_running_workers_only() {
    let pool = started_pool(test_config()).await;
    let (running, running_adapter) = add(&pool, StubAdapter::default());
    let disabled = pool
        .register_with("stub", "off", Settings::new(), false)
        .unwrap()
        .id();
    wait_for_status(&pool, running, BackendStatus::Running).await;

    assert!(pool.restart(running).await.unwrap());
    wait_for_status(&pool, running, BackendStatus::Running).await;
    assert_eq!(running_adapter.inits(), 2);
    assert_eq!(running_adapter.shutdowns(), 1);

    assert!(!pool.restart(disabled).await.unwrap());
    assert_eq!(pool.restart_all().await.unwrap(), 1);
}

#[tokio::test]
async fn first_eligible_prefers_registration_order() {
    let pool = started_pool(test_config()).await;
    let (first, _) = add(&pool, StubAdapter::default());
    let (second, _) = add(&pool, StubAdapter::default());
    wait_for_status(&pool, first, BackendStatus::Running).await;
    wait_for_status(&pool, second, BackendStatus::Running).await;

    for _ in 0..3 {
        let lease = pool.acquire(None).await.unwrap();
        assert_eq!(lease.worker_id(), first);
    }
}

#[tokio::test]
async fn least_recently_released_rotates_workers() {
    let config = test_config().with_selection_policy(SelectionPolicy::LeastRecentlyReleased);
    let pool = started_pool(config).await;
    let (first, _) = add(&pool, StubAdapter::default());
    let (second, _) = add(&pool, StubAdapter::default());
    wait_for_status(&pool, first, BackendStatus::Running).await;
    wait_for_status(&pool, second, BackendStatus::Running).await;

    let mut order = Vec::new();
    for _ in 0..4 {
        let lease = pool.acquire(None).await.unwrap();
        order.push(lease.worker_id());
        drop(lease);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(order, vec![first, second, first, second]);
}

#[tokio::test]
async fn filtered_acquire_only_considers_matching_workers() {
    let pool = started_pool(test_config()).await;
    let (plain, _) = add(&pool, StubAdapter::default());
    let (featured, _) = add(
        &pool,
        StubAdapter {
            features: BTreeSet::from(["refiner".to_string()]),
            ..StubAdapter::default()
        },
    );
    wait_for_status(&pool, plain, BackendStatus::Running).await;
    wait_for_status(&pool, featured, BackendStatus::Running).await;

    let lease = pool
        .acquire_matching(Some(Duration::from_secs(1)), |record| {
            record.features().contains("refiner")
        })
        .await
        .unwrap();
    assert_eq!(lease.worker_id(), featured);
    assert!(pool.supported_features().contains("refiner"));

    let err = pool
        .acquire_matching(Some(Duration::from_secs(1)), |record| {
            record.features().contains("video")
        })
        .await
        .unwrap_err();
    assert_eq!(err, PoolError::Unavailable);
}

#[tokio::test]
async fn load_model_on_all_reports_any_success() {
    let pool = started_pool(test_config()).await;
    let a = pool.register("stub", settings(json!({ "models": ["a"] }))).unwrap();
    let b = pool.register("stub", settings(json!({ "models": ["b"] }))).unwrap();
    wait_for_status(&pool, a.id(), BackendStatus::Running).await;
    wait_for_status(&pool, b.id(), BackendStatus::Running).await;

    assert!(pool.load_model_on_all("a").await.unwrap());
    assert_eq!(a.current_model().as_deref(), Some("a"));
    assert_eq!(b.current_model(), None);

    assert!(!pool.load_model_on_all("missing").await.unwrap());
    assert!(pool.load_model_on_all(NO_MODEL).await.unwrap());
}

#[tokio::test]
async fn model_requests_prefer_workers_with_the_model_loaded() {
    let pool = started_pool(test_config()).await;
    let first = pool.register("stub", settings(json!({ "models": ["a"] }))).unwrap();
    let second = pool.register("stub", settings(json!({ "models": ["a", "b"] }))).unwrap();
    wait_for_status(&pool, first.id(), BackendStatus::Running).await;
    wait_for_status(&pool, second.id(), BackendStatus::Running).await;

    // Only the second worker can load "b".
    let lease = pool
        .acquire_for_model(Some(Duration::from_secs(1)), Some("b"), |_| true)
        .await
        .unwrap();
    assert_eq!(lease.worker_id(), second.id());
    assert_eq!(second.current_model().as_deref(), Some("b"));
    assert_eq!(first.current_model(), None);
    drop(lease);

    // Already loaded, so it wins over registration order.
    let lease = pool
        .acquire_for_model(Some(Duration::from_secs(1)), Some("b"), |_| true)
        .await
        .unwrap();
    assert_eq!(lease.worker_id(), second.id());
    drop(lease);

    let lease = pool
        .acquire_for_model(Some(Duration::from_secs(1)), None, |_| true)
        .await
        .unwrap();
    assert_eq!(lease.worker_id(), first.id());
    drop(lease);

    let err = pool
        .acquire_for_model(Some(Duration::from_secs(1)), Some("missing"), |_| true)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::InvalidData(message) if message.contains("missing")));
    assert!(!first.is_in_use());
    assert!(!second.is_in_use());
}

#[tokio::test]
async fn free_memory_counts_running_workers_that_freed() {
    let pool = started_pool(test_config()).await;
    let a = pool.register("stub", settings(json!({ "models": ["a"] }))).unwrap();
    let b = pool.register("stub", settings(json!({}))).unwrap();
    let c = pool.register("stub", settings(json!({ "models": ["c"] }))).unwrap();
    for id in [a.id(), b.id(), c.id()] {
        wait_for_status(&pool, id, BackendStatus::Running).await;
    }
    assert_eq!(pool.free_memory_all(false).await, 2);

    pool.toggle(c.id(), false).await.unwrap();
    assert_eq!(pool.free_memory_all(true).await, 1);
}

#[tokio::test]
async fn backends_file_restores_registrations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backends.json");

    let pool = started_pool(test_config()).await;
    let on = pool
        .register_with("stub", "gpu0", settings(json!({ "models": ["a"] })), true)
        .unwrap();
    let off = pool
        .register_with("stub", "gpu1", Settings::new(), false)
        .unwrap();
    pool.save_backends(&path).unwrap();

    let restored = started_pool(test_config()).await;
    assert_eq!(restored.load_backends(&path).unwrap(), 2);
    wait_for_status(&restored, on.id(), BackendStatus::Running).await;
    let off_record = restored.get(off.id()).unwrap();
    assert_eq!(off_record.title(), "gpu1");
    assert_eq!(off_record.status(), BackendStatus::Disabled);

    let next = restored.register("stub", Settings::new()).unwrap();
    assert!(next.id() > off.id());
}

#[tokio::test]
async fn backends_file_skips_unknown_types() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backends.json");
    std::fs::write(
        &path,
        r#"{ "backends": [
            { "id": 4, "type": "nope", "title": "x", "enabled": true },
            { "id": 7, "type": "stub", "title": "y", "enabled": true }
        ] }"#,
    )
    .unwrap();

    let pool = started_pool(test_config()).await;
    assert_eq!(pool.load_backends(&path).unwrap(), 1);
    assert!(pool.get(WorkerId(4)).is_none());
    assert!(pool.get(WorkerId(7)).is_some());
    assert_eq!(pool.load_backends(dir.path().join("missing.json")).unwrap(), 0);
}

#[tokio::test]
async fn status_summary_tracks_real_workers() {
    let pool = started_pool(test_config()).await;
    assert_eq!(pool.status_summary().status, "empty");

    let (broken, _) = add(
        &pool,
        StubAdapter {
            config_invalid: true,
            ..StubAdapter::default()
        },
    );
    wait_for_status(&pool, broken, BackendStatus::Errored).await;
    assert_eq!(pool.status_summary().status, "errored");

    let (healthy, _) = add(&pool, StubAdapter::default());
    wait_for_status(&pool, healthy, BackendStatus::Running).await;
    assert_eq!(pool.status_summary().status, "running");
}

#[tokio::test]
async fn status_changes_are_published() {
    let pool = started_pool(test_config()).await;
    let mut events = pool.subscribe();
    let (id, _) = add(&pool, StubAdapter::default());
    wait_for_status(&pool, id, BackendStatus::Running).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.meta.worker_id, id);
        seen.push(event.payload);
    }
    assert!(matches!(seen.first(), Some(PoolEventPayload::Registered { .. })));
    assert!(seen.contains(&PoolEventPayload::StatusChanged {
        from: BackendStatus::Loading,
        to: BackendStatus::Running,
    }));
}
