use std::sync::Arc;
use std::time::{Duration, Instant};

use flock::backends::{BackendAdapter, BackendEnvironment, BackendRegistry, BackendType};
use flock::{BackendStatus, PoolConfig, PoolManager, Settings, WorkerId};

use crate::mock::MockAdapter;

pub const MOCK_TYPE: &str = "mock";

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Pool settings with short retry and poll intervals.
pub fn fast_config() -> PoolConfig {
    PoolConfig::default()
        .with_init_retry_delay(10)
        .with_acquire_poll_interval(20)
        .with_drain_timeout(2)
        .with_shutdown_grace(1)
}

/// Registry with a `mock` type built by [`MockAdapter::from_settings`].
pub fn mock_registry() -> BackendRegistry {
    BackendRegistry::new(BackendEnvironment::new()).with_type(BackendType::new(
        MOCK_TYPE,
        "Mock",
        "In-memory test backend",
        |settings, _env| {
            Ok(Arc::new(MockAdapter::from_settings(settings)) as Arc<dyn BackendAdapter>)
        },
    ))
}

/// Start a pool, register `adapters` and wait until all of them run.
pub async fn running_pool(
    config: PoolConfig,
    adapters: Vec<Arc<MockAdapter>>,
) -> (PoolManager, Vec<WorkerId>) {
    let pool = PoolManager::new(config, mock_registry());
    pool.start().await.expect("pool should start");
    let mut ids = Vec::new();
    for adapter in adapters {
        let record = pool
            .register_adapter(MOCK_TYPE, "", Settings::new(), true, adapter)
            .expect("mock registers");
        ids.push(record.id());
    }
    for id in &ids {
        wait_for_status(&pool, *id, BackendStatus::Running).await;
    }
    (pool, ids)
}

/// Poll until worker `id` reports `status`, panicking after a few seconds.
pub async fn wait_for_status(pool: &PoolManager, id: WorkerId, status: BackendStatus) {
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let seen = pool.get(id).map(|record| record.status());
        if seen == Some(status) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "worker {id} never reached {status}, last seen {seen:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll `condition` until it holds, panicking with `what` after a few seconds.
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
