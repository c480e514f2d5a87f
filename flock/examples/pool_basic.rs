//! Basic pool and dispatch example with mock backends.
//!
//! This example demonstrates how to:
//! - load pool and dispatch settings from TOML
//! - register workers and watch them come up
//! - run a batch through the dispatch engine
//! - save the registrations and shut the pool down
//!
//! The workers are flock-testkit mocks, so no inference server is needed.

use std::sync::Arc;
use std::time::Duration;

use flock::telemetry::init_tracing;
use flock::*;
use flock_testkit::{MOCK_TYPE, mock_registry, wait_for_status};
use serde_json::json;

const CONFIG: &str = r#"
[pool]
max_init_attempts = 2
acquire_poll_interval_ms = 50

[dispatch]
max_degree = 3
lease_timeout_secs = 10
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("flock=info,pool_basic=info");
    println!("=== Flock Pool Basic Example ===\n");

    let config = FlockConfig::from_toml_str(CONFIG)?;
    let pool = PoolManager::new(config.pool.clone(), mock_registry());
    pool.start().await?;

    println!("1. Registering workers...");
    let mut ids = Vec::new();
    for i in 0..3 {
        let settings = json!({ "models": ["sdxl-base"], "features": ["txt2img"], "delay_ms": 150 });
        let record = pool.register_with(
            MOCK_TYPE,
            &format!("gpu{i}"),
            settings.as_object().cloned().unwrap_or_default(),
            true,
        )?;
        println!("   Registered {} (id={})", record.title(), record.id());
        ids.push(record.id());
    }
    for id in &ids {
        wait_for_status(&pool, *id, BackendStatus::Running).await;
    }
    println!("   Pool status: {:?}\n", pool.status_summary());

    println!("2. Loading a model on every worker...");
    let loaded = pool.load_model_on_all("sdxl-base").await?;
    println!("   Loaded: {loaded}\n");

    println!("3. Dispatching a batch of 8...");
    let engine = DispatchEngine::new(pool.clone(), config.dispatch.clone());
    let session = Session::new(Arc::new(User::new("example")));
    let request = GenerationRequest::new("a red fox in the snow")
        .with_seed(1234)
        .with_steps(20);
    let (mut events, handle) = engine.spawn(session.clone(), request, 8);
    while let Some(event) = events.recv().await {
        match event {
            DispatchEvent::Image {
                batch_index,
                worker_id,
                image,
            } => println!(
                "   image {batch_index} from worker {worker_id} ({} bytes)",
                image.data.len()
            ),
            DispatchEvent::Progress { .. } => {}
            DispatchEvent::Error { message, .. } => println!("   error: {message}"),
        }
    }
    let summary = handle.await?;
    println!("   Summary: {summary:?}\n");

    println!("4. Saving registrations...");
    let dir = std::env::temp_dir().join(format!("flock-example-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("backends.json");
    pool.save_backends(&path)?;
    println!("   Wrote {}\n", path.display());

    println!("5. Shutting down...");
    tokio::time::timeout(Duration::from_secs(10), pool.shutdown()).await??;
    std::fs::remove_dir_all(&dir)?;
    println!("   Done.");
    Ok(())
}
