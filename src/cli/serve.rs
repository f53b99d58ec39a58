use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

use conductor::config::RuntimeConfig;
use conductor::core::agent::Runtime;
use conductor::core::engine::RemoteEngine;
use conductor::core::lifecycle::LifecycleManager;
use conductor::core::scheduler::Scheduler;

use super::{print_status, print_success};

/// Long-running mode: periodic cache sweeps and scheduler ticks until Ctrl+C.
pub(crate) async fn run_serve(data_dir: &Path, config: &RuntimeConfig) -> Result<()> {
    let engine = Arc::new(RemoteEngine::new(&config.engine)?);
    let runtime = Arc::new(Runtime::bootstrap(data_dir, config, engine).await?);
    let scheduler = Arc::new(Scheduler::new(runtime.clone(), config.scheduler.clone()));

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(runtime.memory().clone());
    lifecycle.attach(runtime.cache().clone());

    let cache = runtime.cache().clone();
    lifecycle
        .every("cache-sweep", config.cache.sweep_interval(), move || {
            let cache = cache.clone();
            async move {
                let evicted = cache.evict_idle(Utc::now());
                debug!(evicted, remaining = cache.len(), "Cache sweep finished");
            }
        })
        .await?;

    lifecycle
        .every("scheduler-tick", config.scheduler.tick_interval(), move || {
            let scheduler = scheduler.clone();
            async move {
                match scheduler.tick(Utc::now()).await {
                    Ok(report) => debug!(
                        dispatched = report.dispatched.len(),
                        skipped = report.skipped.len(),
                        invalid = report.invalid.len(),
                        "Scheduler tick finished"
                    ),
                    Err(e) => error!("Scheduler tick failed: {}", e),
                }
            }
        })
        .await?;

    lifecycle.start().await?;

    print_success("conductor is running");
    print_status("Data directory", &data_dir.display().to_string());
    print_status(
        "Idle TTL",
        &format!("{}s (sweep every {}s)", config.cache.idle_ttl_secs, config.cache.sweep_interval().as_secs()),
    );
    print_status(
        "Scheduler tick",
        &format!("every {}s", config.scheduler.tick_interval().as_secs()),
    );
    print_status("Stop", "Ctrl+C");

    tokio::signal::ctrl_c().await?;
    lifecycle.shutdown().await
}
