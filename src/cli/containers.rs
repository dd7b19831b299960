//! `pmr start` / `pmr stop`.

use std::sync::Arc;

use crate::config::{Config, EngineSettings, process_env};
use crate::container::{ContainerConfig, Coordinator, CoordinatorOptions, Engine, LeaseOrigin};
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::session::Session;

fn container_config(engine: Engine) -> anyhow::Result<ContainerConfig> {
    Ok(EngineSettings::resolve(engine, &process_env)?.to_container_config()?)
}

/// Start each engine's container and leave it running for later test runs.
pub async fn run_start_command(
    runtime: &DockerRuntime,
    config: &Config,
    engines: &[Engine],
) -> anyhow::Result<()> {
    // Pre-started containers outlive this process and are never recorded.
    let options = CoordinatorOptions {
        multiprocess_safe: false,
        cleanup: false,
        readiness: config.readiness,
    };
    let coordinator = Coordinator::new(
        Arc::new(runtime.clone()),
        Arc::new(Session::from_config(config)),
        options,
    );

    for &engine in engines {
        let container = container_config(engine)?;
        let lease = coordinator.acquire(&container).await?;
        let status = match lease.origin() {
            LeaseOrigin::AlreadyRunning => "already running",
            LeaseOrigin::StartedHere => "started",
            LeaseOrigin::StartedElsewhere => "started by another process",
        };
        println!(
            "{engine}: {} {} on {}:{}",
            lease.container_name(),
            status,
            lease.host(),
            lease.port()
        );
        lease.release().await;
    }
    Ok(())
}

/// Kill each engine's container by its derived name.
///
/// Missing containers are reported and skipped.
pub async fn run_stop_command(runtime: &dyn ContainerRuntime, engines: &[Engine]) -> anyhow::Result<()> {
    for &engine in engines {
        let container = container_config(engine)?;
        let name = container.container_name();
        let stopped = match runtime.get(name).await {
            Ok(handle) => runtime.kill(&handle).await,
            Err(e) => Err(e),
        };
        match stopped {
            Ok(()) => println!("Stopped {engine} container {name}"),
            Err(e) => {
                tracing::debug!("Stopping {} failed: {}", name, e);
                println!("Failed to stop {engine} container");
            }
        }
    }
    Ok(())
}
