use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use crate::config::Config;
use crate::pool::{CloneQueue, PendingCounter, PoolView};
use crate::replenisher::Replenisher;
use crate::vsphere::Gateway;
use crate::worker::pool::TransientSessionFaultMarker;
use crate::worker::{BuilderPool, WorkerCommand};

/// Wire the control plane together and run it until a shutdown signal.
///
/// Shutdown order: stop the replenisher, wait for every enqueued build to
/// finish (`CloneQueue::join`), then cancel the builder pool.
pub async fn run(cfg: Config) -> Result<()> {
    cfg.log_values();

    // The control-plane session; failing to reach vCenter here is fatal.
    let gateway = {
        let cfg = cfg.clone();
        tokio::task::spawn_blocking(move || Gateway::connect(&cfg))
            .await
            .context("vCenter connect task panicked")?
            .context("cannot reach vCenter")?
    };
    let view = PoolView::new(gateway, &cfg.vm_prefix);

    let queue = Arc::new(CloneQueue::new());
    let pending = Arc::new(PendingCounter::new());

    let (replenisher, stop) =
        Replenisher::new(Arc::new(view), queue.clone(), pending.clone(), &cfg);
    let builder_pool = Arc::new(BuilderPool::new(
        queue.clone(),
        pending.clone(),
        WorkerCommand::current_exe()?,
        Arc::new(TransientSessionFaultMarker::new(cfg.clone())),
        &cfg,
    ));

    let replenisher_task = tokio::spawn(replenisher.run());
    let builder_task = tokio::spawn(builder_pool.run());

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received, draining in-flight builds");

    stop.stop();
    queue.join().await;
    builder_task.abort();
    replenisher_task
        .await
        .context("replenisher task panicked")?;

    info!("drained, exiting");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}
