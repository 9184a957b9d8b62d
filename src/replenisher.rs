use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::pool::{CloneQueue, CloneTask, Inventory, PendingCounter};

/// Cooperative stop signal for the reconciler loop.
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

/// Desired-state reconciler with low/high watermarks.
///
/// Each tick reaps broken VMs, reads `ready + pending`, and tops the pool
/// up to the low watermark without ever pushing `ready + pending` past the
/// high one. Stops at the next sleep boundary after `StopHandle::stop`.
pub struct Replenisher {
    pool: Arc<dyn Inventory>,
    queue: Arc<CloneQueue>,
    pending: Arc<PendingCounter>,
    min_ready_vm: u32,
    max_ready_vm: u32,
    batch_size: u32,
    check_interval: Duration,
    fault_vm_ttl_minutes: i64,
    stop: watch::Receiver<bool>,
}

impl Replenisher {
    pub fn new(
        pool: Arc<dyn Inventory>,
        queue: Arc<CloneQueue>,
        pending: Arc<PendingCounter>,
        cfg: &Config,
    ) -> (Self, StopHandle) {
        let (tx, rx) = watch::channel(false);
        let replenisher = Self {
            pool,
            queue,
            pending,
            min_ready_vm: cfg.min_ready_vm,
            max_ready_vm: cfg.max_ready_vm,
            batch_size: cfg.batch_size,
            check_interval: Duration::from_secs(cfg.check_interval_secs),
            fault_vm_ttl_minutes: cfg.fault_vm_ttl_minutes,
            stop: rx,
        };
        (replenisher, StopHandle(tx))
    }

    pub async fn run(mut self) {
        info!(
            low = self.min_ready_vm,
            high = self.max_ready_vm,
            "replenisher online",
        );
        while !*self.stop.borrow() {
            if let Err(e) = self.tick().await {
                // A dead reconciler is worse than a skipped tick; log and
                // try again at the next interval.
                error!(error = format!("{:#}", e), "reconciler tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
                _ = self.stop.changed() => {}
            }
        }
        info!("replenisher stopped");
    }

    /// One reconciliation pass: janitor, then the watermark check.
    pub async fn tick(&self) -> Result<()> {
        self.reap_broken_vms().await;

        let ready = self.pool.count_ready().await?;
        let pending = self.pending.value();
        let total = ready + pending;
        info!(ready, pending, total, "pool level");

        if total < self.min_ready_vm {
            let need = self.batch_size.min(self.max_ready_vm - total);
            warn!(need, ready, pending, "replenishing pool");
            for _ in 0..need {
                // inc before put: anyone computing ready + pending after
                // the put must already see the new slot.
                self.pending.inc();
                self.queue.put(CloneTask::new());
            }
        }
        Ok(())
    }

    /// Delete fault-marked VMs and init-VMs stuck past the TTL. Per-VM
    /// failures are logged and skipped; the sweep never stops the loop.
    async fn reap_broken_vms(&self) {
        let fault = match self.pool.list_fault_vms().await {
            Ok(names) => names,
            Err(e) => {
                error!(error = format!("{:#}", e), "listing fault VMs failed");
                return;
            }
        };
        let stuck = if self.fault_vm_ttl_minutes > 0 {
            match self.pool.list_init_vms(self.fault_vm_ttl_minutes).await {
                Ok(names) => names,
                Err(e) => {
                    error!(error = format!("{:#}", e), "listing stuck init VMs failed");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        // Union: a name in both lists is deleted once.
        let victims: BTreeSet<String> = fault.into_iter().chain(stuck).collect();
        if victims.is_empty() {
            return;
        }
        warn!(count = victims.len(), "deleting broken or stuck VMs");
        for name in victims {
            match self.pool.delete_vm_by_name(&name).await {
                Ok(()) => info!(vm = %name, "deleted"),
                Err(e) => error!(vm = %name, error = format!("{:#}", e), "delete failed"),
            }
        }
    }
}
