use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use crate::naming::{self, VmClass};
use crate::vsphere::{CreationTimestamp, Gateway, ManagedVM, VSphereError};

/// The slice of the pool the replenisher consumes.
///
/// Kept narrow so control-loop tests can run against an in-memory stub.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Refresh inventory and count ready-marker names.
    async fn count_ready(&self) -> Result<u32>;
    /// Names of fault-marked VMs.
    async fn list_fault_vms(&self) -> Result<Vec<String>>;
    /// Names of init-VMs at least `older_than_minutes` old (UTC).
    async fn list_init_vms(&self, older_than_minutes: i64) -> Result<Vec<String>>;
    /// Power off (ignoring errors) and destroy a VM.
    async fn delete_vm_by_name(&self, name: &str) -> Result<()>;
}

/// Name-prefix classifier over the environment folder.
///
/// Renaming between classes is the pool's sole state transition; the 8-hex
/// suffix stays stable across a VM's whole life.
#[derive(Clone)]
pub struct PoolView {
    gateway: Arc<Mutex<Gateway>>,
    env: String,
}

impl PoolView {
    pub fn new(gateway: Gateway, env: &str) -> Self {
        Self {
            gateway: Arc::new(Mutex::new(gateway)),
            env: env.to_string(),
        }
    }

    fn classify(&self, name: &str) -> Option<VmClass> {
        naming::parse_name(&self.env, name).map(|(class, _)| class)
    }

    fn list_class(&self, class: VmClass) -> Result<Vec<ManagedVM>, VSphereError> {
        let mut gateway = self.gateway.lock().unwrap();
        let vms = gateway.list_env_vms(&self.env)?;
        Ok(vms
            .into_iter()
            .filter(|vm| self.classify(&vm.name) == Some(class))
            .collect())
    }

    pub fn count_ready_sync(&self) -> Result<u32, VSphereError> {
        let ready = self.list_class(VmClass::Ready)?;
        debug!(count = ready.len(), "ready VMs in pool");
        Ok(ready.len() as u32)
    }

    pub fn list_fault_sync(&self) -> Result<Vec<String>, VSphereError> {
        Ok(self
            .list_class(VmClass::Fault)?
            .into_iter()
            .map(|vm| vm.name)
            .collect())
    }

    /// Init-VMs stuck longer than the TTL.
    ///
    /// A non-positive TTL disables the sweep entirely. VMs exposing neither
    /// a create date nor a boot time (normal right after a clone) count as
    /// young and are excluded.
    pub fn list_init_sync(&self, older_than_minutes: i64) -> Result<Vec<String>, VSphereError> {
        if older_than_minutes <= 0 {
            return Ok(Vec::new());
        }
        let cutoff = Utc::now() - ChronoDuration::minutes(older_than_minutes);
        let candidates = self.list_class(VmClass::Init)?;

        let mut gateway = self.gateway.lock().unwrap();
        let mut victims = Vec::new();
        for mut vm in candidates {
            let created = match gateway.vm_creation_timestamp(&mut vm) {
                Ok(created) => created,
                Err(e) => {
                    // Likely deleted underneath us; skip rather than abort
                    // the whole sweep.
                    warn!(vm = %vm.name, error = %e, "could not read creation time");
                    continue;
                }
            };
            if is_older_than(created, cutoff) {
                victims.push(vm.name);
            }
        }
        Ok(victims)
    }

    /// Rename to the ready class, preserving the 8-hex suffix.
    pub fn mark_ready(&self, vm: &mut ManagedVM) -> Result<(), VSphereError> {
        let target = naming::with_class(&self.env, &vm.name, VmClass::Ready);
        self.gateway.lock().unwrap().rename_vm(vm, &target)
    }

    /// Rename to the fault class, preserving the 8-hex suffix.
    pub fn mark_fault(&self, vm: &mut ManagedVM) -> Result<(), VSphereError> {
        let target = naming::with_class(&self.env, &vm.name, VmClass::Fault);
        self.gateway.lock().unwrap().rename_vm(vm, &target)
    }

    pub fn mark_fault_by_name(&self, name: &str) -> Result<(), VSphereError> {
        let mut gateway = self.gateway.lock().unwrap();
        let mut vm = gateway.get_vm_by_name(name)?;
        let target = naming::with_class(&self.env, &vm.name, VmClass::Fault);
        gateway.rename_vm(&mut vm, &target)
    }

    pub fn delete_vm_by_name_sync(&self, name: &str) -> Result<(), VSphereError> {
        let mut gateway = self.gateway.lock().unwrap();
        let mut vm = gateway.get_vm_by_name(name)?;
        if let Err(e) = gateway.power_off_vm(&mut vm) {
            warn!(vm = name, error = %e, "power off before delete failed, continuing");
        }
        gateway.delete_vm(&mut vm)
    }
}

/// Age check with the explicit fallback rule: unknown creation time means
/// the VM is young.
fn is_older_than(created: CreationTimestamp, cutoff: DateTime<Utc>) -> bool {
    match created {
        CreationTimestamp::Known(ts) => ts <= cutoff,
        CreationTimestamp::Unknown => false,
    }
}

#[async_trait]
impl Inventory for PoolView {
    async fn count_ready(&self) -> Result<u32> {
        let view = self.clone();
        tokio::task::spawn_blocking(move || view.count_ready_sync())
            .await
            .context("count_ready task panicked")?
            .context("count_ready failed")
    }

    async fn list_fault_vms(&self) -> Result<Vec<String>> {
        let view = self.clone();
        tokio::task::spawn_blocking(move || view.list_fault_sync())
            .await
            .context("list_fault_vms task panicked")?
            .context("list_fault_vms failed")
    }

    async fn list_init_vms(&self, older_than_minutes: i64) -> Result<Vec<String>> {
        let view = self.clone();
        tokio::task::spawn_blocking(move || view.list_init_sync(older_than_minutes))
            .await
            .context("list_init_vms task panicked")?
            .context("list_init_vms failed")
    }

    async fn delete_vm_by_name(&self, name: &str) -> Result<()> {
        let view = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || view.delete_vm_by_name_sync(&name))
            .await
            .context("delete_vm_by_name task panicked")?
            .context("delete_vm_by_name failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_older_than_known() {
        let cutoff = Utc::now();
        let old = CreationTimestamp::Known(cutoff - ChronoDuration::minutes(5));
        let young = CreationTimestamp::Known(cutoff + ChronoDuration::minutes(5));
        assert!(is_older_than(old, cutoff));
        assert!(!is_older_than(young, cutoff));
    }

    #[test]
    fn test_is_older_than_boundary_inclusive() {
        let cutoff = Utc::now();
        assert!(is_older_than(CreationTimestamp::Known(cutoff), cutoff));
    }

    #[test]
    fn test_unknown_creation_time_counts_as_young() {
        assert!(!is_older_than(CreationTimestamp::Unknown, Utc::now()));
    }
}
