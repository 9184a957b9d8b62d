use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::nsx::NsxArpResolver;

use super::error::VSphereError;
use super::session::Session;

/// Guest readiness is probed on the ADB port; no VMware Tools in the image.
const ADB_PORT: u16 = 5555;
const ADB_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const ADB_POLL: Duration = Duration::from_secs(2);
const ARP_POLL: Duration = Duration::from_secs(5);
const TASK_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Suspended,
    Unknown,
}

impl PowerState {
    fn from_api(state: &str) -> Self {
        match state {
            "POWERED_ON" => Self::On,
            "POWERED_OFF" => Self::Off,
            "SUSPENDED" => Self::Suspended,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
            Self::Suspended => write!(f, "suspended"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// When a VM was created, as far as vCenter can tell.
///
/// Freshly cloned VMs may expose neither a create date nor a boot time;
/// such VMs count as young everywhere an age check happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationTimestamp {
    Known(DateTime<Utc>),
    Unknown,
}

/// A vSphere VM handle pinned by name.
///
/// Handles are not valid across session reconnects; every operation taking
/// one re-resolves it by name when the reconnect probe fired.
#[derive(Debug, Clone)]
pub struct ManagedVM {
    pub id: String,
    pub name: String,
    pub power_state: PowerState,
    /// MAC of the first virtual NIC, once the detail fetch has run.
    pub mac_address: Option<String>,
    pub created_at: CreationTimestamp,
}

/// VM lifecycle operations over a vCenter session.
///
/// Owns the session and the NSX resolver used for MAC → IP lookups during
/// readiness waits. Task-style API calls are polled at 1 s granularity
/// until they succeed or fail.
pub struct Gateway {
    session: Session,
    nsx: NsxArpResolver,
}

impl Gateway {
    /// Open a fresh vCenter session (and a lazy NSX resolver) from config.
    pub fn connect(cfg: &Config) -> Result<Self, VSphereError> {
        let session = Session::connect(
            &cfg.vcenter_host,
            &cfg.vcenter_user,
            &cfg.vcenter_password,
            cfg.vcenter_port,
        )?;
        let nsx = NsxArpResolver::new(
            &cfg.nsx_host,
            cfg.nsx_port,
            &cfg.nsx_user,
            &cfg.nsx_password,
            &cfg.nsx_switch_name,
            Duration::from_secs(cfg.nsx_cli_timeout_secs),
        );
        Ok(Self { session, nsx })
    }

    // ---- handle resolution ----

    /// Resolve a VM by name, probing the session first.
    pub fn get_vm_by_name(&mut self, name: &str) -> Result<ManagedVM, VSphereError> {
        self.session.reconnect_if_needed()?;
        self.resolve_by_name(name)
    }

    fn resolve_by_name(&self, name: &str) -> Result<ManagedVM, VSphereError> {
        let listing = self
            .session
            .call(Method::GET, "/api/vcenter/vm", &[("names", name)], None)?;
        let summary = listing
            .as_array()
            .and_then(|vms| vms.first())
            .ok_or_else(|| VSphereError::VmNotFound {
                vm_name: name.to_string(),
            })?;
        let mut vm = parse_vm_summary(summary).ok_or_else(|| VSphereError::VmNotFound {
            vm_name: name.to_string(),
        })?;
        self.hydrate(&mut vm)?;
        Ok(vm)
    }

    /// Fill in NIC and creation-time data from the VM detail endpoint.
    fn hydrate(&self, vm: &mut ManagedVM) -> Result<(), VSphereError> {
        let detail = self
            .session
            .call(Method::GET, &format!("/api/vcenter/vm/{}", vm.id), &[], None)?;
        vm.mac_address = first_nic_mac(&detail);
        vm.created_at = creation_timestamp(&detail);
        Ok(())
    }

    /// Re-resolve a handle by name if the session had to reconnect.
    fn ensure_fresh(&mut self, vm: &mut ManagedVM) -> Result<(), VSphereError> {
        if self.session.reconnect_if_needed()? {
            *vm = self.resolve_by_name(&vm.name)?;
        }
        Ok(())
    }

    /// All VMs whose ancestor folder tree is rooted at a folder named
    /// `env_folder`. Summaries only; details are fetched on demand.
    pub fn list_env_vms(&mut self, env_folder: &str) -> Result<Vec<ManagedVM>, VSphereError> {
        self.session.reconnect_if_needed()?;

        let folder_ids = self.env_folder_tree(env_folder)?;
        if folder_ids.is_empty() {
            debug!(folder = env_folder, "no environment folder in inventory");
            return Ok(Vec::new());
        }

        let query: Vec<(&str, &str)> = folder_ids
            .iter()
            .map(|id| ("folders", id.as_str()))
            .collect();
        let listing = self
            .session
            .call(Method::GET, "/api/vcenter/vm", &query, None)?;
        let vms = listing
            .as_array()
            .map(|arr| arr.iter().filter_map(parse_vm_summary).collect())
            .unwrap_or_default();
        Ok(vms)
    }

    /// Folders named `env_folder` plus all their descendants.
    fn env_folder_tree(&self, env_folder: &str) -> Result<Vec<String>, VSphereError> {
        let roots = self.session.call(
            Method::GET,
            "/api/vcenter/folder",
            &[("type", "VIRTUAL_MACHINE"), ("names", env_folder)],
            None,
        )?;
        let mut pending: Vec<String> = folder_ids(&roots);
        let mut all = Vec::new();
        while let Some(id) = pending.pop() {
            let children = self.session.call(
                Method::GET,
                "/api/vcenter/folder",
                &[("type", "VIRTUAL_MACHINE"), ("parent_folders", id.as_str())],
                None,
            )?;
            pending.extend(folder_ids(&children));
            all.push(id);
        }
        Ok(all)
    }

    /// Creation timestamp for a VM, from the detail endpoint.
    pub fn vm_creation_timestamp(
        &mut self,
        vm: &mut ManagedVM,
    ) -> Result<CreationTimestamp, VSphereError> {
        self.ensure_fresh(vm)?;
        self.hydrate(vm)?;
        Ok(vm.created_at)
    }

    // ---- lifecycle operations ----

    /// Clone `source_name` into `new_name` under `folder_path`, creating
    /// missing folders. Placement keeps the source's resource pool and
    /// first datastore.
    pub fn clone_vm(
        &mut self,
        source_name: &str,
        new_name: &str,
        folder_path: &str,
    ) -> Result<ManagedVM, VSphereError> {
        self.session.reconnect_if_needed()?;

        let source = self
            .resolve_by_name(source_name)
            .map_err(|e| VSphereError::Clone {
                vm_name: new_name.to_string(),
                details: format!("source VM '{}': {}", source_name, e),
            })?;
        let folder = self
            .ensure_folder_path(folder_path)
            .map_err(|e| VSphereError::Clone {
                vm_name: new_name.to_string(),
                details: format!("folder path '{}': {}", folder_path, e),
            })?;

        info!(source = source_name, clone = new_name, "cloning VM");
        let body = json!({
            "source": source.id,
            "name": new_name,
            "power_on": false,
            "placement": { "folder": folder },
        });
        let task = self.session.call(
            Method::POST,
            "/api/vcenter/vm",
            &[("action", "clone"), ("vmw-task", "true")],
            Some(&body),
        )?;
        self.wait_for_task(&task, "clone")
            .map_err(|e| VSphereError::Clone {
                vm_name: new_name.to_string(),
                details: e.to_string(),
            })?;

        // The task can report success while inventory has already lost the
        // VM (renamed or deleted underneath us); that is a clone failure.
        self.resolve_by_name(new_name)
            .map_err(|_| VSphereError::Clone {
                vm_name: new_name.to_string(),
                details: "clone task succeeded but the VM was not found".to_string(),
            })
    }

    fn power_state_of(&self, vm_id: &str) -> Result<PowerState, VSphereError> {
        let power = self.session.call(
            Method::GET,
            &format!("/api/vcenter/vm/{}/power", vm_id),
            &[],
            None,
        )?;
        Ok(power
            .get("state")
            .and_then(Value::as_str)
            .map(PowerState::from_api)
            .unwrap_or(PowerState::Unknown))
    }

    /// Power on, a no-op when the VM already runs.
    pub fn power_on_vm(&mut self, vm: &mut ManagedVM) -> Result<(), VSphereError> {
        self.ensure_fresh(vm)?;
        let state = self.power_state_of(&vm.id)?;
        if state == PowerState::On {
            debug!(vm = %vm.name, "already powered on");
            vm.power_state = state;
            return Ok(());
        }
        info!(vm = %vm.name, "powering on");
        self.session
            .call(
                Method::POST,
                &format!("/api/vcenter/vm/{}/power", vm.id),
                &[("action", "start")],
                None,
            )
            .map_err(|_| VSphereError::PowerOn {
                vm_name: vm.name.clone(),
                state,
            })?;
        vm.power_state = PowerState::On;
        Ok(())
    }

    /// Power off, a no-op when the VM is already off.
    pub fn power_off_vm(&mut self, vm: &mut ManagedVM) -> Result<(), VSphereError> {
        self.ensure_fresh(vm)?;
        let state = self.power_state_of(&vm.id)?;
        if state == PowerState::Off {
            debug!(vm = %vm.name, "already powered off");
            vm.power_state = state;
            return Ok(());
        }
        info!(vm = %vm.name, "powering off");
        self.session
            .call(
                Method::POST,
                &format!("/api/vcenter/vm/{}/power", vm.id),
                &[("action", "stop")],
                None,
            )
            .map_err(|_| VSphereError::PowerOff {
                vm_name: vm.name.clone(),
                state,
            })?;
        vm.power_state = PowerState::Off;
        Ok(())
    }

    /// Suspend, a no-op when the VM is already suspended.
    pub fn suspend_vm(&mut self, vm: &mut ManagedVM) -> Result<(), VSphereError> {
        self.ensure_fresh(vm)?;
        let state = self.power_state_of(&vm.id)?;
        if state == PowerState::Suspended {
            debug!(vm = %vm.name, "already suspended");
            vm.power_state = state;
            return Ok(());
        }
        info!(vm = %vm.name, "suspending");
        self.session
            .call(
                Method::POST,
                &format!("/api/vcenter/vm/{}/power", vm.id),
                &[("action", "suspend")],
                None,
            )
            .map_err(|_| VSphereError::Suspend {
                vm_name: vm.name.clone(),
                state,
            })?;
        vm.power_state = PowerState::Suspended;
        Ok(())
    }

    /// Best-effort power off, mandatory power on, then wait for readiness.
    /// Returns the resolved guest IP.
    pub fn restart_vm(
        &mut self,
        vm: &mut ManagedVM,
        ready_timeout: Duration,
    ) -> Result<String, VSphereError> {
        info!(vm = %vm.name, "restarting");
        if let Err(e) = self.power_off_vm(vm) {
            warn!(vm = %vm.name, error = %e, "power off before restart failed, continuing");
        }
        self.power_on_vm(vm)?;
        self.wait_for_vm_ready(vm, ready_timeout)
    }

    /// Wait until the guest has an IP (NSX ARP, polled every 5 s) and
    /// accepts a TCP handshake on the ADB port (polled every 2 s), both
    /// under one hard deadline.
    pub fn wait_for_vm_ready(
        &mut self,
        vm: &mut ManagedVM,
        timeout: Duration,
    ) -> Result<String, VSphereError> {
        self.ensure_fresh(vm)?;
        if vm.mac_address.is_none() {
            self.hydrate(vm)?;
        }
        let mac = vm
            .mac_address
            .clone()
            .ok_or_else(|| VSphereError::IpNotFound {
                vm_name: vm.name.clone(),
                mac: "unknown".to_string(),
            })?;

        info!(vm = %vm.name, mac = %mac, "waiting for guest readiness");
        let deadline = Instant::now() + timeout;

        let mut resolved = None;
        while Instant::now() < deadline {
            match self.nsx.get_ip_by_mac(&mac) {
                Ok(Some(ip)) => {
                    resolved = Some(ip);
                    break;
                }
                Ok(None) => debug!(vm = %vm.name, "no ARP entry yet"),
                // NSX hiccups are transient inside the wait window; the
                // deadline bounds a persistent outage.
                Err(e) => warn!(vm = %vm.name, error = %e, "ARP lookup failed, will retry"),
            }
            thread::sleep(ARP_POLL);
        }
        let Some(ip) = resolved else {
            return Err(VSphereError::IpNotFound {
                vm_name: vm.name.clone(),
                mac,
            });
        };

        let addr = ip
            .parse::<Ipv4Addr>()
            .map(|v4| SocketAddr::from((v4, ADB_PORT)))
            .map_err(|_| VSphereError::IpNotFound {
                vm_name: vm.name.clone(),
                mac: mac.clone(),
            })?;

        while Instant::now() < deadline {
            if TcpStream::connect_timeout(&addr, ADB_DIAL_TIMEOUT).is_ok() {
                info!(vm = %vm.name, ip = %ip, "guest is ready on the ADB port");
                thread::sleep(Duration::from_secs(1));
                return Ok(ip);
            }
            thread::sleep(ADB_POLL);
        }
        Err(VSphereError::WaitReady {
            vm_name: vm.name.clone(),
            timeout_secs: timeout.as_secs(),
        })
    }

    /// Rename via a vSphere task; the handle tracks the new name.
    pub fn rename_vm(&mut self, vm: &mut ManagedVM, new_name: &str) -> Result<(), VSphereError> {
        self.ensure_fresh(vm)?;
        info!(vm = %vm.name, new_name, "renaming VM");
        let result = self
            .session
            .call(
                Method::POST,
                &format!("/api/vcenter/vm/{}", vm.id),
                &[("action", "rename"), ("vmw-task", "true")],
                Some(&json!({ "name": new_name })),
            )
            .and_then(|task| self.wait_for_task(&task, "rename"));
        result.map_err(|e| VSphereError::Rename {
            vm_name: vm.name.clone(),
            new_name: new_name.to_string(),
            details: e.to_string(),
        })?;
        vm.name = new_name.to_string();
        Ok(())
    }

    /// Move a VM into `folder_path`, creating missing folder segments.
    pub fn move_vm_to_folder(
        &mut self,
        vm: &mut ManagedVM,
        folder_path: &str,
    ) -> Result<(), VSphereError> {
        self.ensure_fresh(vm)?;
        let move_err = |details: String| VSphereError::Move {
            vm_name: vm.name.clone(),
            folder: folder_path.to_string(),
            details,
        };
        let folder = self
            .ensure_folder_path(folder_path)
            .map_err(|e| move_err(e.to_string()))?;
        info!(vm = %vm.name, folder = folder_path, "moving VM");
        self.session
            .call(
                Method::POST,
                &format!("/api/vcenter/vm/{}", vm.id),
                &[("action", "relocate"), ("vmw-task", "true")],
                Some(&json!({ "placement": { "folder": folder } })),
            )
            .and_then(|task| self.wait_for_task(&task, "relocate"))
            .map_err(|e| move_err(e.to_string()))?;
        Ok(())
    }

    /// Destroy a VM. Callers power off first; destroy on a running VM is
    /// left to vCenter to reject.
    pub fn delete_vm(&mut self, vm: &mut ManagedVM) -> Result<(), VSphereError> {
        self.ensure_fresh(vm)?;
        info!(vm = %vm.name, "deleting VM");
        self.session
            .call(
                Method::DELETE,
                &format!("/api/vcenter/vm/{}", vm.id),
                &[],
                None,
            )
            .map_err(|e| VSphereError::Delete {
                vm_name: vm.name.clone(),
                details: e.to_string(),
            })?;
        Ok(())
    }

    /// Change CPU count and memory size.
    pub fn reconfigure_vm(
        &mut self,
        vm: &mut ManagedVM,
        cpus: u32,
        memory_mb: u64,
    ) -> Result<(), VSphereError> {
        self.ensure_fresh(vm)?;
        info!(vm = %vm.name, cpus, memory_mb, "reconfiguring VM");
        let reconf_err = |e: VSphereError| VSphereError::Reconfigure {
            vm_name: vm.name.clone(),
            details: e.to_string(),
        };
        self.session
            .call(
                Method::PATCH,
                &format!("/api/vcenter/vm/{}/hardware/cpu", vm.id),
                &[],
                Some(&json!({ "count": cpus })),
            )
            .map_err(&reconf_err)?;
        self.session
            .call(
                Method::PATCH,
                &format!("/api/vcenter/vm/{}/hardware/memory", vm.id),
                &[],
                Some(&json!({ "size_MiB": memory_mb })),
            )
            .map_err(&reconf_err)?;
        Ok(())
    }

    // ---- folders and tasks ----

    /// Walk a slash-separated path from the datacenter, creating missing
    /// folders. Returns the leaf folder id.
    fn ensure_folder_path(&mut self, folder_path: &str) -> Result<String, VSphereError> {
        let mut parts = folder_path.split('/').filter(|s| !s.is_empty());
        let dc_name = parts.next().ok_or_else(|| VSphereError::Api {
            path: "/api/vcenter/folder".to_string(),
            details: format!("empty folder path: {:?}", folder_path),
        })?;

        let dcs = self.session.call(
            Method::GET,
            "/api/vcenter/datacenter",
            &[("names", dc_name)],
            None,
        )?;
        let dc_id = dcs
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|dc| dc.get("datacenter"))
            .and_then(Value::as_str)
            .ok_or_else(|| VSphereError::Api {
                path: "/api/vcenter/datacenter".to_string(),
                details: format!("datacenter '{}' not found", dc_name),
            })?
            .to_string();

        let mut parent: Option<String> = None;
        for segment in parts {
            let existing = self.find_child_folder(&dc_id, parent.as_deref(), segment)?;
            let id = match existing {
                Some(id) => id,
                None => {
                    info!(folder = segment, path = folder_path, "creating folder");
                    self.create_folder(&dc_id, parent.as_deref(), segment)?
                }
            };
            parent = Some(id);
        }
        parent.ok_or_else(|| VSphereError::Api {
            path: "/api/vcenter/folder".to_string(),
            details: format!("folder path '{}' has no folder segments", folder_path),
        })
    }

    fn find_child_folder(
        &self,
        dc_id: &str,
        parent: Option<&str>,
        name: &str,
    ) -> Result<Option<String>, VSphereError> {
        let mut query = vec![
            ("type", "VIRTUAL_MACHINE"),
            ("datacenters", dc_id),
            ("names", name),
        ];
        if let Some(parent) = parent {
            query.push(("parent_folders", parent));
        }
        let found = self
            .session
            .call(Method::GET, "/api/vcenter/folder", &query, None)?;
        Ok(folder_ids(&found).into_iter().next())
    }

    fn create_folder(
        &self,
        dc_id: &str,
        parent: Option<&str>,
        name: &str,
    ) -> Result<String, VSphereError> {
        let mut body = json!({ "name": name, "type": "VIRTUAL_MACHINE" });
        match parent {
            Some(parent) => body["parent_folder"] = json!(parent),
            None => body["datacenter"] = json!(dc_id),
        }
        let created = self
            .session
            .call(Method::POST, "/api/vcenter/folder", &[], Some(&body))?;
        created
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| VSphereError::Api {
                path: "/api/vcenter/folder".to_string(),
                details: format!("folder create for '{}' returned no id", name),
            })
    }

    /// Poll a task at 1 s granularity until it finishes. On failure the
    /// task's error message is surfaced.
    fn wait_for_task(&self, task: &Value, label: &str) -> Result<Value, VSphereError> {
        let task_id = task.as_str().ok_or_else(|| VSphereError::Task {
            label: label.to_string(),
            message: format!("expected a task id, got {}", task),
        })?;
        loop {
            let status = self.session.call(
                Method::GET,
                &format!("/api/cis/tasks/{}", task_id),
                &[],
                None,
            )?;
            match status.get("status").and_then(Value::as_str) {
                Some("SUCCEEDED") => return Ok(status.get("result").cloned().unwrap_or(Value::Null)),
                Some("FAILED") => {
                    return Err(VSphereError::Task {
                        label: label.to_string(),
                        message: task_error_message(&status),
                    });
                }
                _ => thread::sleep(TASK_POLL),
            }
        }
    }
}

fn folder_ids(listing: &Value) -> Vec<String> {
    listing
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|f| f.get("folder").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_vm_summary(summary: &Value) -> Option<ManagedVM> {
    Some(ManagedVM {
        id: summary.get("vm")?.as_str()?.to_string(),
        name: summary.get("name")?.as_str()?.to_string(),
        power_state: summary
            .get("power_state")
            .and_then(Value::as_str)
            .map(PowerState::from_api)
            .unwrap_or(PowerState::Unknown),
        mac_address: None,
        created_at: CreationTimestamp::Unknown,
    })
}

/// MAC of the first virtual NIC, by device order.
fn first_nic_mac(detail: &Value) -> Option<String> {
    let nics = detail.get("nics")?.as_object()?;
    let mut keys: Vec<&String> = nics.keys().collect();
    keys.sort();
    keys.into_iter()
        .filter_map(|k| {
            nics.get(k)
                .and_then(|nic| nic.get("mac_address"))
                .and_then(Value::as_str)
        })
        .next()
        .map(str::to_string)
}

/// Creation time from the detail payload: `create_date` when present,
/// falling back to the runtime `boot_time`, else Unknown.
fn creation_timestamp(detail: &Value) -> CreationTimestamp {
    for key in ["create_date", "boot_time"] {
        if let Some(raw) = detail.get(key).and_then(Value::as_str)
            && let Ok(ts) = DateTime::parse_from_rfc3339(raw)
        {
            return CreationTimestamp::Known(ts.with_timezone(&Utc));
        }
    }
    CreationTimestamp::Unknown
}

fn task_error_message(status: &Value) -> String {
    status
        .get("error")
        .and_then(|e| e.get("messages"))
        .and_then(Value::as_array)
        .and_then(|msgs| msgs.first())
        .and_then(|m| m.get("default_message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown task error")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_state_from_api() {
        assert_eq!(PowerState::from_api("POWERED_ON"), PowerState::On);
        assert_eq!(PowerState::from_api("POWERED_OFF"), PowerState::Off);
        assert_eq!(PowerState::from_api("SUSPENDED"), PowerState::Suspended);
        assert_eq!(PowerState::from_api("GARBAGE"), PowerState::Unknown);
    }

    #[test]
    fn test_parse_vm_summary() {
        let summary = json!({
            "vm": "vm-1042",
            "name": "[Prod] VM2login_a3f7b2c1",
            "power_state": "POWERED_OFF",
        });
        let vm = parse_vm_summary(&summary).unwrap();
        assert_eq!(vm.id, "vm-1042");
        assert_eq!(vm.name, "[Prod] VM2login_a3f7b2c1");
        assert_eq!(vm.power_state, PowerState::Off);
        assert!(vm.mac_address.is_none());
        assert_eq!(vm.created_at, CreationTimestamp::Unknown);
    }

    #[test]
    fn test_parse_vm_summary_rejects_incomplete() {
        assert!(parse_vm_summary(&json!({ "name": "x" })).is_none());
        assert!(parse_vm_summary(&json!({ "vm": "vm-1" })).is_none());
    }

    #[test]
    fn test_first_nic_mac_takes_lowest_device() {
        let detail = json!({
            "nics": {
                "4001": { "mac_address": "00:50:56:aa:68:17" },
                "4000": { "mac_address": "00:50:56:aa:68:16" },
            }
        });
        assert_eq!(first_nic_mac(&detail).as_deref(), Some("00:50:56:aa:68:16"));
        assert!(first_nic_mac(&json!({ "nics": {} })).is_none());
        assert!(first_nic_mac(&json!({})).is_none());
    }

    #[test]
    fn test_creation_timestamp_prefers_create_date() {
        let detail = json!({
            "create_date": "2026-07-01T10:00:00Z",
            "boot_time": "2026-07-02T10:00:00Z",
        });
        let CreationTimestamp::Known(ts) = creation_timestamp(&detail) else {
            panic!("expected a known timestamp");
        };
        assert_eq!(ts, "2026-07-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn test_creation_timestamp_boot_time_fallback() {
        let detail = json!({ "boot_time": "2026-07-02T10:00:00Z" });
        assert!(matches!(
            creation_timestamp(&detail),
            CreationTimestamp::Known(_)
        ));
    }

    #[test]
    fn test_creation_timestamp_unknown_for_fresh_clone() {
        assert_eq!(creation_timestamp(&json!({})), CreationTimestamp::Unknown);
        assert_eq!(
            creation_timestamp(&json!({ "create_date": "garbage" })),
            CreationTimestamp::Unknown
        );
    }

    #[test]
    fn test_task_error_message() {
        let status = json!({
            "status": "FAILED",
            "error": { "messages": [ { "default_message": "disk full" } ] },
        });
        assert_eq!(task_error_message(&status), "disk full");
        assert_eq!(task_error_message(&json!({})), "unknown task error");
    }
}
