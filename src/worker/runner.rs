use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::naming::{self, VmClass};
use crate::pool::WorkerResult;
use crate::retry::retry_op;
use crate::vsphere::{Gateway, ManagedVM};

use super::guest::{GuestError, GuestPhases, HookRunner};

/// Inventory lags a finished clone task; the new VM misbehaves if driven
/// immediately.
const CLONE_SETTLE: Duration = Duration::from_secs(10);
/// Readiness window after a mid-provisioning restart.
const RESTART_READY_TIMEOUT: Duration = Duration::from_secs(300);
/// Each guest phase gets this many tries before the build is abandoned.
const GUEST_PHASE_ATTEMPTS: u32 = 3;

/// One-shot build state machine for a single VM.
///
/// Runs inside its own OS process so crashes in native client libraries
/// never take down the control plane. Produces exactly one `WorkerResult`.
struct CloneWorker {
    cfg: Config,
    source_name: String,
    name_init: String,
    name_ready: String,
    name_error: String,
    folder_path: String,
    /// Set once the clone exists; cleanup uses it to decide whether there
    /// is a VM to power off and mark.
    vm: Option<ManagedVM>,
}

impl CloneWorker {
    fn new(cfg: &Config, job_id: Uuid) -> Self {
        let env = &cfg.vm_prefix;
        let suffix = naming::job_suffix(job_id);
        Self {
            cfg: cfg.clone(),
            source_name: naming::golden_name(env, &cfg.golden_name),
            name_init: naming::format_name(env, VmClass::Init, &suffix),
            name_ready: naming::format_name(env, VmClass::Ready, &suffix),
            name_error: naming::format_name(env, VmClass::Fault, &suffix),
            folder_path: format!("DC1/Zeon/{}/LoginVMs", env),
            vm: None,
        }
    }

    /// clone → power on → wait for IP → bootstrap → tutorial → freeze →
    /// mark ready. Strictly sequential; any failure bubbles to cleanup.
    fn prepare_vm(&mut self, guest: &dyn GuestPhases) -> Result<String> {
        let retries = self.cfg.pool_op_retries;
        let backoff = self.cfg.pool_op_backoff_secs;
        let mut pool = Gateway::connect(&self.cfg).context("connecting to vCenter")?;

        let mut vm = retry_op(retries, backoff, "clone_vm", || {
            Ok(pool.clone_vm(&self.source_name, &self.name_init, &self.folder_path)?)
        })?;
        self.vm = Some(vm.clone());
        thread::sleep(CLONE_SETTLE);

        retry_op(retries, backoff, "power_on_vm", || {
            Ok(pool.power_on_vm(&mut vm)?)
        })?;

        let ip_timeout = Duration::from_secs(self.cfg.ip_timeout_secs);
        let ip = retry_op(retries, backoff, "wait_for_ip", || {
            Ok(pool.wait_for_vm_ready(&mut vm, ip_timeout)?)
        })?;
        info!(vm = %vm.name, ip = %ip, "guest is up");

        // An install timeout re-runs the bootstrap as-is; any other guest
        // failure gets a restarted VM before the next try.
        let ip = drive_guest_phase(
            "guest bootstrap",
            GUEST_PHASE_ATTEMPTS,
            true,
            ip,
            |ip| guest.bootstrap(ip),
            || Ok(pool.restart_vm(&mut vm, RESTART_READY_TIMEOUT)?),
        )?;

        let vm_name = vm.name.clone();
        drive_guest_phase(
            "app tutorial",
            GUEST_PHASE_ATTEMPTS,
            false,
            ip,
            |ip| guest.tutorial(ip, &vm_name),
            || Ok(pool.restart_vm(&mut vm, RESTART_READY_TIMEOUT)?),
        )?;

        // Freeze the provisioned guest, then flip the ready marker.
        retry_op(retries, backoff, "power_off_vm", || {
            Ok(pool.power_off_vm(&mut vm)?)
        })?;
        retry_op(retries, backoff, "mark_ready", || {
            let target = naming::with_class(&self.cfg.vm_prefix, &vm.name, VmClass::Ready);
            Ok(pool.rename_vm(&mut vm, &target)?)
        })?;

        info!(vm = %self.name_ready, "VM is ready for pickup");
        Ok(self.name_ready.clone())
    }

    /// Best-effort teardown on a fresh session (the build session may be the
    /// thing that broke). Never fails; always yields the ERR result.
    fn cleanup_on_error(&mut self, err: &anyhow::Error) -> WorkerResult {
        let diagnostic = format!("{:#}", err);
        error!(vm = %self.name_init, error = %diagnostic, "VM build failed, cleaning up");

        if self.vm.is_some() {
            match Gateway::connect(&self.cfg) {
                Ok(mut pool) => match pool.get_vm_by_name(&self.name_init) {
                    Ok(mut vm) => {
                        let off = retry_op(
                            self.cfg.pool_op_retries,
                            self.cfg.pool_op_backoff_secs,
                            "power_off_vm",
                            || Ok(pool.power_off_vm(&mut vm)?),
                        );
                        if let Err(e) = off {
                            warn!(vm = %vm.name, error = %e, "cleanup power off failed");
                        }
                        let target =
                            naming::with_class(&self.cfg.vm_prefix, &vm.name, VmClass::Fault);
                        if let Err(e) = pool.rename_vm(&mut vm, &target) {
                            warn!(vm = %vm.name, error = %e, "cleanup mark fault failed");
                        }
                    }
                    Err(e) => warn!(vm = %self.name_init, error = %e, "cleanup lookup failed"),
                },
                Err(e) => warn!(error = %e, "cleanup session could not be opened"),
            }
        }

        WorkerResult::err(self.name_error.clone(), diagnostic)
    }
}

/// Drive one guest phase with bounded retries.
///
/// `phase` receives the current guest IP. When it fails and attempts
/// remain, `restart` brings the guest back up and returns the fresh IP —
/// except for install timeouts when `plain_retry_on_timeout` is set, which
/// re-run the phase against the same guest. The final attempt's error is
/// returned as-is.
fn drive_guest_phase<P, R>(
    label: &str,
    attempts: u32,
    plain_retry_on_timeout: bool,
    mut ip: String,
    mut phase: P,
    mut restart: R,
) -> Result<String>
where
    P: FnMut(&str) -> Result<(), GuestError>,
    R: FnMut() -> Result<String>,
{
    for attempt in 1..=attempts {
        let err = match phase(&ip) {
            Ok(()) => {
                info!(phase = label, attempt, "guest phase succeeded");
                return Ok(ip);
            }
            Err(e) => e,
        };
        if attempt == attempts {
            return Err(err).with_context(|| format!("{} exhausted {} attempts", label, attempts));
        }
        if plain_retry_on_timeout && matches!(err, GuestError::InstallTimeout) {
            warn!(phase = label, attempt, "install timeout, retrying without a restart");
        } else {
            error!(phase = label, attempt, error = %err, "guest phase failed, restarting VM");
            ip = restart()?;
        }
    }
    unreachable!("phase loop returns or errors on the last attempt")
}

/// Build one VM and report the outcome. Infallible by design: every failure
/// path funnels through cleanup into an ERR result.
pub fn build_vm(cfg: &Config, job_id: Uuid, guest: &dyn GuestPhases) -> WorkerResult {
    let mut worker = CloneWorker::new(cfg, job_id);
    match worker.prepare_vm(guest) {
        Ok(ready_name) => WorkerResult::ok(ready_name),
        Err(e) => worker.cleanup_on_error(&e),
    }
}

/// Entry point of the `worker` subcommand: run the build and print the one
/// result line the builder pool reads back over stdout.
pub fn run_worker_process(job_id: Uuid) -> Result<()> {
    let cfg = Config::from_env()?;
    let guest = HookRunner::from_config(&cfg);
    let result = build_vm(&cfg, job_id, &guest);
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerStatus;
    use std::cell::Cell;

    fn test_config() -> Config {
        Config {
            min_ready_vm: 1,
            max_ready_vm: 2,
            batch_size: 1,
            check_interval_secs: 1,
            golden_name: "Golden Bliss 16".to_string(),
            pool_op_retries: 1,
            pool_op_backoff_secs: 0.001,
            ip_timeout_secs: 1,
            builder_proc: 1,
            worker_timeout_secs: 5,
            fault_vm_ttl_minutes: 60,
            vm_prefix: "Test".to_string(),
            vcenter_host: "vcenter.invalid".to_string(),
            vcenter_user: String::new(),
            vcenter_password: String::new(),
            vcenter_port: 443,
            nsx_host: String::new(),
            nsx_user: String::new(),
            nsx_password: String::new(),
            nsx_port: 22,
            nsx_switch_name: String::new(),
            nsx_cli_timeout_secs: 1,
            guest_bootstrap_cmd: None,
            app_tutorial_cmd: None,
        }
    }

    #[test]
    fn test_derived_names() {
        let job_id = Uuid::parse_str("a3f7b2c1-0000-4000-8000-000000000000").unwrap();
        let worker = CloneWorker::new(&test_config(), job_id);
        assert_eq!(worker.source_name, "[Test] Golden Bliss 16");
        assert_eq!(worker.name_init, "[Test] VMInit_a3f7b2c1");
        assert_eq!(worker.name_ready, "[Test] VM2login_a3f7b2c1");
        assert_eq!(worker.name_error, "[Test] VMError_a3f7b2c1");
        assert_eq!(worker.folder_path, "DC1/Zeon/Test/LoginVMs");
    }

    #[test]
    fn test_install_timeout_retries_without_restart() {
        let calls = Cell::new(0u32);
        let restarts = Cell::new(0u32);
        let ip = drive_guest_phase(
            "guest bootstrap",
            3,
            true,
            "192.0.2.7".to_string(),
            |_ip| {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(GuestError::InstallTimeout)
                } else {
                    Ok(())
                }
            },
            || {
                restarts.set(restarts.get() + 1);
                Ok("192.0.2.8".to_string())
            },
        )
        .unwrap();
        assert_eq!(calls.get(), 3);
        assert_eq!(restarts.get(), 0);
        // The guest was never restarted, so the IP is unchanged.
        assert_eq!(ip, "192.0.2.7");
    }

    #[test]
    fn test_other_failure_restarts_and_uses_fresh_ip() {
        let calls = Cell::new(0u32);
        let restarts = Cell::new(0u32);
        let seen_ips = std::cell::RefCell::new(Vec::new());
        let ip = drive_guest_phase(
            "guest bootstrap",
            3,
            true,
            "192.0.2.7".to_string(),
            |ip| {
                seen_ips.borrow_mut().push(ip.to_string());
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(GuestError::Other("adb dropped".to_string()))
                } else {
                    Ok(())
                }
            },
            || {
                restarts.set(restarts.get() + 1);
                Ok(format!("192.0.2.{}", 10 + restarts.get()))
            },
        )
        .unwrap();
        assert_eq!(restarts.get(), 2);
        assert_eq!(*seen_ips.borrow(), vec!["192.0.2.7", "192.0.2.11", "192.0.2.12"]);
        assert_eq!(ip, "192.0.2.12");
    }

    #[test]
    fn test_tutorial_restarts_even_on_timeout() {
        let restarts = Cell::new(0u32);
        let calls = Cell::new(0u32);
        drive_guest_phase(
            "app tutorial",
            3,
            false,
            "192.0.2.7".to_string(),
            |_ip| {
                calls.set(calls.get() + 1);
                if calls.get() < 2 {
                    Err(GuestError::InstallTimeout)
                } else {
                    Ok(())
                }
            },
            || {
                restarts.set(restarts.get() + 1);
                Ok("192.0.2.7".to_string())
            },
        )
        .unwrap();
        assert_eq!(restarts.get(), 1);
    }

    #[test]
    fn test_phase_exhaustion_returns_last_error() {
        let calls = Cell::new(0u32);
        let restarts = Cell::new(0u32);
        let err = drive_guest_phase(
            "guest bootstrap",
            3,
            true,
            "192.0.2.7".to_string(),
            |_ip| {
                calls.set(calls.get() + 1);
                Err(GuestError::InstallTimeout)
            },
            || {
                restarts.set(restarts.get() + 1);
                Ok("192.0.2.8".to_string())
            },
        )
        .unwrap_err();
        assert_eq!(calls.get(), 3);
        assert_eq!(restarts.get(), 0);
        assert!(err.to_string().contains("exhausted 3 attempts"));
    }

    #[test]
    fn test_restart_failure_aborts_the_phase() {
        let err = drive_guest_phase(
            "app tutorial",
            3,
            false,
            "192.0.2.7".to_string(),
            |_ip| Err(GuestError::Other("tutorial crashed".to_string())),
            || anyhow::bail!("power on failed"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("power on failed"));
    }

    #[test]
    fn test_build_vm_without_vcenter_reports_err_result() {
        // No reachable vCenter: the clone fails, cleanup is skipped (no VM
        // was created), and exactly one ERR result comes back.
        let cfg = test_config();
        let job_id = Uuid::parse_str("deadbeef-0000-4000-8000-000000000000").unwrap();

        struct NeverCalled;
        impl GuestPhases for NeverCalled {
            fn bootstrap(&self, _ip: &str) -> Result<(), GuestError> {
                panic!("guest phase must not run when the clone failed");
            }
            fn tutorial(&self, _ip: &str, _vm_name: &str) -> Result<(), GuestError> {
                panic!("guest phase must not run when the clone failed");
            }
        }

        let result = build_vm(&cfg, job_id, &NeverCalled);
        assert_eq!(result.status, WorkerStatus::Err);
        assert_eq!(result.vm_name, "[Test] VMError_deadbeef");
        assert!(result.message.is_some());
    }
}
