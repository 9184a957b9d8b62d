use std::process::Command;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;

/// Exit status the `timeout(1)` wrapper uses; maps to `InstallTimeout` so
/// the worker retries the phase without restarting the VM.
const INSTALL_TIMEOUT_EXIT: i32 = 124;

#[derive(Debug, Error)]
pub enum GuestError {
    /// The in-guest install did not finish in time; worth a plain re-run.
    #[error("guest install timed out")]
    InstallTimeout,

    #[error("{0}")]
    Other(String),
}

/// The two opaque guest-side provisioning phases.
///
/// Each runs to completion or raises; the refiller inspects nothing beyond
/// the outcome.
pub trait GuestPhases {
    /// OS bootstrap inside the freshly booted guest.
    fn bootstrap(&self, ip: &str) -> Result<(), GuestError>;
    /// In-app tutorial walk-through.
    fn tutorial(&self, ip: &str, vm_name: &str) -> Result<(), GuestError>;
}

/// Production phases: configured external commands run through the shell
/// with the target exposed via `GUEST_IP` / `VM_NAME`. An unset command
/// means the deployment has no such phase.
pub struct HookRunner {
    bootstrap_cmd: Option<String>,
    tutorial_cmd: Option<String>,
}

impl HookRunner {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            bootstrap_cmd: cfg.guest_bootstrap_cmd.clone(),
            tutorial_cmd: cfg.app_tutorial_cmd.clone(),
        }
    }
}

impl GuestPhases for HookRunner {
    fn bootstrap(&self, ip: &str) -> Result<(), GuestError> {
        match &self.bootstrap_cmd {
            Some(cmd) => run_hook(cmd, &[("GUEST_IP", ip)], "guest bootstrap"),
            None => {
                info!("no guest bootstrap command configured, skipping phase");
                Ok(())
            }
        }
    }

    fn tutorial(&self, ip: &str, vm_name: &str) -> Result<(), GuestError> {
        match &self.tutorial_cmd {
            Some(cmd) => run_hook(cmd, &[("GUEST_IP", ip), ("VM_NAME", vm_name)], "app tutorial"),
            None => {
                info!("no app tutorial command configured, skipping phase");
                Ok(())
            }
        }
    }
}

fn run_hook(cmd: &str, envs: &[(&str, &str)], label: &str) -> Result<(), GuestError> {
    info!(hook = label, "running guest phase command");
    let status = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .envs(envs.iter().copied())
        .status()
        .map_err(|e| GuestError::Other(format!("{} command failed to start: {}", label, e)))?;

    if status.success() {
        return Ok(());
    }
    if status.code() == Some(INSTALL_TIMEOUT_EXIT) {
        warn!(hook = label, "guest phase reported an install timeout");
        return Err(GuestError::InstallTimeout);
    }
    Err(GuestError::Other(format!(
        "{} exited with {}",
        label, status
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_hook_success() {
        assert!(run_hook("true", &[], "test").is_ok());
    }

    #[test]
    fn test_run_hook_failure_is_other() {
        let err = run_hook("exit 3", &[], "test").unwrap_err();
        assert!(matches!(err, GuestError::Other(_)));
    }

    #[test]
    fn test_run_hook_exit_124_is_install_timeout() {
        let err = run_hook("exit 124", &[], "test").unwrap_err();
        assert!(matches!(err, GuestError::InstallTimeout));
    }

    #[test]
    fn test_run_hook_sees_env() {
        assert!(run_hook(r#"test "$GUEST_IP" = "192.0.2.7""#, &[("GUEST_IP", "192.0.2.7")], "test").is_ok());
    }

    #[test]
    fn test_unset_hooks_are_noops() {
        let runner = HookRunner {
            bootstrap_cmd: None,
            tutorial_cmd: None,
        };
        assert!(runner.bootstrap("192.0.2.7").is_ok());
        assert!(runner.tutorial("192.0.2.7", "[Dev] VMInit_00000000").is_ok());
    }
}
