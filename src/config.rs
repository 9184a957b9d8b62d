use std::env;
use std::fmt::Display;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use tracing::info;

/// Runtime configuration, read once at startup from the environment.
///
/// Required keys abort startup when missing; everything else falls back to
/// the defaults below. `log_values` dumps the effective configuration with
/// the source of each value, so a misdeployed env file is visible in the
/// first lines of the log.
#[derive(Debug, Clone)]
pub struct Config {
    /// Low watermark: replenish while `ready + pending` is below this.
    pub min_ready_vm: u32,
    /// Hard upper bound on `ready + pending`.
    pub max_ready_vm: u32,
    /// Max clone tasks enqueued per reconciler tick.
    pub batch_size: u32,
    /// Seconds between reconciler ticks.
    pub check_interval_secs: u64,
    /// Golden template name, without the env prefix.
    pub golden_name: String,

    pub pool_op_retries: u32,
    pub pool_op_backoff_secs: f64,
    /// Seconds to wait for IP resolution + ADB-port readiness.
    pub ip_timeout_secs: u64,
    /// Max concurrent worker processes.
    pub builder_proc: usize,
    /// Hard per-worker deadline, seconds.
    pub worker_timeout_secs: u64,
    /// Age at which stuck init-VMs are reaped, minutes.
    pub fault_vm_ttl_minutes: i64,

    /// Environment name used in the `[<env>] *` name prefix.
    pub vm_prefix: String,

    pub vcenter_host: String,
    pub vcenter_user: String,
    pub vcenter_password: String,
    pub vcenter_port: u16,

    pub nsx_host: String,
    pub nsx_user: String,
    pub nsx_password: String,
    pub nsx_port: u16,
    pub nsx_switch_name: String,
    /// Seconds of CLI output quiescence before a command is considered done.
    pub nsx_cli_timeout_secs: u64,

    /// External command for the guest bootstrap phase; unset skips the phase.
    pub guest_bootstrap_cmd: Option<String>,
    /// External command for the in-app tutorial phase; unset skips the phase.
    pub app_tutorial_cmd: Option<String>,
}

fn required<T>(key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = env::var(key).map_err(|_| anyhow!("required environment variable {} is not set", key))?;
    raw.parse()
        .map_err(|e| anyhow!("invalid value for {}: {:?} ({})", key, raw, e))
}

fn parsed_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow!("invalid value for {}: {:?} ({})", key, raw, e)),
        Err(_) => Ok(default),
    }
}

fn string_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let cfg = Self {
            min_ready_vm: required("REFILLER_MIN_READY_VM")?,
            max_ready_vm: required("REFILLER_MAX_READY_VM")?,
            batch_size: required("REFILLER_BATCH_SIZE")?,
            check_interval_secs: required("REFILLER_CHECK_INTERVAL")?,
            golden_name: required("REFILLER_GOLDEN_VM_NAME")?,

            pool_op_retries: parsed_or("POOL_OP_RETRIES", 3)?,
            pool_op_backoff_secs: parsed_or("POOL_OP_BACKOFF", 2.0)?,
            ip_timeout_secs: parsed_or("IP_TIMEOUT", 10)?,
            builder_proc: parsed_or("REFILLER_BUILDER_PROC", 2)?,
            worker_timeout_secs: parsed_or("WORKER_TIMEOUT", 1800)?,
            fault_vm_ttl_minutes: parsed_or("FAULT_VM_TTL_MINUTES", 60)?,

            vm_prefix: string_or("VM_PREFIX", "Dev").trim().to_string(),

            vcenter_host: string_or("VCENTER_HOST", ""),
            vcenter_user: string_or("VCENTER_USER", ""),
            vcenter_password: string_or("VCENTER_PASSWORD", ""),
            vcenter_port: parsed_or("VCENTER_PORT", 443)?,

            nsx_host: string_or("NSX_HOST", ""),
            nsx_user: string_or("NSX_USER", ""),
            nsx_password: string_or("NSX_PASSWORD", ""),
            nsx_port: parsed_or("NSX_PORT", 22)?,
            nsx_switch_name: string_or("NSX_SWITCH_NAME", ""),
            nsx_cli_timeout_secs: parsed_or("NSX_CLI_TIMEOUT", 2)?,

            guest_bootstrap_cmd: env::var("GUEST_BOOTSTRAP_CMD").ok(),
            app_tutorial_cmd: env::var("APP_TUTORIAL_CMD").ok(),
        };

        if cfg.max_ready_vm < cfg.min_ready_vm {
            anyhow::bail!(
                "REFILLER_MAX_READY_VM ({}) must be >= REFILLER_MIN_READY_VM ({})",
                cfg.max_ready_vm,
                cfg.min_ready_vm,
            );
        }

        Ok(cfg)
    }

    /// Log every recognized option with whether it came from the environment
    /// or a built-in default. Secrets are redacted.
    pub fn log_values(&self) {
        let entries: [(&str, String); 24] = [
            ("REFILLER_MIN_READY_VM", self.min_ready_vm.to_string()),
            ("REFILLER_MAX_READY_VM", self.max_ready_vm.to_string()),
            ("REFILLER_BATCH_SIZE", self.batch_size.to_string()),
            ("REFILLER_CHECK_INTERVAL", self.check_interval_secs.to_string()),
            ("REFILLER_GOLDEN_VM_NAME", self.golden_name.clone()),
            ("POOL_OP_RETRIES", self.pool_op_retries.to_string()),
            ("POOL_OP_BACKOFF", self.pool_op_backoff_secs.to_string()),
            ("IP_TIMEOUT", self.ip_timeout_secs.to_string()),
            ("REFILLER_BUILDER_PROC", self.builder_proc.to_string()),
            ("WORKER_TIMEOUT", self.worker_timeout_secs.to_string()),
            ("FAULT_VM_TTL_MINUTES", self.fault_vm_ttl_minutes.to_string()),
            ("VM_PREFIX", self.vm_prefix.clone()),
            ("VCENTER_HOST", self.vcenter_host.clone()),
            ("VCENTER_USER", self.vcenter_user.clone()),
            ("VCENTER_PASSWORD", redact(&self.vcenter_password)),
            ("VCENTER_PORT", self.vcenter_port.to_string()),
            ("NSX_HOST", self.nsx_host.clone()),
            ("NSX_USER", self.nsx_user.clone()),
            ("NSX_PASSWORD", redact(&self.nsx_password)),
            ("NSX_PORT", self.nsx_port.to_string()),
            ("NSX_SWITCH_NAME", self.nsx_switch_name.clone()),
            ("NSX_CLI_TIMEOUT", self.nsx_cli_timeout_secs.to_string()),
            (
                "GUEST_BOOTSTRAP_CMD",
                self.guest_bootstrap_cmd.clone().unwrap_or_default(),
            ),
            (
                "APP_TUTORIAL_CMD",
                self.app_tutorial_cmd.clone().unwrap_or_default(),
            ),
        ];
        for (key, value) in entries {
            let source = if env::var_os(key).is_some() { "env" } else { "default" };
            info!(source, "{}={}", key, value);
        }
    }
}

fn redact(secret: &str) -> String {
    if secret.is_empty() { String::new() } else { "***".to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var access is process-global; tests that set variables use unique
    // keys instead of mutating the real REFILLER_* ones.

    #[test]
    fn test_required_missing() {
        let err = required::<u32>("ZEON_TEST_DEFINITELY_UNSET").unwrap_err();
        assert!(err.to_string().contains("ZEON_TEST_DEFINITELY_UNSET"));
    }

    #[test]
    fn test_parsed_or_default() {
        assert_eq!(parsed_or("ZEON_TEST_DEFINITELY_UNSET", 7u32).unwrap(), 7);
    }

    #[test]
    fn test_parsed_or_env_value() {
        unsafe { env::set_var("ZEON_TEST_PARSED_OR", "42") };
        assert_eq!(parsed_or("ZEON_TEST_PARSED_OR", 7u32).unwrap(), 42);
        unsafe { env::remove_var("ZEON_TEST_PARSED_OR") };
    }

    #[test]
    fn test_parsed_or_invalid_value() {
        unsafe { env::set_var("ZEON_TEST_PARSED_BAD", "not-a-number") };
        let err = parsed_or("ZEON_TEST_PARSED_BAD", 7u32).unwrap_err();
        assert!(err.to_string().contains("ZEON_TEST_PARSED_BAD"));
        unsafe { env::remove_var("ZEON_TEST_PARSED_BAD") };
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact(""), "");
        assert_eq!(redact("hunter2"), "***");
    }
}
