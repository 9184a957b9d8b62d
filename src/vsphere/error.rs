use thiserror::Error;

use super::gateway::PowerState;

/// Typed failures of the vCenter gateway, one variant per operation.
#[derive(Debug, Error)]
pub enum VSphereError {
    #[error("failed to connect to vCenter {host}: {details}")]
    Connect { host: String, details: String },

    #[error("vCenter API request {path} failed: {details}")]
    Api { path: String, details: String },

    #[error("VM '{vm_name}' not found")]
    VmNotFound { vm_name: String },

    #[error("failed to clone VM '{vm_name}': {details}")]
    Clone { vm_name: String, details: String },

    #[error("failed to power on VM '{vm_name}' (last observed state: {state})")]
    PowerOn { vm_name: String, state: PowerState },

    #[error("failed to power off VM '{vm_name}' (last observed state: {state})")]
    PowerOff { vm_name: String, state: PowerState },

    #[error("failed to suspend VM '{vm_name}' (last observed state: {state})")]
    Suspend { vm_name: String, state: PowerState },

    #[error("failed to delete VM '{vm_name}': {details}")]
    Delete { vm_name: String, details: String },

    #[error("failed to rename VM '{vm_name}' to '{new_name}': {details}")]
    Rename {
        vm_name: String,
        new_name: String,
        details: String,
    },

    #[error("failed to move VM '{vm_name}' to folder '{folder}': {details}")]
    Move {
        vm_name: String,
        folder: String,
        details: String,
    },

    #[error("failed to reconfigure VM '{vm_name}': {details}")]
    Reconfigure { vm_name: String, details: String },

    #[error("no IP found for VM '{vm_name}' with MAC {mac}")]
    IpNotFound { vm_name: String, mac: String },

    #[error("VM '{vm_name}' not ready for ADB connection within {timeout_secs}s")]
    WaitReady { vm_name: String, timeout_secs: u64 },

    #[error("vSphere task '{label}' failed: {message}")]
    Task { label: String, message: String },
}
