//! Hypervisor driver seam
//!
//! The lifecycle core never talks to a hypervisor process directly. It boots
//! or re-attaches instances through a [`HypervisorDriver`] and drives them
//! through the returned [`VmInstance`]. Each boot also yields the receiving
//! end of the VM's private status feed.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::config::BootConfig;
use crate::error::DriverError;

/// Status codes carried on a VM's status feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Guest is up and accepting work
    Running,
    /// Startup rejected or aborted
    Failed,
    /// Hypervisor process exited
    Exited,
    /// Instance was configured but its start was refused
    Rejected,
}

impl StatusCode {
    /// Numeric code reported to callers of release/kill
    pub fn code(&self) -> i32 {
        match self {
            StatusCode::Running => 0,
            StatusCode::Failed => 1,
            StatusCode::Exited => 2,
            StatusCode::Rejected => 3,
        }
    }
}

/// One event on a VM's status feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmEvent {
    pub vm_id: String,
    pub code: StatusCode,
    pub cause: String,
}

impl VmEvent {
    pub fn new(vm_id: impl Into<String>, code: StatusCode, cause: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            code,
            cause: cause.into(),
        }
    }

    pub fn running(vm_id: impl Into<String>) -> Self {
        Self::new(vm_id, StatusCode::Running, "")
    }
}

/// Result of a successful kill
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillOutcome {
    pub code: i32,
    pub cause: String,
}

/// A booted (or re-attached) instance together with its status feed
pub struct BootedVm {
    pub instance: Box<dyn VmInstance>,
    pub events: mpsc::Receiver<VmEvent>,
}

impl std::fmt::Debug for BootedVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootedVm").finish_non_exhaustive()
    }
}

/// A live hypervisor process backing one VM
#[async_trait]
pub trait VmInstance: Send + Sync {
    /// Forcefully stop the hypervisor process
    async fn kill(&self) -> Result<KillOutcome, DriverError>;

    /// Gracefully shut the guest down; returns the final status code
    async fn release(&self) -> Result<i32, DriverError>;

    /// Complete a deferred (lazy) start. No-op for instances already running.
    async fn launch(&self) -> Result<(), DriverError>;

    /// Whether the hypervisor process still exists
    async fn is_alive(&self) -> bool;

    /// Serialize enough state to re-attach after a daemon restart
    ///
    /// `vm_id` is the id the VM is registered under, which differs from the
    /// boot-time name for instances taken from a warm pool.
    fn dump(&self, vm_id: &str) -> Result<Vec<u8>, DriverError>;
}

/// Boots and re-attaches hypervisor processes
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Start a brand-new hypervisor process for `vm_id`
    async fn boot(&self, vm_id: &str, config: &BootConfig, lazy: bool) -> Result<BootedVm, DriverError>;

    /// Reconstruct an instance from persisted metadata without booting
    async fn attach(
        &self,
        vm_id: &str,
        config: &BootConfig,
        metadata: &[u8],
    ) -> Result<BootedVm, DriverError>;
}

/// Source of pre-warmed VMs keyed by resource shape
#[async_trait]
pub trait VmPool: Send + Sync {
    /// Take a warm VM matching (cpu, memory), booting one if none is idle
    async fn acquire(&self, vm_id: &str, config: &BootConfig) -> Result<BootedVm, DriverError>;
}
