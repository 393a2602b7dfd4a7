//! VM Handle - represents a single VM instance with all its resources
//!
//! Each VmHandle tracks one hypervisor-backed VM throughout its lifecycle:
//! Booting -> Running | Failed, and Killed after a successful kill.
//!
//! Handles are shared as `Arc<VmHandle>`: the registry owns the canonical
//! reference, everyone else looks them up by id. Mutable state (status, the
//! status feed) lives behind interior locks.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};

use super::config::BootConfig;
use super::driver::{BootedVm, KillOutcome, VmEvent, VmInstance};
use crate::error::DriverError;

/// Status of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    /// Hypervisor process started, first status event not yet observed
    Booting,
    /// Guest confirmed running
    Running,
    /// Startup rejected or aborted
    Failed,
    /// Hypervisor process killed or released
    Killed,
}

/// Represents a single VM instance with all its resources
pub struct VmHandle {
    id: String,
    cpu: u32,
    memory_mb: u32,
    boot_config: BootConfig,
    lazy: bool,
    status: Mutex<VmStatus>,
    instance: Box<dyn VmInstance>,
    feed: Arc<AsyncMutex<mpsc::Receiver<VmEvent>>>,
    created_at: Instant,
}

impl VmHandle {
    /// Wrap a booted instance. The handle starts in `Booting`.
    pub fn new(id: impl Into<String>, boot_config: BootConfig, lazy: bool, booted: BootedVm) -> Self {
        Self {
            id: id.into(),
            cpu: boot_config.cpu,
            memory_mb: boot_config.memory_mb,
            boot_config,
            lazy,
            status: Mutex::new(VmStatus::Booting),
            instance: booted.instance,
            feed: Arc::new(AsyncMutex::new(booted.events)),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn memory_mb(&self) -> u32 {
        self.memory_mb
    }

    pub fn boot_config(&self) -> &BootConfig {
        &self.boot_config
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn status(&self) -> VmStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_status(&self, status: VmStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Get time since the handle was created
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Acquire exclusive read access to the status feed
    ///
    /// Returns `None` when another waiter currently holds it. Access is
    /// released when the returned guard is dropped.
    pub fn acquire_status_feed(&self) -> Option<StatusFeed> {
        Arc::clone(&self.feed)
            .try_lock_owned()
            .ok()
            .map(|guard| StatusFeed { guard })
    }

    /// Kill the backing hypervisor process
    pub async fn kill(&self) -> Result<KillOutcome, DriverError> {
        let outcome = self.instance.kill().await?;
        self.set_status(VmStatus::Killed);
        Ok(outcome)
    }

    /// Gracefully release the backing hypervisor process
    pub async fn release(&self) -> Result<i32, DriverError> {
        let code = self.instance.release().await?;
        self.set_status(VmStatus::Killed);
        Ok(code)
    }

    /// Complete a lazy boot on first use
    pub async fn launch(&self) -> Result<(), DriverError> {
        self.instance.launch().await
    }

    /// Serialized driver state for re-attachment
    pub fn dump(&self) -> Result<Vec<u8>, DriverError> {
        self.instance.dump(&self.id)
    }
}

impl std::fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmHandle")
            .field("id", &self.id)
            .field("cpu", &self.cpu)
            .field("memory_mb", &self.memory_mb)
            .field("lazy", &self.lazy)
            .field("status", &self.status())
            .field("age", &self.age())
            .finish()
    }
}

/// Scoped, exclusive access to one VM's status feed
pub struct StatusFeed {
    guard: OwnedMutexGuard<mpsc::Receiver<VmEvent>>,
}

impl StatusFeed {
    /// Wait for the next event. `None` means the producer is gone.
    pub async fn recv(&mut self) -> Option<VmEvent> {
        self.guard.recv().await
    }

    /// Give the feed back explicitly. Dropping has the same effect.
    pub fn release(self) {}
}

impl std::fmt::Debug for StatusFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusFeed").finish_non_exhaustive()
    }
}
