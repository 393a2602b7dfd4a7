//! VM Manager - the lifecycle API handed to the transport layer
//!
//! The VmManager is responsible for:
//! - Creating VMs, optionally waiting for them to report running
//! - Completing deferred (lazy) starts
//! - Killing a compensating VM when a synchronous creation fails
//! - Handing existing VMs to pods after a resource compatibility check
//! - Killing single VMs and releasing every VM at shutdown
//! - Re-attaching pods to VMs recovered from persisted metadata
//!
//! Every operation may be called concurrently. Work on one VM id is
//! serialized through the registry's per-id guards.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info, warn};

use super::boot::wait_start;
use super::config::Resource;
use super::driver::KillOutcome;
use super::factory::VmFactory;
use super::handle::{VmHandle, VmStatus};
use super::registry::VmRegistry;
use crate::error::{ResourceDimension, Result, VmError};
use crate::metadata::MetadataStore;
use crate::metrics::VM_OPERATIONS_TOTAL;
use crate::pod::Pod;

/// What `release_all_vms` does after a VM fails to release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// Stop at the first failure; later VMs stay registered
    #[default]
    StopOnFirstFailure,
    /// Attempt every VM and report the first failure
    ContinueOnFailure,
}

/// Configuration for the VmManager
#[derive(Debug, Clone)]
pub struct VmManagerConfig {
    /// Bound on the wait for a VM's first status event (`None` waits forever)
    pub boot_timeout: Option<Duration>,
    pub release_policy: ReleasePolicy,
}

impl Default for VmManagerConfig {
    fn default() -> Self {
        Self {
            boot_timeout: Some(Duration::from_secs(60)),
            release_policy: ReleasePolicy::StopOnFirstFailure,
        }
    }
}

/// Top-level lifecycle orchestrator
pub struct VmManager {
    factory: VmFactory,
    metadata: Arc<dyn MetadataStore>,
    config: VmManagerConfig,
}

impl VmManager {
    pub fn new(factory: VmFactory, metadata: Arc<dyn MetadataStore>, config: VmManagerConfig) -> Self {
        Self {
            factory,
            metadata,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<VmRegistry> {
        self.factory.registry()
    }

    pub fn factory(&self) -> &VmFactory {
        &self.factory
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// All registered VMs
    pub fn vms(&self) -> Vec<Arc<VmHandle>> {
        self.registry().all()
    }

    /// Start (or reuse) a VM and register it, without waiting for it
    pub async fn start_vm(
        &self,
        vm_id: &str,
        cpu: u32,
        memory_mb: u32,
        lazy: bool,
    ) -> Result<Arc<VmHandle>> {
        self.factory.start_vm(vm_id, cpu, memory_mb, lazy).await
    }

    /// Wait for `handle` to report running
    ///
    /// A confirmed VM gets its metadata persisted so a pod can be
    /// re-associated with it after a daemon restart.
    pub async fn wait_vm_start(&self, handle: &VmHandle) -> Result<()> {
        wait_start(handle, self.config.boot_timeout).await?;
        self.persist(handle).await;
        Ok(())
    }

    /// Create a VM
    ///
    /// With `async_start == false` the call returns only after the VM reports
    /// running; if it does not, the VM is killed and deregistered before the
    /// error is returned. With `async_start == true` the handle is returned
    /// straight away and the caller confirms the start later.
    pub async fn create_vm(&self, cpu: u32, memory_mb: u32, async_start: bool) -> Result<Arc<VmHandle>> {
        let vm = self.start_vm("", cpu, memory_mb, false).await?;

        if async_start {
            return Ok(vm);
        }

        if let Err(err) = self.wait_vm_start(&vm).await {
            VM_OPERATIONS_TOTAL.with_label_values(&["create", "error"]).inc();
            self.roll_back(&vm, &err).await;
            return Err(err);
        }

        VM_OPERATIONS_TOTAL.with_label_values(&["create", "ok"]).inc();
        Ok(vm)
    }

    /// Complete the start of a VM booted with `lazy == true` and wait for it
    ///
    /// A VM that already reported running is returned as is. If the start is
    /// refused or never confirmed, the VM is killed and deregistered.
    pub async fn launch_vm(&self, vm_id: &str) -> Result<Arc<VmHandle>> {
        let vm = {
            let _guard = self.registry().lock_id(vm_id).await;
            self.registry()
                .lookup(vm_id)
                .ok_or_else(|| VmError::VmNotFound(vm_id.to_string()))?
        };
        if vm.status() == VmStatus::Running {
            return Ok(vm);
        }

        info!(vm_id, "Launching VM");
        let started = match vm.launch().await {
            Ok(()) => self.wait_vm_start(&vm).await,
            Err(source) => {
                vm.set_status(VmStatus::Failed);
                Err(VmError::Boot {
                    vm_id: vm_id.to_string(),
                    source,
                })
            }
        };

        match started {
            Ok(()) => {
                VM_OPERATIONS_TOTAL.with_label_values(&["launch", "ok"]).inc();
                Ok(vm)
            }
            Err(err) => {
                VM_OPERATIONS_TOTAL.with_label_values(&["launch", "error"]).inc();
                self.roll_back(&vm, &err).await;
                Err(err)
            }
        }
    }

    /// Kill and deregister a VM whose start was not confirmed
    async fn roll_back(&self, vm: &VmHandle, cause: &VmError) {
        warn!(vm_id = %vm.id(), error = %cause, "VM did not start, rolling back");
        if let Err(kill_err) = self.kill_vm(vm.id()).await {
            error!(vm_id = %vm.id(), error = %kill_err, "Failed to kill VM after failed start");
            // An unconfirmed VM is never left visible, even if the process lingers.
            self.registry().remove(vm.id());
        }
    }

    /// Kill a VM and deregister it
    ///
    /// An unknown id is treated as already gone and yields the default
    /// outcome. On kill failure the VM stays registered so the call can be
    /// retried.
    pub async fn kill_vm(&self, vm_id: &str) -> Result<KillOutcome> {
        info!(vm_id, "KillVm");
        let _guard = self.registry().lock_id(vm_id).await;

        let Some(vm) = self.registry().lookup(vm_id) else {
            info!(vm_id, "Cannot find VM");
            return Ok(KillOutcome::default());
        };

        match vm.kill().await {
            Ok(outcome) => {
                self.registry().remove(vm_id);
                self.forget(vm_id).await;
                VM_OPERATIONS_TOTAL.with_label_values(&["kill", "ok"]).inc();
                Ok(outcome)
            }
            Err(source) => {
                VM_OPERATIONS_TOTAL.with_label_values(&["kill", "error"]).inc();
                Err(VmError::Kill {
                    vm_id: vm_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Release every registered VM
    ///
    /// Under the default policy the first failure ends the sweep: VMs already
    /// released are deregistered, the failing VM and everything after it stay
    /// registered. Returns the status code of the last successful release.
    pub async fn release_all_vms(&self) -> Result<i32> {
        let mut last_code = 0;
        let mut first_err = None;

        for vm in self.registry().all() {
            info!(vm_id = %vm.id(), "Release VM");
            let _guard = self.registry().lock_id(vm.id()).await;
            if !self.registry().contains(vm.id()) {
                continue;
            }

            match vm.release().await {
                Ok(code) => {
                    last_code = code;
                    self.registry().remove(vm.id());
                    self.forget(vm.id()).await;
                    VM_OPERATIONS_TOTAL.with_label_values(&["release", "ok"]).inc();
                }
                Err(source) => {
                    VM_OPERATIONS_TOTAL.with_label_values(&["release", "error"]).inc();
                    error!(vm_id = %vm.id(), error = %source, "Failed to release VM");
                    let err = VmError::Release {
                        vm_id: vm.id().to_string(),
                        code: last_code,
                        source,
                    };
                    match self.config.release_policy {
                        ReleasePolicy::StopOnFirstFailure => return Err(err),
                        ReleasePolicy::ContinueOnFailure => {
                            first_err.get_or_insert(err);
                        }
                    }
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(last_code),
        }
    }

    /// Get a VM for a pod
    ///
    /// An empty `vm_id` starts a fresh VM sized by `resource`. Otherwise the
    /// registered VM must match `resource` exactly; it is returned unchanged.
    pub async fn get_vm(&self, vm_id: &str, resource: &Resource, lazy: bool) -> Result<Arc<VmHandle>> {
        if vm_id.is_empty() {
            return self.start_vm("", resource.vcpu, resource.memory, lazy).await;
        }

        let _guard = self.registry().lock_id(vm_id).await;
        let vm = self
            .registry()
            .lookup(vm_id)
            .ok_or_else(|| VmError::VmNotFound(vm_id.to_string()))?;
        info!(vm_id = %vm.id(), "Found VM");

        self.check_resource(&vm, resource)?;
        Ok(vm)
    }

    /// Exact cpu/memory match between a VM and a requirement
    pub fn check_resource(&self, vm: &VmHandle, resource: &Resource) -> Result<()> {
        if resource.vcpu != vm.cpu() {
            return Err(VmError::ResourceMismatch {
                vm_id: vm.id().to_string(),
                dimension: ResourceDimension::Cpu,
                actual: vm.cpu(),
                requested: resource.vcpu,
            });
        }
        if resource.memory != vm.memory_mb() {
            return Err(VmError::ResourceMismatch {
                vm_id: vm.id().to_string(),
                dimension: ResourceDimension::Memory,
                actual: vm.memory_mb(),
                requested: resource.memory,
            });
        }
        Ok(())
    }

    /// Bind `pod` to VM `vm_id`, recovering the VM from metadata if needed
    pub async fn associate_vm(&self, pod: &mut Pod, vm_id: &str) -> Result<()> {
        let result = pod.associate_vm(self, vm_id).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        VM_OPERATIONS_TOTAL.with_label_values(&["associate", outcome]).inc();
        result
    }

    async fn persist(&self, vm: &VmHandle) {
        let data = match vm.dump() {
            Ok(data) => data,
            Err(e) => {
                warn!(vm_id = %vm.id(), error = %e, "Failed to dump VM state");
                return;
            }
        };
        if let Err(e) = self.metadata.put_vm_metadata(vm.id(), &data).await {
            warn!(vm_id = %vm.id(), error = %e, "Failed to persist VM metadata");
        }
    }

    async fn forget(&self, vm_id: &str) {
        if let Err(e) = self.metadata.delete_vm_metadata(vm_id).await {
            warn!(vm_id, error = %e, "Failed to delete VM metadata");
        }
    }
}

impl std::fmt::Debug for VmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmManager")
            .field("factory", &self.factory)
            .field("config", &self.config)
            .finish()
    }
}
