//! Pods and their association with VMs
//!
//! A pod is bound to at most one VM. Binding happens either when the pod is
//! started on a fresh VM or when it is recovered after a daemon restart, in
//! which case the VM is reconstructed from persisted metadata instead of
//! being booted.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Result, VmError};
use crate::vm::{Resource, VmHandle, VmManager, VmStatus};

/// Status summary of a pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodStatus {
    /// Id of the bound VM, empty when unbound
    pub vm: String,
}

/// A logical workload bound to at most one VM
#[derive(Debug)]
pub struct Pod {
    id: String,
    resource: Resource,
    vm: Option<Arc<VmHandle>>,
    status: PodStatus,
}

impl Pod {
    pub fn new(id: impl Into<String>, resource: Resource) -> Self {
        Self {
            id: id.into(),
            resource,
            vm: None,
            status: PodStatus::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    pub fn vm(&self) -> Option<&Arc<VmHandle>> {
        self.vm.as_ref()
    }

    pub fn vm_id(&self) -> Option<&str> {
        self.vm.as_ref().map(|vm| vm.id())
    }

    pub fn status(&self) -> &PodStatus {
        &self.status
    }

    /// Bind to a handle created for this pod (fresh start path)
    pub fn bind_vm(&mut self, vm: Arc<VmHandle>) -> Result<()> {
        if let Some(current) = &self.vm {
            if current.id() == vm.id() {
                return Ok(());
            }
            return Err(self.conflict(current.id(), vm.id()));
        }
        self.status.vm = vm.id().to_string();
        self.vm = Some(vm);
        Ok(())
    }

    /// Clear the association at pod teardown or VM removal
    pub fn detach_vm(&mut self) -> Option<Arc<VmHandle>> {
        self.status.vm.clear();
        self.vm.take()
    }

    fn conflict(&self, current: &str, requested: &str) -> VmError {
        VmError::AlreadyAssociated {
            pod: self.id.clone(),
            current: current.to_string(),
            requested: requested.to_string(),
        }
    }

    /// Re-attach this pod to VM `vm_id` using persisted metadata
    ///
    /// Idempotent for the VM the pod already holds. The hypervisor process is
    /// trusted to exist if its metadata does; no new process is booted.
    pub async fn associate_vm(&mut self, manager: &VmManager, vm_id: &str) -> Result<()> {
        match &self.vm {
            Some(current) if current.id() == vm_id => return Ok(()),
            Some(current) => return Err(self.conflict(current.id(), vm_id)),
            None => {}
        }

        let registry = manager.registry();
        let _guard = registry.lock_id(vm_id).await;

        // Already recovered for someone else in this process: reuse it.
        if let Some(existing) = registry.lookup(vm_id) {
            manager.check_resource(&existing, &self.resource)?;
            self.status.vm = vm_id.to_string();
            self.vm = Some(existing);
            return Ok(());
        }

        let metadata = manager
            .metadata()
            .get_vm_metadata(vm_id)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    VmError::MetadataNotFound(vm_id.to_string())
                } else {
                    VmError::Metadata {
                        vm_id: vm_id.to_string(),
                        source: e,
                    }
                }
            })?;
        info!(vm_id, pod_id = %self.id, "Got data for VM");

        let config = manager
            .factory()
            .boot_config(self.resource.vcpu, self.resource.memory);
        let booted = match manager.factory().driver().attach(vm_id, &config, &metadata).await {
            Ok(booted) => booted,
            Err(source) => {
                warn!(vm_id, pod_id = %self.id, error = %source, "Failed to associate VM");
                return Err(VmError::Hydration {
                    vm_id: vm_id.to_string(),
                    source,
                });
            }
        };

        let handle = Arc::new(VmHandle::new(vm_id, config, false, booted));
        handle.set_status(VmStatus::Running);
        registry.add(Arc::clone(&handle))?;

        self.status.vm = vm_id.to_string();
        self.vm = Some(handle);
        Ok(())
    }
}
