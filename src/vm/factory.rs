//! VM Factory - turns resource requests into registered VM handles
//!
//! The factory is responsible for:
//! - Applying cpu/memory defaults
//! - Building a boot configuration from the daemon-wide images
//! - Generating unique VM identifiers
//! - Choosing between a direct boot and the reuse pool
//! - Registering the resulting handle (and nothing else on failure)

use std::sync::Arc;
use std::time::Instant;

use rand::distr::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use super::config::{BootConfig, DEFAULT_CPU, DEFAULT_MEMORY_MB};
use super::driver::{BootedVm, HypervisorDriver, VmPool};
use super::handle::VmHandle;
use super::registry::VmRegistry;
use crate::config::ImageConfig;
use crate::error::{Result, VmError};
use crate::metrics::{VM_BOOT_DURATION, VM_OPERATIONS_TOTAL};

/// Length of the random suffix in generated VM ids
const VM_ID_SUFFIX_LEN: usize = 10;

/// Pooled reuse is not available on macOS hosts
const POOL_SUPPORTED: bool = !cfg!(target_os = "macos");

/// Generate a `vm-XXXXXXXXXX` id not currently present in `registry`
pub fn generate_vm_id(registry: &VmRegistry) -> String {
    loop {
        let candidate = format!("vm-{}", random_suffix(VM_ID_SUFFIX_LEN));
        if !registry.contains(&candidate) {
            return candidate;
        }
        debug!(vm_id = %candidate, "Generated VM id collides, retrying");
    }
}

pub(crate) fn random_suffix(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Creates VMs and registers them
pub struct VmFactory {
    registry: Arc<VmRegistry>,
    driver: Arc<dyn HypervisorDriver>,
    pool: Option<Arc<dyn VmPool>>,
    images: ImageConfig,
}

impl VmFactory {
    pub fn new(registry: Arc<VmRegistry>, driver: Arc<dyn HypervisorDriver>, images: ImageConfig) -> Self {
        Self {
            registry,
            driver,
            pool: None,
            images,
        }
    }

    /// Route eligible requests through a reuse pool
    pub fn with_pool(mut self, pool: Arc<dyn VmPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn registry(&self) -> &Arc<VmRegistry> {
        &self.registry
    }

    pub fn driver(&self) -> &Arc<dyn HypervisorDriver> {
        &self.driver
    }

    /// Boot configuration for the given (already defaulted) shape
    pub fn boot_config(&self, cpu: u32, memory_mb: u32) -> BootConfig {
        BootConfig {
            cpu,
            memory_mb,
            kernel: self.images.kernel.clone(),
            initrd: self.images.initrd.clone(),
            bios: self.images.bios.clone(),
            cbfs: self.images.cbfs.clone(),
            alt_image: self.images.alt_image.clone(),
        }
    }

    /// Whether a request must bypass the pool and boot a fresh process
    fn needs_direct_boot(&self, requested_id: &str, config: &BootConfig, lazy: bool) -> bool {
        !requested_id.is_empty()
            || config.has_custom_firmware()
            || !POOL_SUPPORTED
            || lazy
            || self.pool.is_none()
    }

    /// Start (or reuse) a VM and register it
    ///
    /// `cpu == 0` and `memory_mb == 0` fall back to 1 vCPU / 128 MB. An empty
    /// `requested_id` gets a generated one.
    pub async fn start_vm(
        &self,
        requested_id: &str,
        cpu: u32,
        memory_mb: u32,
        lazy: bool,
    ) -> Result<Arc<VmHandle>> {
        let cpu = if cpu == 0 { DEFAULT_CPU } else { cpu };
        let memory_mb = if memory_mb == 0 { DEFAULT_MEMORY_MB } else { memory_mb };

        let vm_id = if requested_id.is_empty() {
            generate_vm_id(&self.registry)
        } else {
            if self.registry.contains(requested_id) {
                return Err(VmError::AlreadyRegistered(requested_id.to_string()));
            }
            requested_id.to_string()
        };

        let config = self.boot_config(cpu, memory_mb);
        debug!(
            kernel = %config.kernel.display(),
            initrd = %config.initrd.display(),
            "Boot config"
        );

        let start = Instant::now();
        let direct = self.needs_direct_boot(requested_id, &config, lazy);
        let booted: std::result::Result<BootedVm, _> = match (&self.pool, direct) {
            (Some(pool), false) => pool.acquire(&vm_id, &config).await,
            _ => self.driver.boot(&vm_id, &config, lazy).await,
        };

        let booted = match booted {
            Ok(b) => b,
            Err(source) => {
                VM_OPERATIONS_TOTAL.with_label_values(&["start", "error"]).inc();
                warn!(vm_id = %vm_id, error = %source, "Failed to start VM");
                return Err(VmError::Boot { vm_id, source });
            }
        };

        let handle = Arc::new(VmHandle::new(vm_id.clone(), config, lazy, booted));
        if let Err(e) = self.registry.add(Arc::clone(&handle)) {
            // Lost a race on the id; the fresh process must not leak.
            if let Err(kill_err) = handle.kill().await {
                warn!(vm_id = %vm_id, error = %kill_err, "Failed to kill unregistered VM");
            }
            VM_OPERATIONS_TOTAL.with_label_values(&["start", "error"]).inc();
            return Err(e);
        }

        VM_BOOT_DURATION.observe(start.elapsed().as_secs_f64());
        VM_OPERATIONS_TOTAL.with_label_values(&["start", "ok"]).inc();
        info!(
            vm_id = %vm_id,
            cpu,
            memory_mb,
            lazy,
            pooled = !direct,
            "VM started"
        );

        Ok(handle)
    }
}

impl std::fmt::Debug for VmFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmFactory")
            .field("images", &self.images)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}
