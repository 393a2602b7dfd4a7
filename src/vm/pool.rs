//! Warm Pool - pre-booted VMs keyed by resource shape
//!
//! The WarmPool keeps a few idle VMs booted for each configured
//! (cpu, memory) shape. The factory asks it for a VM whenever a request is
//! eligible for reuse; a warm instance is handed over if one is idle,
//! otherwise a fresh one is booted on the spot.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Warm Pool                                                      │
//! │                                                                 │
//! │  (1 cpu, 128 MB)   ┌──────┐ ┌──────┐                            │
//! │                    │ warm │ │ warm │                            │
//! │                    └──────┘ └──────┘                            │
//! │  (2 cpu, 256 MB)   ┌──────┐                                     │
//! │                    │ warm │                                     │
//! │                    └──────┘                                     │
//! │         │                                                       │
//! │         ▼                                                       │
//! │    acquire() ──► instance leaves the pool, replenish refills    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::config::{BootConfig, Resource};
use super::driver::{BootedVm, HypervisorDriver, VmPool};
use super::factory::random_suffix;
use crate::config::{ImageConfig, PoolConfig};
use crate::error::DriverError;
use crate::metrics::{POOL_ACQUIRE_TOTAL, POOL_WARM_VMS};

type Shape = (u32, u32);

/// Statistics about the pool state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle VMs per (cpu, memory) shape
    pub warm: HashMap<Shape, usize>,
    pub hits: u64,
    pub misses: u64,
}

impl PoolStats {
    pub fn warm_total(&self) -> usize {
        self.warm.values().sum()
    }
}

/// Pool of pre-warmed VMs
pub struct WarmPool {
    driver: Arc<dyn HypervisorDriver>,
    images: ImageConfig,
    config: PoolConfig,
    warm: Mutex<HashMap<Shape, Vec<BootedVm>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl WarmPool {
    pub fn new(driver: Arc<dyn HypervisorDriver>, images: ImageConfig, config: PoolConfig) -> Self {
        Self {
            driver,
            images,
            config,
            warm: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn boot_config(&self, shape: Resource) -> BootConfig {
        BootConfig {
            cpu: shape.vcpu,
            memory_mb: shape.memory,
            kernel: self.images.kernel.clone(),
            initrd: self.images.initrd.clone(),
            bios: None,
            cbfs: None,
            alt_image: self.images.alt_image.clone(),
        }
    }

    async fn warm_count(&self, shape: Shape) -> usize {
        self.warm.lock().await.get(&shape).map(Vec::len).unwrap_or(0)
    }

    async fn publish_warm_gauge(&self) {
        let total: usize = self.warm.lock().await.values().map(Vec::len).sum();
        POOL_WARM_VMS.set(total as f64);
    }

    /// Initialize the pool by pre-warming every configured shape
    pub async fn initialize(&self) {
        info!(
            shapes = self.config.shapes.len(),
            per_shape = self.config.warm_per_shape,
            "Pre-warming VMs"
        );
        self.replenish().await;
        let stats = self.stats().await;
        info!(warm = stats.warm_total(), "Pool initialized");
    }

    /// Top every shape back up to `warm_per_shape`
    ///
    /// A boot failure stops refilling that shape until the next round.
    pub async fn replenish(&self) {
        for shape in &self.config.shapes {
            let key = (shape.vcpu, shape.memory);
            let needed = self
                .config
                .warm_per_shape
                .saturating_sub(self.warm_count(key).await);

            for _ in 0..needed {
                let name = format!("warm-{}", random_suffix(10));
                match self.driver.boot(&name, &self.boot_config(*shape), false).await {
                    Ok(booted) => {
                        self.warm.lock().await.entry(key).or_default().push(booted);
                        debug!(vm_name = %name, cpu = key.0, memory_mb = key.1, "Warm VM ready");
                    }
                    Err(e) => {
                        warn!(cpu = key.0, memory_mb = key.1, error = %e, "Failed to create warm VM");
                        break;
                    }
                }
            }
        }
        self.publish_warm_gauge().await;
    }

    /// Get current pool statistics
    pub async fn stats(&self) -> PoolStats {
        let warm = self
            .warm
            .lock()
            .await
            .iter()
            .map(|(shape, vms)| (*shape, vms.len()))
            .collect();
        PoolStats {
            warm,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Graceful shutdown: kill every idle VM
    pub async fn shutdown(&self) {
        info!("Shutting down VM pool");
        let vms: Vec<BootedVm> = {
            let mut warm = self.warm.lock().await;
            warm.drain().flat_map(|(_, vms)| vms).collect()
        };

        for vm in vms {
            if let Err(e) = vm.instance.kill().await {
                warn!(error = %e, "Failed to kill warm VM during shutdown");
            }
        }

        POOL_WARM_VMS.set(0.0);
        info!("VM pool shutdown complete");
    }

    /// Start the background replenisher task
    pub fn start_replenisher(pool: Arc<WarmPool>) -> JoinHandle<()> {
        let period = Duration::from_millis(pool.config.replenish_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                pool.replenish().await;
            }
        })
    }
}

#[async_trait]
impl VmPool for WarmPool {
    async fn acquire(&self, vm_id: &str, config: &BootConfig) -> Result<BootedVm, DriverError> {
        let key = (config.cpu, config.memory_mb);

        // An idle VM may have died since it was warmed; its queued Running
        // event is stale, so it must never be handed out.
        loop {
            let Some(vm) = self.warm.lock().await.get_mut(&key).and_then(Vec::pop) else {
                break;
            };
            if vm.instance.is_alive().await {
                self.hits.fetch_add(1, Ordering::Relaxed);
                POOL_ACQUIRE_TOTAL.with_label_values(&["hit"]).inc();
                self.publish_warm_gauge().await;
                debug!(vm_id, cpu = key.0, memory_mb = key.1, "Reusing warm VM");
                return Ok(vm);
            }

            POOL_ACQUIRE_TOTAL.with_label_values(&["stale"]).inc();
            warn!(vm_id, cpu = key.0, memory_mb = key.1, "Discarding dead warm VM");
            if let Err(e) = vm.instance.kill().await {
                debug!(error = %e, "Failed to reap dead warm VM");
            }
        }
        self.publish_warm_gauge().await;

        self.misses.fetch_add(1, Ordering::Relaxed);
        POOL_ACQUIRE_TOTAL.with_label_values(&["miss"]).inc();
        self.driver.boot(vm_id, config, false).await
    }
}

impl std::fmt::Debug for WarmPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
