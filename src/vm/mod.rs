//! VM lifecycle management
//!
//! This module provides:
//! - VM handles, the registry of live VMs, and the factory that creates them
//! - Boot synchronization on a VM's status feed
//! - The lifecycle orchestrator (`VmManager`)
//! - The hypervisor driver seam plus a Firecracker implementation
//! - A warm pool of pre-booted VMs keyed by resource shape

pub mod boot;
pub mod config;
pub mod driver;
pub mod factory;
pub mod firecracker;
pub mod handle;
pub mod lifecycle;
pub mod manager;
pub mod pool;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{BootConfig, Resource, DEFAULT_CPU, DEFAULT_MEMORY_MB};
pub use driver::{BootedVm, HypervisorDriver, KillOutcome, StatusCode, VmEvent, VmInstance, VmPool};
pub use factory::{generate_vm_id, VmFactory};
pub use firecracker::FirecrackerClient;
pub use handle::{StatusFeed, VmHandle, VmStatus};
pub use lifecycle::{FirecrackerDriver, FirecrackerMetadata};
pub use manager::{ReleasePolicy, VmManager, VmManagerConfig};
pub use pool::{PoolStats, WarmPool};
pub use registry::VmRegistry;
