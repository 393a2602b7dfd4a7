//! podvisor - lifecycle core of a daemon that runs every pod in its own VM
//!
//! This library keeps the mapping between pods and the hypervisor-backed
//! VMs that run them: creating, booting, reusing, re-attaching and tearing
//! down VMs under concurrent requests and partial failures.
//!
//! # Modules
//!
//! - `vm` - VM registry, factory, boot synchronization, pool, orchestrator
//! - `pod` - pods and their association with VMs
//! - `metadata` - persisted VM metadata stores
//! - `config` - daemon configuration
//! - `error` - error types
//! - `metrics` - Prometheus metrics for observability
//! - `telemetry` - logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use podvisor::{VmFactory, VmManager, VmRegistry};
//!
//! let factory = VmFactory::new(registry, driver, config.images.clone());
//! let manager = VmManager::new(factory, metadata, config.manager_config());
//!
//! // Boot a 2 vCPU / 256 MB VM and wait for it to report running
//! let vm = manager.create_vm(2, 256, false).await?;
//! ```

pub mod config;
pub mod error;
pub mod metadata;
pub mod metrics;
pub mod pod;
pub mod telemetry;
pub mod vm;

// Re-export commonly used types at crate root for convenience
pub use config::DaemonConfig;
pub use error::{ErrorKind, VmError};
pub use metadata::{DirMetadataStore, MemoryMetadataStore, MetadataStore};
pub use pod::{Pod, PodStatus};
pub use vm::{Resource, VmFactory, VmHandle, VmManager, VmRegistry, VmStatus, WarmPool};
