//! Daemon configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) yields a usable configuration.
//!
//! ```toml
//! metadata_dir = "/var/lib/podvisor/vms"
//! boot_timeout_secs = 30
//! release_policy = "stop_on_first_failure"
//!
//! [images]
//! kernel = "/var/lib/podvisor/kernel"
//! initrd = "/var/lib/podvisor/hyper-initrd.img"
//!
//! [pool]
//! enabled = true
//! warm_per_shape = 2
//! shapes = [{ vcpu = 1, memory = 128 }]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::vm::{ReleasePolicy, Resource, VmManagerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon-wide guest images
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub bios: Option<PathBuf>,
    pub cbfs: Option<PathBuf>,
    pub alt_image: Option<PathBuf>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            kernel: PathBuf::from("/var/lib/podvisor/kernel"),
            initrd: PathBuf::from("/var/lib/podvisor/hyper-initrd.img"),
            bios: None,
            cbfs: None,
            alt_image: None,
        }
    }
}

/// Reuse pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub enabled: bool,
    /// Idle VMs kept booted per shape
    pub warm_per_shape: usize,
    /// Shapes to keep warm
    pub shapes: Vec<Resource>,
    pub replenish_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            warm_per_shape: 2,
            shapes: vec![Resource::new(1, 128)],
            replenish_interval_ms: 1000,
        }
    }
}

/// Firecracker driver settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FirecrackerConfig {
    pub binary: PathBuf,
    /// Directory holding per-VM API sockets
    pub runtime_dir: PathBuf,
    pub boot_args: String,
    pub api_socket_timeout_ms: u64,
    /// How long a graceful release waits before killing
    pub release_grace_ms: u64,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/bin/firecracker"),
            runtime_dir: PathBuf::from("/run/podvisor"),
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".to_string(),
            api_socket_timeout_ms: 10_000,
            release_grace_ms: 5_000,
        }
    }
}

/// Logging and trace export
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// OTLP collector endpoint; console-only logging when unset
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "podvisor".to_string(),
            otlp_endpoint: None,
        }
    }
}

/// Top-level daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub metadata_dir: PathBuf,
    /// Seconds to wait for a VM's first status event; 0 waits forever
    pub boot_timeout_secs: u64,
    pub release_policy: ReleasePolicy,
    pub images: ImageConfig,
    pub pool: PoolConfig,
    pub firecracker: FirecrackerConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            metadata_dir: PathBuf::from("/var/lib/podvisor/vms"),
            boot_timeout_secs: 60,
            release_policy: ReleasePolicy::default(),
            images: ImageConfig::default(),
            pool: PoolConfig::default(),
            firecracker: FirecrackerConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load a config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Manager settings derived from this config
    pub fn manager_config(&self) -> VmManagerConfig {
        VmManagerConfig {
            boot_timeout: match self.boot_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            release_policy: self.release_policy,
        }
    }
}
