//! VM boot configuration and Firecracker API payloads
//!
//! [`BootConfig`] is what the factory hands to a hypervisor driver. The
//! remaining structs are the JSON bodies the Firecracker driver sends over
//! its API socket.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default vCPU count when a request asks for zero
pub const DEFAULT_CPU: u32 = 1;

/// Default memory in MB when a request asks for zero
pub const DEFAULT_MEMORY_MB: u32 = 128;

/// Parameters passed to the hypervisor driver to start a VM
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub cpu: u32,
    pub memory_mb: u32,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    /// Custom BIOS image; forces a direct boot when set
    pub bios: Option<PathBuf>,
    /// Firmware (CBFS) image; forces a direct boot when set
    pub cbfs: Option<PathBuf>,
    /// Alternate hypervisor image (e.g. a VirtualBox disk)
    pub alt_image: Option<PathBuf>,
}

impl BootConfig {
    /// True when the config carries a custom BIOS or firmware image
    pub fn has_custom_firmware(&self) -> bool {
        self.bios.is_some() || self.cbfs.is_some()
    }
}

/// Resource requirement of a pod or a creation request
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Resource {
    pub vcpu: u32,
    pub memory: u32,
}

impl Resource {
    pub fn new(vcpu: u32, memory: u32) -> Self {
        Self { vcpu, memory }
    }
}

/// Boot source configuration for the VM kernel
#[derive(Serialize, Debug, Clone)]
pub struct BootSource {
    pub kernel_image_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<String>,
    pub boot_args: String,
}

/// vCPU and memory sizing
#[derive(Serialize, Debug, Clone)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

/// VM action (e.g., "InstanceStart")
#[derive(Serialize, Debug, Clone)]
pub struct Action {
    pub action_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_firmware() {
        let mut config = BootConfig {
            cpu: 1,
            memory_mb: 128,
            kernel: PathBuf::from("/var/lib/podvisor/kernel"),
            initrd: PathBuf::from("/var/lib/podvisor/initrd.img"),
            bios: None,
            cbfs: None,
            alt_image: None,
        };
        assert!(!config.has_custom_firmware());

        config.cbfs = Some(PathBuf::from("/var/lib/podvisor/cbfs.rom"));
        assert!(config.has_custom_firmware());
    }

    #[test]
    fn test_boot_source_omits_missing_initrd() {
        let source = BootSource {
            kernel_image_path: "/kernel".into(),
            initrd_path: None,
            boot_args: "console=ttyS0".into(),
        };
        let json = serde_json::to_string(&source).unwrap();
        assert!(!json.contains("initrd_path"));
    }
}
