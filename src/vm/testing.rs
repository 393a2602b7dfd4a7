//! In-crate stubs for unit tests

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::config::BootConfig;
use super::driver::{BootedVm, KillOutcome, VmEvent, VmInstance};
use super::handle::VmHandle;
use crate::error::DriverError;

pub(crate) struct StubInstance;

#[async_trait]
impl VmInstance for StubInstance {
    async fn kill(&self) -> Result<KillOutcome, DriverError> {
        Ok(KillOutcome::default())
    }

    async fn release(&self) -> Result<i32, DriverError> {
        Ok(0)
    }

    async fn launch(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        true
    }

    fn dump(&self, _vm_id: &str) -> Result<Vec<u8>, DriverError> {
        Ok(Vec::new())
    }
}

pub(crate) fn boot_config(cpu: u32, memory_mb: u32) -> BootConfig {
    BootConfig {
        cpu,
        memory_mb,
        kernel: PathBuf::from("/kernel"),
        initrd: PathBuf::from("/initrd.img"),
        bios: None,
        cbfs: None,
        alt_image: None,
    }
}

pub(crate) fn stub_handle(id: &str, cpu: u32, memory_mb: u32) -> Arc<VmHandle> {
    let (_tx, events) = mpsc::channel(1);
    let booted = BootedVm {
        instance: Box::new(StubInstance),
        events,
    };
    Arc::new(VmHandle::new(id, boot_config(cpu, memory_mb), false, booted))
}

pub(crate) fn stub_handle_with_feed(id: &str) -> (VmHandle, mpsc::Sender<VmEvent>) {
    let (tx, events) = mpsc::channel(4);
    let booted = BootedVm {
        instance: Box::new(StubInstance),
        events,
    };
    (VmHandle::new(id, boot_config(1, 128), false, booted), tx)
}
