//! Scripted hypervisor driver shared by the integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use podvisor::config::ImageConfig;
use podvisor::error::DriverError;
use podvisor::metadata::{MemoryMetadataStore, MetadataStore};
use podvisor::vm::{
    BootConfig, BootedVm, HypervisorDriver, KillOutcome, StatusCode, VmEvent, VmFactory,
    VmInstance, VmManager, VmManagerConfig, VmRegistry,
};

/// Knobs and records shared by the driver and every instance it hands out
#[derive(Default)]
pub struct Script {
    pub fail_boot: AtomicBool,
    /// Post a failure instead of `Running` after boot
    pub reject_start: AtomicBool,
    /// Post nothing after boot (keeps the feed open)
    pub silent: AtomicBool,
    pub fail_attach: AtomicBool,
    /// Fail every kill regardless of id
    pub fail_all_kills: AtomicBool,
    /// Refuse the deferred start of lazy boots
    pub fail_launch: AtomicBool,
    /// Instances whose process is reported dead
    pub dead: Mutex<HashSet<String>>,
    pub kill_failures: Mutex<HashSet<String>>,
    pub release_failures: Mutex<HashSet<String>>,
    pub boots: Mutex<Vec<(String, BootConfig, bool)>>,
    pub attaches: AtomicUsize,
    pub killed: Mutex<Vec<String>>,
    pub released: Mutex<Vec<String>>,
}

impl Script {
    pub fn boot_count(&self) -> usize {
        self.boots.lock().unwrap().len()
    }

    pub fn fail_kill(&self, vm_id: &str) {
        self.kill_failures.lock().unwrap().insert(vm_id.to_string());
    }

    pub fn fail_release(&self, vm_id: &str) {
        self.release_failures.lock().unwrap().insert(vm_id.to_string());
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    pub fn mark_dead(&self, vm_id: &str) {
        self.dead.lock().unwrap().insert(vm_id.to_string());
    }

    /// Event a boot reports once the instance is started
    fn start_event(&self, vm_id: &str) -> VmEvent {
        if self.reject_start.load(Ordering::SeqCst) {
            VmEvent::new(vm_id, StatusCode::Failed, "guest init crashed")
        } else {
            VmEvent::running(vm_id)
        }
    }
}

#[derive(Default)]
pub struct ScriptedDriver {
    pub script: Arc<Script>,
}

struct ScriptedInstance {
    vm_id: String,
    script: Arc<Script>,
    events: mpsc::Sender<VmEvent>,
    /// Start event of a lazy boot, posted by `launch`
    deferred: Mutex<Option<VmEvent>>,
}

#[async_trait]
impl VmInstance for ScriptedInstance {
    async fn kill(&self) -> Result<KillOutcome, DriverError> {
        if self.script.fail_all_kills.load(Ordering::SeqCst)
            || self.script.kill_failures.lock().unwrap().contains(&self.vm_id)
        {
            return Err(DriverError::Signal(format!("cannot kill {}", self.vm_id)));
        }
        self.script.killed.lock().unwrap().push(self.vm_id.clone());
        Ok(KillOutcome {
            code: 137,
            cause: "killed".to_string(),
        })
    }

    async fn release(&self) -> Result<i32, DriverError> {
        if self.script.release_failures.lock().unwrap().contains(&self.vm_id) {
            return Err(DriverError::Other(format!("cannot release {}", self.vm_id)));
        }
        self.script.released.lock().unwrap().push(self.vm_id.clone());
        Ok(0)
    }

    async fn launch(&self) -> Result<(), DriverError> {
        if self.script.fail_launch.load(Ordering::SeqCst) {
            return Err(DriverError::Api {
                endpoint: "/actions".to_string(),
                status: 400,
                body: "InstanceStart refused".to_string(),
            });
        }
        let deferred = self.deferred.lock().unwrap().take();
        if let Some(event) = deferred {
            self.events.try_send(event).unwrap();
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        !self.script.dead.lock().unwrap().contains(&self.vm_id)
    }

    fn dump(&self, vm_id: &str) -> Result<Vec<u8>, DriverError> {
        Ok(format!("state-of-{}", vm_id).into_bytes())
    }
}

#[async_trait]
impl HypervisorDriver for ScriptedDriver {
    async fn boot(&self, vm_id: &str, config: &BootConfig, lazy: bool) -> Result<BootedVm, DriverError> {
        if self.script.fail_boot.load(Ordering::SeqCst) {
            return Err(DriverError::Spawn(std::io::Error::other("no hypervisor")));
        }
        self.script
            .boots
            .lock()
            .unwrap()
            .push((vm_id.to_string(), config.clone(), lazy));

        let (tx, rx) = mpsc::channel(4);
        let mut deferred = None;
        if !self.script.silent.load(Ordering::SeqCst) {
            let event = self.script.start_event(vm_id);
            if lazy {
                deferred = Some(event);
            } else {
                tx.try_send(event).unwrap();
            }
        }

        Ok(BootedVm {
            instance: Box::new(ScriptedInstance {
                vm_id: vm_id.to_string(),
                script: Arc::clone(&self.script),
                events: tx,
                deferred: Mutex::new(deferred),
            }),
            events: rx,
        })
    }

    async fn attach(
        &self,
        vm_id: &str,
        _config: &BootConfig,
        metadata: &[u8],
    ) -> Result<BootedVm, DriverError> {
        if self.script.fail_attach.load(Ordering::SeqCst) {
            return Err(DriverError::Metadata(format!(
                "cannot decode {} bytes",
                metadata.len()
            )));
        }
        self.script.attaches.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(4);
        tx.try_send(VmEvent::running(vm_id)).unwrap();
        Ok(BootedVm {
            instance: Box::new(ScriptedInstance {
                vm_id: vm_id.to_string(),
                script: Arc::clone(&self.script),
                events: tx,
                deferred: Mutex::new(None),
            }),
            events: rx,
        })
    }
}

pub fn images() -> ImageConfig {
    ImageConfig {
        kernel: "/var/lib/podvisor/kernel".into(),
        initrd: "/var/lib/podvisor/hyper-initrd.img".into(),
        ..ImageConfig::default()
    }
}

pub struct Harness {
    pub manager: VmManager,
    pub script: Arc<Script>,
    pub metadata: Arc<MemoryMetadataStore>,
}

impl Harness {
    pub fn registry(&self) -> &Arc<VmRegistry> {
        self.manager.registry()
    }
}

pub fn harness_with(config: VmManagerConfig) -> Harness {
    let driver = Arc::new(ScriptedDriver::default());
    let script = Arc::clone(&driver.script);
    let metadata = Arc::new(MemoryMetadataStore::new());

    let dyn_driver: Arc<dyn HypervisorDriver> = driver;
    let dyn_metadata: Arc<dyn MetadataStore> = metadata.clone();
    let factory = VmFactory::new(Arc::new(VmRegistry::new()), dyn_driver, images());

    Harness {
        manager: VmManager::new(factory, dyn_metadata, config),
        script,
        metadata,
    }
}

pub fn harness() -> Harness {
    harness_with(VmManagerConfig {
        boot_timeout: Some(Duration::from_secs(5)),
        ..VmManagerConfig::default()
    })
}
