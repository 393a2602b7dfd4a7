//! Firecracker-backed hypervisor driver
//!
//! Each VM is one `firecracker` process listening on its own API socket
//! under the runtime directory. Booting spawns the process, configures
//! machine size and boot source over the API, then issues `InstanceStart`
//! (deferred until [`VmInstance::launch`] for lazy boots). The outcome of the
//! start is posted on the VM's status feed.
//!
//! The persisted metadata of an instance is its pid and API socket, which is
//! all that is needed to re-attach after a daemon restart.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::config::BootConfig;
use super::driver::{BootedVm, HypervisorDriver, KillOutcome, StatusCode, VmEvent, VmInstance};
use super::firecracker::FirecrackerClient;
use crate::config::FirecrackerConfig;
use crate::error::DriverError;

/// Capacity of a VM's status feed
const STATUS_FEED_CAPACITY: usize = 8;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Spawn a Firecracker process with the given API socket path
pub fn spawn_firecracker(binary: &Path, vm_id: &str, api_socket: &Path) -> Result<Child, DriverError> {
    Command::new(binary)
        .arg("--api-sock")
        .arg(api_socket)
        .arg("--id")
        .arg(vm_id)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(false)
        .spawn()
        .map_err(DriverError::Spawn)
}

/// Wait for the Firecracker API socket to become available
pub async fn wait_for_api_socket(socket_path: &Path, timeout: Duration) -> Result<(), DriverError> {
    let start_time = Instant::now();

    loop {
        if socket_path.exists() {
            return Ok(());
        }

        if start_time.elapsed() > timeout {
            return Err(DriverError::SocketTimeout {
                path: socket_path.display().to_string(),
                waited_ms: timeout.as_millis(),
            });
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Whether a process with `pid` still exists
fn process_alive(pid: i32) -> bool {
    match signal::kill(Pid::from_raw(pid), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// What gets persisted for a Firecracker VM
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FirecrackerMetadata {
    pub vm_id: String,
    pub pid: i32,
    pub api_socket: PathBuf,
}

enum Process {
    /// Spawned by this daemon
    Child(Child),
    /// Re-attached after a restart; only the pid is known
    Adopted(i32),
    Gone,
}

impl Process {
    fn pid(&self) -> Option<i32> {
        match self {
            Process::Child(child) => child.id().map(|p| p as i32),
            Process::Adopted(pid) => Some(*pid),
            Process::Gone => None,
        }
    }
}

/// One running Firecracker process
pub struct FirecrackerInstance {
    vm_id: String,
    client: FirecrackerClient,
    process: Mutex<Process>,
    started: AtomicBool,
    events: mpsc::Sender<VmEvent>,
    release_grace: Duration,
}

impl FirecrackerInstance {
    async fn post(&self, event: VmEvent) {
        if self.events.try_send(event).is_err() {
            debug!(vm_id = %self.vm_id, "Status feed full or closed, dropping event");
        }
    }

    fn cleanup_socket(&self) {
        let socket = self.client.socket_path();
        if socket.exists() {
            if let Err(e) = std::fs::remove_file(socket) {
                warn!(vm_id = %self.vm_id, path = %socket.display(), error = %e, "Failed to remove API socket");
            }
        }
    }

    /// Signal-kill and reap the process; returns (exit code, cause)
    async fn terminate(&self, process: &mut Process) -> Result<KillOutcome, DriverError> {
        let outcome = match process {
            Process::Child(child) => {
                if let Err(e) = child.start_kill() {
                    // Already exited; reaping below still yields the status.
                    debug!(vm_id = %self.vm_id, error = %e, "start_kill failed");
                }
                let status = child.wait().await.map_err(|e| DriverError::Signal(e.to_string()))?;
                KillOutcome {
                    code: status.code().unwrap_or(0),
                    cause: "killed".to_string(),
                }
            }
            Process::Adopted(pid) => {
                match signal::kill(Pid::from_raw(*pid), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => return Err(DriverError::Signal(e.to_string())),
                }
                KillOutcome {
                    code: 0,
                    cause: "killed".to_string(),
                }
            }
            Process::Gone => return Ok(KillOutcome::default()),
        };
        *process = Process::Gone;
        self.cleanup_socket();
        Ok(outcome)
    }

    /// Wait up to `grace` for the process to exit on its own
    async fn wait_exit(&self, process: &mut Process, grace: Duration) -> Option<i32> {
        let code = match process {
            Process::Child(child) => match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => status.code().unwrap_or(0),
                _ => return None,
            },
            Process::Adopted(pid) => {
                let deadline = Instant::now() + grace;
                while process_alive(*pid) {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                0
            }
            Process::Gone => 0,
        };
        *process = Process::Gone;
        self.cleanup_socket();
        Some(code)
    }
}

#[async_trait]
impl VmInstance for FirecrackerInstance {
    async fn kill(&self) -> Result<KillOutcome, DriverError> {
        let mut process = self.process.lock().await;
        let outcome = self.terminate(&mut process).await?;
        info!(vm_id = %self.vm_id, code = outcome.code, "Firecracker process killed");
        Ok(outcome)
    }

    async fn release(&self) -> Result<i32, DriverError> {
        let mut process = self.process.lock().await;

        if let Err(e) = self.client.send_ctrl_alt_del().await {
            warn!(vm_id = %self.vm_id, error = %e, "Graceful shutdown request failed");
        } else if let Some(code) = self.wait_exit(&mut process, self.release_grace).await {
            self.post(VmEvent::new(&self.vm_id, StatusCode::Exited, "released")).await;
            return Ok(code);
        }

        let outcome = self.terminate(&mut process).await?;
        self.post(VmEvent::new(&self.vm_id, StatusCode::Exited, "killed on release")).await;
        Ok(outcome.code)
    }

    async fn launch(&self) -> Result<(), DriverError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.client.start().await {
            Ok(()) => {
                self.post(VmEvent::running(&self.vm_id)).await;
                Ok(())
            }
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                self.post(VmEvent::new(&self.vm_id, StatusCode::Rejected, e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn is_alive(&self) -> bool {
        match &mut *self.process.lock().await {
            Process::Child(child) => matches!(child.try_wait(), Ok(None)),
            Process::Adopted(pid) => process_alive(*pid),
            Process::Gone => false,
        }
    }

    fn dump(&self, vm_id: &str) -> Result<Vec<u8>, DriverError> {
        let pid = self
            .process
            .try_lock()
            .ok()
            .and_then(|p| p.pid())
            .ok_or_else(|| DriverError::Other(format!("VM {} has no live process", self.vm_id)))?;
        let metadata = FirecrackerMetadata {
            vm_id: vm_id.to_string(),
            pid,
            api_socket: self.client.socket_path().to_path_buf(),
        };
        serde_json::to_vec(&metadata).map_err(|e| DriverError::Metadata(e.to_string()))
    }
}

/// Boots Firecracker VMs
#[derive(Debug, Clone)]
pub struct FirecrackerDriver {
    config: FirecrackerConfig,
}

impl FirecrackerDriver {
    pub fn new(config: FirecrackerConfig) -> Self {
        Self { config }
    }

    fn api_socket(&self, vm_id: &str) -> PathBuf {
        self.config.runtime_dir.join(format!("{}.socket", vm_id))
    }

    async fn configure(&self, client: &FirecrackerClient, config: &BootConfig) -> Result<(), DriverError> {
        client.machine_config(config.cpu, config.memory_mb).await?;
        let initrd = if config.initrd.as_os_str().is_empty() {
            None
        } else {
            Some(config.initrd.display().to_string())
        };
        client
            .boot_source(config.kernel.display().to_string(), initrd, self.config.boot_args.clone())
            .await
    }
}

#[async_trait]
impl HypervisorDriver for FirecrackerDriver {
    async fn boot(&self, vm_id: &str, config: &BootConfig, lazy: bool) -> Result<BootedVm, DriverError> {
        if config.has_custom_firmware() || config.alt_image.is_some() {
            return Err(DriverError::Other(
                "firecracker boots kernel images only; bios/cbfs/alternate images are unsupported".to_string(),
            ));
        }

        tokio::fs::create_dir_all(&self.config.runtime_dir).await?;
        let api_socket = self.api_socket(vm_id);
        if let Err(e) = std::fs::remove_file(&api_socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(vm_id, path = %api_socket.display(), error = %e, "Failed to remove stale API socket");
            }
        }

        info!(vm_id, cpu = config.cpu, memory_mb = config.memory_mb, lazy, "Creating VM");
        let child = spawn_firecracker(&self.config.binary, vm_id, &api_socket)?;

        let (tx, rx) = mpsc::channel(STATUS_FEED_CAPACITY);
        let instance = FirecrackerInstance {
            vm_id: vm_id.to_string(),
            client: FirecrackerClient::new(&api_socket),
            process: Mutex::new(Process::Child(child)),
            started: AtomicBool::new(false),
            events: tx,
            release_grace: Duration::from_millis(self.config.release_grace_ms),
        };

        let timeout = Duration::from_millis(self.config.api_socket_timeout_ms);
        let setup = async {
            wait_for_api_socket(&api_socket, timeout).await?;
            self.configure(&instance.client, config).await
        };
        if let Err(e) = setup.await {
            if let Err(kill_err) = instance.kill().await {
                warn!(vm_id, error = %kill_err, "Failed to kill half-configured VM");
            }
            return Err(e);
        }

        if !lazy {
            // A refused start is reported on the status feed, not as a boot error.
            if let Err(e) = instance.launch().await {
                warn!(vm_id, error = %e, "InstanceStart failed");
            }
        }

        Ok(BootedVm {
            instance: Box::new(instance),
            events: rx,
        })
    }

    async fn attach(
        &self,
        vm_id: &str,
        _config: &BootConfig,
        metadata: &[u8],
    ) -> Result<BootedVm, DriverError> {
        let metadata: FirecrackerMetadata =
            serde_json::from_slice(metadata).map_err(|e| DriverError::Metadata(e.to_string()))?;
        if metadata.vm_id != vm_id {
            return Err(DriverError::Metadata(format!(
                "metadata belongs to {}, not {}",
                metadata.vm_id, vm_id
            )));
        }
        if !process_alive(metadata.pid) {
            return Err(DriverError::ProcessGone { pid: metadata.pid });
        }
        if !metadata.api_socket.exists() {
            return Err(DriverError::Metadata(format!(
                "API socket {} is missing",
                metadata.api_socket.display()
            )));
        }

        let (tx, rx) = mpsc::channel(STATUS_FEED_CAPACITY);
        let instance = FirecrackerInstance {
            vm_id: vm_id.to_string(),
            client: FirecrackerClient::new(&metadata.api_socket),
            process: Mutex::new(Process::Adopted(metadata.pid)),
            started: AtomicBool::new(true),
            events: tx,
            release_grace: Duration::from_millis(self.config.release_grace_ms),
        };
        instance.post(VmEvent::running(vm_id)).await;
        info!(vm_id, pid = metadata.pid, "Re-attached VM");

        Ok(BootedVm {
            instance: Box::new(instance),
            events: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(dir: &Path) -> FirecrackerDriver {
        FirecrackerDriver::new(FirecrackerConfig {
            runtime_dir: dir.to_path_buf(),
            ..FirecrackerConfig::default()
        })
    }

    fn config() -> BootConfig {
        BootConfig {
            cpu: 1,
            memory_mb: 128,
            kernel: PathBuf::from("/kernel"),
            initrd: PathBuf::from("/initrd.img"),
            bios: None,
            cbfs: None,
            alt_image: None,
        }
    }

    #[tokio::test]
    async fn test_socket_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = wait_for_api_socket(&dir.path().join("missing.socket"), Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::SocketTimeout { .. }));
    }

    #[tokio::test]
    async fn test_boot_rejects_custom_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.bios = Some(PathBuf::from("/bios.bin"));
        let err = driver(dir.path()).boot("vm-a", &config, false).await.unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[tokio::test]
    async fn test_attach_rejects_garbage_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let err = driver(dir.path())
            .attach("vm-a", &config(), b"not json")
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Metadata(_)));
    }

    #[tokio::test]
    async fn test_attach_rejects_foreign_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = FirecrackerMetadata {
            vm_id: "vm-b".into(),
            pid: std::process::id() as i32,
            api_socket: dir.path().join("vm-b.socket"),
        };
        let raw = serde_json::to_vec(&metadata).unwrap();
        let err = driver(dir.path()).attach("vm-a", &config(), &raw).await.unwrap_err();
        assert!(matches!(err, DriverError::Metadata(_)));
    }

    #[tokio::test]
    async fn test_attach_to_own_process() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("vm-a.socket");
        std::fs::write(&socket, b"").unwrap();
        let metadata = FirecrackerMetadata {
            vm_id: "vm-a".into(),
            pid: std::process::id() as i32,
            api_socket: socket,
        };
        let raw = serde_json::to_vec(&metadata).unwrap();

        let mut booted = driver(dir.path()).attach("vm-a", &config(), &raw).await.unwrap();
        let event = booted.events.recv().await.unwrap();
        assert_eq!(event.code, StatusCode::Running);

        let dumped: FirecrackerMetadata =
            serde_json::from_slice(&booted.instance.dump("vm-a").unwrap()).unwrap();
        assert_eq!(dumped, metadata);
        assert!(booted.instance.is_alive().await);
    }

    fn adopted(vm_id: &str, socket: &Path, process: Process) -> FirecrackerInstance {
        let (tx, _rx) = mpsc::channel(STATUS_FEED_CAPACITY);
        FirecrackerInstance {
            vm_id: vm_id.to_string(),
            client: FirecrackerClient::new(socket),
            process: Mutex::new(process),
            started: AtomicBool::new(true),
            events: tx,
            release_grace: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_pooled_instance_dumps_registered_id() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("warm-abcdefghij.socket");
        std::fs::write(&socket, b"").unwrap();
        let warm = adopted(
            "warm-abcdefghij",
            &socket,
            Process::Adopted(std::process::id() as i32),
        );

        let raw = warm.dump("vm-Q1w2E3r4T5").unwrap();
        let metadata: FirecrackerMetadata = serde_json::from_slice(&raw).unwrap();
        assert_eq!(metadata.vm_id, "vm-Q1w2E3r4T5");
        assert_eq!(metadata.api_socket, socket);

        let mut booted = driver(dir.path())
            .attach("vm-Q1w2E3r4T5", &config(), &raw)
            .await
            .unwrap();
        assert_eq!(booted.events.recv().await.unwrap().vm_id, "vm-Q1w2E3r4T5");
    }

    #[tokio::test]
    async fn test_boot_continues_past_unremovable_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("vm-a.socket");
        std::fs::create_dir(&stale).unwrap();
        std::fs::write(stale.join("leftover"), b"").unwrap();
        let driver = FirecrackerDriver::new(FirecrackerConfig {
            binary: dir.path().join("no-such-firecracker"),
            runtime_dir: dir.path().to_path_buf(),
            ..FirecrackerConfig::default()
        });

        let err = driver.boot("vm-a", &config(), false).await.unwrap_err();

        assert!(matches!(err, DriverError::Spawn(_)));
        assert!(stale.exists());
    }

    #[tokio::test]
    async fn test_reaped_instance_is_not_alive() {
        let dir = tempfile::tempdir().unwrap();
        let gone = adopted("vm-a", &dir.path().join("vm-a.socket"), Process::Gone);
        assert!(!gone.is_alive().await);
        assert!(gone.dump("vm-a").is_err());
    }
}
