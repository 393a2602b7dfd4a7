//! Firecracker API client
//!
//! Provides a high-level client for interacting with Firecracker's HTTP API
//! over Unix domain sockets.

use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::Serialize;

use super::config::{Action, BootSource, MachineConfig};
use crate::error::DriverError;

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// Client for communicating with Firecracker's control API
#[derive(Clone)]
pub struct FirecrackerClient {
    client: HyperClient,
    socket_path: PathBuf,
}

impl FirecrackerClient {
    /// Create a new Firecracker API client
    ///
    /// # Arguments
    /// * `socket_path` - Path to the Firecracker API Unix socket
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);

        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a PUT request with a JSON body and fail on non-2xx answers
    async fn put<T: Serialize>(&self, endpoint: &str, body: T) -> Result<(), DriverError> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let json = serde_json::to_string(&body).map_err(|e| DriverError::Other(e.to_string()))?;

        let req = hyper::Request::builder()
            .method(hyper::Method::PUT)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .map_err(|e| DriverError::Transport(e.to_string()))?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| DriverError::Transport(e.to_string()))?;
        let status = res.status();

        if !status.is_success() {
            let body_bytes = res
                .into_body()
                .collect()
                .await
                .map_err(|e| DriverError::Transport(e.to_string()))?
                .to_bytes();
            return Err(DriverError::Api {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body_bytes).into_owned(),
            });
        }

        Ok(())
    }

    /// Set vCPU count and memory size
    pub async fn machine_config(&self, vcpu_count: u32, mem_size_mib: u32) -> Result<(), DriverError> {
        self.put(
            "/machine-config",
            MachineConfig {
                vcpu_count,
                mem_size_mib,
            },
        )
        .await
    }

    /// Configure the boot source (kernel, optional initrd, boot arguments)
    pub async fn boot_source(
        &self,
        kernel_image_path: impl Into<String>,
        initrd_path: Option<String>,
        boot_args: impl Into<String>,
    ) -> Result<(), DriverError> {
        self.put(
            "/boot-source",
            BootSource {
                kernel_image_path: kernel_image_path.into(),
                initrd_path,
                boot_args: boot_args.into(),
            },
        )
        .await
    }

    /// Start the VM instance
    pub async fn start(&self) -> Result<(), DriverError> {
        self.action("InstanceStart").await
    }

    /// Ask the guest to shut down (keyboard reset on x86)
    pub async fn send_ctrl_alt_del(&self) -> Result<(), DriverError> {
        self.action("SendCtrlAltDel").await
    }

    async fn action(&self, action_type: &str) -> Result<(), DriverError> {
        self.put(
            "/actions",
            Action {
                action_type: action_type.to_string(),
            },
        )
        .await
    }
}

impl std::fmt::Debug for FirecrackerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirecrackerClient")
            .field("socket_path", &self.socket_path)
            .finish()
    }
}
