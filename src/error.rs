//! Error types for the VM lifecycle core
//!
//! Every failure surfaced by the upward API is a [`VmError`]. Callers that
//! need to branch on the failure class use [`VmError::kind`] rather than
//! matching individual variants.

use thiserror::Error;

/// Coarse failure class of a [`VmError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// VM or its persisted metadata is absent
    NotFound,
    /// Pod already bound elsewhere, or resource shape mismatch
    Conflict,
    /// Driver boot or the status wait failed
    BootFailure,
    /// Driver kill/release failed; the VM stays registered
    KillFailure,
    /// Persisted metadata could not reconstruct a handle
    HydrationFailure,
}

/// Which resource dimension disagreed in a compatibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceDimension {
    Cpu,
    Memory,
}

impl std::fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceDimension::Cpu => write!(f, "cpu"),
            ResourceDimension::Memory => write!(f, "memory"),
        }
    }
}

/// Errors reported by a hypervisor driver or a reuse pool
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to spawn hypervisor process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("hypervisor API socket {path} not ready after {waited_ms}ms")]
    SocketTimeout { path: String, waited_ms: u128 },

    #[error("hypervisor API {endpoint} returned {status}: {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("hypervisor API transport error: {0}")]
    Transport(String),

    #[error("invalid persisted metadata: {0}")]
    Metadata(String),

    #[error("hypervisor process {pid} is not alive")]
    ProcessGone { pid: i32 },

    #[error("failed to signal hypervisor process: {0}")]
    Signal(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Other(err.to_string())
    }
}

/// Errors surfaced by the VM lifecycle API
#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM {0} doesn't exist")]
    VmNotFound(String),

    #[error("no persisted metadata for VM {0}")]
    MetadataNotFound(String),

    #[error("pod {pod} already has VM {current}, but trying to associate with {requested}")]
    AlreadyAssociated {
        pod: String,
        current: String,
        requested: String,
    },

    #[error("VM {vm_id} {dimension} setting ({actual}) differs from the requested {requested}")]
    ResourceMismatch {
        vm_id: String,
        dimension: ResourceDimension,
        actual: u32,
        requested: u32,
    },

    #[error("VM {0} is already registered")]
    AlreadyRegistered(String),

    #[error("failed to boot VM {vm_id}: {source}")]
    Boot {
        vm_id: String,
        #[source]
        source: DriverError,
    },

    #[error("VM {vm_id} did not start successfully: {cause}")]
    StartFailed { vm_id: String, cause: String },

    #[error("failed to kill VM {vm_id}: {source}")]
    Kill {
        vm_id: String,
        #[source]
        source: DriverError,
    },

    #[error("failed to release VM {vm_id} (code {code}): {source}")]
    Release {
        vm_id: String,
        code: i32,
        #[source]
        source: DriverError,
    },

    #[error("failed to associate VM {vm_id}: {source}")]
    Hydration {
        vm_id: String,
        #[source]
        source: DriverError,
    },

    #[error("metadata store error for VM {vm_id}: {source}")]
    Metadata {
        vm_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl VmError {
    /// Failure class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::VmNotFound(_) | VmError::MetadataNotFound(_) => ErrorKind::NotFound,
            VmError::AlreadyAssociated { .. }
            | VmError::ResourceMismatch { .. }
            | VmError::AlreadyRegistered(_) => ErrorKind::Conflict,
            VmError::Boot { .. } | VmError::StartFailed { .. } => ErrorKind::BootFailure,
            VmError::Kill { .. } | VmError::Release { .. } => ErrorKind::KillFailure,
            VmError::Hydration { .. } => ErrorKind::HydrationFailure,
            VmError::Metadata { source, .. } => {
                if source.kind() == std::io::ErrorKind::NotFound {
                    ErrorKind::NotFound
                } else {
                    ErrorKind::HydrationFailure
                }
            }
        }
    }
}

pub type Result<T, E = VmError> = std::result::Result<T, E>;
