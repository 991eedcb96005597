//! Error type shared by the daemon and its clients.
//!
//! Every variant maps to a stable wire discriminator via [`BurrowError::kind`];
//! the human-readable message travels next to it in an error response.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type BurrowResult<T> = std::result::Result<T, BurrowError>;

#[derive(Debug, Error)]
pub enum BurrowError {
    /// A finite resource pool has no free elements left.
    #[error("{pool} pool exhausted")]
    PoolExhausted { pool: &'static str },

    /// The handle names no live container.
    #[error("unknown handle: {0}")]
    ContainerNotFound(String),

    /// The process id is not known to the container's tracker.
    #[error("unknown process: {0}")]
    ProcessNotFound(u32),

    /// The rootfs URI scheme has no registered provider.
    #[error("unknown rootfs provider: {0:?}")]
    UnknownRootfsProvider(String),

    /// A host-side script exited non-zero.
    #[error("{script} exited with status {status}")]
    HostScriptFailed { script: String, status: i32 },

    /// Malformed spec, CIDR, path or similar caller mistake.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Socket, pipe or filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// During restore, a pool refused to reserve an element it does not hold
    /// as free. Suggests depot/snapshot drift.
    #[error("{element} already taken from {pool} pool")]
    AlreadyTaken { pool: &'static str, element: String },

    /// Persisted state could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BurrowError {
    /// Stable discriminator carried on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            BurrowError::PoolExhausted { .. } => "pool_exhausted",
            BurrowError::ContainerNotFound(_) => "container_not_found",
            BurrowError::ProcessNotFound(_) => "process_not_found",
            BurrowError::UnknownRootfsProvider(_) => "unknown_rootfs_provider",
            BurrowError::HostScriptFailed { .. } => "host_script_failed",
            BurrowError::InvalidArgument(_) => "invalid_argument",
            BurrowError::Io(_) => "io_error",
            BurrowError::AlreadyTaken { .. } => "already_taken",
            BurrowError::Storage(_) => "storage_error",
            BurrowError::Internal(_) => "internal_error",
        }
    }
}
