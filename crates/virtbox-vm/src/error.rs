//! Error types for virtbox-vm.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for virtbox-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur during VM operations.
#[derive(Debug, Error)]
pub enum VmError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Host filesystem operation failed on a specific path
    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A recovered domain root does not end in a dash-free UUID
    #[error("invalid domain UUID: {0}")]
    InvalidUuid(String),

    /// Could not reach the control plane
    #[error("failed to connect to control plane: {0}")]
    Connect(String),

    /// The control plane rejected a request
    #[error("control plane rejected {op}: {message}")]
    ControlPlane { op: &'static str, message: String },

    /// The event pump stopped; the connection can no longer be used
    #[error("control plane event loop failed: {0}")]
    EventLoop(String),

    /// Domain descriptor could not be rendered
    #[error("failed to serialize domain descriptor: {0}")]
    Serialize(String),

    /// VM is not in expected state
    #[error("invalid VM state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Operation is not implemented by this driver
    #[error("{0} is not supported by the libvirt driver")]
    Unsupported(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VmError {
    /// Wrap an I/O error with the path it occurred on.
    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Build a control plane rejection for the named operation.
    pub(crate) fn rejected(op: &'static str, message: impl Into<String>) -> Self {
        Self::ControlPlane {
            op,
            message: message.into(),
        }
    }
}
