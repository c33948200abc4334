//! Error types for the ovadeploy core library.

use std::path::PathBuf;
use std::time::Duration;

/// The main error type for appliance import operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The appliance archive or its extracted layout is unusable.
    #[error("archive error: {message}")]
    Archive { message: String },

    /// A manifest entry is malformed or does not match the extracted file.
    #[error("manifest error: {message}")]
    Manifest { message: String },

    /// The OVF descriptor could not be read.
    #[error("descriptor error: {message}")]
    Descriptor { message: String },

    /// A SOAP response could not be understood.
    #[error("SOAP error: {message}")]
    Soap { message: String },

    /// The host refused a request (SOAP fault or error entries in a result).
    #[error("host rejected {operation}: {message}")]
    HostRejected { operation: String, message: String },

    /// The transfer lease entered a terminal failure state.
    #[error("lease error: {state}{}", message.as_ref().map(|m| format!(" ({m})")).unwrap_or_default())]
    Lease {
        state: String,
        message: Option<String>,
    },

    /// The lease did not become ready within the polling policy.
    #[error("lease not ready after {polls} polls ({elapsed:?})")]
    LeaseTimeout { polls: u32, elapsed: Duration },

    /// The operation was cancelled through a cancel flag.
    #[error("operation cancelled")]
    Cancelled,

    /// Uploading a disk failed on the primary path.
    #[error("transfer of '{disk}' failed: {message}")]
    Transfer { disk: String, message: String },

    /// One or more disks could not be placed, even through the fallback path.
    #[error("{} disk(s) not transferred: {}", failed.len(), failed.join(", "))]
    PartialTransfer { failed: Vec<String> },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration value.
    #[error("configuration error: {message}")]
    Config { message: String },
}

/// A specialized Result type for appliance import operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create an archive error.
    pub fn archive(message: impl Into<String>) -> Self {
        Self::Archive {
            message: message.into(),
        }
    }

    /// Create a manifest error.
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }

    /// Create a descriptor error.
    pub fn descriptor(message: impl Into<String>) -> Self {
        Self::Descriptor {
            message: message.into(),
        }
    }

    /// Create a SOAP error.
    pub fn soap(message: impl Into<String>) -> Self {
        Self::Soap {
            message: message.into(),
        }
    }

    /// Create a host rejection error for the named operation.
    pub fn host_rejected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HostRejected {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a lease failure error.
    pub fn lease(state: impl Into<String>, message: Option<String>) -> Self {
        Self::Lease {
            state: state.into(),
            message,
        }
    }

    /// Create a transfer error for a disk.
    pub fn transfer(disk: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            disk: disk.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
