use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in conduit core operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Host key verification failed
    #[error("host key verification failed: {0}")]
    HostKeyFailed(String),

    /// An operation exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Referenced entity does not exist
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Requested listen address is already taken
    #[error("address {address} is already in use")]
    PortInUse { address: String },

    /// Network binding failed
    #[error("failed to bind {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The connection a dependent rides on was closed
    #[error("connection {id} is closed")]
    ConnectionClosed { id: String },

    /// A jump chain could not be established
    #[error("jump chain failed at hop {hop} ({host}): {reason}")]
    JumpChainFailed { host: String, hop: usize, reason: String },

    /// Data relay between two streams failed
    #[error("relay failed: {0}")]
    Relay(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for conduit core operations
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Create a jump chain error naming the failing hop
    pub fn jump_chain(host: impl Into<String>, hop: usize, reason: impl Into<String>) -> Self {
        Self::JumpChainFailed {
            host: host.into(),
            hop,
            reason: reason.into(),
        }
    }
}
