use thiserror::Error;

/// Errors that can occur while establishing or driving an SSH session
#[derive(Error, Debug)]
pub enum SshClientError {
    /// SSH protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Host key verification failed
    #[error("host key verification failed: {0}")]
    HostKeyFailed(String),

    /// Cryptographic error
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for SSH client operations
pub type SshClientResult<T> = Result<T, SshClientError>;

impl From<SshClientError> for conduit_core::CoreError {
    fn from(err: SshClientError) -> Self {
        match err {
            SshClientError::AuthFailed(message) => conduit_core::CoreError::AuthFailed(message),
            SshClientError::HostKeyFailed(message) => conduit_core::CoreError::HostKeyFailed(message),
            SshClientError::Io(err) => conduit_core::CoreError::Io(err),
            SshClientError::Ssh(err) => conduit_core::CoreError::Other(format!("SSH error: {err}")),
            SshClientError::Crypto(message) => conduit_core::CoreError::Other(format!("cryptographic error: {message}")),
            SshClientError::Other(message) => conduit_core::CoreError::Other(message),
        }
    }
}

/// Shorthand used by the transport methods, which speak the core error type.
pub(crate) fn core_err(err: russh::Error) -> conduit_core::CoreError {
    SshClientError::from(err).into()
}
