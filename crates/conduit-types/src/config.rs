//! Configuration inputs for connections, tunnels, and jump chains.

use std::{path::PathBuf, time::Duration};

use secrecy::SecretString;

use crate::ids::ConnectionId;

/// How to authenticate a connection.
#[derive(Clone, Debug)]
pub enum AuthMethod {
    /// Password authentication.
    Password { password: SecretString },
    /// Private key file, optionally passphrase-protected.
    Key {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
    /// Private key plus an OpenSSH certificate.
    Certificate { key_path: PathBuf, cert_path: PathBuf },
}

/// Host key acceptance policy for a connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum HostKeyVerification {
    /// Accept whatever key the server presents.
    #[default]
    AcceptAny,
    /// Require the presented key to match a pinned value: either a full
    /// OpenSSH public key line or a `SHA256:...` fingerprint.
    Pinned(String),
}

/// Parameters for establishing one transport session.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Optional human-readable label.
    pub name: Option<String>,
    /// Remote host to connect to.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Username to authenticate as.
    pub username: String,
    /// Authentication method.
    pub auth: AuthMethod,
    /// Host key policy.
    pub host_key: HostKeyVerification,
    /// Timeout applied to connect, authentication, and channel opens.
    pub timeout: Duration,
    /// Optional transport keepalive interval.
    pub keepalive_interval: Option<Duration>,
}

impl ConnectionConfig {
    /// Default timeout for connection-level operations.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Build a config with defaults for everything beyond the endpoint and credentials.
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            name: None,
            host: host.into(),
            port,
            username: username.into(),
            auth,
            host_key: HostKeyVerification::default(),
            timeout: Self::DEFAULT_TIMEOUT,
            keepalive_interval: None,
        }
    }

    /// `host:port` form, used in logs and error messages.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The three tunnel shapes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelSpec {
    /// Listen locally, forward each connection out through the transport.
    Local {
        bind_port: u16,
        target_host: String,
        target_port: u16,
    },
    /// Ask the server to listen remotely, forward each connection back to a
    /// local target.
    Remote {
        bind_port: u16,
        target_host: String,
        target_port: u16,
    },
    /// Local SOCKS5 proxy resolving targets per client request.
    Dynamic { bind_port: u16 },
}

impl TunnelSpec {
    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelSpec::Local { .. } => "local",
            TunnelSpec::Remote { .. } => "remote",
            TunnelSpec::Dynamic { .. } => "dynamic",
        }
    }
}

/// Parameters for one tunnel.
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// Connection the tunnel rides on.
    pub connection_id: ConnectionId,
    /// Tunnel shape and endpoints.
    pub spec: TunnelSpec,
    /// Optional bind address (defaults to 127.0.0.1 locally, to the server
    /// default for remote tunnels).
    pub bind_address: Option<String>,
    /// Re-establish the tunnel after listener failure.
    pub auto_restart: bool,
    /// Give up permanently after this many reconnect attempts.
    pub max_reconnect_attempts: u32,
}

impl TunnelConfig {
    /// Default cap on reconnect attempts.
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

    pub fn new(connection_id: ConnectionId, spec: TunnelSpec) -> Self {
        Self {
            connection_id,
            spec,
            bind_address: None,
            auto_restart: false,
            max_reconnect_attempts: Self::DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Strategy for ordering jump hosts in a chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChainStrategy {
    /// Hop through the jumps in the order given.
    #[default]
    Sequential,
    /// Reserved; currently treated as sequential.
    Optimal,
    /// Sort jumps by priority and retry the whole chain once on failure.
    Failover,
}

/// One intermediate hop in a jump chain.
#[derive(Clone, Debug)]
pub struct JumpHostConfig {
    /// How to reach and authenticate against the hop.
    pub connection: ConnectionConfig,
    /// Ordering hint for the failover strategy (lower is preferred).
    pub priority: u32,
    /// Per-hop latency ceiling; exceeding it is logged, not fatal.
    pub max_latency_ms: Option<u64>,
}

/// Parameters for a multi-hop chain ending at a target host.
#[derive(Clone, Debug)]
pub struct JumpChainConfig {
    /// Intermediate hops, possibly empty for a direct connection.
    pub jumps: Vec<JumpHostConfig>,
    /// Final destination.
    pub target: ConnectionConfig,
    /// Hop ordering strategy.
    pub strategy: ChainStrategy,
    /// Abort the chain when the summed hop latency exceeds this.
    pub max_total_latency_ms: Option<u64>,
    /// Remember the jump list for this target host.
    pub cache_paths: bool,
    /// How long a cached path stays valid.
    pub cache_duration: Duration,
}

impl JumpChainConfig {
    /// Default lifetime for cached paths.
    pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(600);

    pub fn new(jumps: Vec<JumpHostConfig>, target: ConnectionConfig) -> Self {
        Self {
            jumps,
            target,
            strategy: ChainStrategy::default(),
            max_total_latency_ms: None,
            cache_paths: false,
            cache_duration: Self::DEFAULT_CACHE_DURATION,
        }
    }
}
