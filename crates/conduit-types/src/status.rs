//! Status snapshots reported by the managers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ChainId, ConnectionId, TunnelId};

/// Connection health as judged by the last health check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Transport alive, no errors recorded.
    #[default]
    Healthy,
    /// Transport alive but errors have been recorded.
    Degraded,
    /// Transport no longer alive.
    Failed,
}

/// Point-in-time snapshot of a connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub connected: bool,
    pub health: HealthStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub commands_executed: u64,
    pub error_count: u64,
}

/// Tunnel lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// Listener/registration being set up (also during reconnect backoff).
    Establishing,
    /// Accepting and relaying traffic.
    Active,
    /// Closed on request.
    Closed,
    /// Gave up after errors; terminal.
    Failed,
}

/// Point-in-time snapshot of a tunnel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub id: TunnelId,
    pub connection_id: ConnectionId,
    pub kind: String,
    pub state: TunnelState,
    /// Local listening endpoint, when the tunnel has one.
    pub local_endpoint: Option<String>,
    /// Remote endpoint description (target, or the server-side bind).
    pub remote_endpoint: String,
    pub bytes_transferred: u64,
    pub connections_count: u64,
    pub errors_count: u64,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One established hop in a jump chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JumpHop {
    pub host: String,
    pub latency_ms: u64,
    pub connected_at: DateTime<Utc>,
}

/// Whether a chain's final hop is still usable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainState {
    /// Final hop connection registered and connected.
    #[default]
    Active,
    /// Final hop connection is gone or no longer connected.
    Failed,
}

/// Point-in-time snapshot of a jump chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JumpChainStatus {
    pub id: ChainId,
    /// Connection id of the final hop; tunnels ride on this one.
    pub connection_id: ConnectionId,
    pub state: ChainState,
    pub hop_count: usize,
    pub actual_path: Vec<JumpHop>,
    pub total_latency_ms: u64,
    pub created_at: DateTime<Utc>,
}
