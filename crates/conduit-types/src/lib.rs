//! Shared configuration and status types used across the conduit workspace.
//!
//! These structs/enums are intentionally dependency-light so they can be
//! reused by config loaders, embedders, and runtimes without pulling in
//! protocol implementations.

pub mod config;
pub mod ids;
pub mod result;
pub mod status;

pub use config::{
    AuthMethod, ChainStrategy, ConnectionConfig, HostKeyVerification, JumpChainConfig, JumpHostConfig, TunnelConfig, TunnelSpec,
};
pub use ids::{ChainId, ConnectionId, TunnelId};
pub use result::ToolResult;
pub use status::{ChainState, ConnectionInfo, HealthStatus, JumpChainStatus, JumpHop, TunnelState, TunnelStatus};
