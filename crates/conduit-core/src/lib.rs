//! Core managers for the conduit tunneling subsystem: connections, tunnels
//! (local, remote, dynamic SOCKS5), and jump chains, all written against the
//! [`transport`] seam so any authenticated session implementation plugs in.

pub mod connection;
pub mod error;
pub mod jump;
pub mod logging;
pub mod transport;
pub mod tunnel;

pub use connection::{Connection, ConnectionManager, ConnectionMetrics};
pub use error::{CoreError, CoreResult};
pub use jump::JumpHostManager;
pub use transport::{Connector, InboundRegistry, Transport, TransportStream, TransportStreamIo};
pub use tunnel::{TunnelManager, TunnelMetrics, reconnect_delay_ms};
