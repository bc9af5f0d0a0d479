//! The seam between the managers and the underlying transport protocol.
//!
//! Everything the managers need from an authenticated session is expressed
//! through these traits, so the core stays testable with in-memory mocks and
//! the protocol implementation lives in its own crate.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use conduit_types::ConnectionConfig;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tracing::warn;

type Result<T> = crate::CoreResult<T>;

/// Trait for streams carried over the transport.
pub trait TransportStreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TransportStreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type alias for boxed transport streams.
pub type TransportStream = Box<dyn TransportStreamIo>;

/// An authenticated session that can open and accept forwarded streams.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open an outbound stream to `target_host:target_port` through the
    /// session (SSH `direct-tcpip`).
    async fn open_direct(
        &self,
        target_host: String,
        target_port: u16,
        origin_host: String,
        origin_port: u16,
    ) -> Result<TransportStream>;

    /// Ask the remote side to listen on `bind_address:bind_port` and route
    /// accepted connections back. Returns the port actually bound, which may
    /// differ when 0 was requested.
    async fn request_remote_forward(&self, bind_address: String, bind_port: u16) -> Result<u32>;

    /// Cancel a previously requested remote listener.
    async fn cancel_remote_forward(&self, bind_address: String, port: u32) -> Result<()>;

    /// Whether the session is still usable.
    async fn is_alive(&self) -> bool;

    /// Disconnect the session.
    async fn close(&self) -> Result<()>;

    /// Registry routing streams accepted by remote listeners.
    fn inbound(&self) -> Arc<InboundRegistry>;
}

/// Factory for transports; the second form authenticates a fresh session over
/// an already-established stream, which is how jump chains stack hops.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Transport>>;

    async fn connect_over(&self, config: &ConnectionConfig, stream: TransportStream) -> Result<Arc<dyn Transport>>;
}

/// Routes streams accepted by remote listeners to whoever registered the
/// matching bind address and port. Streams with no registered consumer are
/// dropped, which closes them.
#[derive(Default)]
pub struct InboundRegistry {
    routes: tokio::sync::Mutex<HashMap<u32, InboundRoute>>,
}

struct InboundRoute {
    bind_address: Option<String>,
    sender: mpsc::UnboundedSender<TransportStream>,
}

impl InboundRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a consumer for `bind_address:port`. An empty or absent
    /// address matches any reported address.
    pub async fn register(&self, bind_address: Option<String>, port: u32) -> mpsc::UnboundedReceiver<TransportStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().await.insert(port, InboundRoute {
            bind_address,
            sender: tx,
        });
        rx
    }

    pub async fn unregister(&self, port: u32) {
        self.routes.lock().await.remove(&port);
    }

    /// Deliver an accepted stream to its consumer, if any.
    pub async fn dispatch(&self, bind_address: &str, port: u32, stream: TransportStream) {
        let routes = self.routes.lock().await;
        let matched = routes.get(&port).filter(|route| match route.bind_address.as_deref() {
            None | Some("") => true,
            Some(addr) => addr == bind_address,
        });
        match matched {
            Some(route) => {
                if route.sender.send(stream).is_err() {
                    warn!(address = bind_address, port, "inbound consumer is gone; dropping forwarded stream");
                }
            }
            None => {
                warn!(address = bind_address, port, "forwarded stream with no matching registration");
            }
        }
    }
}
