//! Tunnel lifecycle: local, remote, and dynamic SOCKS forwarding over a
//! registered connection.

mod local;
mod relay;
mod remote;
mod socks;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use conduit_types::{ConnectionId, TunnelConfig, TunnelId, TunnelSpec, TunnelState, TunnelStatus};
use tokio::{
    net::TcpListener,
    sync::{RwLock, watch},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::connection::{Connection, ConnectionManager};

type Result<T> = crate::CoreResult<T>;

/// First reconnect delay.
pub const INITIAL_BACKOFF_MS: u64 = 1_000;
/// Ceiling for reconnect delays.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Delay before reconnect attempt `attempt` (1-based): doubles each attempt,
/// capped at [`MAX_BACKOFF_MS`].
pub fn reconnect_delay_ms(attempt: u32) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let exp = (attempt - 1).min(15);
    (INITIAL_BACKOFF_MS << exp).min(MAX_BACKOFF_MS)
}

/// Monotonic per-tunnel counters.
#[derive(Default)]
pub struct TunnelMetrics {
    bytes_transferred: AtomicU64,
    connections_count: AtomicU64,
    errors_count: AtomicU64,
}

impl TunnelMetrics {
    pub fn add_bytes(&self, n: u64) {
        self.bytes_transferred.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_connection(&self) {
        self.connections_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn connections_count(&self) -> u64 {
        self.connections_count.load(Ordering::Relaxed)
    }

    pub fn errors_count(&self) -> u64 {
        self.errors_count.load(Ordering::Relaxed)
    }
}

/// Why a serve task stopped.
pub(super) enum ServeOutcome {
    /// Tunnel was closed on request.
    Shutdown,
    /// The underlying connection went away.
    ConnectionClosed,
    /// Listener or registration failure.
    Error(String),
}

pub(crate) struct Tunnel {
    id: TunnelId,
    config: TunnelConfig,
    state: std::sync::Mutex<TunnelState>,
    local_endpoint: std::sync::Mutex<Option<String>>,
    remote_endpoint: std::sync::Mutex<String>,
    metrics: TunnelMetrics,
    reconnect_attempts: AtomicU32,
    last_error: std::sync::Mutex<Option<String>>,
    created_at: DateTime<Utc>,
    shutdown_tx: watch::Sender<bool>,
    /// Server-side binding for remote tunnels: (bind address, actual port).
    remote_binding: std::sync::Mutex<Option<(String, u32)>>,
}

impl Tunnel {
    fn new(config: TunnelConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let remote_endpoint = match &config.spec {
            TunnelSpec::Local { target_host, target_port, .. } | TunnelSpec::Remote { target_host, target_port, .. } => {
                format!("{target_host}:{target_port}")
            }
            TunnelSpec::Dynamic { .. } => "socks".to_string(),
        };
        Self {
            id: TunnelId::new(format!("tun-{}", Uuid::new_v4())),
            config,
            state: std::sync::Mutex::new(TunnelState::Establishing),
            local_endpoint: std::sync::Mutex::new(None),
            remote_endpoint: std::sync::Mutex::new(remote_endpoint),
            metrics: TunnelMetrics::default(),
            reconnect_attempts: AtomicU32::new(0),
            last_error: std::sync::Mutex::new(None),
            created_at: Utc::now(),
            shutdown_tx,
            remote_binding: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> &TunnelId {
        &self.id
    }

    pub(crate) fn metrics(&self) -> &TunnelMetrics {
        &self.metrics
    }

    fn set_state(&self, state: TunnelState) {
        if let Ok(mut cell) = self.state.lock() {
            *cell = state;
        }
    }

    fn state(&self) -> TunnelState {
        self.state.lock().map(|s| *s).unwrap_or(TunnelState::Failed)
    }

    fn set_local_endpoint(&self, endpoint: String) {
        if let Ok(mut cell) = self.local_endpoint.lock() {
            *cell = Some(endpoint);
        }
    }

    fn set_remote_endpoint(&self, endpoint: String) {
        if let Ok(mut cell) = self.remote_endpoint.lock() {
            *cell = endpoint;
        }
    }

    fn set_remote_binding(&self, address: String, port: u32) {
        if let Ok(mut cell) = self.remote_binding.lock() {
            *cell = Some((address, port));
        }
    }

    fn take_remote_binding(&self) -> Option<(String, u32)> {
        self.remote_binding.lock().ok().and_then(|mut cell| cell.take())
    }

    /// Record a serve failure in the counters and `last_error`.
    fn record_error(&self, message: String) {
        self.metrics.record_error();
        if let Ok(mut cell) = self.last_error.lock() {
            *cell = Some(message);
        }
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Claim the next reconnect slot. Returns the backoff delay to wait, or
    /// `None` once `max_reconnect_attempts` have been used up.
    fn begin_reconnect(&self) -> Option<Duration> {
        let max = self.config.max_reconnect_attempts;
        let previous = self
            .reconnect_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n >= max { None } else { Some(n + 1) });
        match previous {
            Ok(n) => Some(Duration::from_millis(reconnect_delay_ms(n + 1))),
            Err(_) => None,
        }
    }

    fn snapshot(&self) -> TunnelStatus {
        TunnelStatus {
            id: self.id.clone(),
            connection_id: self.config.connection_id.clone(),
            kind: self.config.spec.kind().to_string(),
            state: self.state(),
            local_endpoint: self.local_endpoint.lock().ok().and_then(|cell| cell.clone()),
            remote_endpoint: self.remote_endpoint.lock().map(|cell| cell.clone()).unwrap_or_default(),
            bytes_transferred: self.metrics.bytes_transferred(),
            connections_count: self.metrics.connections_count(),
            errors_count: self.metrics.errors_count(),
            reconnect_attempts: self.reconnect_attempts(),
            last_error: self.last_error.lock().ok().and_then(|cell| cell.clone()),
            created_at: self.created_at,
        }
    }
}

/// Bind a local listener, distinguishing an occupied port from other bind
/// failures.
pub(super) async fn bind_listener(bind_host: &str, port: u16) -> Result<TcpListener> {
    match TcpListener::bind((bind_host, port)).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => Err(crate::CoreError::PortInUse {
            address: format!("{bind_host}:{port}"),
        }),
        Err(err) => Err(crate::CoreError::BindFailed {
            address: format!("{bind_host}:{port}"),
            source: err,
        }),
    }
}

async fn establish(tunnel: &Arc<Tunnel>, connection: &Arc<Connection>) -> Result<JoinHandle<ServeOutcome>> {
    match &tunnel.config.spec {
        TunnelSpec::Local { .. } => local::establish(tunnel, connection).await,
        TunnelSpec::Remote { .. } => remote::establish(tunnel, connection).await,
        TunnelSpec::Dynamic { .. } => socks::establish(tunnel, connection).await,
    }
}

struct TunnelManagerState {
    connections: ConnectionManager,
    tunnels: RwLock<HashMap<TunnelId, Arc<Tunnel>>>,
}

/// Owns every tunnel; listener and relay work runs in spawned tasks that
/// report back through the supervisor.
#[derive(Clone)]
pub struct TunnelManager {
    state: Arc<TunnelManagerState>,
}

impl TunnelManager {
    pub fn new(connections: ConnectionManager) -> Self {
        Self {
            state: Arc::new(TunnelManagerState {
                connections,
                tunnels: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Establish a tunnel and register it. The tunnel only enters the
    /// registry once its listener (or remote registration) is up.
    pub async fn create_tunnel(&self, config: TunnelConfig) -> Result<TunnelId> {
        let connection = self.state.connections.lookup(&config.connection_id).await?;
        if !connection.is_connected() {
            return Err(crate::CoreError::ConnectionClosed {
                id: config.connection_id.as_str().to_string(),
            });
        }
        connection.touch();

        let tunnel = Arc::new(Tunnel::new(config));
        let serving = establish(&tunnel, &connection).await?;
        tunnel.set_state(TunnelState::Active);
        let id = tunnel.id().clone();
        self.state.tunnels.write().await.insert(id.clone(), Arc::clone(&tunnel));
        info!(
            id = %id,
            kind = tunnel.config.spec.kind(),
            connection = %tunnel.config.connection_id,
            "tunnel established"
        );

        let manager = self.clone();
        tokio::spawn(async move {
            manager.supervise(tunnel, connection, serving).await;
        });
        Ok(id)
    }

    /// Close a tunnel. Closing an id that is already gone is a no-op, so
    /// repeated closes are safe.
    pub async fn close_tunnel(&self, id: &TunnelId) -> Result<()> {
        let Some(tunnel) = self.state.tunnels.write().await.remove(id) else {
            return Ok(());
        };
        tunnel.begin_shutdown();
        tunnel.set_state(TunnelState::Closed);
        if let Some((address, port)) = tunnel.take_remote_binding()
            && let Ok(connection) = self.state.connections.lookup(&tunnel.config.connection_id).await
        {
            connection.transport().inbound().unregister(port).await;
            if let Err(err) = connection.transport().cancel_remote_forward(address.clone(), port).await {
                warn!(?err, bind = &address, port, "failed to cancel remote forward");
            }
        }
        info!(id = %id, "tunnel closed");
        Ok(())
    }

    /// Snapshot of one tunnel.
    pub async fn tunnel_status(&self, id: &TunnelId) -> Result<TunnelStatus> {
        self.state
            .tunnels
            .read()
            .await
            .get(id)
            .map(|tunnel| tunnel.snapshot())
            .ok_or_else(|| crate::CoreError::not_found("tunnel", id.as_str()))
    }

    /// Snapshots of all tunnels, optionally only those riding one connection.
    pub async fn list_tunnels(&self, connection_id: Option<&ConnectionId>) -> Vec<TunnelStatus> {
        self.state
            .tunnels
            .read()
            .await
            .values()
            .filter(|tunnel| connection_id.is_none_or(|id| &tunnel.config.connection_id == id))
            .map(|tunnel| tunnel.snapshot())
            .collect()
    }

    /// Close every tunnel.
    pub async fn shutdown(&self) {
        let ids: Vec<TunnelId> = self.state.tunnels.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.close_tunnel(&id).await {
                warn!(id = %id, ?err, "failed to close tunnel");
            }
        }
    }

    async fn supervise(self, tunnel: Arc<Tunnel>, connection: Arc<Connection>, mut serving: JoinHandle<ServeOutcome>) {
        loop {
            let outcome = match serving.await {
                Ok(outcome) => outcome,
                // Aborted mid-close; the tunnel is already being torn down.
                Err(_) => return,
            };
            let mut message = match outcome {
                ServeOutcome::Shutdown => return,
                ServeOutcome::ConnectionClosed => {
                    tunnel.record_error(format!("connection {} is closed", tunnel.config.connection_id));
                    tunnel.set_state(TunnelState::Failed);
                    warn!(id = %tunnel.id(), "tunnel failed: connection closed");
                    return;
                }
                ServeOutcome::Error(message) => message,
            };

            // Reconnect loop: each failed re-establish claims another slot.
            loop {
                tunnel.record_error(message.clone());
                if !tunnel.config.auto_restart {
                    tunnel.set_state(TunnelState::Failed);
                    warn!(id = %tunnel.id(), error = %message, "tunnel failed");
                    return;
                }
                let Some(delay) = tunnel.begin_reconnect() else {
                    tunnel.set_state(TunnelState::Failed);
                    warn!(
                        id = %tunnel.id(),
                        attempts = tunnel.reconnect_attempts(),
                        error = %message,
                        "tunnel failed permanently; reconnect attempts exhausted"
                    );
                    return;
                };
                tunnel.set_state(TunnelState::Establishing);
                info!(
                    id = %tunnel.id(),
                    attempt = tunnel.reconnect_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "re-establishing tunnel after backoff"
                );
                let mut shutdown = tunnel.shutdown_signal();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
                if !connection.is_connected() {
                    tunnel.record_error(format!("connection {} is closed", tunnel.config.connection_id));
                    tunnel.set_state(TunnelState::Failed);
                    return;
                }
                match establish(&tunnel, &connection).await {
                    Ok(handle) => {
                        tunnel.set_state(TunnelState::Active);
                        info!(id = %tunnel.id(), "tunnel re-established");
                        serving = handle;
                        break;
                    }
                    Err(err) => {
                        message = err.to_string();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
