//! Registry of authenticated transport sessions.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use conduit_types::{ConnectionConfig, ConnectionId, ConnectionInfo, HealthStatus};
use tokio::sync::{RwLock, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::transport::{Connector, Transport};

type Result<T> = crate::CoreResult<T>;

/// Monotonic per-connection counters, updated by whoever moves data or runs
/// work over the connection.
#[derive(Default)]
pub struct ConnectionMetrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    commands_executed: AtomicU64,
    error_count: AtomicU64,
}

impl ConnectionMetrics {
    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_command(&self) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn commands_executed(&self) -> u64 {
        self.commands_executed.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }
}

/// One authenticated session plus its bookkeeping.
pub struct Connection {
    id: ConnectionId,
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    connected: AtomicBool,
    health: std::sync::Mutex<HealthStatus>,
    metrics: ConnectionMetrics,
    created_at: DateTime<Utc>,
    last_used: std::sync::Mutex<DateTime<Utc>>,
    closed_tx: watch::Sender<bool>,
}

impl Connection {
    fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let now = Utc::now();
        Self {
            id: ConnectionId::new(format!("conn-{}", Uuid::new_v4())),
            config,
            transport,
            connected: AtomicBool::new(true),
            health: std::sync::Mutex::new(HealthStatus::Healthy),
            metrics: ConnectionMetrics::default(),
            created_at: now,
            last_used: std::sync::Mutex::new(now),
            closed_tx,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Signal that flips to `true` once the connection is closed; dependents
    /// watch it to fail fast instead of discovering a dead transport later.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Bump the last-used timestamp.
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_used.lock() {
            *last = Utc::now();
        }
    }

    fn mark_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.closed_tx.send(true);
    }

    fn set_health(&self, health: HealthStatus) {
        if let Ok(mut cell) = self.health.lock() {
            *cell = health;
        }
    }

    fn snapshot(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            name: self.config.name.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            connected: self.is_connected(),
            health: self.health.lock().map(|h| *h).unwrap_or_default(),
            created_at: self.created_at,
            last_used: self.last_used.lock().map(|t| *t).unwrap_or(self.created_at),
            bytes_sent: self.metrics.bytes_sent(),
            bytes_received: self.metrics.bytes_received(),
            commands_executed: self.metrics.commands_executed(),
            error_count: self.metrics.error_count(),
        }
    }
}

struct ConnectionState {
    connector: Arc<dyn Connector>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

/// Owns every live connection; hands out ids and snapshots, never the
/// sessions themselves.
#[derive(Clone)]
pub struct ConnectionManager {
    state: Arc<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            state: Arc::new(ConnectionState {
                connector,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Establish and register a new connection. The whole connect-and-auth
    /// sequence runs under the config's timeout.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<ConnectionId> {
        let endpoint = config.endpoint();
        let transport = tokio::time::timeout(config.timeout, self.state.connector.connect(&config))
            .await
            .map_err(|_| crate::CoreError::timeout(format!("connect to {endpoint}"), config.timeout))??;
        let id = self.adopt(config, transport).await;
        Ok(id)
    }

    /// Register an already-established transport (used for jump chain hops).
    pub(crate) async fn adopt(&self, config: ConnectionConfig, transport: Arc<dyn Transport>) -> ConnectionId {
        let connection = Arc::new(Connection::new(config, transport));
        let id = connection.id().clone();
        info!(
            id = %id,
            endpoint = %connection.config().endpoint(),
            user = %connection.config().username,
            "connection established"
        );
        self.state.connections.write().await.insert(id.clone(), connection);
        id
    }

    pub(crate) async fn lookup(&self, id: &ConnectionId) -> Result<Arc<Connection>> {
        self.state
            .connections
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| crate::CoreError::not_found("connection", id.as_str()))
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.state.connector)
    }

    /// Snapshot of one connection.
    pub async fn get(&self, id: &ConnectionId) -> Result<ConnectionInfo> {
        Ok(self.lookup(id).await?.snapshot())
    }

    /// Snapshots of every registered connection.
    pub async fn list(&self) -> Vec<ConnectionInfo> {
        self.state.connections.read().await.values().map(|c| c.snapshot()).collect()
    }

    /// Close a connection. Dependents holding its close signal observe the
    /// flip before the transport goes away; new tunnel creation against the
    /// id fails from the moment the entry leaves the registry.
    pub async fn close(&self, id: &ConnectionId) -> Result<()> {
        let connection = {
            let mut connections = self.state.connections.write().await;
            let connection = connections
                .remove(id)
                .ok_or_else(|| crate::CoreError::not_found("connection", id.as_str()))?;
            connection.mark_closed();
            connection
        };
        if let Err(err) = connection.transport().close().await {
            warn!(id = %id, ?err, "transport close reported an error");
        }
        info!(id = %id, endpoint = %connection.config().endpoint(), "connection closed");
        Ok(())
    }

    /// Close every connection, ignoring individual failures.
    pub async fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.state.connections.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.close(&id).await {
                warn!(id = %id, ?err, "failed to close connection");
            }
        }
    }

    /// Probe one connection and record the verdict.
    pub async fn health_check(&self, id: &ConnectionId) -> Result<HealthStatus> {
        let connection = self.lookup(id).await?;
        let alive = connection.is_connected() && connection.transport().is_alive().await;
        let health = if !alive {
            HealthStatus::Failed
        } else if connection.metrics().error_count() > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        connection.set_health(health);
        Ok(health)
    }

    /// Probe every connection.
    pub async fn health_check_all(&self) -> Vec<(ConnectionId, HealthStatus)> {
        let ids: Vec<ConnectionId> = self.state.connections.read().await.keys().cloned().collect();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(health) = self.health_check(&id).await {
                results.push((id, health));
            }
        }
        results
    }
}
