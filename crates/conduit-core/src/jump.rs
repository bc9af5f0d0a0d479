//! Multi-hop chains: connect to the first jump directly, then stack each
//! further hop (and finally the target) over a forwarded channel from the
//! previous one.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Instant,
};

use chrono::{DateTime, Utc};
use conduit_types::{
    ChainId, ChainState, ChainStrategy, ConnectionConfig, ConnectionId, JumpChainConfig, JumpChainStatus, JumpHop,
    JumpHostConfig,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::connection::ConnectionManager;

type Result<T> = crate::CoreResult<T>;

struct CachedPath {
    jumps: Vec<JumpHostConfig>,
    expires_at: Instant,
}

struct JumpChain {
    id: ChainId,
    connection_id: ConnectionId,
    /// Every hop session in order; intermediates must stay alive to carry
    /// the ones stacked on top of them.
    hop_ids: Vec<ConnectionId>,
    actual_path: Vec<JumpHop>,
    total_latency_ms: u64,
    created_at: DateTime<Utc>,
}

impl JumpChain {
    fn snapshot(&self, state: ChainState) -> JumpChainStatus {
        JumpChainStatus {
            id: self.id.clone(),
            connection_id: self.connection_id.clone(),
            state,
            hop_count: self.actual_path.len(),
            actual_path: self.actual_path.clone(),
            total_latency_ms: self.total_latency_ms,
            created_at: self.created_at,
        }
    }
}

struct JumpManagerState {
    connections: ConnectionManager,
    chains: RwLock<HashMap<ChainId, Arc<JumpChain>>>,
    path_cache: Mutex<HashMap<String, CachedPath>>,
}

/// Builds and tracks jump chains; hop sessions are registered with the
/// connection manager so tunnels can ride the final one.
#[derive(Clone)]
pub struct JumpHostManager {
    state: Arc<JumpManagerState>,
}

impl JumpHostManager {
    pub fn new(connections: ConnectionManager) -> Self {
        Self {
            state: Arc::new(JumpManagerState {
                connections,
                chains: RwLock::new(HashMap::new()),
                path_cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Establish a chain through the configured jumps to the target. On
    /// failure every hop opened so far is closed before the error returns.
    pub async fn connect_through_jumps(&self, config: JumpChainConfig) -> Result<JumpChainStatus> {
        let jumps = self.plan_jumps(&config).await;
        let built = match self.build_chain(&jumps, &config.target).await {
            Ok(built) => built,
            Err(err) if config.strategy == ChainStrategy::Failover => {
                warn!(?err, target = %config.target.host, "jump chain failed; failover retries once");
                self.build_chain(&jumps, &config.target).await?
            }
            Err(err) => return Err(err),
        };
        let (hop_ids, actual_path) = built;
        let total_latency_ms: u64 = actual_path.iter().map(|hop| hop.latency_ms).sum();
        if let Some(limit) = config.max_total_latency_ms
            && total_latency_ms > limit
        {
            self.teardown(&hop_ids).await;
            return Err(crate::CoreError::jump_chain(
                config.target.host.clone(),
                actual_path.len().saturating_sub(1),
                format!("total latency {total_latency_ms}ms exceeds limit {limit}ms"),
            ));
        }
        if config.cache_paths {
            self.state.path_cache.lock().await.insert(config.target.host.clone(), CachedPath {
                jumps: jumps.clone(),
                expires_at: Instant::now() + config.cache_duration,
            });
        }

        let connection_id = hop_ids
            .last()
            .cloned()
            .ok_or_else(|| crate::CoreError::Other("jump chain produced no hops".into()))?;
        let chain = Arc::new(JumpChain {
            id: ChainId::new(format!("chain-{}", Uuid::new_v4())),
            connection_id,
            hop_ids,
            actual_path,
            total_latency_ms,
            created_at: Utc::now(),
        });
        let status = chain.snapshot(ChainState::Active);
        info!(
            id = %chain.id,
            target = %config.target.endpoint(),
            hops = status.hop_count,
            total_latency_ms,
            "jump chain established"
        );
        self.state.chains.write().await.insert(chain.id.clone(), chain);
        Ok(status)
    }

    /// Snapshot of one chain, with its state taken from the final hop.
    pub async fn chain_status(&self, id: &ChainId) -> Result<JumpChainStatus> {
        let chain = self
            .state
            .chains
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| crate::CoreError::not_found("jump chain", id.as_str()))?;
        Ok(chain.snapshot(self.final_hop_state(&chain).await))
    }

    /// Snapshots of every chain.
    pub async fn list_chains(&self) -> Vec<JumpChainStatus> {
        let chains: Vec<Arc<JumpChain>> = self.state.chains.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(chains.len());
        for chain in chains {
            statuses.push(chain.snapshot(self.final_hop_state(&chain).await));
        }
        statuses
    }

    async fn final_hop_state(&self, chain: &JumpChain) -> ChainState {
        match self.state.connections.lookup(&chain.connection_id).await {
            Ok(connection) if connection.is_connected() => ChainState::Active,
            _ => ChainState::Failed,
        }
    }

    /// Close a chain, tearing down its hop sessions innermost-first.
    pub async fn close_chain(&self, id: &ChainId) -> Result<()> {
        let chain = self
            .state
            .chains
            .write()
            .await
            .remove(id)
            .ok_or_else(|| crate::CoreError::not_found("jump chain", id.as_str()))?;
        self.teardown(&chain.hop_ids).await;
        info!(id = %id, "jump chain closed");
        Ok(())
    }

    /// Drop all remembered paths.
    pub async fn clear_path_cache(&self) {
        self.state.path_cache.lock().await.clear();
    }

    async fn plan_jumps(&self, config: &JumpChainConfig) -> Vec<JumpHostConfig> {
        if config.cache_paths {
            let mut cache = self.state.path_cache.lock().await;
            match cache.get(&config.target.host) {
                Some(cached) if cached.expires_at > Instant::now() => {
                    info!(target = %config.target.host, "reusing cached jump path");
                    return cached.jumps.clone();
                }
                Some(_) => {
                    cache.remove(&config.target.host);
                }
                None => {}
            }
        }
        let mut jumps = config.jumps.clone();
        match config.strategy {
            ChainStrategy::Sequential => {}
            ChainStrategy::Optimal => {
                warn!("optimal chain strategy is not implemented; using sequential order");
            }
            ChainStrategy::Failover => {
                jumps.sort_by_key(|jump| jump.priority);
            }
        }
        jumps
    }

    async fn build_chain(
        &self,
        jumps: &[JumpHostConfig],
        target: &ConnectionConfig,
    ) -> Result<(Vec<ConnectionId>, Vec<JumpHop>)> {
        let mut hop_ids: Vec<ConnectionId> = Vec::with_capacity(jumps.len() + 1);
        let mut path: Vec<JumpHop> = Vec::with_capacity(jumps.len() + 1);
        let hops = jumps.iter().map(|jump| &jump.connection).chain(std::iter::once(target));
        for (index, hop) in hops.enumerate() {
            let started = Instant::now();
            let result = match hop_ids.last() {
                None => self.state.connections.connect(hop.clone()).await,
                Some(previous) => self.connect_over_previous(previous, hop).await,
            };
            let id = match result {
                Ok(id) => id,
                Err(err) => {
                    warn!(host = %hop.host, hop = index, ?err, "jump hop failed; closing partial chain");
                    self.teardown(&hop_ids).await;
                    return Err(crate::CoreError::jump_chain(hop.host.clone(), index, err.to_string()));
                }
            };
            let latency_ms = started.elapsed().as_millis() as u64;
            if let Some(limit) = jumps.get(index).and_then(|jump| jump.max_latency_ms)
                && latency_ms > limit
            {
                warn!(host = %hop.host, latency_ms, limit, "jump hop latency exceeds configured ceiling");
            }
            hop_ids.push(id);
            path.push(JumpHop {
                host: hop.host.clone(),
                latency_ms,
                connected_at: Utc::now(),
            });
            info!(host = %hop.host, hop = index, latency_ms, "jump hop established");
        }
        Ok((hop_ids, path))
    }

    async fn connect_over_previous(&self, previous: &ConnectionId, hop: &ConnectionConfig) -> Result<ConnectionId> {
        let carrier = self.state.connections.lookup(previous).await?;
        let timeout = hop.timeout;
        let stream = tokio::time::timeout(
            timeout,
            carrier
                .transport()
                .open_direct(hop.host.clone(), hop.port, "127.0.0.1".to_string(), 0),
        )
        .await
        .map_err(|_| crate::CoreError::timeout(format!("open channel to {}", hop.endpoint()), timeout))??;
        carrier.touch();
        let connector = self.state.connections.connector();
        let transport = tokio::time::timeout(timeout, connector.connect_over(hop, stream))
            .await
            .map_err(|_| crate::CoreError::timeout(format!("session handshake with {}", hop.endpoint()), timeout))??;
        Ok(self.state.connections.adopt(hop.clone(), transport).await)
    }

    async fn teardown(&self, hop_ids: &[ConnectionId]) {
        for id in hop_ids.iter().rev() {
            if let Err(err) = self.state.connections.close(id).await {
                warn!(id = %id, ?err, "failed to close chain hop");
            }
        }
    }
}
