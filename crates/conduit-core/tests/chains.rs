//! Jump chain construction, ordering, cleanup, and path caching, exercised
//! with a scripted connector that hands out mock sessions (or failures) in
//! order.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use conduit_core::{
    Connector, ConnectionManager, CoreError, CoreResult, InboundRegistry, JumpHostManager, Transport, TransportStream,
};
use conduit_types::{AuthMethod, ChainState, ChainStrategy, ConnectionConfig, JumpChainConfig, JumpHostConfig};
use secrecy::SecretString;
use tokio::io;

struct ChainTransport {
    inbound: Arc<InboundRegistry>,
}

#[async_trait]
impl Transport for ChainTransport {
    async fn open_direct(
        &self,
        _target_host: String,
        _target_port: u16,
        _origin_host: String,
        _origin_port: u16,
    ) -> CoreResult<TransportStream> {
        let (client, _server) = io::duplex(1024);
        Ok(Box::new(client))
    }

    async fn request_remote_forward(&self, _bind_address: String, bind_port: u16) -> CoreResult<u32> {
        Ok(bind_port as u32)
    }

    async fn cancel_remote_forward(&self, _bind_address: String, _port: u32) -> CoreResult<()> {
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn close(&self) -> CoreResult<()> {
        Ok(())
    }

    fn inbound(&self) -> Arc<InboundRegistry> {
        Arc::clone(&self.inbound)
    }
}

struct ScriptedConnector {
    outcomes: Mutex<VecDeque<CoreResult<()>>>,
    connects: AtomicUsize,
    handshakes: AtomicUsize,
    delay: Duration,
}

impl ScriptedConnector {
    fn new(outcomes: Vec<CoreResult<()>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            connects: AtomicUsize::new(0),
            handshakes: AtomicUsize::new(0),
            delay: Duration::ZERO,
        })
    }

    async fn next(&self) -> CoreResult<Arc<dyn Transport>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CoreError::Other("script exhausted".into())));
        outcome.map(|()| {
            Arc::new(ChainTransport {
                inbound: InboundRegistry::new(),
            }) as Arc<dyn Transport>
        })
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _config: &ConnectionConfig) -> CoreResult<Arc<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.next().await
    }

    async fn connect_over(&self, _config: &ConnectionConfig, _stream: TransportStream) -> CoreResult<Arc<dyn Transport>> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        self.next().await
    }
}

fn hop_config(host: &str) -> ConnectionConfig {
    ConnectionConfig::new(host, 22, "deploy", AuthMethod::Password {
        password: SecretString::new("secret".into()),
    })
}

fn jump(host: &str, priority: u32) -> JumpHostConfig {
    JumpHostConfig {
        connection: hop_config(host),
        priority,
        max_latency_ms: None,
    }
}

fn managers(connector: Arc<ScriptedConnector>) -> (ConnectionManager, JumpHostManager) {
    let connections = ConnectionManager::new(connector);
    let jumps = JumpHostManager::new(connections.clone());
    (connections, jumps)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chain_records_every_hop() -> Result<()> {
    let connector = ScriptedConnector::new(vec![Ok(()), Ok(()), Ok(())]);
    let (connections, jumps) = managers(Arc::clone(&connector));

    let config = JumpChainConfig::new(
        vec![jump("jump-one.example", 1), jump("jump-two.example", 2)],
        hop_config("target.example"),
    );
    let status = jumps.connect_through_jumps(config).await?;

    assert_eq!(status.state, ChainState::Active);
    assert_eq!(status.hop_count, 3);
    assert_eq!(status.actual_path.len(), 3);
    let hosts: Vec<&str> = status.actual_path.iter().map(|hop| hop.host.as_str()).collect();
    assert_eq!(hosts, ["jump-one.example", "jump-two.example", "target.example"]);
    let summed: u64 = status.actual_path.iter().map(|hop| hop.latency_ms).sum();
    assert_eq!(status.total_latency_ms, summed);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    assert_eq!(connector.handshakes.load(Ordering::SeqCst), 2);
    assert_eq!(connections.list().await.len(), 3);

    jumps.close_chain(&status.id).await?;
    assert!(connections.list().await.is_empty());
    let err = jumps.chain_status(&status.id).await.expect_err("chain is gone");
    assert!(matches!(err, CoreError::NotFound { .. }), "got {err:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mid_chain_failure_closes_partial_hops() -> Result<()> {
    let connector = ScriptedConnector::new(vec![Ok(()), Err(CoreError::AuthFailed("rejected".into()))]);
    let (connections, jumps) = managers(connector);

    let config = JumpChainConfig::new(vec![jump("jump-one.example", 1)], hop_config("target.example"));
    let err = jumps.connect_through_jumps(config).await.expect_err("second hop fails");
    match err {
        CoreError::JumpChainFailed { host, hop, .. } => {
            assert_eq!(host, "target.example");
            assert_eq!(hop, 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(connections.list().await.is_empty());
    assert!(jumps.list_chains().await.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failover_retries_the_chain_once() -> Result<()> {
    let connector = ScriptedConnector::new(vec![Err(CoreError::Other("first attempt refused".into())), Ok(())]);
    let (_connections, jumps) = managers(Arc::clone(&connector));

    let mut config = JumpChainConfig::new(Vec::new(), hop_config("target.example"));
    config.strategy = ChainStrategy::Failover;
    let status = jumps.connect_through_jumps(config).await?;

    assert_eq!(status.hop_count, 1);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failover_orders_jumps_by_priority() -> Result<()> {
    let connector = ScriptedConnector::new(vec![Ok(()), Ok(()), Ok(())]);
    let (_connections, jumps) = managers(connector);

    let mut config = JumpChainConfig::new(
        vec![jump("hop-b.example", 5), jump("hop-a.example", 1)],
        hop_config("target.example"),
    );
    config.strategy = ChainStrategy::Failover;
    let status = jumps.connect_through_jumps(config).await?;

    let hosts: Vec<&str> = status.actual_path.iter().map(|hop| hop.host.as_str()).collect();
    assert_eq!(hosts, ["hop-a.example", "hop-b.example", "target.example"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cached_path_is_reused_for_the_same_target() -> Result<()> {
    let connector = ScriptedConnector::new((0..5).map(|_| Ok(())).collect());
    let (_connections, jumps) = managers(connector);

    let mut config = JumpChainConfig::new(vec![jump("jump-one.example", 1)], hop_config("target.example"));
    config.cache_paths = true;
    let first = jumps.connect_through_jumps(config.clone()).await?;
    assert_eq!(first.hop_count, 2);

    // A second request for the same target plans from the cache even when
    // the config carries no jumps.
    config.jumps = Vec::new();
    let second = jumps.connect_through_jumps(config.clone()).await?;
    assert_eq!(second.hop_count, 2);

    jumps.clear_path_cache().await;
    let third = jumps.connect_through_jumps(config).await?;
    assert_eq!(third.hop_count, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chain_state_follows_the_final_hop() -> Result<()> {
    let connector = ScriptedConnector::new(vec![Ok(()), Ok(())]);
    let (connections, jumps) = managers(connector);

    let config = JumpChainConfig::new(vec![jump("jump-one.example", 1)], hop_config("target.example"));
    let status = jumps.connect_through_jumps(config).await?;
    assert_eq!(jumps.chain_status(&status.id).await?.state, ChainState::Active);

    connections.close(&status.connection_id).await?;
    assert_eq!(jumps.chain_status(&status.id).await?.state, ChainState::Failed);
    assert_eq!(jumps.list_chains().await[0].state, ChainState::Failed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn total_latency_limit_tears_the_chain_down() -> Result<()> {
    let connector = Arc::new(ScriptedConnector {
        outcomes: Mutex::new(vec![Ok(())].into()),
        connects: AtomicUsize::new(0),
        handshakes: AtomicUsize::new(0),
        delay: Duration::from_millis(20),
    });
    let (connections, jumps) = managers(connector);

    let mut config = JumpChainConfig::new(Vec::new(), hop_config("target.example"));
    config.max_total_latency_ms = Some(1);
    let err = jumps.connect_through_jumps(config).await.expect_err("latency budget blown");
    assert!(err.to_string().contains("latency"), "got {err}");
    assert!(connections.list().await.is_empty());
    Ok(())
}
