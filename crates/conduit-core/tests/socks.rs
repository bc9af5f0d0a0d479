//! SOCKS5 behavior of dynamic tunnels, exercised against a mock transport
//! whose channels are in-memory duplex pairs.

use std::{
    net::TcpListener as StdTcpListener,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use conduit_core::{Connector, ConnectionManager, CoreError, CoreResult, InboundRegistry, Transport, TransportStream, TunnelManager};
use conduit_types::{AuthMethod, ConnectionConfig, TunnelConfig, TunnelSpec};
use secrecy::SecretString;
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::sleep,
};

struct MockTransport {
    targets: Arc<Mutex<Vec<String>>>,
    streams: mpsc::UnboundedSender<io::DuplexStream>,
    fail_open: Arc<AtomicBool>,
    inbound: Arc<InboundRegistry>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_direct(
        &self,
        target_host: String,
        target_port: u16,
        _origin_host: String,
        _origin_port: u16,
    ) -> CoreResult<TransportStream> {
        self.targets.lock().unwrap().push(format!("{target_host}:{target_port}"));
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(CoreError::Other("administratively prohibited".into()));
        }
        let (client, server) = io::duplex(4096);
        self.streams.send(server).map_err(|_| CoreError::Other("test receiver gone".into()))?;
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

struct MockConnector {
    transport: Mutex<Option<Arc<MockTransport>>>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _config: &ConnectionConfig) -> CoreResult<Arc<dyn Transport>> {
        self.transport
            .lock()
            .unwrap()
            .take()
            .map(|t| t as Arc<dyn Transport>)
            .ok_or_else(|| CoreError::Other("no scripted transport".into()))
    }

    async fn connect_over(&self, _config: &ConnectionConfig, _stream: TransportStream) -> CoreResult<Arc<dyn Transport>> {
        Err(CoreError::Other("not used in these tests".into()))
    }
}

struct Proxy {
    tunnels: TunnelManager,
    id: conduit_types::TunnelId,
    port: u16,
    transport: Arc<MockTransport>,
    streams: mpsc::UnboundedReceiver<io::DuplexStream>,
}

async fn start_proxy() -> Proxy {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(MockTransport {
        targets: Arc::new(Mutex::new(Vec::new())),
        streams: tx,
        fail_open: Arc::new(AtomicBool::new(false)),
        inbound: InboundRegistry::new(),
    });
    let connector = Arc::new(MockConnector {
        transport: Mutex::new(Some(Arc::clone(&transport))),
    });
    let connections = ConnectionManager::new(connector);
    let config = ConnectionConfig::new("gateway.example", 22, "deploy", AuthMethod::Password {
        password: SecretString::new("secret".into()),
    });
    let conn_id = connections.connect(config).await.expect("connect");
    let tunnels = TunnelManager::new(connections);

    let port = StdTcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap();
    let id = tunnels
        .create_tunnel(TunnelConfig::new(conn_id, TunnelSpec::Dynamic { bind_port: port }))
        .await
        .expect("create tunnel");
    Proxy {
        tunnels,
        id,
        port,
        transport,
        streams: rx,
    }
}

async fn greet(client: &mut TcpStream) -> Result<()> {
    client.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await?;
    assert_eq!(reply, [0x05, 0x00]);
    Ok(())
}

async fn request_ipv4(client: &mut TcpStream, addr: [u8; 4], port: u16) -> Result<[u8; 10]> {
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&addr);
    request.extend_from_slice(&port.to_be_bytes());
    client.write_all(&request).await?;
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await?;
    Ok(reply)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_succeeds_and_relays_payload() -> Result<()> {
    let mut proxy = start_proxy().await;
    let mut client = TcpStream::connect(("127.0.0.1", proxy.port)).await?;
    greet(&mut client).await?;
    let reply = request_ipv4(&mut client, [203, 0, 113, 10], 8080).await?;
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00);

    let mut upstream = proxy.streams.recv().await.expect("channel opened");
    client.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    upstream.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"ping");
    upstream.write_all(b"pong").await?;
    client.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"pong");

    let targets = proxy.transport.targets.lock().unwrap().clone();
    assert_eq!(targets, vec!["203.0.113.10:8080".to_string()]);
    drop(client);
    sleep(Duration::from_millis(50)).await;
    let status = proxy.tunnels.tunnel_status(&proxy.id).await?;
    assert_eq!(status.connections_count, 1);
    assert!(status.bytes_transferred >= 8);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn domain_requests_reach_the_named_target() -> Result<()> {
    let proxy = start_proxy().await;
    let mut client = TcpStream::connect(("127.0.0.1", proxy.port)).await?;
    greet(&mut client).await?;

    let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
    request.extend_from_slice(b"internal.db");
    request.extend_from_slice(&5432u16.to_be_bytes());
    client.write_all(&request).await?;
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await?;
    assert_eq!(reply[1], 0x00);

    let targets = proxy.transport.targets.lock().unwrap().clone();
    assert_eq!(targets, vec!["internal.db:5432".to_string()]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ipv6_requests_are_refused() -> Result<()> {
    let proxy = start_proxy().await;
    let mut client = TcpStream::connect(("127.0.0.1", proxy.port)).await?;
    greet(&mut client).await?;

    let mut request = vec![0x05, 0x01, 0x00, 0x04];
    request.extend_from_slice(&[0u8; 16]);
    request.extend_from_slice(&443u16.to_be_bytes());
    client.write_all(&request).await?;
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await?;
    assert_eq!(reply[1], 0x08);

    // The proxy hangs up after the refusal.
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await?, 0);
    assert!(proxy.transport.targets.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bind_command_is_rejected() -> Result<()> {
    let proxy = start_proxy().await;
    let mut client = TcpStream::connect(("127.0.0.1", proxy.port)).await?;
    greet(&mut client).await?;

    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
        .await?;
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await?;
    assert_eq!(reply[1], 0x07);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clients_without_noauth_are_turned_away() -> Result<()> {
    let proxy = start_proxy().await;
    let mut client = TcpStream::connect(("127.0.0.1", proxy.port)).await?;
    client.write_all(&[0x05, 0x01, 0x02]).await?;
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await?;
    assert_eq!(reply, [0x05, 0xFF]);
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_socks5_clients_are_dropped() -> Result<()> {
    let proxy = start_proxy().await;
    let mut client = TcpStream::connect(("127.0.0.1", proxy.port)).await?;
    client.write_all(&[0x04, 0x01]).await?;
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_channel_open_reports_general_failure() -> Result<()> {
    let proxy = start_proxy().await;
    proxy.transport.fail_open.store(true, Ordering::SeqCst);
    let mut client = TcpStream::connect(("127.0.0.1", proxy.port)).await?;
    greet(&mut client).await?;
    let reply = request_ipv4(&mut client, [203, 0, 113, 10], 8080).await?;
    assert_eq!(reply[1], 0x01);
    sleep(Duration::from_millis(50)).await;
    let status = proxy.tunnels.tunnel_status(&proxy.id).await?;
    assert_eq!(status.errors_count, 1);
    Ok(())
}
