use std::sync::Arc;

use conduit_types::TunnelSpec;
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
};
use tracing::{info, warn};

use super::{ServeOutcome, Tunnel, bind_listener, relay::relay};
use crate::connection::Connection;

type Result<T> = crate::CoreResult<T>;

// SOCKS5 reply codes sent by this proxy.
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Bind the SOCKS5 listener and spawn the accept loop.
pub(super) async fn establish(tunnel: &Arc<Tunnel>, connection: &Arc<Connection>) -> Result<JoinHandle<ServeOutcome>> {
    let TunnelSpec::Dynamic { bind_port } = &tunnel.config.spec else {
        return Err(crate::CoreError::Other("not a dynamic tunnel spec".into()));
    };
    let bind_port = *bind_port;
    let bind_host = tunnel.config.bind_address.clone().unwrap_or_else(|| "127.0.0.1".to_string());
    let listener = bind_listener(&bind_host, bind_port).await?;
    let local_addr = listener.local_addr()?;
    tunnel.set_local_endpoint(local_addr.to_string());
    info!(bind = %local_addr, "dynamic SOCKS forward listening");
    let tunnel = Arc::clone(tunnel);
    let connection = Arc::clone(connection);
    Ok(tokio::spawn(run_listener(listener, tunnel, connection)))
}

async fn run_listener(listener: tokio::net::TcpListener, tunnel: Arc<Tunnel>, connection: Arc<Connection>) -> ServeOutcome {
    let mut shutdown = tunnel.shutdown_signal();
    let mut closed = connection.closed_signal();
    if *closed.borrow() {
        return ServeOutcome::ConnectionClosed;
    }
    loop {
        tokio::select! {
            _ = shutdown.changed() => return ServeOutcome::Shutdown,
            _ = closed.changed() => return ServeOutcome::ConnectionClosed,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let tunnel = Arc::clone(&tunnel);
                    let connection = Arc::clone(&connection);
                    tokio::spawn(async move {
                        if let Err(err) = handle_socks_client(stream, tunnel, connection).await {
                            warn!(?err, "socks client failed");
                        }
                    });
                }
                Err(err) => {
                    warn!(?err, "dynamic SOCKS listener accept error");
                    return ServeOutcome::Error(format!("accept failed: {err}"));
                }
            }
        }
    }
}

async fn handle_socks_client(mut stream: TcpStream, tunnel: Arc<Tunnel>, connection: Arc<Connection>) -> Result<()> {
    tunnel.metrics().record_connection();
    connection.touch();

    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != 0x05 {
        return Ok(()); // only SOCKS5 supported
    }
    let method_count = header[1] as usize;
    let mut methods = vec![0u8; method_count];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&0x00) {
        // No authentication is the only method offered here.
        stream.write_all(&[0x05, 0xFF]).await?;
        return Ok(());
    }
    stream.write_all(&[0x05, 0x00]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != 0x05 || request[1] != 0x01 {
        send_socks_reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Ok(());
    }
    let target_host = match request[3] {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).to_string()
        }
        // IPv4 and domain addressing only; IPv6 requests are refused.
        _ => {
            send_socks_reply(&mut stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Ok(());
        }
    };
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let target_port = u16::from_be_bytes(port_buf);
    let origin = stream.peer_addr().ok();
    let origin_host = origin.map(|addr| addr.ip().to_string()).unwrap_or_else(|| "0.0.0.0".to_string());
    let origin_port = origin.map(|addr| addr.port()).unwrap_or(0);

    let timeout = connection.config().timeout;
    let opened = tokio::time::timeout(
        timeout,
        connection
            .transport()
            .open_direct(target_host.clone(), target_port, origin_host, origin_port),
    )
    .await;
    let remote = match opened {
        Ok(Ok(remote)) => remote,
        Ok(Err(err)) => {
            tunnel.record_error(err.to_string());
            connection.metrics().record_error();
            warn!(?err, target = %format!("{target_host}:{target_port}"), "failed to open socks target");
            send_socks_reply(&mut stream, REPLY_GENERAL_FAILURE).await?;
            return Ok(());
        }
        Err(_) => {
            tunnel.record_error(format!("open to {target_host}:{target_port} timed out after {timeout:?}"));
            connection.metrics().record_error();
            warn!(target = %format!("{target_host}:{target_port}"), "socks open timed out");
            send_socks_reply(&mut stream, REPLY_GENERAL_FAILURE).await?;
            return Ok(());
        }
    };
    send_socks_reply(&mut stream, REPLY_SUCCESS).await?;

    let mut shutdown = tunnel.shutdown_signal();
    tokio::select! {
        _ = shutdown.changed() => {}
        result = relay(stream, remote, tunnel.metrics(), connection.metrics()) => {
            if let Err(err) = result {
                tunnel.record_error(err.to_string());
                warn!(?err, "socks relay failed");
            }
        }
    }
    Ok(())
}

async fn send_socks_reply<W>(stream: &mut W, status: u8) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut response = [0u8; 10];
    response[0] = 0x05;
    response[1] = status;
    response[2] = 0x00;
    response[3] = 0x01;
    stream.write_all(&response).await?;
    Ok(())
}
