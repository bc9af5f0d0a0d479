use std::{net::SocketAddr, sync::Arc};

use conduit_types::TunnelSpec;
use tokio::{net::TcpStream, task::JoinHandle};
use tracing::{info, warn};

use super::{ServeOutcome, Tunnel, bind_listener, relay::relay};
use crate::connection::Connection;

type Result<T> = crate::CoreResult<T>;

/// Bind the local listener and spawn the accept loop.
pub(super) async fn establish(tunnel: &Arc<Tunnel>, connection: &Arc<Connection>) -> Result<JoinHandle<ServeOutcome>> {
    let TunnelSpec::Local {
        bind_port,
        target_host,
        target_port,
    } = &tunnel.config.spec
    else {
        return Err(crate::CoreError::Other("not a local tunnel spec".into()));
    };
    let (bind_port, target_host, target_port) = (*bind_port, target_host.clone(), *target_port);
    let bind_host = tunnel.config.bind_address.clone().unwrap_or_else(|| "127.0.0.1".to_string());
    let listener = bind_listener(&bind_host, bind_port).await?;
    let local_addr = listener.local_addr()?;
    tunnel.set_local_endpoint(local_addr.to_string());
    info!(
        bind = %local_addr,
        target = %format!("{}:{}", target_host, target_port),
        "local TCP forward listening"
    );
    let tunnel = Arc::clone(tunnel);
    let connection = Arc::clone(connection);
    Ok(tokio::spawn(run_listener(listener, target_host, target_port, tunnel, connection)))
}

async fn run_listener(
    listener: tokio::net::TcpListener,
    target_host: String,
    target_port: u16,
    tunnel: Arc<Tunnel>,
    connection: Arc<Connection>,
) -> ServeOutcome {
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
                Ok((stream, origin)) => {
                    let tunnel = Arc::clone(&tunnel);
                    let connection = Arc::clone(&connection);
                    let target_host = target_host.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, origin, target_host, target_port, tunnel, connection).await;
                    });
                }
                Err(err) => {
                    warn!(?err, "local TCP forward listener accept error");
                    return ServeOutcome::Error(format!("accept failed: {err}"));
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    origin: SocketAddr,
    target_host: String,
    target_port: u16,
    tunnel: Arc<Tunnel>,
    connection: Arc<Connection>,
) {
    tunnel.metrics().record_connection();
    connection.touch();
    stream.set_nodelay(true).ok();
    let timeout = connection.config().timeout;
    let opened = tokio::time::timeout(
        timeout,
        connection
            .transport()
            .open_direct(target_host.clone(), target_port, origin.ip().to_string(), origin.port()),
    )
    .await;
    let remote = match opened {
        Ok(Ok(remote)) => remote,
        Ok(Err(err)) => {
            tunnel.record_error(err.to_string());
            connection.metrics().record_error();
            warn!(?err, target = %format!("{target_host}:{target_port}"), "failed to open forward target");
            return;
        }
        Err(_) => {
            let message = format!("open to {target_host}:{target_port} timed out after {timeout:?}");
            tunnel.record_error(message.clone());
            connection.metrics().record_error();
            warn!(target = %format!("{target_host}:{target_port}"), "forward open timed out");
            return;
        }
    };
    let mut shutdown = tunnel.shutdown_signal();
    tokio::select! {
        _ = shutdown.changed() => {}
        result = relay(stream, remote, tunnel.metrics(), connection.metrics()) => {
            if let Err(err) = result {
                tunnel.record_error(err.to_string());
                warn!(?err, "local TCP forward connection failed");
            }
        }
    }
}
