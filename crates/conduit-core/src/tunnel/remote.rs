use std::sync::Arc;

use conduit_types::TunnelSpec;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use super::{ServeOutcome, Tunnel, relay::relay};
use crate::{connection::Connection, transport::TransportStream};

type Result<T> = crate::CoreResult<T>;

/// Register the server-side listener and spawn the inbound dispatch loop.
pub(super) async fn establish(tunnel: &Arc<Tunnel>, connection: &Arc<Connection>) -> Result<JoinHandle<ServeOutcome>> {
    let TunnelSpec::Remote {
        bind_port,
        target_host,
        target_port,
    } = &tunnel.config.spec
    else {
        return Err(crate::CoreError::Other("not a remote tunnel spec".into()));
    };
    let (bind_port, target_host, target_port) = (*bind_port, target_host.clone(), *target_port);
    let bind_address = tunnel.config.bind_address.clone().unwrap_or_else(|| "127.0.0.1".to_string());

    let timeout = connection.config().timeout;
    let requested = tokio::time::timeout(
        timeout,
        connection.transport().request_remote_forward(bind_address.clone(), bind_port),
    )
    .await
    .map_err(|_| crate::CoreError::timeout(format!("remote forward registration on {bind_address}:{bind_port}"), timeout))?;
    let assigned = requested?;
    let actual_port = if assigned != 0 { assigned } else { bind_port as u32 };

    let inbound = connection.transport().inbound();
    let streams = inbound.register(Some(bind_address.clone()), actual_port).await;
    tunnel.set_remote_binding(bind_address.clone(), actual_port);
    tunnel.set_remote_endpoint(format!("{bind_address}:{actual_port}"));
    tunnel.set_local_endpoint(format!("{target_host}:{target_port}"));
    info!(
        bind = %format!("{}:{}", bind_address, actual_port),
        target = %format!("{}:{}", target_host, target_port),
        "remote TCP forward registered"
    );
    let tunnel = Arc::clone(tunnel);
    let connection = Arc::clone(connection);
    Ok(tokio::spawn(run_inbound(streams, target_host, target_port, tunnel, connection)))
}

async fn run_inbound(
    mut streams: mpsc::UnboundedReceiver<TransportStream>,
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
            next = streams.recv() => match next {
                Some(stream) => {
                    let tunnel = Arc::clone(&tunnel);
                    let connection = Arc::clone(&connection);
                    let target_host = target_host.clone();
                    tokio::spawn(async move {
                        handle_inbound(stream, target_host, target_port, tunnel, connection).await;
                    });
                }
                // Route was unregistered; the tunnel is being torn down.
                None => return ServeOutcome::Shutdown,
            }
        }
    }
}

async fn handle_inbound(
    remote: TransportStream,
    target_host: String,
    target_port: u16,
    tunnel: Arc<Tunnel>,
    connection: Arc<Connection>,
) {
    tunnel.metrics().record_connection();
    connection.touch();
    let local = match TcpStream::connect((target_host.as_str(), target_port)).await {
        Ok(local) => local,
        Err(err) => {
            tunnel.record_error(err.to_string());
            connection.metrics().record_error();
            warn!(?err, target = %format!("{target_host}:{target_port}"), "failed to reach remote forward target");
            return;
        }
    };
    let mut shutdown = tunnel.shutdown_signal();
    tokio::select! {
        _ = shutdown.changed() => {}
        result = relay(local, remote, tunnel.metrics(), connection.metrics()) => {
            if let Err(err) = result {
                tunnel.record_error(err.to_string());
                warn!(?err, "remote forwarded connection failed");
            }
        }
    }
}
