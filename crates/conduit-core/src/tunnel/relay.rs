use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TunnelMetrics;
use crate::connection::ConnectionMetrics;

type Result<T> = crate::CoreResult<T>;

const CHUNK: usize = 16 * 1024;

/// Copy bytes both ways between a client-side stream and a transport stream,
/// bumping the tunnel and connection counters per chunk so callers can watch
/// transfer progress while the relay is still running. `local -> remote`
/// counts as sent, the reverse as received.
///
/// Each direction writes its chunk fully before reading the next one, so a
/// slow peer backpressures its sender naturally.
pub(crate) async fn relay<L, R>(
    local: L,
    remote: R,
    tunnel: &TunnelMetrics,
    connection: &ConnectionMetrics,
) -> Result<(u64, u64)>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_rx, mut local_tx) = tokio::io::split(local);
    let (mut remote_rx, mut remote_tx) = tokio::io::split(remote);
    let mut outbound = vec![0u8; CHUNK];
    let mut inbound = vec![0u8; CHUNK];
    let mut sent = 0u64;
    let mut received = 0u64;
    let mut local_eof = false;
    let mut remote_eof = false;

    let outcome: std::io::Result<()> = async {
        while !(local_eof && remote_eof) {
            tokio::select! {
                read = local_rx.read(&mut outbound), if !local_eof => {
                    let n = read?;
                    if n == 0 {
                        local_eof = true;
                        let _ = remote_tx.shutdown().await;
                    } else {
                        remote_tx.write_all(&outbound[..n]).await?;
                        sent += n as u64;
                        tunnel.add_bytes(n as u64);
                        connection.add_bytes_sent(n as u64);
                    }
                }
                read = remote_rx.read(&mut inbound), if !remote_eof => {
                    let n = read?;
                    if n == 0 {
                        remote_eof = true;
                        let _ = local_tx.shutdown().await;
                    } else {
                        local_tx.write_all(&inbound[..n]).await?;
                        received += n as u64;
                        tunnel.add_bytes(n as u64);
                        connection.add_bytes_received(n as u64);
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    let _ = local_tx.shutdown().await;
    let _ = remote_tx.shutdown().await;
    match outcome {
        Ok(()) => {}
        Err(err)
            if err.kind() == std::io::ErrorKind::BrokenPipe
                || err.kind() == std::io::ErrorKind::NotConnected
                || err.kind() == std::io::ErrorKind::ConnectionReset =>
        {
            // Treat common half-close races as graceful termination.
        }
        Err(err) => return Err(crate::CoreError::Relay(err.to_string())),
    }
    Ok((sent, received))
}
