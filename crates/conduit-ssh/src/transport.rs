use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{CoreResult, InboundRegistry, Transport, TransportStream};
use russh::{Disconnect, client};
use tokio::sync::Mutex;

use crate::{error::core_err, handler::ClientHandler};

/// [`Transport`] over a live russh session. The handle is serialized behind
/// a mutex because some session operations need exclusive access.
pub struct SshTransport {
    handle: Mutex<client::Handle<ClientHandler>>,
    inbound: Arc<InboundRegistry>,
}

impl SshTransport {
    pub(crate) fn new(handle: client::Handle<ClientHandler>, inbound: Arc<InboundRegistry>) -> Self {
        Self {
            handle: Mutex::new(handle),
            inbound,
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_direct(
        &self,
        target_host: String,
        target_port: u16,
        origin_host: String,
        origin_port: u16,
    ) -> CoreResult<TransportStream> {
        let channel = self
            .handle
            .lock()
            .await
            .channel_open_direct_tcpip(target_host, target_port.into(), origin_host, origin_port.into())
            .await
            .map_err(core_err)?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn request_remote_forward(&self, bind_address: String, bind_port: u16) -> CoreResult<u32> {
        let mut handle = self.handle.lock().await;
        match handle.tcpip_forward(bind_address.clone(), bind_port.into()).await {
            Ok(assigned) => Ok(assigned),
            // The server refuses the bind when the port is taken.
            Err(russh::Error::RequestDenied) => Err(conduit_core::CoreError::PortInUse {
                address: format!("{bind_address}:{bind_port}"),
            }),
            Err(err) => Err(core_err(err)),
        }
    }

    async fn cancel_remote_forward(&self, bind_address: String, port: u32) -> CoreResult<()> {
        self.handle
            .lock()
            .await
            .cancel_tcpip_forward(bind_address, port)
            .await
            .map_err(core_err)?;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        !self.handle.lock().await.is_closed()
    }

    async fn close(&self) -> CoreResult<()> {
        self.handle
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "", "english")
            .await
            .map_err(core_err)?;
        Ok(())
    }

    fn inbound(&self) -> Arc<InboundRegistry> {
        Arc::clone(&self.inbound)
    }
}
