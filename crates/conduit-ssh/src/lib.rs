//! russh-backed implementation of the conduit transport seam.

mod auth;
pub mod error;
mod handler;
mod transport;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use conduit_core::{Connector, CoreResult, InboundRegistry, Transport, TransportStream};
pub use error::{SshClientError, SshClientResult};
use conduit_types::ConnectionConfig;
use handler::ClientHandler;
use russh::client;
use tracing::info;
use transport::SshTransport;

/// Connects and authenticates SSH sessions, either over a fresh TCP
/// connection or over an existing stream (jump chain hops).
#[derive(Clone, Default)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }

    fn client_config(config: &ConnectionConfig) -> Arc<client::Config> {
        Arc::new(client::Config {
            nodelay: true,
            inactivity_timeout: None,
            keepalive_interval: config.keepalive_interval.or(Some(Duration::from_secs(30))),
            keepalive_max: 3,
            ..Default::default()
        })
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, config: &ConnectionConfig) -> CoreResult<Arc<dyn Transport>> {
        let inbound = InboundRegistry::new();
        let handler = ClientHandler::new(config, Arc::clone(&inbound));
        let ssh_config = Self::client_config(config);
        info!(endpoint = %config.endpoint(), "connecting");
        let mut session = client::connect(ssh_config, (config.host.as_str(), config.port), handler)
            .await
            .map_err(conduit_core::CoreError::from)?;
        auth::authenticate(&mut session, config).await.map_err(conduit_core::CoreError::from)?;
        Ok(Arc::new(SshTransport::new(session, inbound)))
    }

    async fn connect_over(&self, config: &ConnectionConfig, stream: TransportStream) -> CoreResult<Arc<dyn Transport>> {
        let inbound = InboundRegistry::new();
        let handler = ClientHandler::new(config, Arc::clone(&inbound));
        let ssh_config = Self::client_config(config);
        info!(endpoint = %config.endpoint(), "starting session over forwarded stream");
        let mut session = client::connect_stream(ssh_config, stream, handler)
            .await
            .map_err(conduit_core::CoreError::from)?;
        auth::authenticate(&mut session, config).await.map_err(conduit_core::CoreError::from)?;
        Ok(Arc::new(SshTransport::new(session, inbound)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::AuthMethod;
    use secrecy::SecretString;

    fn sample_config() -> ConnectionConfig {
        ConnectionConfig::new("bastion.example", 22, "deploy", AuthMethod::Password {
            password: SecretString::new("secret".into()),
        })
    }

    #[test]
    fn client_config_defaults_keepalive() {
        let config = SshConnector::client_config(&sample_config());
        assert!(config.nodelay);
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.keepalive_max, 3);
    }

    #[test]
    fn client_config_honors_explicit_keepalive() {
        let mut conn = sample_config();
        conn.keepalive_interval = Some(Duration::from_secs(5));
        let config = SshConnector::client_config(&conn);
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(5)));
    }
}
