use std::sync::Arc;

use conduit_core::InboundRegistry;
use conduit_types::{ConnectionConfig, HostKeyVerification};
use russh::{
    Channel,
    client::{Msg, Session},
    keys::{HashAlg, PublicKey},
};
use tracing::debug;

use crate::error::SshClientError;

type Result<T> = crate::SshClientResult<T>;

/// Per-session handler: verifies the host key against the configured policy
/// and routes forwarded-tcpip channels into the inbound registry.
#[derive(Clone)]
pub struct ClientHandler {
    authority: String,
    verification: HostKeyVerification,
    inbound: Arc<InboundRegistry>,
}

impl ClientHandler {
    pub fn new(config: &ConnectionConfig, inbound: Arc<InboundRegistry>) -> Self {
        Self {
            authority: config.endpoint(),
            verification: config.host_key.clone(),
            inbound,
        }
    }

    fn check(&self, server_key: &PublicKey) -> Result<bool> {
        let fingerprint = server_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.verification {
            HostKeyVerification::AcceptAny => {
                debug!(authority = %self.authority, fingerprint = %fingerprint, "accepting host key");
                Ok(true)
            }
            HostKeyVerification::Pinned(expected) => {
                let presented = server_key
                    .to_openssh()
                    .map_err(|e| SshClientError::Crypto(e.to_string()))?
                    .to_string();
                if pinned_matches(expected, &presented, &fingerprint) {
                    debug!(authority = %self.authority, "host key verified against pinned value");
                    Ok(true)
                } else {
                    Err(SshClientError::HostKeyFailed(format!(
                        "host key mismatch for {} (received SHA256 {})",
                        self.authority, fingerprint
                    )))
                }
            }
        }
    }
}

/// A pinned value is either a `SHA256:...` fingerprint or an OpenSSH public
/// key line (whose trailing comment is ignored).
fn pinned_matches(expected: &str, presented_openssh: &str, fingerprint: &str) -> bool {
    let expected = expected.trim();
    if expected.starts_with("SHA256:") {
        return expected == fingerprint;
    }
    let expected_fields: Vec<&str> = expected.split_whitespace().take(2).collect();
    let presented_fields: Vec<&str> = presented_openssh.split_whitespace().take(2).collect();
    !expected_fields.is_empty() && expected_fields == presented_fields
}

impl russh::client::Handler for ClientHandler {
    type Error = SshClientError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let result = self.check(server_public_key);
        async move { result }
    }

    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
        let inbound = Arc::clone(&self.inbound);
        let address = connected_address.to_string();
        let origin = format!("{originator_address}:{originator_port}");
        async move {
            debug!(bind = %format!("{address}:{connected_port}"), origin = %origin, "forwarded connection accepted");
            inbound.dispatch(&address, connected_port, Box::new(channel.into_stream())).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::pinned_matches;

    const KEY_LINE: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAmUo7lXNOiHZLkzSkjU4x3ZAkDO4DOWuhHDxJHCUe+R";
    const FINGERPRINT: &str = "SHA256:Jm3Rk7mDauBtzrWIbZr3geFIDy/96JPJRdV9QVmW8Vo";

    #[test]
    fn fingerprint_pin_matches_exactly() {
        assert!(pinned_matches(FINGERPRINT, KEY_LINE, FINGERPRINT));
        assert!(!pinned_matches("SHA256:other", KEY_LINE, FINGERPRINT));
    }

    #[test]
    fn key_line_pin_ignores_comment() {
        let with_comment = format!("{KEY_LINE} ops@bastion");
        assert!(pinned_matches(&with_comment, KEY_LINE, FINGERPRINT));
        assert!(pinned_matches(KEY_LINE, &format!("{KEY_LINE} host"), FINGERPRINT));
    }

    #[test]
    fn mismatched_key_line_is_rejected() {
        let other = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIDifferentKeyMaterialHereAAAAAAAAAAAAAAA";
        assert!(!pinned_matches(other, KEY_LINE, FINGERPRINT));
        assert!(!pinned_matches("", KEY_LINE, FINGERPRINT));
    }
}
