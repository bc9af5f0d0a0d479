use std::{path::Path, sync::Arc};

use conduit_types::{AuthMethod, ConnectionConfig};
use russh::{
    client::{self, AuthResult},
    keys::{self, Certificate, PrivateKeyWithHashAlg},
};
use secrecy::{ExposeSecret, SecretString};
use tokio::fs;
use tracing::{debug, info};

use crate::{error::SshClientError, handler::ClientHandler};

type Result<T> = crate::SshClientResult<T>;

/// Run the configured authentication method against a freshly connected
/// session.
pub(crate) async fn authenticate(session: &mut client::Handle<ClientHandler>, config: &ConnectionConfig) -> Result<()> {
    match &config.auth {
        AuthMethod::Password { password } => {
            let result = session
                .authenticate_password(config.username.clone(), password.expose_secret().to_string())
                .await?;
            finish(result, "password")
        }
        AuthMethod::Key { path, passphrase } => {
            let key = Arc::new(load_private_key(path, passphrase.as_ref()).await?);
            let hash_alg = if key.algorithm().is_rsa() {
                session.best_supported_rsa_hash().await.unwrap_or(None).flatten()
            } else {
                None
            };
            debug!(key = ?key.algorithm(), "attempting public-key auth");
            let key = PrivateKeyWithHashAlg::new(key, hash_alg);
            let result = session.authenticate_publickey(config.username.clone(), key).await?;
            finish(result, "publickey")
        }
        AuthMethod::Certificate { key_path, cert_path } => {
            let key = Arc::new(load_private_key(key_path, None).await?);
            let blob = fs::read_to_string(cert_path).await.map_err(SshClientError::Io)?;
            let cert = Certificate::from_openssh(&blob).map_err(|e| SshClientError::Crypto(e.to_string()))?;
            let result = session
                .authenticate_openssh_cert(config.username.clone(), key, cert)
                .await?;
            finish(result, "certificate")
        }
    }
}

fn finish(result: AuthResult, method: &'static str) -> Result<()> {
    match result {
        AuthResult::Success => {
            info!(method, "authentication succeeded");
            Ok(())
        }
        AuthResult::Failure { .. } => Err(SshClientError::AuthFailed(format!(
            "{method} authentication rejected by server"
        ))),
    }
}

async fn load_private_key(path: &Path, passphrase: Option<&SecretString>) -> Result<keys::PrivateKey> {
    let data = fs::read_to_string(path).await.map_err(SshClientError::Io)?;
    match keys::PrivateKey::from_openssh(&data) {
        Ok(key) => Ok(key),
        Err(_openssh_err) => match keys::decode_secret_key(&data, passphrase.map(|p| p.expose_secret())) {
            Ok(key) => Ok(key),
            Err(keys::Error::KeyIsEncrypted) => Err(SshClientError::Crypto(format!(
                "{} is encrypted and no passphrase was supplied",
                path.display()
            ))),
            Err(err) => Err(SshClientError::Crypto(format!(
                "{} is not a valid private key: {err}",
                path.display()
            ))),
        },
    }
}
