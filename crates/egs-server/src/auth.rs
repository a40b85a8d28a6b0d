//! Session authentication for the guest service.
//!
//! Only the service user name is accepted, with the one client key the
//! host provisioned. The key is looked up on every attempt so a key pushed
//! after startup takes effect without a restart.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ssh_key::PublicKey;
use tracing::{debug, info, warn};

use egs_core::auth::{LocalSigner, key_fingerprint, parse_public_key, same_public_key};
use egs_core::constants::{CLIENT_AUTH_KEY, CLIENT_USERNAME};
use egs_core::error::{Error, Result};
use egs_core::session::Authenticator;

use crate::kvp::KvpPool;

/// Where the authorized client key comes from.
#[derive(Debug, Clone)]
pub enum ClientKeySource {
    /// An OpenSSH public key file.
    File(PathBuf),
    /// The host-to-guest KVP pool.
    Kvp(KvpPool),
    /// A fixed key.
    Static(PublicKey),
}

/// Supplies the expected client public key.
#[derive(Debug, Clone)]
pub struct ClientKeyProvider {
    source: ClientKeySource,
}

impl ClientKeyProvider {
    pub fn new(source: ClientKeySource) -> Self {
        Self { source }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::new(ClientKeySource::File(path.into()))
    }

    pub fn from_kvp(pool: KvpPool) -> Self {
        Self::new(ClientKeySource::Kvp(pool))
    }

    pub fn source(&self) -> &ClientKeySource {
        &self.source
    }

    /// Read the current client key.
    pub fn load(&self) -> Result<PublicKey> {
        match &self.source {
            ClientKeySource::File(path) => {
                let text = std::fs::read_to_string(path)?;
                parse_public_key(&text)
            }
            ClientKeySource::Kvp(pool) => {
                let value = pool.get(CLIENT_AUTH_KEY)?.ok_or_else(|| Error::Protocol {
                    message: format!(
                        "no client key provisioned in {}",
                        pool.path().display()
                    ),
                })?;
                parse_public_key(&value)
            }
            ClientKeySource::Static(key) => Ok(key.clone()),
        }
    }
}

/// Accepts user `egs` with the provisioned client key.
pub struct GuestAuthenticator {
    provider: ClientKeyProvider,
}

impl GuestAuthenticator {
    pub fn new(provider: ClientKeyProvider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Authenticator for GuestAuthenticator {
    async fn authenticate(&self, username: &str, key: &PublicKey) -> bool {
        if username != CLIENT_USERNAME {
            debug!(username, "Unknown user refused");
            return false;
        }

        let provider = self.provider.clone();
        let expected = match tokio::task::spawn_blocking(move || provider.load()).await {
            Ok(Ok(expected)) => expected,
            Ok(Err(e)) => {
                warn!(error = %e, "Client key unavailable");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Client key lookup failed");
                return false;
            }
        };

        let accepted = same_public_key(&expected, key);
        if accepted {
            info!(fingerprint = %key_fingerprint(key), "Client authenticated");
        } else {
            warn!(fingerprint = %key_fingerprint(key), "Client key not authorized");
        }
        accepted
    }
}

/// Load the host key, or generate an ephemeral one.
pub fn load_host_key(path: Option<&Path>) -> Result<LocalSigner> {
    match path {
        Some(path) => LocalSigner::from_file(path),
        None => {
            info!("No host key configured, generating an ephemeral key");
            LocalSigner::generate()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use egs_core::auth::{Signer, encode_public_key};

    #[tokio::test]
    async fn accepts_provisioned_key_only() {
        let client = LocalSigner::generate().unwrap();
        let stranger = LocalSigner::generate().unwrap();
        let auth = GuestAuthenticator::new(ClientKeyProvider::new(ClientKeySource::Static(
            client.public_key().clone(),
        )));

        assert!(auth.authenticate(CLIENT_USERNAME, client.public_key()).await);
        assert!(!auth.authenticate(CLIENT_USERNAME, stranger.public_key()).await);
        assert!(!auth.authenticate("admin", client.public_key()).await);
    }

    #[tokio::test]
    async fn key_is_read_from_kvp_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = KvpPool::host_to_guest(dir.path());
        let client = LocalSigner::generate().unwrap();
        let auth = GuestAuthenticator::new(ClientKeyProvider::from_kvp(pool.clone()));

        // Not provisioned yet.
        assert!(!auth.authenticate(CLIENT_USERNAME, client.public_key()).await);

        let line = encode_public_key(client.public_key()).unwrap();
        pool.set(CLIENT_AUTH_KEY, &line).unwrap();
        assert!(auth.authenticate(CLIENT_USERNAME, client.public_key()).await);
    }

    #[test]
    fn key_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalSigner::generate().unwrap();
        let path = dir.path().join("client.pub");
        let line = encode_public_key(client.public_key()).unwrap();
        std::fs::write(&path, format!("{}\n", line)).unwrap();

        let loaded = ClientKeyProvider::from_file(&path).load().unwrap();
        assert!(same_public_key(&loaded, client.public_key()));
    }

    #[test]
    fn ephemeral_host_key() {
        let signer = load_host_key(None).unwrap();
        assert!(!key_fingerprint(signer.public_key()).is_empty());
    }
}
