//! Keys for session tests.

use std::sync::Arc;

use async_trait::async_trait;
use ssh_key::PublicKey;

use egs_core::auth::{LocalSigner, Signer, same_public_key};
use egs_core::constants::CLIENT_USERNAME;
use egs_core::session::Authenticator;

/// A client key pair and a host key pair.
pub struct TestKeys {
    pub client: LocalSigner,
    pub host: LocalSigner,
}

impl TestKeys {
    /// Generate fresh ed25519 keys.
    pub fn generate() -> Self {
        Self {
            client: LocalSigner::generate().expect("generate client key"),
            host: LocalSigner::generate().expect("generate host key"),
        }
    }

    pub fn client_public(&self) -> PublicKey {
        self.client.public_key().clone()
    }

    pub fn host_public(&self) -> PublicKey {
        self.host.public_key().clone()
    }

    /// Authenticator accepting exactly this client key.
    pub fn authenticator(&self) -> Arc<dyn Authenticator> {
        Arc::new(AllowKey(self.client_public()))
    }
}

impl Default for TestKeys {
    fn default() -> Self {
        Self::generate()
    }
}

/// Accepts the service user name with one public key.
pub struct AllowKey(pub PublicKey);

#[async_trait]
impl Authenticator for AllowKey {
    async fn authenticate(&self, username: &str, key: &PublicKey) -> bool {
        username == CLIENT_USERNAME && same_public_key(&self.0, key)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        let keys = TestKeys::generate();
        assert!(!same_public_key(&keys.client_public(), &keys.host_public()));
    }

    #[tokio::test]
    async fn authenticator_checks_user_and_key() {
        let keys = TestKeys::generate();
        let auth = keys.authenticator();
        assert!(auth.authenticate(CLIENT_USERNAME, &keys.client_public()).await);
        assert!(!auth.authenticate("root", &keys.client_public()).await);
        assert!(!auth.authenticate(CLIENT_USERNAME, &keys.host_public()).await);
    }
}
