//! Public-key authentication for the session handshake.
//!
//! The client signs `AUTH_NAMESPACE || "client" || nonce || host_key` with its
//! private key (SSHSIG, PEM armored). The server verifies the signature and
//! then decides, by raw public-key bytes, whether the key is authorized.

use std::path::Path;

use ssh_key::{Algorithm, HashAlg, LineEnding, PrivateKey, PublicKey, SshSig};
use tracing::debug;

use crate::constants::{AUTH_NAMESPACE, AUTH_NONCE_LEN};
use crate::error::{Error, Result};

/// Trait for signing operations.
pub trait Signer: Send + Sync {
    /// Sign `data`, returning a PEM-encoded SSHSIG.
    fn sign(&self, data: &[u8]) -> Result<String>;

    fn public_key(&self) -> &PublicKey;
}

/// Signer backed by an in-memory private key.
pub struct LocalSigner {
    private_key: PrivateKey,
    public_key: PublicKey,
}

impl LocalSigner {
    pub fn new(private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key().clone();
        Self {
            private_key,
            public_key,
        }
    }

    /// Generate a fresh ed25519 key.
    pub fn generate() -> Result<Self> {
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).map_err(|e| {
            Error::Protocol {
                message: format!("key generation failed: {}", e),
            }
        })?;
        Ok(Self::new(key))
    }

    /// Load an unencrypted OpenSSH private key.
    pub fn from_file(path: &Path) -> Result<Self> {
        let key = PrivateKey::read_openssh_file(path).map_err(|e| Error::Protocol {
            message: format!("failed to read private key {}: {}", path.display(), e),
        })?;
        if key.is_encrypted() {
            return Err(Error::Protocol {
                message: format!("private key {} is encrypted", path.display()),
            });
        }
        Ok(Self::new(key))
    }
}

impl Signer for LocalSigner {
    fn sign(&self, data: &[u8]) -> Result<String> {
        let sig = self
            .private_key
            .sign(AUTH_NAMESPACE, HashAlg::Sha512, data)
            .map_err(|e| Error::Protocol {
                message: format!("signing failed: {}", e),
            })?;
        sig.to_pem(LineEnding::LF).map_err(|e| Error::Protocol {
            message: format!("failed to encode signature: {}", e),
        })
    }

    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

/// Generate a random handshake nonce.
pub fn generate_nonce() -> [u8; AUTH_NONCE_LEN] {
    use rand::RngCore;
    let mut nonce = [0u8; AUTH_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Build the data the client signs.
pub fn build_client_sign_data(nonce: &[u8], host_key: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(AUTH_NAMESPACE.len() + 6 + nonce.len() + host_key.len());
    data.extend_from_slice(AUTH_NAMESPACE.as_bytes());
    data.extend_from_slice(b"client");
    data.extend_from_slice(nonce);
    data.extend_from_slice(host_key.as_bytes());
    data
}

/// Sign the handshake transcript on the client side.
pub fn sign_client(signer: &dyn Signer, nonce: &[u8], host_key: &str) -> Result<String> {
    signer.sign(&build_client_sign_data(nonce, host_key))
}

/// Verify a client signature. Returns `Ok(false)` for a well-formed but wrong signature.
pub fn verify_client(key: &PublicKey, signature_pem: &str, nonce: &[u8], host_key: &str) -> Result<bool> {
    let sig = SshSig::from_pem(signature_pem).map_err(|e| Error::Protocol {
        message: format!("malformed signature: {}", e),
    })?;
    let data = build_client_sign_data(nonce, host_key);
    match key.verify(AUTH_NAMESPACE, &data, &sig) {
        Ok(()) => Ok(true),
        Err(e) => {
            debug!(error = %e, "signature verification failed");
            Ok(false)
        }
    }
}

/// Parse an OpenSSH public key line (`ssh-ed25519 AAAA... comment`).
pub fn parse_public_key(text: &str) -> Result<PublicKey> {
    PublicKey::from_openssh(text.trim()).map_err(|e| Error::Protocol {
        message: format!("invalid public key: {}", e),
    })
}

/// Encode a public key as an OpenSSH line.
pub fn encode_public_key(key: &PublicKey) -> Result<String> {
    key.to_openssh().map_err(|e| Error::Protocol {
        message: format!("failed to encode public key: {}", e),
    })
}

/// Compare the raw public-key bytes of two keys, ignoring comments.
pub fn same_public_key(a: &PublicKey, b: &PublicKey) -> bool {
    match (a.to_bytes(), b.to_bytes()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// SHA-256 fingerprint for logging.
pub fn key_fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_random() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn sign_data_layout() {
        let data = build_client_sign_data(&[1, 2], "key");
        assert!(data.starts_with(AUTH_NAMESPACE.as_bytes()));
        assert!(data.ends_with(&[1, 2, b'k', b'e', b'y']));
    }

    #[test]
    fn sign_and_verify() {
        let signer = LocalSigner::generate().unwrap();
        let nonce = generate_nonce();
        let sig = sign_client(&signer, &nonce, "host").unwrap();
        assert!(verify_client(signer.public_key(), &sig, &nonce, "host").unwrap());
        // A different transcript must not verify.
        assert!(!verify_client(signer.public_key(), &sig, &nonce, "other").unwrap());
    }

    #[test]
    fn verify_with_wrong_key_fails() {
        let signer = LocalSigner::generate().unwrap();
        let other = LocalSigner::generate().unwrap();
        let nonce = generate_nonce();
        let sig = sign_client(&signer, &nonce, "host").unwrap();
        assert!(!verify_client(other.public_key(), &sig, &nonce, "host").unwrap());
    }

    #[test]
    fn public_key_text_roundtrip_ignores_comment() {
        let signer = LocalSigner::generate().unwrap();
        let text = encode_public_key(signer.public_key()).unwrap();
        let parsed = parse_public_key(&format!("{text} someone@host\n")).unwrap();
        assert!(same_public_key(&parsed, signer.public_key()));
        assert!(key_fingerprint(&parsed).starts_with("SHA256:"));
    }

    #[test]
    fn malformed_signature_is_error() {
        let signer = LocalSigner::generate().unwrap();
        assert!(verify_client(signer.public_key(), "not a signature", &[0; 32], "h").is_err());
    }
}
