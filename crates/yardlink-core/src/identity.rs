//! Agent identity, broker credentials, and key fingerprints.
//!
//! Fingerprints are SHA-256 over the DER-encoded public key, displayed like
//! git's short hashes: the shortest hex prefix that is unique in context.

use std::fmt;

use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};

use crate::error::YardResult;
use crate::signing::{self, Signer, PublicKeyInput};

/// Key size used when an identity generates its own keypair.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// The agent's long-lived identity: a uuid and one RSA keypair.
///
/// The keypair is fixed for the lifetime of the value. The uuid may start
/// empty (first-ever boot) and is filled in from the check-in response.
#[derive(Debug, Clone)]
pub struct Identity {
    uuid: String,
    signer: Signer,
}

impl Identity {
    /// Create an identity with a freshly generated keypair.
    pub fn generate(uuid: impl Into<String>) -> YardResult<Self> {
        Ok(Self {
            uuid: uuid.into(),
            signer: Signer::generate(DEFAULT_KEY_BITS)?,
        })
    }

    /// Create an identity around an existing private key.
    pub fn from_private_pem(uuid: impl Into<String>, pem: &str) -> YardResult<Self> {
        Ok(Self {
            uuid: uuid.into(),
            signer: Signer::from_pem(pem)?,
        })
    }

    pub fn with_signer(uuid: impl Into<String>, signer: Signer) -> Self {
        Self {
            uuid: uuid.into(),
            signer,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Adopt the uuid assigned by the server.
    pub fn set_uuid(&mut self, uuid: impl Into<String>) {
        self.uuid = uuid.into();
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        self.signer.public_key()
    }

    /// Public key as SubjectPublicKeyInfo PEM, the form sent at check-in.
    pub fn public_key_pem(&self) -> YardResult<String> {
        self.signer.public_key_pem()
    }

    /// Full hex fingerprint of the public key.
    pub fn fingerprint(&self) -> YardResult<String> {
        key_fingerprint(self.public_key())
    }
}

/// Broker account credentials plus the server material learned at check-in.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// PEM CA certificate for TLS broker connections.
    pub ca_certificate: Option<String>,
    /// Server public key (PEM) used to verify inbound signatures.
    pub counterpart_public_key: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ca_certificate: None,
            counterpart_public_key: None,
        }
    }

    /// Parse the counterpart key, if one is known.
    pub fn counterpart_key(&self) -> YardResult<Option<RsaPublicKey>> {
        self.counterpart_public_key
            .as_deref()
            .map(|pem| PublicKeyInput::from(pem).parse())
            .transpose()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &mask(&self.password))
            .field("ca_certificate", &self.ca_certificate.is_some())
            .field("counterpart_public_key", &self.counterpart_public_key.is_some())
            .finish()
    }
}

/// Fixed-width stand-in for a secret; the length is not revealed.
pub fn mask(_secret: &str) -> String {
    "****".to_string()
}

/// Compute the full hex-encoded SHA-256 fingerprint of DER key bytes.
pub fn fingerprint(public_key_der: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key_der))
}

/// Fingerprint of a parsed RSA public key.
pub fn key_fingerprint(key: &RsaPublicKey) -> YardResult<String> {
    Ok(fingerprint(&signing::public_key_der(key)?))
}

/// Find the shortest unique prefix for a fingerprint within a set.
///
/// Returns a prefix of at least `min_len` characters that uniquely identifies
/// `fp` among all `fingerprints`.
pub fn short_fingerprint(fp: &str, fingerprints: &[&str], min_len: usize) -> String {
    let min_len = min_len.max(4);
    let others: Vec<&str> = fingerprints.iter().filter(|&&f| f != fp).copied().collect();

    for len in min_len..=fp.len() {
        let prefix = &fp[..len];
        if !others.iter().any(|f| f.starts_with(prefix)) {
            return prefix.to_string();
        }
    }
    fp.to_string()
}
