//! RSA-PSS message signing for yardlink envelopes.
//!
//! Signatures are RSA-PSS with SHA-256 as both the message digest and the
//! MGF1 mask digest, using the maximum salt length the key allows. The salt
//! is drawn from a generator seeded by the private key and the message, so
//! the same key signing the same text always yields the same signature.
//!
//! Keys travel as PEM: private keys as PKCS#1 (`RSA PRIVATE KEY`), public
//! keys as SubjectPublicKeyInfo (`PUBLIC KEY`).

use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::{YardError, YardResult};

/// Smallest modulus accepted for signing or verification.
pub const MIN_KEY_BITS: usize = 2048;

/// SHA-256 output length in bytes.
const DIGEST_LEN: usize = 32;

/// Maximum PSS salt length for `key` with a SHA-256 digest.
///
/// `emLen - hLen - 2`, where `emLen = ceil((modBits - 1) / 8)`.
pub fn max_salt_len(key: &RsaPublicKey) -> usize {
    let em_bits = key.n().bits().saturating_sub(1);
    let em_len = (em_bits + 7) / 8;
    em_len.saturating_sub(DIGEST_LEN + 2)
}

/// An RSA private key able to sign envelope messages.
#[derive(Clone)]
pub struct Signer {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    salt_seed: [u8; 32],
}

impl Signer {
    /// Generate a fresh keypair.
    pub fn generate(bits: usize) -> YardResult<Self> {
        if bits < MIN_KEY_BITS {
            return Err(YardError::Key(format!(
                "refusing to generate a {bits}-bit key (minimum {MIN_KEY_BITS})"
            )));
        }
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| YardError::Key(format!("key generation failed: {e}")))?;
        Self::from_private_key(key)
    }

    /// Wrap an existing private key.
    pub fn from_private_key(private_key: RsaPrivateKey) -> YardResult<Self> {
        let public_key = private_key.to_public_key();
        check_modulus(&public_key)?;

        let der = private_key
            .to_pkcs1_der()
            .map_err(|e| YardError::Key(format!("cannot encode private key: {e}")))?;
        let salt_seed: [u8; 32] = Sha256::digest(der.as_bytes()).into();

        Ok(Self {
            private_key,
            public_key,
            salt_seed,
        })
    }

    /// Load a private key from PEM text (PKCS#1 or PKCS#8).
    pub fn from_pem(pem: &str) -> YardResult<Self> {
        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| YardError::Key(format!("cannot load private key: {e}")))?;
        Self::from_private_key(key)
    }

    /// The matching public key.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// The public key as SubjectPublicKeyInfo PEM.
    pub fn public_key_pem(&self) -> YardResult<String> {
        public_key_to_pem(&self.public_key)
    }

    /// The private key as PKCS#1 PEM.
    pub fn private_key_pem(&self) -> YardResult<String> {
        let pem = self
            .private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| YardError::Key(format!("cannot encode private key: {e}")))?;
        Ok(pem.to_string())
    }

    /// Sign the UTF-8 bytes of `message`.
    pub fn sign(&self, message: &str) -> YardResult<Vec<u8>> {
        let digest = Sha256::digest(message.as_bytes());

        let mut seed_hasher = Sha256::new();
        seed_hasher.update(self.salt_seed);
        seed_hasher.update(message.as_bytes());
        let seed: [u8; 32] = seed_hasher.finalize().into();
        let mut rng = StdRng::from_seed(seed);

        let padding = Pss::new_with_salt::<Sha256>(max_salt_len(&self.public_key));
        self.private_key
            .sign_with_rng(&mut rng, padding, &digest)
            .map_err(|e| YardError::Signing(e.to_string()))
    }

    /// Verify a signature made with this signer's own key.
    ///
    /// Same contract as [`verify`]: `Ok(true)` or an error, never `Ok(false)`.
    pub fn verify_own(&self, message: &str, signature: impl Into<SignatureInput>) -> YardResult<bool> {
        let signature = signature.into().into_bytes()?;
        verify_with_key(message, &signature, &self.public_key)?;
        Ok(true)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("bits", &self.public_key.n().bits())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Public key material in any of the accepted encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeyInput {
    /// PEM text.
    Pem(String),
    /// PEM bytes, or DER (SubjectPublicKeyInfo or PKCS#1).
    Bytes(Vec<u8>),
}

impl PublicKeyInput {
    /// Read a key from a JSON value: a PEM string or an array of byte values.
    pub fn from_json(value: &serde_json::Value) -> YardResult<Self> {
        match value {
            serde_json::Value::String(s) => Ok(Self::Pem(s.clone())),
            serde_json::Value::Array(items) => {
                let bytes = items
                    .iter()
                    .map(|v| {
                        v.as_u64()
                            .and_then(|n| u8::try_from(n).ok())
                            .ok_or_else(|| YardError::Key("public key array holds a non-byte".into()))
                    })
                    .collect::<YardResult<Vec<u8>>>()?;
                Ok(Self::Bytes(bytes))
            }
            other => Err(YardError::Key(format!(
                "unsupported public key representation: {other}"
            ))),
        }
    }

    /// Parse into an RSA public key.
    pub fn parse(&self) -> YardResult<RsaPublicKey> {
        let key = match self {
            Self::Pem(pem) => parse_public_pem(pem)?,
            Self::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) if text.contains("-----BEGIN") => parse_public_pem(text)?,
                _ => RsaPublicKey::from_public_key_der(bytes)
                    .or_else(|_| RsaPublicKey::from_pkcs1_der(bytes))
                    .map_err(|e| YardError::Key(format!("cannot load public key: {e}")))?,
            },
        };
        check_modulus(&key)?;
        Ok(key)
    }
}

impl From<&str> for PublicKeyInput {
    fn from(pem: &str) -> Self {
        Self::Pem(pem.to_string())
    }
}

impl From<String> for PublicKeyInput {
    fn from(pem: String) -> Self {
        Self::Pem(pem)
    }
}

impl From<&[u8]> for PublicKeyInput {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<Vec<u8>> for PublicKeyInput {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

/// A signature as raw bytes or hex text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureInput {
    Raw(Vec<u8>),
    Hex(String),
}

impl SignatureInput {
    pub fn into_bytes(self) -> YardResult<Vec<u8>> {
        match self {
            Self::Raw(bytes) => Ok(bytes),
            Self::Hex(text) => hex::decode(text.trim()).map_err(|e| {
                YardError::SignatureVerification(format!("signature is not valid hex: {e}"))
            }),
        }
    }
}

impl From<Vec<u8>> for SignatureInput {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Raw(bytes)
    }
}

impl From<&[u8]> for SignatureInput {
    fn from(bytes: &[u8]) -> Self {
        Self::Raw(bytes.to_vec())
    }
}

impl From<&str> for SignatureInput {
    fn from(hex: &str) -> Self {
        Self::Hex(hex.to_string())
    }
}

impl From<String> for SignatureInput {
    fn from(hex: String) -> Self {
        Self::Hex(hex)
    }
}

/// Verify `signature` over `message` with `public_key`.
///
/// Returns `Ok(true)` when the signature holds. Every failure, including an
/// unparseable key or signature, is [`YardError::SignatureVerification`].
pub fn verify(
    message: &str,
    signature: impl Into<SignatureInput>,
    public_key: impl Into<PublicKeyInput>,
) -> YardResult<bool> {
    let key = public_key
        .into()
        .parse()
        .map_err(|e| YardError::SignatureVerification(format!("unusable public key: {e}")))?;
    let signature = signature.into().into_bytes()?;
    verify_with_key(message, &signature, &key)?;
    Ok(true)
}

/// Verify against an already-parsed key.
pub fn verify_with_key(message: &str, signature: &[u8], key: &RsaPublicKey) -> YardResult<()> {
    let digest = Sha256::digest(message.as_bytes());
    let padding = Pss::new_with_salt::<Sha256>(max_salt_len(key));
    key.verify(padding, &digest, signature)
        .map_err(|e| YardError::SignatureVerification(e.to_string()))
}

/// Encode a public key as SubjectPublicKeyInfo PEM.
pub fn public_key_to_pem(key: &RsaPublicKey) -> YardResult<String> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| YardError::Key(format!("cannot encode public key: {e}")))
}

/// DER bytes of a public key, used for fingerprints.
pub fn public_key_der(key: &RsaPublicKey) -> YardResult<Vec<u8>> {
    let doc = key
        .to_public_key_der()
        .map_err(|e| YardError::Key(format!("cannot encode public key: {e}")))?;
    Ok(doc.as_bytes().to_vec())
}

fn parse_public_pem(pem: &str) -> YardResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| YardError::Key(format!("cannot load public key: {e}")))
}

fn check_modulus(key: &RsaPublicKey) -> YardResult<()> {
    let bits = key.n().bits();
    if bits < MIN_KEY_BITS {
        return Err(YardError::Key(format!(
            "{bits}-bit RSA key is below the {MIN_KEY_BITS}-bit minimum"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENT_KEY: &str = include_str!("../tests/fixtures/agent_private.pem");
    const AGENT_PUB: &str = include_str!("../tests/fixtures/agent_public.pem");
    const SERVER_PUB: &str = include_str!("../tests/fixtures/server_public.pem");
    const VECTOR_MESSAGE: &str = include_str!("../tests/fixtures/vector_message.txt");
    const VECTOR_SIGNATURE: &str = include_str!("../tests/fixtures/vector_signature.hex");

    fn signer() -> Signer {
        Signer::from_pem(AGENT_KEY).unwrap()
    }

    #[test]
    fn salt_length_for_2048_bit_key() {
        assert_eq!(max_salt_len(signer().public_key()), 222);
    }

    #[test]
    fn sign_and_verify() {
        let s = signer();
        let sig = s.sign("{\"type\":\"agent_state\"}").unwrap();
        assert_eq!(sig.len(), 256);
        assert!(verify("{\"type\":\"agent_state\"}", sig, AGENT_PUB).unwrap());
    }

    #[test]
    fn signing_is_deterministic() {
        let s = signer();
        assert_eq!(s.sign("same text").unwrap(), s.sign("same text").unwrap());
        assert_ne!(s.sign("same text").unwrap(), s.sign("other text").unwrap());
    }

    #[test]
    fn tampered_message_is_an_error_not_false() {
        let s = signer();
        let sig = s.sign("pay 10").unwrap();
        let err = verify("pay 90", sig, AGENT_PUB).unwrap_err();
        assert!(matches!(err, YardError::SignatureVerification(_)));
    }

    #[test]
    fn wrong_key_fails() {
        let sig = signer().sign("hello").unwrap();
        assert!(verify("hello", sig, SERVER_PUB).is_err());
    }

    #[test]
    fn accepts_hex_signatures_and_byte_keys() {
        let s = signer();
        let sig = hex::encode(s.sign("hello").unwrap());
        assert!(verify("hello", sig.as_str(), AGENT_PUB.as_bytes()).unwrap());
    }

    #[test]
    fn accepts_der_public_keys() {
        let s = signer();
        let der = public_key_der(s.public_key()).unwrap();
        let sig = s.sign("hello").unwrap();
        assert!(verify("hello", sig, der).unwrap());
    }

    #[test]
    fn garbage_key_is_a_verification_error() {
        let sig = signer().sign("hello").unwrap();
        let err = verify("hello", sig, "not a key").unwrap_err();
        assert!(matches!(err, YardError::SignatureVerification(_)));
    }

    #[test]
    fn bad_hex_is_a_verification_error() {
        let err = verify("hello", "zz-not-hex", AGENT_PUB).unwrap_err();
        assert!(matches!(err, YardError::SignatureVerification(_)));
    }

    #[test]
    fn verify_own_uses_the_same_contract() {
        let s = signer();
        let sig = s.sign("mine").unwrap();
        assert!(s.verify_own("mine", sig.clone()).unwrap());
        assert!(s.verify_own("theirs", sig).is_err());
    }

    #[test]
    fn verifies_signature_from_another_implementation() {
        assert!(verify(VECTOR_MESSAGE, VECTOR_SIGNATURE, SERVER_PUB).unwrap());
    }

    #[test]
    fn pem_round_trip() {
        let s = signer();
        let reloaded = Signer::from_pem(&s.private_key_pem().unwrap()).unwrap();
        assert_eq!(reloaded.public_key(), s.public_key());
        assert_eq!(s.public_key_pem().unwrap().trim(), AGENT_PUB.trim());
    }

    #[test]
    fn key_from_json_byte_array() {
        let bytes: Vec<serde_json::Value> = AGENT_PUB.bytes().map(|b| b.into()).collect();
        let input = PublicKeyInput::from_json(&serde_json::Value::Array(bytes)).unwrap();
        assert_eq!(&input.parse().unwrap(), signer().public_key());
    }

    #[test]
    fn debug_redacts_private_key() {
        let rendered = format!("{:?}", signer());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("BEGIN"));
    }
}
