//! Signed JSON envelopes.
//!
//! Wire format: `{"message": "<canonical JSON>", "signature": [..] | null, "headers": {..}}`
//!
//! The inner message is serialized with object keys sorted so that equal
//! payloads always produce the same text, and therefore the same signature.

use std::sync::{PoisonError, RwLock};

use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{YardError, YardResult};
use crate::signing::{self, PublicKeyInput, SignatureInput, Signer};

/// Serialize `value` as compact JSON with every object's keys sorted.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> YardResult<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&sort_keys(value))?)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let sorted: Map<String, Value> = entries
                .into_iter()
                .map(|(k, v)| (k, sort_keys(v)))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Transport headers carried alongside the message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeaders {
    /// Milliseconds since the Unix epoch, stamped at publish time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// The outer frame exchanged with the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message: String,
    #[serde(default, with = "signature_field")]
    pub signature: Option<Vec<u8>>,
    #[serde(default)]
    pub headers: EnvelopeHeaders,
}

impl Envelope {
    /// An envelope around already-serialized message text, without a signature.
    pub fn unsigned(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            signature: None,
            headers: EnvelopeHeaders::default(),
        }
    }

    /// Parse a raw frame.
    ///
    /// Fails with [`YardError::MalformedEnvelope`] unless the frame is a JSON
    /// object holding a string `message`.
    pub fn decode(raw: &[u8]) -> YardResult<Self> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| YardError::MalformedEnvelope(format!("frame is not JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| YardError::MalformedEnvelope("frame is not a JSON object".into()))?;
        match obj.get("message") {
            Some(Value::String(_)) => {}
            Some(_) => {
                return Err(YardError::MalformedEnvelope(
                    "`message` is not a string".into(),
                ))
            }
            None => return Err(YardError::MalformedEnvelope("missing `message` field".into())),
        }
        serde_json::from_value(value).map_err(|e| YardError::MalformedEnvelope(e.to_string()))
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> YardResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the message text as JSON without any signature check.
    pub fn message_value(&self) -> YardResult<Value> {
        serde_json::from_str(&self.message)
            .map_err(|e| YardError::MalformedEnvelope(format!("message is not JSON: {e}")))
    }
}

/// Signatures go out as JSON byte arrays; inbound frames may also carry hex.
mod signature_field {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Bytes(Vec<u8>),
        Hex(String),
    }

    pub fn serialize<S: Serializer>(sig: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match sig {
            Some(bytes) => s.collect_seq(bytes),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<Repr>::deserialize(d)? {
            None => Ok(None),
            Some(Repr::Bytes(bytes)) => Ok(Some(bytes)),
            Some(Repr::Hex(text)) => hex::decode(text.trim())
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// How strictly inbound envelopes are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignaturePolicy {
    /// Unsigned frames pass. Signed frames are verified when a counterpart
    /// key is known and released as [`Authenticity::Unverifiable`] otherwise.
    #[default]
    AllowUnsigned,
    /// Every frame must carry a signature that verifies.
    RequireSigned,
}

/// What an inbound envelope proved about its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authenticity {
    Verified,
    Unsigned,
    /// Signed, but no counterpart key was known to check it. Only a first
    /// check-in reply may be trusted on this basis.
    Unverifiable,
}

/// A message released by [`EnvelopeCodec::open`].
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedEnvelope {
    pub message: Value,
    pub authenticity: Authenticity,
}

/// Builds and checks envelopes for one agent.
///
/// Holds the agent's signer (if any) and the counterpart public key once it
/// is learned.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    signer: Option<Signer>,
    counterpart: RwLock<Option<RsaPublicKey>>,
}

impl EnvelopeCodec {
    pub fn new(signer: Option<Signer>) -> Self {
        Self {
            signer,
            counterpart: RwLock::new(None),
        }
    }

    pub fn with_counterpart(self, key: RsaPublicKey) -> Self {
        self.set_counterpart(Some(key));
        self
    }

    pub fn set_counterpart(&self, key: Option<RsaPublicKey>) {
        *self
            .counterpart
            .write()
            .unwrap_or_else(PoisonError::into_inner) = key;
    }

    pub fn counterpart(&self) -> Option<RsaPublicKey> {
        self.counterpart
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn can_sign(&self) -> bool {
        self.signer.is_some()
    }

    /// Sign `message` with the agent key.
    pub fn sign(&self, message: &str) -> YardResult<Vec<u8>> {
        self.signer
            .as_ref()
            .ok_or_else(|| YardError::Signing("no private key configured".into()))?
            .sign(message)
    }

    /// Verify `signature` over `message` against an explicit key.
    pub fn verify(
        &self,
        message: &str,
        signature: impl Into<SignatureInput>,
        public_key: impl Into<PublicKeyInput>,
    ) -> YardResult<bool> {
        signing::verify(message, signature, public_key)
    }

    /// Verify a signature made with the agent's own key.
    pub fn verify_own(&self, message: &str, signature: impl Into<SignatureInput>) -> YardResult<bool> {
        self.signer
            .as_ref()
            .ok_or_else(|| YardError::SignatureVerification("no private key configured".into()))?
            .verify_own(message, signature)
    }

    /// Canonicalize `message` and wrap it, signing when `sign` is set.
    pub fn encode_envelope<T: Serialize + ?Sized>(
        &self,
        message: &T,
        headers: EnvelopeHeaders,
        sign: bool,
    ) -> YardResult<Envelope> {
        let message = canonical_json(message)?;
        let signature = if sign {
            Some(self.sign(&message)?)
        } else {
            None
        };
        Ok(Envelope {
            message,
            signature,
            headers,
        })
    }

    pub fn decode_envelope(&self, raw: &[u8]) -> YardResult<Envelope> {
        Envelope::decode(raw)
    }

    /// Apply `policy` to an envelope and parse its message.
    ///
    /// A signature that is present and checkable must verify; failure is
    /// [`YardError::SignatureVerification`], never a downgrade to unsigned.
    pub fn open(&self, envelope: &Envelope, policy: SignaturePolicy) -> YardResult<OpenedEnvelope> {
        let authenticity = match (&envelope.signature, self.counterpart()) {
            (Some(sig), Some(key)) => {
                signing::verify_with_key(&envelope.message, sig, &key)?;
                Authenticity::Verified
            }
            (Some(_), None) if policy == SignaturePolicy::RequireSigned => {
                return Err(YardError::SignatureVerification(
                    "no counterpart key to verify against".into(),
                ))
            }
            (Some(_), None) => Authenticity::Unverifiable,
            (None, _) if policy == SignaturePolicy::RequireSigned => {
                return Err(YardError::SignatureVerification(
                    "unsigned message rejected".into(),
                ))
            }
            (None, _) => Authenticity::Unsigned,
        };
        Ok(OpenedEnvelope {
            message: envelope.message_value()?,
            authenticity,
        })
    }

    /// Decode and open in one step.
    pub fn open_frame(&self, raw: &[u8], policy: SignaturePolicy) -> YardResult<OpenedEnvelope> {
        self.open(&Envelope::decode(raw)?, policy)
    }
}
