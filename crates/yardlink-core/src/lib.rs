//! yardlink-core: shared protocol library for yardlink agents.
//!
//! Provides RSA-PSS signing, signed JSON envelopes, agent identity and
//! fingerprints, routing-key derivation, message shapes, and the broker and
//! transport traits the client builds on.

pub mod codec;
pub mod error;
pub mod identity;
pub mod messages;
pub mod routing;
pub mod signing;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{canonical_json, Envelope, EnvelopeCodec, EnvelopeHeaders, SignaturePolicy};
pub use error::{ErrorKind, YardError, YardResult};
pub use identity::{fingerprint, short_fingerprint, Credentials, Identity};
pub use routing::{Purpose, RoutingScheme};
pub use signing::{verify, PublicKeyInput, SignatureInput, Signer};
pub use transport::{ConnectParams, Delivery, TransportAdapter};
