//! yardlink-client: agent-side connectivity for yardlink.
//!
//! Provides the check-in handshake, queue and pub/sub transports over a
//! pluggable broker backend, inbound message routing, reconnect
//! supervision, the database RPC helper, key storage and configuration.

pub mod client;
pub mod config;
pub mod database;
pub mod handshake;
pub mod keystore;
pub mod router;
pub mod supervisor;
pub mod transport;

pub use client::{AgentClient, AgentStatus};
pub use config::AgentConfig;
pub use database::DatabaseConnector;
pub use handshake::{CheckinOutcome, CheckinRequest, HandshakeController, HandshakeState};
pub use keystore::KeyStore;
pub use router::{MessageRouter, RouteOutcome, RoutedMessage};
pub use supervisor::{Backoff, PublishOutcome, ReconnectSupervisor, RetryPolicy};
pub use transport::{AnyTransport, Exchanges, TransportFactory, TransportKind};
