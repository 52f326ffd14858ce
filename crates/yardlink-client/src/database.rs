//! Request/response queries against the yard database.
//!
//! Requests go unsigned to `agent.{uuid}.database_req` with a fresh
//! correlation id and an exclusive reply queue. Only the queue transport
//! can carry them.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info};

use yardlink_core::codec::{canonical_json, Envelope};
use yardlink_core::error::{YardError, YardResult};
use yardlink_core::routing::Purpose;

use crate::client::AgentClient;
use crate::transport::TransportKind;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DatabaseConnector<'a> {
    client: &'a AgentClient,
    timeout: Duration,
}

impl<'a> DatabaseConnector<'a> {
    pub fn new(client: &'a AgentClient) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `request` (e.g. `{"query": "allAgents", "conditions": {...}}`)
    /// and return the decoded reply message.
    pub async fn call(&self, request: Value) -> YardResult<Value> {
        let transport = self.client.transport();
        if transport.kind() != TransportKind::Amqp {
            return Err(YardError::Unsupported(
                "database requests need the queue transport".into(),
            ));
        }
        if !transport.is_connected() {
            info!("transport down, reconnecting before database request");
            self.client.reconnect().await?;
        }

        let envelope = Envelope::unsigned(canonical_json(&json!({ "body": request }))?);
        let routing_key = transport
            .scheme()
            .routing_key(&self.client.uuid(), Purpose::DatabaseRequest);
        let reply = transport.request(&routing_key, envelope, self.timeout).await?;
        debug!(%routing_key, bytes = reply.body.len(), "database reply received");

        Envelope::decode(&reply.body)?.message_value()
    }
}
