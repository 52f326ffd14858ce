//! Transport selection for yardlink.
//!
//! The broker protocol is fixed at construction time:
//! - `amqp://` / `amqps://` (or `amqp`) → queue transport
//! - `mqtt://` / `mqtts://` (or `mqtt`) → pub/sub transport

pub(crate) mod link;
pub mod memory;
pub mod pubsub;
pub mod queue;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use memory::{BrokerMode, MemoryBroker};
pub use pubsub::PubSubTransport;
pub use queue::QueueTransport;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use yardlink_core::codec::Envelope;
use yardlink_core::error::{YardError, YardResult};
use yardlink_core::routing::RoutingScheme;
use yardlink_core::transport::{
    BrokerConnector, ConnectParams, Delivery, DeliveryHandler, PublishOptions, TransportAdapter,
};

/// Transport kind, chosen from configuration or a broker URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Reliable queue semantics (AMQP).
    Amqp,
    /// Lightweight topics (MQTT).
    Mqtt,
}

impl TransportKind {
    pub fn default_port(self, tls: bool) -> u16 {
        match (self, tls) {
            (TransportKind::Amqp, false) => 5672,
            (TransportKind::Amqp, true) => 5671,
            (TransportKind::Mqtt, false) => 1883,
            (TransportKind::Mqtt, true) => 8883,
        }
    }

    pub fn scheme(self) -> RoutingScheme {
        match self {
            TransportKind::Amqp => RoutingScheme::Dotted,
            TransportKind::Mqtt => RoutingScheme::Slashed,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Amqp => f.write_str("amqp"),
            TransportKind::Mqtt => f.write_str("mqtt"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = YardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "amqp" | "queue" => Ok(TransportKind::Amqp),
            "mqtt" | "pubsub" => Ok(TransportKind::Mqtt),
            other => Err(YardError::Config(format!(
                "unknown transport '{other}' (expected amqp or mqtt)"
            ))),
        }
    }
}

/// Determine the transport kind and TLS flag from a broker URL.
pub fn detect_transport(url: &str) -> YardResult<(TransportKind, bool)> {
    let lower = url.to_lowercase();
    if lower.starts_with("amqps://") {
        Ok((TransportKind::Amqp, true))
    } else if lower.starts_with("amqp://") {
        Ok((TransportKind::Amqp, false))
    } else if lower.starts_with("mqtts://") {
        Ok((TransportKind::Mqtt, true))
    } else if lower.starts_with("mqtt://") {
        Ok((TransportKind::Mqtt, false))
    } else {
        Err(YardError::Transport(format!(
            "unsupported URL scheme: {url} (expected amqp://, amqps://, mqtt:// or mqtts://)"
        )))
    }
}

/// Exchange names on the queue broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Exchanges {
    pub uplink: String,
    pub downlink: String,
    pub anonymous: String,
    pub mqtt: String,
}

impl Default for Exchanges {
    fn default() -> Self {
        Self {
            uplink: "xchange_helyos.agents.ul".into(),
            downlink: "xchange_helyos.agents.dl".into(),
            anonymous: "xchange_helyos.agents.anonymous".into(),
            mqtt: "xchange_helyos.agents.mqtt".into(),
        }
    }
}

/// Enum-dispatched transport.
///
/// Wraps both variants so callers can use them without `dyn
/// TransportAdapter` (which is not object-safe due to async methods).
pub enum AnyTransport {
    Queue(QueueTransport),
    PubSub(PubSubTransport),
}

impl AnyTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Queue(_) => TransportKind::Amqp,
            Self::PubSub(_) => TransportKind::Mqtt,
        }
    }

    pub fn scheme(&self) -> RoutingScheme {
        match self {
            Self::Queue(t) => t.scheme(),
            Self::PubSub(t) => t.scheme(),
        }
    }

    pub async fn connect(&self, params: ConnectParams) -> YardResult<()> {
        match self {
            Self::Queue(t) => t.connect(params).await,
            Self::PubSub(t) => t.connect(params).await,
        }
    }

    pub async fn publish(
        &self,
        target: &str,
        envelope: Envelope,
        options: PublishOptions,
    ) -> YardResult<()> {
        match self {
            Self::Queue(t) => t.publish(target, envelope, options).await,
            Self::PubSub(t) => t.publish(target, envelope, options).await,
        }
    }

    pub async fn subscribe(&self, target: &str, handler: DeliveryHandler) -> YardResult<String> {
        match self {
            Self::Queue(t) => t.subscribe(target, handler).await,
            Self::PubSub(t) => t.subscribe(target, handler).await,
        }
    }

    pub async fn open_reply_channel(
        &self,
        uuid: &str,
        handler: DeliveryHandler,
    ) -> YardResult<String> {
        match self {
            Self::Queue(t) => t.open_reply_channel(uuid, handler).await,
            Self::PubSub(t) => t.open_reply_channel(uuid, handler).await,
        }
    }

    pub async fn unsubscribe(&self, source: &str) -> YardResult<()> {
        match self {
            Self::Queue(t) => t.unsubscribe(source).await,
            Self::PubSub(t) => t.unsubscribe(source).await,
        }
    }

    /// Correlated request/response. Queue transport only.
    pub async fn request(
        &self,
        routing_key: &str,
        envelope: Envelope,
        timeout: Duration,
    ) -> YardResult<Delivery> {
        match self {
            Self::Queue(t) => t.request(routing_key, envelope, timeout).await,
            Self::PubSub(_) => Err(YardError::Unsupported(
                "request/response needs the queue transport".into(),
            )),
        }
    }

    pub async fn start_consuming(&self) -> YardResult<()> {
        match self {
            Self::Queue(t) => t.start_consuming().await,
            Self::PubSub(t) => t.start_consuming().await,
        }
    }

    pub fn stop_consuming(&self) {
        match self {
            Self::Queue(t) => t.stop_consuming(),
            Self::PubSub(t) => t.stop_consuming(),
        }
    }

    pub fn is_consuming(&self) -> bool {
        match self {
            Self::Queue(t) => t.is_consuming(),
            Self::PubSub(t) => t.is_consuming(),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Self::Queue(t) => t.is_connected(),
            Self::PubSub(t) => t.is_connected(),
        }
    }

    pub fn username(&self) -> Option<String> {
        match self {
            Self::Queue(t) => t.username(),
            Self::PubSub(t) => t.username(),
        }
    }

    pub async fn close(&self) -> YardResult<()> {
        match self {
            Self::Queue(t) => t.close().await,
            Self::PubSub(t) => t.close().await,
        }
    }
}

/// Builds transports of one kind over one broker connector.
#[derive(Clone)]
pub struct TransportFactory {
    kind: TransportKind,
    connector: Arc<dyn BrokerConnector>,
    exchanges: Exchanges,
}

impl TransportFactory {
    pub fn new(kind: TransportKind, connector: Arc<dyn BrokerConnector>, exchanges: Exchanges) -> Self {
        Self {
            kind,
            connector,
            exchanges,
        }
    }

    /// Factory over the network backend for `kind`.
    ///
    /// Fails with `Unsupported` when the crate was built without the
    /// matching feature.
    pub fn for_network(kind: TransportKind, exchanges: Exchanges) -> YardResult<Self> {
        let connector: Arc<dyn BrokerConnector> = match kind {
            #[cfg(feature = "amqp")]
            TransportKind::Amqp => Arc::new(amqp::AmqpConnector),
            #[cfg(feature = "mqtt")]
            TransportKind::Mqtt => Arc::new(mqtt::MqttConnector::default()),
            #[allow(unreachable_patterns)]
            other => {
                return Err(YardError::Unsupported(format!(
                    "yardlink-client was built without the `{other}` feature"
                )))
            }
        };
        Ok(Self::new(kind, connector, exchanges))
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn exchanges(&self) -> &Exchanges {
        &self.exchanges
    }

    pub fn build(&self) -> AnyTransport {
        match self.kind {
            TransportKind::Amqp => AnyTransport::Queue(QueueTransport::new(
                self.connector.clone(),
                self.exchanges.clone(),
            )),
            TransportKind::Mqtt => AnyTransport::PubSub(PubSubTransport::new(self.connector.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_from_url() {
        assert_eq!(detect_transport("amqp://broker:5672").unwrap(), (TransportKind::Amqp, false));
        assert_eq!(detect_transport("AMQPS://broker").unwrap(), (TransportKind::Amqp, true));
        assert_eq!(detect_transport("mqtt://broker").unwrap(), (TransportKind::Mqtt, false));
        assert_eq!(detect_transport("mqtts://broker").unwrap(), (TransportKind::Mqtt, true));
        assert!(detect_transport("http://broker").is_err());
    }

    #[test]
    fn parse_kind_names() {
        assert_eq!("AMQP".parse::<TransportKind>().unwrap(), TransportKind::Amqp);
        assert_eq!("pubsub".parse::<TransportKind>().unwrap(), TransportKind::Mqtt);
        assert!("stomp".parse::<TransportKind>().is_err());
    }

    #[test]
    fn default_ports() {
        assert_eq!(TransportKind::Amqp.default_port(false), 5672);
        assert_eq!(TransportKind::Mqtt.default_port(true), 8883);
    }

    #[test]
    fn factory_builds_matching_variant() {
        let broker = MemoryBroker::new(BrokerMode::PubSub);
        let factory = TransportFactory::new(TransportKind::Mqtt, Arc::new(broker), Exchanges::default());
        let t = factory.build();
        assert_eq!(t.kind(), TransportKind::Mqtt);
        assert_eq!(t.scheme(), RoutingScheme::Slashed);
    }
}
