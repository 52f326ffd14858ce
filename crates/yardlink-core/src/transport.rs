//! Broker seam and the transport capability set.
//!
//! The `Broker*` traits are the object-safe boundary to a concrete broker
//! client library (AMQP, MQTT, or the in-process test broker). The
//! [`TransportAdapter`] trait is what the rest of the agent talks to.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::Envelope;
use crate::error::YardResult;
use crate::identity::mask;
use crate::routing::RoutingScheme;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Username and password used for the check-in bootstrap connection.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Per-message broker properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    /// Milliseconds since the Unix epoch. AMQP carries it as whole seconds.
    pub timestamp: Option<u64>,
}

/// One message handed up by a broker channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue name or topic the message was consumed from.
    pub source: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Everything needed to open a broker connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub enable_ssl: bool,
    pub ca_certificate: Option<String>,
    /// Short-lived bootstrap connection.
    pub temporary: bool,
}

impl ConnectParams {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            enable_ssl: false,
            ca_certificate: None,
            temporary: false,
        }
    }

    /// Parameters for the anonymous check-in connection.
    pub fn anonymous(host: impl Into<String>, port: u16) -> Self {
        Self {
            temporary: true,
            ..Self::new(host, port, ANONYMOUS_USER, ANONYMOUS_USER)
        }
    }

    pub fn with_tls(mut self, ca_certificate: Option<String>) -> Self {
        self.enable_ssl = true;
        self.ca_certificate = ca_certificate;
        self
    }

    /// Same endpoint and TLS settings, different account.
    pub fn with_account(&self, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            temporary: false,
            ..self.clone()
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username == ANONYMOUS_USER
    }

    pub fn heartbeat(&self) -> Duration {
        if self.temporary {
            Duration::from_secs(60)
        } else {
            Duration::from_secs(3600)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        if self.temporary {
            Duration::from_secs(60)
        } else {
            Duration::from_secs(300)
        }
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &mask(&self.password))
            .field("enable_ssl", &self.enable_ssl)
            .field("temporary", &self.temporary)
            .finish()
    }
}

/// Opens connections to one kind of broker.
pub trait BrokerConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        params: &'a ConnectParams,
    ) -> BoxFuture<'a, YardResult<Arc<dyn BrokerConnection>>>;
}

/// A live broker connection.
pub trait BrokerConnection: Send + Sync {
    fn open_channel(&self) -> BoxFuture<'_, YardResult<Arc<dyn BrokerChannel>>>;

    fn is_open(&self) -> bool;

    fn close(&self) -> BoxFuture<'_, YardResult<()>>;
}

/// A channel on a broker connection.
///
/// Pub/sub brokers have no exchanges or queues: `exchange` is ignored,
/// `declare_queue`/`bind_queue` report `Unsupported`, and `consume` takes a
/// topic.
pub trait BrokerChannel: Send + Sync {
    /// Publish `body` to `target` (routing key or topic).
    fn publish<'a>(
        &'a self,
        exchange: Option<&'a str>,
        target: &'a str,
        body: &'a [u8],
        properties: &'a MessageProperties,
    ) -> BoxFuture<'a, YardResult<()>>;

    /// Declare a server-named queue and return its name.
    fn declare_queue(&self, exclusive: bool) -> BoxFuture<'_, YardResult<String>>;

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, YardResult<()>>;

    /// Start delivering messages from a queue or topic into [`recv`](Self::recv).
    fn consume<'a>(&'a self, source: &'a str) -> BoxFuture<'a, YardResult<()>>;

    /// Next delivery; `None` once the channel is closed.
    fn recv(&self) -> BoxFuture<'_, Option<Delivery>>;

    fn is_open(&self) -> bool;

    fn close(&self) -> BoxFuture<'_, YardResult<()>>;
}

/// Callback invoked for each delivery on a subscription.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Per-call publish settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Override the transport's default exchange.
    pub exchange: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

/// Uniform transport operations over a queue or pub/sub broker.
#[allow(async_fn_in_trait)]
pub trait TransportAdapter: Send + Sync {
    /// Naming style for routing keys on this transport.
    fn scheme(&self) -> RoutingScheme;

    /// Open (or replace) the connection.
    async fn connect(&self, params: ConnectParams) -> YardResult<()>;

    /// Stamp headers and publish an envelope to `target`.
    async fn publish(&self, target: &str, envelope: Envelope, options: PublishOptions) -> YardResult<()>;

    /// Receive messages for `target` through `handler`. Returns the source
    /// (queue name or topic) the handler is attached to.
    async fn subscribe(&self, target: &str, handler: DeliveryHandler) -> YardResult<String>;

    /// Arm a temporary reply destination for `uuid` and return its id.
    async fn open_reply_channel(&self, uuid: &str, handler: DeliveryHandler) -> YardResult<String>;

    /// Remove a subscription or reply channel.
    async fn unsubscribe(&self, source: &str) -> YardResult<()>;

    /// Run the consume loop until [`stop_consuming`](Self::stop_consuming)
    /// is called or the channel closes.
    async fn start_consuming(&self) -> YardResult<()>;

    fn stop_consuming(&self);

    fn is_consuming(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Username of the current connection.
    fn username(&self) -> Option<String>;

    async fn close(&self) -> YardResult<()>;
}
