//! Topic-based transport (MQTT semantics).
//!
//! No exchanges, queues or anonymous logins. Request/response is built from
//! dedicated reply topics.

use std::sync::{Arc, Mutex, PoisonError};

use yardlink_core::codec::Envelope;
use yardlink_core::error::{YardError, YardResult};
use yardlink_core::routing::{checkin_response_topic, RoutingScheme};
use yardlink_core::transport::{
    BrokerConnector, ConnectParams, DeliveryHandler, PublishOptions, TransportAdapter,
};

use super::link::Link;

pub struct PubSubTransport {
    link: Link,
    /// Topics re-subscribed after a reconnect.
    topics: Mutex<Vec<String>>,
}

impl PubSubTransport {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            link: Link::new(connector),
            topics: Mutex::new(Vec::new()),
        }
    }

    fn lock_topics(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn listen(&self, topic: &str) -> YardResult<()> {
        let state = self.link.require()?;
        state.consume_channel.consume(topic).await
    }
}

impl TransportAdapter for PubSubTransport {
    fn scheme(&self) -> RoutingScheme {
        RoutingScheme::Slashed
    }

    async fn connect(&self, params: ConnectParams) -> YardResult<()> {
        if params.is_anonymous() {
            return Err(YardError::AnonymousConnectionNotSupported(
                "this agent".into(),
            ));
        }
        self.link.open(params).await?;

        let topics = self.lock_topics().clone();
        for topic in topics {
            self.listen(&topic).await?;
        }
        Ok(())
    }

    async fn publish(&self, target: &str, envelope: Envelope, options: PublishOptions) -> YardResult<()> {
        self.link.publish(None, target, envelope, &options).await
    }

    async fn subscribe(&self, target: &str, handler: DeliveryHandler) -> YardResult<String> {
        self.listen(target).await?;
        self.link.register(target.to_string(), handler);
        let mut topics = self.lock_topics();
        if !topics.iter().any(|t| t == target) {
            topics.push(target.to_string());
        }
        Ok(target.to_string())
    }

    async fn open_reply_channel(&self, uuid: &str, handler: DeliveryHandler) -> YardResult<String> {
        let topic = checkin_response_topic(uuid);
        self.listen(&topic).await?;
        self.link.register(topic.clone(), handler);
        Ok(topic)
    }

    async fn unsubscribe(&self, source: &str) -> YardResult<()> {
        self.link.unregister(source);
        self.lock_topics().retain(|t| t != source);
        Ok(())
    }

    async fn start_consuming(&self) -> YardResult<()> {
        self.link.run().await
    }

    fn stop_consuming(&self) {
        self.link.stop();
    }

    fn is_consuming(&self) -> bool {
        self.link.is_consuming()
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn username(&self) -> Option<String> {
        self.link.username()
    }

    async fn close(&self) -> YardResult<()> {
        self.link.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{BrokerMode, MemoryBroker};
    use std::time::Duration;
    use yardlink_core::transport::Delivery;

    fn connected(broker: &MemoryBroker) -> PubSubTransport {
        PubSubTransport::new(Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn anonymous_connect_is_not_supported() {
        let broker = MemoryBroker::new(BrokerMode::PubSub);
        let err = connected(&broker)
            .connect(ConnectParams::anonymous("mem", 1883))
            .await
            .unwrap_err();
        assert!(matches!(err, YardError::AnonymousConnectionNotSupported(_)));
        assert!(broker.connect_log().is_empty());
    }

    #[tokio::test]
    async fn publishes_to_topic_without_exchange() {
        let broker = MemoryBroker::new(BrokerMode::PubSub);
        let t = connected(&broker);
        t.connect(ConnectParams::new("mem", 1883, "agent-7", "pw")).await.unwrap();
        t.publish(
            "agent/agent-7/visualization",
            Envelope::unsigned("{}"),
            PublishOptions::default(),
        )
        .await
        .unwrap();
        let frame = &broker.published_to("agent/agent-7/visualization")[0];
        assert_eq!(frame.exchange, None);
        let env = Envelope::decode(&frame.body).unwrap();
        assert_eq!(env.headers.user_id.as_deref(), Some("agent-7"));
    }

    #[tokio::test]
    async fn reply_channel_is_the_checkin_response_topic() {
        let broker = MemoryBroker::new(BrokerMode::PubSub);
        let t = Arc::new(connected(&broker));
        t.connect(ConnectParams::new("mem", 1883, "agent-7", "pw")).await.unwrap();

        let stopper = t.clone();
        let topic = t
            .open_reply_channel(
                "agent-7",
                Arc::new(move |d: Delivery| {
                    assert_eq!(d.body, b"ok");
                    stopper.stop_consuming();
                }),
            )
            .await
            .unwrap();
        assert_eq!(topic, "agent/agent-7/checkinresponse");

        broker.inject(None, &topic, b"ok");
        tokio::time::timeout(Duration::from_secs(5), t.start_consuming())
            .await
            .unwrap()
            .unwrap();
    }
}
