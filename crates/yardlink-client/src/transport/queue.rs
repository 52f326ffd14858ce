//! Queue-oriented transport (AMQP semantics).
//!
//! Publishes go to the uplink exchange (the anonymous exchange on a
//! bootstrap connection). Subscriptions declare a server-named queue, bind
//! it on the downlink exchange, and consume from it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use yardlink_core::codec::Envelope;
use yardlink_core::error::{YardError, YardResult};
use yardlink_core::routing::RoutingScheme;
use yardlink_core::transport::{
    BrokerConnector, ConnectParams, Delivery, DeliveryHandler, PublishOptions, TransportAdapter,
};

use super::link::{stamp, Link};
use super::Exchanges;

pub struct QueueTransport {
    link: Link,
    exchanges: Exchanges,
    /// (routing key, queue) pairs re-armed after a reconnect.
    subscriptions: Mutex<Vec<(String, String)>>,
}

impl QueueTransport {
    pub fn new(connector: Arc<dyn BrokerConnector>, exchanges: Exchanges) -> Self {
        Self {
            link: Link::new(connector),
            exchanges,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn exchanges(&self) -> &Exchanges {
        &self.exchanges
    }

    fn default_exchange(&self, params: &ConnectParams) -> &str {
        if params.is_anonymous() {
            &self.exchanges.anonymous
        } else {
            &self.exchanges.uplink
        }
    }

    /// Declare, bind and consume a queue for `routing_key`.
    async fn arm(&self, routing_key: &str) -> YardResult<String> {
        let state = self.link.require()?;
        let channel = &state.consume_channel;
        let queue = channel.declare_queue(false).await?;
        channel
            .bind_queue(&queue, &self.exchanges.downlink, routing_key)
            .await?;
        channel.consume(&queue).await?;
        tracing::debug!(%queue, %routing_key, "queue bound");
        Ok(queue)
    }

    async fn rearm(&self) -> YardResult<()> {
        let subs = std::mem::take(&mut *self.lock_subscriptions());
        for (routing_key, old_queue) in subs {
            let Some(handler) = self.link.unregister(&old_queue) else {
                continue;
            };
            let queue = self.arm(&routing_key).await?;
            self.link.register(queue.clone(), handler);
            self.lock_subscriptions().push((routing_key, queue));
        }
        Ok(())
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<(String, String)>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Correlated request/response on a dedicated channel.
    ///
    /// Declares an exclusive reply queue, publishes with a fresh correlation
    /// id, and waits up to `timeout` for the matching reply.
    pub async fn request(
        &self,
        routing_key: &str,
        envelope: Envelope,
        timeout: Duration,
    ) -> YardResult<Delivery> {
        let state = self.link.require()?;
        let channel = state.connection.open_channel().await?;
        let queue = channel.declare_queue(true).await?;
        channel.consume(&queue).await?;

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let options = PublishOptions {
            exchange: None,
            reply_to: Some(queue.clone()),
            correlation_id: Some(correlation_id.clone()),
        };
        let (body, properties) = stamp(envelope, &state.params.username, &options)?;
        channel
            .publish(
                Some(self.default_exchange(&state.params)),
                routing_key,
                &body,
                &properties,
            )
            .await?;

        let wait = async {
            loop {
                match channel.recv().await {
                    Some(d) if d.properties.correlation_id.as_deref() == Some(correlation_id.as_str()) => {
                        return Ok(d);
                    }
                    Some(d) => {
                        tracing::debug!(
                            correlation_id = ?d.properties.correlation_id,
                            "discarding uncorrelated reply"
                        );
                    }
                    None => return Err(YardError::Transport("reply channel closed".into())),
                }
            }
        };
        let result = tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(YardError::Timeout));

        if let Err(e) = channel.close().await {
            tracing::debug!("closing request channel: {}", e);
        }
        result
    }
}

impl TransportAdapter for QueueTransport {
    fn scheme(&self) -> RoutingScheme {
        RoutingScheme::Dotted
    }

    async fn connect(&self, params: ConnectParams) -> YardResult<()> {
        let anonymous = params.is_anonymous();
        self.link.open(params).await.map_err(|e| {
            if anonymous {
                YardError::AnonymousConnection(e.to_string())
            } else {
                e
            }
        })?;
        self.rearm().await
    }

    async fn publish(&self, target: &str, envelope: Envelope, options: PublishOptions) -> YardResult<()> {
        let state = self.link.require()?;
        let exchange = options
            .exchange
            .clone()
            .unwrap_or_else(|| self.default_exchange(&state.params).to_string());
        self.link
            .publish(Some(&exchange), target, envelope, &options)
            .await
    }

    async fn subscribe(&self, target: &str, handler: DeliveryHandler) -> YardResult<String> {
        let queue = self.arm(target).await?;
        self.link.register(queue.clone(), handler);
        self.lock_subscriptions()
            .push((target.to_string(), queue.clone()));
        Ok(queue)
    }

    async fn open_reply_channel(&self, _uuid: &str, handler: DeliveryHandler) -> YardResult<String> {
        let state = self.link.require()?;
        let queue = state.consume_channel.declare_queue(true).await?;
        self.link.register(queue.clone(), handler);
        state.consume_channel.consume(&queue).await?;
        Ok(queue)
    }

    async fn unsubscribe(&self, source: &str) -> YardResult<()> {
        self.link.unregister(source);
        self.lock_subscriptions().retain(|(_, q)| q != source);
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use yardlink_core::codec::EnvelopeHeaders;

    fn transport(broker: &MemoryBroker) -> QueueTransport {
        QueueTransport::new(Arc::new(broker.clone()), Exchanges::default())
    }

    fn envelope(text: &str) -> Envelope {
        Envelope {
            message: text.to_string(),
            signature: None,
            headers: EnvelopeHeaders::default(),
        }
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let broker = MemoryBroker::new(BrokerMode::Queue);
        let t = transport(&broker);
        let err = t
            .publish("agent.a.state", envelope("{}"), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, YardError::AuthenticationRequired(_)));
    }

    #[tokio::test]
    async fn publish_stamps_headers_and_uses_uplink() {
        let broker = MemoryBroker::new(BrokerMode::Queue);
        let t = transport(&broker);
        t.connect(ConnectParams::new("mem", 5672, "agent-7", "pw")).await.unwrap();
        t.publish("agent.agent-7.state", envelope("{}"), PublishOptions::default())
            .await
            .unwrap();

        let frame = &broker.published()[0];
        assert_eq!(frame.exchange.as_deref(), Some("xchange_helyos.agents.ul"));
        let env = Envelope::decode(&frame.body).unwrap();
        assert_eq!(env.headers.user_id.as_deref(), Some("agent-7"));
        assert!(env.headers.timestamp.unwrap() > 0);
        assert_eq!(frame.properties.user_id.as_deref(), Some("agent-7"));
    }

    #[tokio::test]
    async fn anonymous_connection_publishes_on_anonymous_exchange() {
        let broker = MemoryBroker::new(BrokerMode::Queue);
        let t = transport(&broker);
        t.connect(ConnectParams::anonymous("mem", 5672)).await.unwrap();
        t.publish("agent..checkin", envelope("{}"), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(
            broker.published()[0].exchange.as_deref(),
            Some("xchange_helyos.agents.anonymous")
        );
    }

    #[tokio::test]
    async fn anonymous_failure_is_classified() {
        let broker = MemoryBroker::new(BrokerMode::Queue);
        broker.set_allow_anonymous(false);
        let err = transport(&broker)
            .connect(ConnectParams::anonymous("mem", 5672))
            .await
            .unwrap_err();
        assert!(matches!(err, YardError::AnonymousConnection(_)));
    }

    #[tokio::test]
    async fn transient_publish_failure_retries_once_on_fresh_channel() {
        let broker = MemoryBroker::new(BrokerMode::Queue);
        let t = transport(&broker);
        t.connect(ConnectParams::new("mem", 5672, "a", "pw")).await.unwrap();

        broker.fail_next_publishes(1);
        t.publish("k", envelope("{}"), PublishOptions::default()).await.unwrap();
        assert_eq!(broker.published().len(), 1);

        broker.fail_next_publishes(2);
        let err = t
            .publish("k", envelope("{}"), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, YardError::Transport(_)));
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn subscriptions_dispatch_until_stopped() {
        let broker = MemoryBroker::new(BrokerMode::Queue);
        let t = Arc::new(transport(&broker));
        t.connect(ConnectParams::new("mem", 5672, "a", "pw")).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let stopper = t.clone();
        t.subscribe(
            "agent.a.assignment",
            Arc::new(move |d: Delivery| {
                assert_eq!(d.routing_key, "agent.a.assignment");
                if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                    stopper.stop_consuming();
                }
            }),
        )
        .await
        .unwrap();

        broker.inject(Some("xchange_helyos.agents.dl"), "agent.a.assignment", b"1");
        broker.inject(Some("xchange_helyos.agents.dl"), "agent.a.assignment", b"2");
        t.start_consuming().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(!t.is_consuming());
    }

    #[tokio::test]
    async fn stop_before_start_ends_the_loop() {
        let broker = MemoryBroker::new(BrokerMode::Queue);
        let t = Arc::new(transport(&broker));
        t.connect(ConnectParams::new("mem", 5672, "a", "pw")).await.unwrap();

        t.stop_consuming();
        tokio::time::timeout(Duration::from_secs(5), t.start_consuming())
            .await
            .unwrap()
            .unwrap();
        assert!(!t.is_consuming());

        // The stop was used up; the next loop runs until stopped again.
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let stopper = t.clone();
        t.subscribe(
            "agent.a.assignment",
            Arc::new(move |_: Delivery| {
                counter.fetch_add(1, Ordering::SeqCst);
                stopper.stop_consuming();
            }),
        )
        .await
        .unwrap();
        broker.inject(Some("xchange_helyos.agents.dl"), "agent.a.assignment", b"1");
        tokio::time::timeout(Duration::from_secs(5), t.start_consuming())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_while_idle_does_not_stop_the_next_loop() {
        let broker = MemoryBroker::new(BrokerMode::Queue);
        let t = Arc::new(transport(&broker));
        let params = ConnectParams::new("mem", 5672, "a", "pw");
        t.connect(params.clone()).await.unwrap();
        t.close().await.unwrap();
        t.connect(params).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let stopper = t.clone();
        t.subscribe(
            "agent.a.assignment",
            Arc::new(move |_: Delivery| {
                counter.fetch_add(1, Ordering::SeqCst);
                stopper.stop_consuming();
            }),
        )
        .await
        .unwrap();
        broker.inject(Some("xchange_helyos.agents.dl"), "agent.a.assignment", b"1");
        tokio::time::timeout(Duration::from_secs(5), t.start_consuming())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnect_rearms_subscriptions() {
        let broker = MemoryBroker::new(BrokerMode::Queue);
        let t = Arc::new(transport(&broker));
        let params = ConnectParams::new("mem", 5672, "a", "pw");
        t.connect(params.clone()).await.unwrap();

        let stopper = t.clone();
        t.subscribe("agent.a.instantActions", Arc::new(move |_| stopper.stop_consuming()))
            .await
            .unwrap();

        broker.disconnect_all();
        assert!(!t.is_connected());
        t.connect(params).await.unwrap();

        broker.inject(Some("xchange_helyos.agents.dl"), "agent.a.instantActions", b"x");
        tokio::time::timeout(Duration::from_secs(5), t.start_consuming())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn request_matches_correlation_id() {
        let broker = MemoryBroker::new(BrokerMode::Queue);
        broker.set_responder(|frame| {
            let mut stale = frame.reply(br#"{"message":"stale"}"#.to_vec()).unwrap();
            stale.properties.correlation_id = Some("someone-else".into());
            vec![stale, frame.reply(br#"{"message":"fresh"}"#.to_vec()).unwrap()]
        });
        let t = transport(&broker);
        t.connect(ConnectParams::new("mem", 5672, "a", "pw")).await.unwrap();

        let reply = t
            .request("agent.a.database_req", envelope("{}"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.body, br#"{"message":"fresh"}"#);
        let sent = &broker.published()[0];
        assert!(sent.properties.correlation_id.is_some());
    }

    #[tokio::test]
    async fn request_times_out_without_reply() {
        let broker = MemoryBroker::new(BrokerMode::Queue);
        let t = transport(&broker);
        t.connect(ConnectParams::new("mem", 5672, "a", "pw")).await.unwrap();
        let err = t
            .request("agent.a.database_req", envelope("{}"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, YardError::Timeout));
    }
}
