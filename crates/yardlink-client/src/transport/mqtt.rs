//! MQTT broker backend over `rumqttc`.
//!
//! One [`AsyncClient`] per connection. The event loop runs on its own task
//! and fans incoming publishes out to whichever channels subscribed to a
//! matching topic filter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use tokio::sync::{mpsc, oneshot, Notify};

use yardlink_core::error::{YardError, YardResult};
use yardlink_core::transport::{
    BoxFuture, BrokerChannel, BrokerConnection, BrokerConnector, ConnectParams, Delivery,
    MessageProperties,
};

type Subscribers = Arc<Mutex<Vec<(String, mpsc::UnboundedSender<Delivery>)>>>;

/// Connects to an MQTT 3.1.1 broker.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    /// Request queue depth handed to `rumqttc`.
    pub capacity: usize,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

/// Does `topic` match the subscription `filter` (`+` and `#` wildcards)?
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn client_id(params: &ConnectParams) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", params.username, &suffix[..8])
}

fn mqtt_options(params: &ConnectParams) -> MqttOptions {
    let mut options = MqttOptions::new(client_id(params), params.host.clone(), params.port);
    options.set_credentials(params.username.clone(), params.password.clone());
    options.set_keep_alive(params.heartbeat());
    options.set_clean_session(true);
    if params.enable_ssl {
        let transport = match &params.ca_certificate {
            Some(ca) => Transport::tls(ca.as_bytes().to_vec(), None, None),
            None => Transport::tls_with_default_config(),
        };
        options.set_transport(transport);
    }
    options
}

impl BrokerConnector for MqttConnector {
    fn connect<'a>(
        &'a self,
        params: &'a ConnectParams,
    ) -> BoxFuture<'a, YardResult<Arc<dyn BrokerConnection>>> {
        Box::pin(async move {
            let (client, eventloop) = AsyncClient::new(mqtt_options(params), self.capacity);
            let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
            let open = Arc::new(AtomicBool::new(false));
            let closed = Arc::new(Notify::new());
            let (ready_tx, ready_rx) = oneshot::channel();

            tokio::spawn(drive(
                eventloop,
                subscribers.clone(),
                open.clone(),
                closed.clone(),
                ready_tx,
            ));

            match tokio::time::timeout(params.connect_timeout(), ready_rx).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => return Err(e),
                Ok(Err(_)) => {
                    return Err(YardError::Transport("mqtt event loop stopped".into()));
                }
                Err(_) => {
                    tracing::warn!(host = %params.host, port = params.port, "mqtt connect timed out");
                    let _ = client.disconnect().await;
                    return Err(YardError::Timeout);
                }
            }

            tracing::debug!(host = %params.host, port = params.port, "mqtt connection open");
            let connection: Arc<dyn BrokerConnection> = Arc::new(MqttConnection {
                client,
                subscribers,
                open,
                closed,
            });
            Ok(connection)
        })
    }
}

/// Poll the event loop until it fails, reporting the ConnAck once.
async fn drive(
    mut eventloop: EventLoop,
    subscribers: Subscribers,
    open: Arc<AtomicBool>,
    closed: Arc<Notify>,
    ready: oneshot::Sender<YardResult<()>>,
) {
    let mut ready = Some(ready);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let result = if ack.code == ConnectReturnCode::Success {
                    open.store(true, Ordering::SeqCst);
                    Ok(())
                } else {
                    Err(YardError::Transport(format!("mqtt connection refused: {:?}", ack.code)))
                };
                let refused = result.is_err();
                if let Some(ready) = ready.take() {
                    let _ = ready.send(result);
                }
                if refused {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let subscribers = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
                for (filter, tx) in subscribers.iter() {
                    if topic_matches(filter, &publish.topic) {
                        let _ = tx.send(Delivery {
                            source: filter.clone(),
                            routing_key: publish.topic.clone(),
                            body: publish.payload.to_vec(),
                            properties: MessageProperties::default(),
                        });
                    }
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                match ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Err(YardError::Transport(e.to_string())));
                    }
                    None => tracing::warn!("mqtt connection lost: {}", e),
                }
                break;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
    subscribers.lock().unwrap_or_else(PoisonError::into_inner).clear();
    closed.notify_waiters();
}

struct MqttConnection {
    client: AsyncClient,
    subscribers: Subscribers,
    open: Arc<AtomicBool>,
    closed: Arc<Notify>,
}

impl BrokerConnection for MqttConnection {
    fn open_channel(&self) -> BoxFuture<'_, YardResult<Arc<dyn BrokerChannel>>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(YardError::Transport("mqtt connection closed".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let channel: Arc<dyn BrokerChannel> = Arc::new(MqttChannel {
                client: self.client.clone(),
                subscribers: self.subscribers.clone(),
                connection_open: self.open.clone(),
                closed: self.closed.clone(),
                open: AtomicBool::new(true),
                tx,
                rx: tokio::sync::Mutex::new(rx),
            });
            Ok(channel)
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) -> BoxFuture<'_, YardResult<()>> {
        Box::pin(async move {
            if self.open.swap(false, Ordering::SeqCst) {
                self.client
                    .disconnect()
                    .await
                    .map_err(|e| YardError::Transport(e.to_string()))?;
            }
            self.closed.notify_waiters();
            Ok(())
        })
    }
}

struct MqttChannel {
    client: AsyncClient,
    subscribers: Subscribers,
    connection_open: Arc<AtomicBool>,
    closed: Arc<Notify>,
    open: AtomicBool,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
}

impl BrokerChannel for MqttChannel {
    fn publish<'a>(
        &'a self,
        _exchange: Option<&'a str>,
        target: &'a str,
        body: &'a [u8],
        _properties: &'a MessageProperties,
    ) -> BoxFuture<'a, YardResult<()>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(YardError::Transport("mqtt channel closed".into()));
            }
            self.client
                .publish(target, QoS::AtLeastOnce, false, body.to_vec())
                .await
                .map_err(|e| YardError::Transport(e.to_string()))
        })
    }

    fn declare_queue(&self, _exclusive: bool) -> BoxFuture<'_, YardResult<String>> {
        Box::pin(async { Err(YardError::Unsupported("queues on an MQTT broker".into())) })
    }

    fn bind_queue<'a>(
        &'a self,
        _queue: &'a str,
        _exchange: &'a str,
        _routing_key: &'a str,
    ) -> BoxFuture<'a, YardResult<()>> {
        Box::pin(async { Err(YardError::Unsupported("exchanges on an MQTT broker".into())) })
    }

    fn consume<'a>(&'a self, source: &'a str) -> BoxFuture<'a, YardResult<()>> {
        Box::pin(async move {
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((source.to_string(), self.tx.clone()));
            self.client
                .subscribe(source, QoS::AtLeastOnce)
                .await
                .map_err(|e| YardError::Transport(e.to_string()))
        })
    }

    fn recv(&self) -> BoxFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            let mut rx = self.rx.lock().await;
            loop {
                if !self.is_open() {
                    return rx.try_recv().ok();
                }
                tokio::select! {
                    delivery = rx.recv() => return delivery,
                    _ = self.closed.notified() => continue,
                }
            }
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    fn close(&self) -> BoxFuture<'_, YardResult<()>> {
        Box::pin(async move {
            self.open.store(false, Ordering::SeqCst);
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(_, tx)| !tx.same_channel(&self.tx));
            self.closed.notify_waiters();
            Ok(())
        })
    }
}
