//! Connection state shared by both transport variants.
//!
//! A link owns one broker connection with two channels: a publish channel
//! guarded by a mutex, and a consume channel drained by the consume loop.
//! Handlers are keyed by the queue name or topic they consume from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;

use yardlink_core::codec::Envelope;
use yardlink_core::error::{YardError, YardResult};
use yardlink_core::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConnectParams, Delivery, DeliveryHandler,
    MessageProperties, PublishOptions,
};

pub(crate) struct LinkState {
    pub params: ConnectParams,
    pub connection: Arc<dyn BrokerConnection>,
    publish_channel: Mutex<Arc<dyn BrokerChannel>>,
    pub consume_channel: Arc<dyn BrokerChannel>,
}

impl LinkState {
    fn publish_channel(&self) -> Arc<dyn BrokerChannel> {
        self.publish_channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub(crate) struct Link {
    connector: Arc<dyn BrokerConnector>,
    state: RwLock<Option<Arc<LinkState>>>,
    handlers: Mutex<HashMap<String, DeliveryHandler>>,
    publish_lock: tokio::sync::Mutex<()>,
    stop: watch::Sender<bool>,
    consuming: AtomicBool,
}

/// Clears the consuming flag and any pending stop request however the loop
/// exits, including cancellation.
struct ConsumingGuard<'a> {
    consuming: &'a AtomicBool,
    stop: &'a watch::Sender<bool>,
}

impl Drop for ConsumingGuard<'_> {
    fn drop(&mut self) {
        self.stop.send_replace(false);
        self.consuming.store(false, Ordering::SeqCst);
    }
}

impl Link {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            connector,
            state: RwLock::new(None),
            handlers: Mutex::new(HashMap::new()),
            publish_lock: tokio::sync::Mutex::new(()),
            stop,
            consuming: AtomicBool::new(false),
        }
    }

    /// Connect and replace any existing connection.
    pub async fn open(&self, params: ConnectParams) -> YardResult<Arc<LinkState>> {
        let connection = self.connector.connect(&params).await?;
        let publish_channel = connection.open_channel().await?;
        let consume_channel = connection.open_channel().await?;

        let state = Arc::new(LinkState {
            params,
            connection,
            publish_channel: Mutex::new(publish_channel),
            consume_channel,
        });

        let previous = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(state.clone());

        if let Some(old) = previous {
            if let Err(e) = old.connection.close().await {
                tracing::debug!("closing replaced connection: {}", e);
            }
        }

        tracing::info!(
            host = %state.params.host,
            port = state.params.port,
            username = %state.params.username,
            "broker connection established"
        );
        Ok(state)
    }

    pub fn current(&self) -> Option<Arc<LinkState>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn require(&self) -> YardResult<Arc<LinkState>> {
        self.current().ok_or_else(|| {
            YardError::AuthenticationRequired("no broker connection; connect or check in first".into())
        })
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|s| s.connection.is_open())
    }

    pub fn username(&self) -> Option<String> {
        self.current().map(|s| s.params.username.clone())
    }

    pub fn register(&self, source: String, handler: DeliveryHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source, handler);
    }

    pub fn unregister(&self, source: &str) -> Option<DeliveryHandler> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source)
    }

    fn handler_for(&self, source: &str) -> Option<DeliveryHandler> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
            .cloned()
    }

    /// Stamp headers and publish, re-acquiring the channel once on a
    /// transient failure.
    pub async fn publish(
        &self,
        exchange: Option<&str>,
        target: &str,
        envelope: Envelope,
        options: &PublishOptions,
    ) -> YardResult<()> {
        let state = self.require()?;
        let (body, properties) = stamp(envelope, &state.params.username, options)?;

        let _guard = self.publish_lock.lock().await;
        let channel = state.publish_channel();
        match channel.publish(exchange, target, &body, &properties).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                tracing::warn!(target_key = %target, "publish failed, re-acquiring channel: {}", e);
                let fresh = state
                    .connection
                    .open_channel()
                    .await
                    .map_err(|e| YardError::Transport(format!("channel re-acquisition failed: {e}")))?;
                *state
                    .publish_channel
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = fresh.clone();
                fresh
                    .publish(exchange, target, &body, &properties)
                    .await
                    .map_err(|e| match e {
                        YardError::Transport(_) => e,
                        other => YardError::Transport(other.to_string()),
                    })
            }
            Err(e) => Err(e),
        }
    }

    /// Drain the consume channel into registered handlers until stopped.
    pub async fn run(&self) -> YardResult<()> {
        if self.consuming.swap(true, Ordering::SeqCst) {
            return Err(YardError::Other("consume loop already running".into()));
        }
        let _guard = ConsumingGuard {
            consuming: &self.consuming,
            stop: &self.stop,
        };

        // A stop requested before the loop got to run still counts.
        let mut stop = self.stop.subscribe();
        if *stop.borrow_and_update() {
            tracing::debug!("stop requested before the consume loop started");
            return Ok(());
        }

        loop {
            let state = self.require()?;
            let channel = state.consume_channel.clone();

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow_and_update() {
                        break;
                    }
                }
                delivery = channel.recv() => match delivery {
                    Some(delivery) => self.dispatch(delivery),
                    None => {
                        let replaced = self
                            .current()
                            .is_some_and(|s| !Arc::ptr_eq(&s.consume_channel, &channel));
                        if !replaced {
                            tracing::warn!("consume channel closed");
                            break;
                        }
                    }
                },
            }
        }

        tracing::debug!("consume loop ended");
        Ok(())
    }

    fn dispatch(&self, delivery: Delivery) {
        match self.handler_for(&delivery.source) {
            Some(handler) => handler(delivery),
            None => tracing::debug!(source = %delivery.source, "no handler for delivery, dropping"),
        }
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::SeqCst)
    }

    pub async fn close(&self) -> YardResult<()> {
        if self.is_consuming() {
            self.stop();
        }
        let previous = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(state) = previous {
            state.connection.close().await?;
        }
        Ok(())
    }
}

/// Stamp publish headers onto `envelope` and mirror them into broker
/// properties. Returns the wire body and the properties.
pub(crate) fn stamp(
    mut envelope: Envelope,
    username: &str,
    options: &PublishOptions,
) -> YardResult<(Vec<u8>, MessageProperties)> {
    envelope.headers.timestamp = Some(now_millis());
    envelope.headers.user_id = Some(username.to_string());
    if options.reply_to.is_some() {
        envelope.headers.reply_to = options.reply_to.clone();
    }
    if options.correlation_id.is_some() {
        envelope.headers.correlation_id = options.correlation_id.clone();
    }

    let properties = MessageProperties {
        reply_to: envelope.headers.reply_to.clone(),
        correlation_id: envelope.headers.correlation_id.clone(),
        user_id: envelope.headers.user_id.clone(),
        timestamp: envelope.headers.timestamp,
    };
    Ok((envelope.to_bytes()?, properties))
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
