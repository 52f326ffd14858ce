//! In-process broker.
//!
//! Implements the broker seam without a network: exchanges, routing-key
//! bindings, server-named exclusive queues and topics. A scripted responder
//! plays the server side, and failures can be injected for reconnect tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use yardlink_core::error::{YardError, YardResult};
use yardlink_core::transport::{
    BoxFuture, BrokerChannel, BrokerConnection, BrokerConnector, ConnectParams, Delivery,
    MessageProperties,
};

/// Which personality the broker plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    /// Exchanges, bindings and queues.
    Queue,
    /// Flat topics.
    PubSub,
}

/// A message as the broker received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFrame {
    pub exchange: Option<String>,
    pub target: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub username: String,
}

impl PublishedFrame {
    /// Body as UTF-8 text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Build a reply addressed to this frame's `reply_to`.
    pub fn reply(&self, body: impl Into<Vec<u8>>) -> Option<BrokerReply> {
        let reply_to = self.properties.reply_to.clone()?;
        Some(BrokerReply {
            exchange: None,
            target: reply_to,
            body: body.into(),
            properties: MessageProperties {
                correlation_id: self.properties.correlation_id.clone(),
                ..MessageProperties::default()
            },
        })
    }
}

/// A message the scripted server sends back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerReply {
    pub exchange: Option<String>,
    pub target: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

pub type Responder = Arc<dyn Fn(&PublishedFrame) -> Vec<BrokerReply> + Send + Sync>;

#[derive(Default)]
struct Queue {
    owner: Option<u64>,
    consumer: Option<u64>,
    pending: Vec<Delivery>,
}

struct ChannelSlot {
    connection: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct State {
    mode: BrokerMode,
    allow_anonymous: bool,
    accounts: HashMap<String, String>,
    queues: HashMap<String, Queue>,
    bindings: Vec<(String, String, String)>,
    topics: Vec<(String, u64)>,
    channels: HashMap<u64, ChannelSlot>,
    connections: HashMap<u64, Arc<AtomicBool>>,
    published: Vec<PublishedFrame>,
    connect_log: Vec<String>,
    responder: Option<Responder>,
    fail_publishes: u32,
    fail_connects: u32,
    next_id: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn deliver_to_queue(&mut self, queue: &str, delivery: Delivery) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };
        let sender = q.consumer.and_then(|id| self.channels.get(&id));
        match sender {
            Some(slot) => {
                let _ = slot.tx.send(delivery);
            }
            None => q.pending.push(delivery),
        }
    }

    fn route(&mut self, exchange: Option<&str>, target: &str, body: &[u8], properties: &MessageProperties) {
        match self.mode {
            BrokerMode::Queue => {
                let queues: Vec<String> = match exchange.filter(|e| !e.is_empty()) {
                    Some(exchange) => self
                        .bindings
                        .iter()
                        .filter(|(x, rk, _)| x == exchange && rk == target)
                        .map(|(_, _, q)| q.clone())
                        .collect(),
                    None => vec![target.to_string()],
                };
                for queue in queues {
                    let delivery = Delivery {
                        source: queue.clone(),
                        routing_key: target.to_string(),
                        body: body.to_vec(),
                        properties: properties.clone(),
                    };
                    self.deliver_to_queue(&queue, delivery);
                }
            }
            BrokerMode::PubSub => {
                for (topic, channel) in &self.topics {
                    if topic != target {
                        continue;
                    }
                    if let Some(slot) = self.channels.get(channel) {
                        let _ = slot.tx.send(Delivery {
                            source: topic.clone(),
                            routing_key: target.to_string(),
                            body: body.to_vec(),
                            properties: properties.clone(),
                        });
                    }
                }
            }
        }
    }

    fn drop_connection(&mut self, id: u64) {
        if let Some(open) = self.connections.remove(&id) {
            open.store(false, Ordering::SeqCst);
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, slot)| slot.connection == id)
            .map(|(cid, _)| *cid)
            .collect();
        for cid in channels {
            self.drop_channel(cid);
        }
        self.queues.retain(|_, q| q.owner != Some(id));
    }

    fn drop_channel(&mut self, id: u64) {
        self.channels.remove(&id);
        self.topics.retain(|(_, c)| *c != id);
        for q in self.queues.values_mut() {
            if q.consumer == Some(id) {
                q.consumer = None;
            }
        }
    }
}

/// Shared handle to an in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new(mode: BrokerMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                mode,
                allow_anonymous: mode == BrokerMode::Queue,
                accounts: HashMap::new(),
                queues: HashMap::new(),
                bindings: Vec::new(),
                topics: Vec::new(),
                channels: HashMap::new(),
                connections: HashMap::new(),
                published: Vec::new(),
                connect_log: Vec::new(),
                responder: None,
                fail_publishes: 0,
                fail_connects: 0,
                next_id: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Require this password for `username`. With no accounts registered
    /// every non-anonymous login is accepted.
    pub fn add_account(&self, username: &str, password: &str) {
        self.lock()
            .accounts
            .insert(username.to_string(), password.to_string());
    }

    pub fn set_allow_anonymous(&self, allow: bool) {
        self.lock().allow_anonymous = allow;
    }

    /// Install the scripted server side.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&PublishedFrame) -> Vec<BrokerReply> + Send + Sync + 'static,
    {
        self.lock().responder = Some(Arc::new(responder));
    }

    pub fn fail_next_publishes(&self, n: u32) {
        self.lock().fail_publishes = n;
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.lock().fail_connects = n;
    }

    /// Everything published so far.
    pub fn published(&self) -> Vec<PublishedFrame> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, target: &str) -> Vec<PublishedFrame> {
        self.lock()
            .published
            .iter()
            .filter(|f| f.target == target)
            .cloned()
            .collect()
    }

    /// Usernames of every successful connection, in order.
    pub fn connect_log(&self) -> Vec<String> {
        self.lock().connect_log.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Publish as the server would.
    pub fn inject(&self, exchange: Option<&str>, target: &str, body: impl AsRef<[u8]>) {
        self.lock()
            .route(exchange, target, body.as_ref(), &MessageProperties::default());
    }

    /// Drop every connection, as if the broker restarted.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.drop_connection(id);
        }
    }

    fn publish(
        &self,
        exchange: Option<&str>,
        target: &str,
        body: &[u8],
        properties: &MessageProperties,
        username: &str,
    ) -> YardResult<()> {
        let responder = {
            let mut state = self.lock();
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(YardError::Transport("connection reset by peer".into()));
            }
            state.published.push(PublishedFrame {
                exchange: exchange.map(str::to_string),
                target: target.to_string(),
                body: body.to_vec(),
                properties: properties.clone(),
                username: username.to_string(),
            });
            state.route(exchange, target, body, properties);
            state.responder.clone()
        };

        if let Some(responder) = responder {
            let frame = PublishedFrame {
                exchange: exchange.map(str::to_string),
                target: target.to_string(),
                body: body.to_vec(),
                properties: properties.clone(),
                username: username.to_string(),
            };
            let replies = responder(&frame);
            let mut state = self.lock();
            for reply in replies {
                state.route(reply.exchange.as_deref(), &reply.target, &reply.body, &reply.properties);
            }
        }
        Ok(())
    }
}

impl BrokerConnector for MemoryBroker {
    fn connect<'a>(
        &'a self,
        params: &'a ConnectParams,
    ) -> BoxFuture<'a, YardResult<Arc<dyn BrokerConnection>>> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(YardError::Transport("connection refused".into()));
            }
            if params.is_anonymous() {
                if !state.allow_anonymous {
                    return Err(YardError::Transport("ACCESS_REFUSED - anonymous login disabled".into()));
                }
            } else if !state.accounts.is_empty()
                && state.accounts.get(&params.username) != Some(&params.password)
            {
                return Err(YardError::Transport(format!(
                    "ACCESS_REFUSED - login refused for user '{}'",
                    params.username
                )));
            }

            let id = state.next_id();
            let open = Arc::new(AtomicBool::new(true));
            state.connections.insert(id, open.clone());
            state.connect_log.push(params.username.clone());

            let connection: Arc<dyn BrokerConnection> = Arc::new(MemoryConnection {
                broker: self.clone(),
                id,
                username: params.username.clone(),
                open,
            });
            Ok(connection)
        })
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    username: String,
    open: Arc<AtomicBool>,
}

impl BrokerConnection for MemoryConnection {
    fn open_channel(&self) -> BoxFuture<'_, YardResult<Arc<dyn BrokerChannel>>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(YardError::Transport("connection closed".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let mut state = self.broker.lock();
            let id = state.next_id();
            state.channels.insert(
                id,
                ChannelSlot {
                    connection: self.id,
                    tx,
                },
            );
            let channel: Arc<dyn BrokerChannel> = Arc::new(MemoryChannel {
                broker: self.broker.clone(),
                id,
                connection: self.id,
                username: self.username.clone(),
                connection_open: self.open.clone(),
                open: AtomicBool::new(true),
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
            self.broker.lock().drop_connection(self.id);
            Ok(())
        })
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    connection: u64,
    username: String,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> YardResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(YardError::Transport("channel closed".into()))
        }
    }
}

impl BrokerChannel for MemoryChannel {
    fn publish<'a>(
        &'a self,
        exchange: Option<&'a str>,
        target: &'a str,
        body: &'a [u8],
        properties: &'a MessageProperties,
    ) -> BoxFuture<'a, YardResult<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            self.broker
                .publish(exchange, target, body, properties, &self.username)
        })
    }

    fn declare_queue(&self, exclusive: bool) -> BoxFuture<'_, YardResult<String>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            if state.mode == BrokerMode::PubSub {
                return Err(YardError::Unsupported("pub/sub broker has no queues".into()));
            }
            let name = format!("amq.gen-{}", state.next_id());
            state.queues.insert(
                name.clone(),
                Queue {
                    owner: exclusive.then_some(self.connection),
                    ..Queue::default()
                },
            );
            Ok(name)
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, YardResult<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            if !state.queues.contains_key(queue) {
                return Err(YardError::Transport(format!("NOT_FOUND - no queue '{queue}'")));
            }
            state
                .bindings
                .push((exchange.to_string(), routing_key.to_string(), queue.to_string()));
            Ok(())
        })
    }

    fn consume<'a>(&'a self, source: &'a str) -> BoxFuture<'a, YardResult<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            match state.mode {
                BrokerMode::PubSub => {
                    state.topics.push((source.to_string(), self.id));
                }
                BrokerMode::Queue => {
                    let channel_id = self.id;
                    let pending = {
                        let q = state.queues.get_mut(source).ok_or_else(|| {
                            YardError::Transport(format!("NOT_FOUND - no queue '{source}'"))
                        })?;
                        q.consumer = Some(channel_id);
                        std::mem::take(&mut q.pending)
                    };
                    if let Some(slot) = state.channels.get(&channel_id) {
                        for delivery in pending {
                            let _ = slot.tx.send(delivery);
                        }
                    }
                }
            }
            Ok(())
        })
    }

    fn recv(&self) -> BoxFuture<'_, Option<Delivery>> {
        Box::pin(async move { self.rx.lock().await.recv().await })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    fn close(&self) -> BoxFuture<'_, YardResult<()>> {
        Box::pin(async move {
            self.open.store(false, Ordering::SeqCst);
            self.broker.lock().drop_channel(self.id);
            Ok(())
        })
    }
}
