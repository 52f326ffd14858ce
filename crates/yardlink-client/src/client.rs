//! The agent client.
//!
//! `AgentClient` owns the identity, credentials, codec, transport and
//! reconnect supervisor, and exposes the agent's publish and consume
//! operations on top of them.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use yardlink_core::codec::{EnvelopeCodec, EnvelopeHeaders};
use yardlink_core::error::{YardError, YardResult};
use yardlink_core::identity::{Credentials, Identity};
use yardlink_core::messages::{
    AgentCurrentResources, AgentMessage, AgentState, AgentStateBody, AssignmentCurrentStatus,
    MissionRequestBody, Pose, SensorsBody, AGENT_SENSORS, AGENT_STATE, AGENT_UPDATE,
    MISSION_REQUEST,
};
use yardlink_core::routing::Purpose;
use yardlink_core::transport::{ConnectParams, PublishOptions};

use crate::config::AgentConfig;
use crate::database::DatabaseConnector;
use crate::handshake::{CheckinOutcome, CheckinRequest, HandshakeController, HandshakeState};
use crate::router::MessageRouter;
use crate::supervisor::{PublishOutcome, ReconnectSupervisor, RetryPolicy};
use crate::transport::{AnyTransport, TransportFactory, TransportKind};

/// Last state the agent reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentStatus {
    pub status: AgentState,
    pub resources: Option<AgentCurrentResources>,
    pub assignment: Option<AssignmentCurrentStatus>,
    pub pose: Pose,
}

impl AgentStatus {
    /// `ready` when reserved for a work process, otherwise `free`.
    pub fn idle_status(&self) -> AgentState {
        match &self.resources {
            Some(r) if r.reserved => AgentState::Ready,
            _ => AgentState::Free,
        }
    }
}

pub struct AgentClient {
    identity: RwLock<Identity>,
    credentials: RwLock<Option<Credentials>>,
    codec: Arc<EnvelopeCodec>,
    factory: TransportFactory,
    transport: AnyTransport,
    supervisor: ReconnectSupervisor,
    /// Host, port and TLS settings; the account is filled in per connect.
    endpoint: ConnectParams,
    yard_uid: RwLock<Option<String>>,
    checkin_data: RwLock<Option<Map<String, Value>>>,
    checkin_state: RwLock<Option<HandshakeState>>,
    status: Mutex<AgentStatus>,
    sign_messages: bool,
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(PoisonError::into_inner) = value;
}

impl AgentClient {
    pub fn new(
        factory: TransportFactory,
        endpoint: ConnectParams,
        identity: Identity,
        policy: RetryPolicy,
    ) -> Self {
        let codec = Arc::new(EnvelopeCodec::new(Some(identity.signer().clone())));
        let transport = factory.build();
        Self {
            identity: RwLock::new(identity),
            credentials: RwLock::new(None),
            codec,
            factory,
            transport,
            supervisor: ReconnectSupervisor::new(policy),
            endpoint,
            yard_uid: RwLock::new(None),
            checkin_data: RwLock::new(None),
            checkin_state: RwLock::new(None),
            status: Mutex::new(AgentStatus::default()),
            sign_messages: false,
        }
    }

    /// Client over the network backend selected by `config`.
    pub fn from_config(config: &AgentConfig, identity: Identity) -> YardResult<Self> {
        let kind: TransportKind = config.transport()?;
        let factory = TransportFactory::for_network(kind, config.exchanges.clone())?;
        let endpoint = config.endpoint()?;
        let mut client = Self::new(factory, endpoint, identity, config.retry.policy());
        client.sign_messages = config.checkin.sign_messages;
        Ok(client)
    }

    /// Sign every outbound agent message.
    pub fn with_signed_messages(mut self, sign: bool) -> Self {
        self.sign_messages = sign;
        self
    }

    /// Use credentials issued out of band.
    pub fn with_credentials(self, credentials: Credentials) -> YardResult<Self> {
        if let Some(key) = credentials.counterpart_key()? {
            self.codec.set_counterpart(Some(key));
        }
        write(&self.credentials, Some(credentials));
        Ok(self)
    }

    pub fn uuid(&self) -> String {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .uuid()
            .to_string()
    }

    pub fn identity(&self) -> Identity {
        read(&self.identity)
    }

    pub fn credentials(&self) -> Option<Credentials> {
        read(&self.credentials)
    }

    /// Terminal state of the most recent check-in, if one has run.
    pub fn checkin_state(&self) -> Option<HandshakeState> {
        read(&self.checkin_state)
    }

    pub fn username(&self) -> Option<String> {
        self.transport
            .username()
            .or_else(|| self.credentials().map(|c| c.username))
    }

    pub fn codec(&self) -> Arc<EnvelopeCodec> {
        self.codec.clone()
    }

    pub fn transport(&self) -> &AnyTransport {
        &self.transport
    }

    pub fn supervisor(&self) -> &ReconnectSupervisor {
        &self.supervisor
    }

    pub fn endpoint(&self) -> &ConnectParams {
        &self.endpoint
    }

    pub fn yard_uid(&self) -> Option<String> {
        read(&self.yard_uid)
    }

    /// Body of the last successful check-in reply, password removed.
    pub fn checkin_data(&self) -> Option<Map<String, Value>> {
        read(&self.checkin_data)
    }

    pub fn status(&self) -> AgentStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn ensure_connected(&self) -> YardResult<()> {
        if self.transport.is_connected() || self.credentials().is_some() {
            Ok(())
        } else {
            Err(YardError::AuthenticationRequired(
                "connect or check in first".into(),
            ))
        }
    }

    /// Connect with an existing broker account.
    pub async fn connect(&self, username: &str, password: &str) -> YardResult<()> {
        let params = self.endpoint.with_account(username, password);
        self.supervisor
            .connect(username, || self.transport.connect(params.clone()))
            .await
            .map_err(|e| match e {
                YardError::AccountConnection { .. } => e,
                other => {
                    warn!(%username, "connect failed: {}", other);
                    YardError::AccountConnection {
                        username: username.to_string(),
                        attempts: 1,
                    }
                }
            })?;

        let mut credentials = self.credentials().unwrap_or_default();
        credentials.username = username.to_string();
        credentials.password = password.to_string();
        write(&self.credentials, Some(credentials));
        info!(%username, "connected");
        Ok(())
    }

    /// Run the check-in handshake and adopt its results.
    pub async fn perform_checkin(&self, request: CheckinRequest) -> YardResult<CheckinOutcome> {
        let yard_uid = request.yard_uid.clone();
        let mut identity = self.identity();
        let controller = HandshakeController::new(
            &self.transport,
            &self.factory,
            &self.codec,
            &self.supervisor,
            &self.endpoint,
        );
        let result = controller.run(&mut identity, request).await;
        write(&self.checkin_state, Some(controller.state()));
        let outcome = result?;

        write(&self.identity, identity);
        if let Some(issued) = &outcome.credentials {
            write(&self.credentials, Some(issued.clone()));
        }
        write(&self.yard_uid, Some(yard_uid));
        write(&self.checkin_data, Some(outcome.checkin_data.clone()));
        Ok(outcome)
    }

    /// Reconnect with the stored credentials. One attempt; retries belong to
    /// the supervisor.
    pub async fn reconnect(&self) -> YardResult<()> {
        let credentials = self.credentials().ok_or_else(|| {
            YardError::AuthenticationRequired("no credentials to reconnect with".into())
        })?;
        let mut params = self
            .endpoint
            .with_account(&credentials.username, &credentials.password);
        if params.enable_ssl && credentials.ca_certificate.is_some() {
            params.ca_certificate = credentials.ca_certificate.clone();
        }
        self.transport.connect(params).await
    }

    /// Publish `message` on this agent's `purpose` channel.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        purpose: Purpose,
        message: &T,
        signed: bool,
    ) -> YardResult<PublishOutcome> {
        self.ensure_connected()?;
        let envelope = self
            .codec
            .encode_envelope(message, EnvelopeHeaders::default(), signed)?;
        let target = self.transport.scheme().routing_key(&self.uuid(), purpose);
        let username = self.username().unwrap_or_default();

        self.supervisor
            .publish(
                &username,
                || {
                    self.transport
                        .publish(&target, envelope.clone(), PublishOptions::default())
                },
                || self.reconnect(),
            )
            .await
    }

    /// Report the agent's state and resources.
    pub async fn publish_state(
        &self,
        status: AgentState,
        resources: Option<AgentCurrentResources>,
        assignment: Option<AssignmentCurrentStatus>,
    ) -> YardResult<PublishOutcome> {
        {
            let mut cached = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            cached.status = status;
            if resources.is_some() {
                cached.resources = resources.clone();
            }
            if assignment.is_some() {
                cached.assignment = assignment.clone();
            }
        }
        let body = AgentStateBody {
            status,
            resources,
            assignment,
        };
        let message = AgentMessage::new(AGENT_STATE, &self.uuid(), body);
        self.publish(Purpose::State, &message, self.sign_messages).await
    }

    /// Report position and free-form sensor data.
    pub async fn publish_sensors(&self, pose: Pose, sensors: Value) -> YardResult<PublishOutcome> {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pose = pose.clone();
        let message = AgentMessage::new(AGENT_SENSORS, &self.uuid(), SensorsBody { pose, sensors });
        self.publish(Purpose::Visualization, &message, self.sign_messages)
            .await
    }

    /// Update agent properties (name, factsheet, ...).
    pub async fn publish_general_updates(&self, body: Value) -> YardResult<PublishOutcome> {
        let message = AgentMessage::new(AGENT_UPDATE, &self.uuid(), body);
        self.publish(Purpose::Update, &message, self.sign_messages).await
    }

    pub async fn request_mission(
        &self,
        mission_name: &str,
        data: Value,
        tools_uuids: Vec<String>,
        sched_start_at: Option<String>,
    ) -> YardResult<PublishOutcome> {
        let body = MissionRequestBody {
            work_process_type_name: mission_name.to_string(),
            data,
            tools_uuids,
            yard_uid: self.yard_uid(),
            sched_start_at,
        };
        let message = AgentMessage::new(MISSION_REQUEST, &self.uuid(), body);
        self.publish(Purpose::MissionRequest, &message, self.sign_messages)
            .await
    }

    /// Route this agent's assignment channel through `router`.
    pub async fn consume_assignments(&self, router: MessageRouter) -> YardResult<String> {
        self.subscribe(Purpose::Assignment, router).await
    }

    /// Route this agent's instant-actions channel through `router`.
    pub async fn consume_instant_actions(&self, router: MessageRouter) -> YardResult<String> {
        self.subscribe(Purpose::InstantActions, router).await
    }

    async fn subscribe(&self, purpose: Purpose, router: MessageRouter) -> YardResult<String> {
        self.ensure_connected()?;
        let target = self.transport.scheme().routing_key(&self.uuid(), purpose);
        let source = self.transport.subscribe(&target, router.into_handler()).await?;
        info!(%target, %source, "consuming");
        Ok(source)
    }

    /// Run the consume loop until [`stop_consuming`](Self::stop_consuming).
    pub async fn start_consuming(&self) -> YardResult<()> {
        self.ensure_connected()?;
        self.transport.start_consuming().await
    }

    pub fn stop_consuming(&self) {
        self.transport.stop_consuming();
    }

    /// Request/response helper for the yard database.
    pub fn database(&self) -> DatabaseConnector<'_> {
        DatabaseConnector::new(self)
    }

    pub async fn close(&self) -> YardResult<()> {
        self.transport.close().await
    }
}
