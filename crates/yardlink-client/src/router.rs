//! Typed dispatch of inbound assignment and instant-action messages.
//!
//! A router is built per category. Every frame is opened with the agent's
//! codec before it is classified. Frames whose signature fails, or that are
//! signed while no counterpart key is known, are rejected and never reach a
//! handler.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use yardlink_core::codec::{Authenticity, EnvelopeCodec, SignaturePolicy};
use yardlink_core::error::{ErrorKind, YardError, YardResult};
use yardlink_core::messages::{
    AssignmentCommand, WorkProcessClearance, WorkProcessResourcesRequest, ASSIGNMENT_CANCEL,
    ASSIGNMENT_EXECUTION, RELEASE_FROM_MISSION, RESERVE_FOR_MISSION, WP_CLEARANCE_REQUEST,
};
use yardlink_core::transport::{Delivery, DeliveryHandler};

/// Which downlink a router serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterCategory {
    Assignments,
    InstantActions,
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedMessage {
    AssignmentExecution(AssignmentCommand),
    AssignmentCancel(AssignmentCommand),
    ResourceReserve(WorkProcessResourcesRequest),
    ResourceRelease(WorkProcessResourcesRequest),
    Other(Vec<u8>),
}

fn body_of<T: DeserializeOwned>(message: &Value) -> YardResult<T> {
    let body = message
        .get("body")
        .cloned()
        .ok_or_else(|| YardError::InvalidMessage("message has no body".into()))?;
    Ok(serde_json::from_value(body)?)
}

impl RoutedMessage {
    /// Parse `message` as a known type of `category`. `Ok(None)` when the
    /// type is not one this category handles.
    pub fn decode(
        category: RouterCategory,
        msg_type: &str,
        message: &Value,
    ) -> YardResult<Option<Self>> {
        let routed = match (category, msg_type) {
            (RouterCategory::Assignments, ASSIGNMENT_EXECUTION) => {
                Self::AssignmentExecution(serde_json::from_value(message.clone())?)
            }
            (RouterCategory::InstantActions, ASSIGNMENT_CANCEL) => {
                Self::AssignmentCancel(serde_json::from_value(message.clone())?)
            }
            (RouterCategory::InstantActions, RESERVE_FOR_MISSION) => {
                Self::ResourceReserve(body_of(message)?)
            }
            (RouterCategory::InstantActions, RELEASE_FROM_MISSION) => {
                Self::ResourceRelease(body_of(message)?)
            }
            (RouterCategory::InstantActions, WP_CLEARANCE_REQUEST) => {
                Self::ResourceReserve(body_of::<WorkProcessClearance>(message)?.into())
            }
            _ => return Ok(None),
        };
        Ok(Some(routed))
    }
}

/// Where a frame came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// Queue or topic the frame arrived on.
    pub channel: String,
    /// Broker-reported sender, when the transport carries one.
    pub sender: Option<String>,
    pub authenticity: Option<Authenticity>,
}

/// What [`MessageRouter::route`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Dispatched,
    Fallback,
    /// Signature check failed.
    Rejected,
    /// Known type that failed to parse.
    Dropped,
}

pub type Handler<T> = Box<dyn Fn(&MessageContext, T) + Send + Sync>;
pub type FallbackHandler = Box<dyn Fn(&MessageContext, &[u8]) + Send + Sync>;

/// One handler slot per message kind plus a fallback.
pub struct MessageRouter {
    category: RouterCategory,
    codec: Arc<EnvelopeCodec>,
    policy: SignaturePolicy,
    on_execution: Handler<AssignmentCommand>,
    on_cancel: Handler<AssignmentCommand>,
    on_reserve: Handler<WorkProcessResourcesRequest>,
    on_release: Handler<WorkProcessResourcesRequest>,
    on_other: FallbackHandler,
}

impl MessageRouter {
    fn with_category(category: RouterCategory, codec: Arc<EnvelopeCodec>) -> Self {
        Self {
            category,
            codec,
            policy: SignaturePolicy::AllowUnsigned,
            on_execution: Box::new(|ctx, cmd| {
                info!(channel = %ctx.channel, work_process_id = cmd.work_process_id, "assignment received")
            }),
            on_cancel: Box::new(|ctx, cmd| {
                info!(channel = %ctx.channel, work_process_id = cmd.work_process_id, "cancel received")
            }),
            on_reserve: Box::new(|ctx, req| {
                info!(channel = %ctx.channel, work_process_id = req.work_process_id, "reserve received")
            }),
            on_release: Box::new(|ctx, req| {
                info!(channel = %ctx.channel, work_process_id = req.work_process_id, "release received")
            }),
            on_other: Box::new(|ctx, raw| {
                info!(channel = %ctx.channel, bytes = raw.len(), "unrouted message received")
            }),
        }
    }

    /// Router for the assignment channel.
    pub fn assignments(codec: Arc<EnvelopeCodec>) -> Self {
        Self::with_category(RouterCategory::Assignments, codec)
    }

    /// Router for the instant-actions channel.
    pub fn instant_actions(codec: Arc<EnvelopeCodec>) -> Self {
        Self::with_category(RouterCategory::InstantActions, codec)
    }

    pub fn category(&self) -> RouterCategory {
        self.category
    }

    pub fn policy(mut self, policy: SignaturePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn on_execution<F>(mut self, f: F) -> Self
    where
        F: Fn(&MessageContext, AssignmentCommand) + Send + Sync + 'static,
    {
        self.on_execution = Box::new(f);
        self
    }

    pub fn on_cancel<F>(mut self, f: F) -> Self
    where
        F: Fn(&MessageContext, AssignmentCommand) + Send + Sync + 'static,
    {
        self.on_cancel = Box::new(f);
        self
    }

    pub fn on_reserve<F>(mut self, f: F) -> Self
    where
        F: Fn(&MessageContext, WorkProcessResourcesRequest) + Send + Sync + 'static,
    {
        self.on_reserve = Box::new(f);
        self
    }

    pub fn on_release<F>(mut self, f: F) -> Self
    where
        F: Fn(&MessageContext, WorkProcessResourcesRequest) + Send + Sync + 'static,
    {
        self.on_release = Box::new(f);
        self
    }

    pub fn on_other<F>(mut self, f: F) -> Self
    where
        F: Fn(&MessageContext, &[u8]) + Send + Sync + 'static,
    {
        self.on_other = Box::new(f);
        self
    }

    /// Open, classify and dispatch one frame.
    pub fn route(&self, channel: &str, sender: Option<&str>, raw: &[u8]) -> RouteOutcome {
        let mut ctx = MessageContext {
            channel: channel.to_string(),
            sender: sender.map(str::to_string),
            authenticity: None,
        };

        let opened = match self.codec.open_frame(raw, self.policy) {
            Ok(opened) => opened,
            Err(e) if e.kind() == ErrorKind::SignatureVerification => {
                warn!(%channel, sender = ?sender, "rejecting frame: {}", e);
                return RouteOutcome::Rejected;
            }
            Err(e) => {
                debug!(%channel, "cannot open frame, using fallback: {}", e);
                self.dispatch(&ctx, RoutedMessage::Other(raw.to_vec()));
                return RouteOutcome::Fallback;
            }
        };
        if opened.authenticity == Authenticity::Unverifiable {
            warn!(%channel, sender = ?sender, "rejecting signed frame: no counterpart key to verify it");
            return RouteOutcome::Rejected;
        }
        ctx.authenticity = Some(opened.authenticity);

        let Some(msg_type) = opened.message.get("type").and_then(Value::as_str) else {
            debug!(%channel, "message has no type, using fallback");
            self.dispatch(&ctx, RoutedMessage::Other(raw.to_vec()));
            return RouteOutcome::Fallback;
        };

        match RoutedMessage::decode(self.category, msg_type, &opened.message) {
            Ok(Some(routed)) => {
                debug!(%channel, %msg_type, "dispatching");
                self.dispatch(&ctx, routed);
                RouteOutcome::Dispatched
            }
            Ok(None) => {
                self.dispatch(&ctx, RoutedMessage::Other(raw.to_vec()));
                RouteOutcome::Fallback
            }
            Err(e) => {
                warn!(%channel, %msg_type, "dropping unparseable message: {}", e);
                RouteOutcome::Dropped
            }
        }
    }

    fn dispatch(&self, ctx: &MessageContext, routed: RoutedMessage) {
        match routed {
            RoutedMessage::AssignmentExecution(cmd) => (self.on_execution)(ctx, cmd),
            RoutedMessage::AssignmentCancel(cmd) => (self.on_cancel)(ctx, cmd),
            RoutedMessage::ResourceReserve(req) => (self.on_reserve)(ctx, req),
            RoutedMessage::ResourceRelease(req) => (self.on_release)(ctx, req),
            RoutedMessage::Other(raw) => (self.on_other)(ctx, &raw),
        }
    }

    /// Wrap the router as a transport delivery handler.
    pub fn into_handler(self) -> DeliveryHandler {
        let router = Arc::new(self);
        Arc::new(move |delivery: Delivery| {
            router.route(
                &delivery.source,
                delivery.properties.user_id.as_deref(),
                &delivery.body,
            );
        })
    }
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("category", &self.category)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use yardlink_core::signing::Signer;

    const SERVER_KEY: &str = include_str!("../tests/fixtures/server_private.pem");

    fn frame(message: serde_json::Value) -> Vec<u8> {
        json!({"message": message.to_string(), "signature": null})
            .to_string()
            .into_bytes()
    }

    fn execution() -> serde_json::Value {
        json!({
            "type": "assignment_execution",
            "work_process_id": 7,
            "assignment_metadata": {"id": 1, "yard_id": 2, "status": "executing", "context": {}},
            "body": {"path": [1, 2]},
            "_version": "3.0.0"
        })
    }

    #[test]
    fn execution_goes_to_its_slot() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let router = MessageRouter::assignments(Arc::new(EnvelopeCodec::default()))
            .on_execution(move |_, cmd| sink.lock().unwrap().push(cmd.work_process_id));

        let outcome = router.route("amq.gen-1", Some("helyos"), &frame(execution()));
        assert_eq!(outcome, RouteOutcome::Dispatched);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn unknown_type_falls_back_with_raw_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let router = MessageRouter::assignments(Arc::new(EnvelopeCodec::default()))
            .on_other(move |_, raw| sink.lock().unwrap().push(raw.to_vec()));

        let raw = frame(json!({"type": "vda5050_order", "body": {}}));
        assert_eq!(router.route("q", None, &raw), RouteOutcome::Fallback);
        assert_eq!(*seen.lock().unwrap(), vec![raw.clone()]);

        assert_eq!(router.route("q", None, b"garbage"), RouteOutcome::Fallback);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn instant_actions_map_legacy_clearance_to_reserve() {
        let reserved = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::new(Mutex::new(Vec::new()));
        let (r1, r2) = (reserved.clone(), released.clone());
        let router = MessageRouter::instant_actions(Arc::new(EnvelopeCodec::default()))
            .on_reserve(move |_, req| r1.lock().unwrap().push(req))
            .on_release(move |_, req| r2.lock().unwrap().push(req));

        let legacy = frame(json!({"type": "wp_clearance_request",
            "body": {"wp_id": 5, "operation_types_required": ["drive"], "reserved": true}}));
        let release = frame(json!({"type": "release_from_mission",
            "body": {"work_process_id": 5, "operation_types_required": [], "reserved": false}}));
        assert_eq!(router.route("q", None, &legacy), RouteOutcome::Dispatched);
        assert_eq!(router.route("q", None, &release), RouteOutcome::Dispatched);

        assert_eq!(reserved.lock().unwrap()[0].work_process_id, 5);
        assert!(reserved.lock().unwrap()[0].reserved);
        assert!(!released.lock().unwrap()[0].reserved);
    }

    #[test]
    fn parse_errors_for_known_types_are_dropped() {
        let router = MessageRouter::instant_actions(Arc::new(EnvelopeCodec::default()))
            .on_reserve(|_, _| panic!("handler must not run"));
        let raw = frame(json!({"type": "reserve_for_mission", "body": {"reserved": "maybe"}}));
        assert_eq!(router.route("q", None, &raw), RouteOutcome::Dropped);
    }

    #[test]
    fn bad_signatures_are_rejected() {
        let server = Signer::from_pem(SERVER_KEY).unwrap();
        let codec = EnvelopeCodec::default().with_counterpart(server.public_key().clone());
        let router = MessageRouter::assignments(Arc::new(codec))
            .on_execution(|_, _| panic!("handler must not run"))
            .on_other(|_, _| panic!("fallback must not run"));

        let message = execution().to_string();
        let mut sig = server.sign(&message).unwrap();
        sig[10] ^= 1;
        let raw = json!({"message": message, "signature": sig}).to_string();
        assert_eq!(router.route("q", None, raw.as_bytes()), RouteOutcome::Rejected);
    }

    #[test]
    fn signed_frames_need_a_counterpart_key() {
        let stranger = Signer::from_pem(SERVER_KEY).unwrap();
        let router = MessageRouter::assignments(Arc::new(EnvelopeCodec::default()))
            .on_execution(|_, _| panic!("handler must not run"))
            .on_other(|_, _| panic!("fallback must not run"));

        let message = execution().to_string();
        let sig = stranger.sign(&message).unwrap();
        let raw = json!({"message": message, "signature": sig}).to_string();
        assert_eq!(router.route("q", None, raw.as_bytes()), RouteOutcome::Rejected);
    }

    #[test]
    fn verified_frames_carry_their_authenticity() {
        let server = Signer::from_pem(SERVER_KEY).unwrap();
        let codec = EnvelopeCodec::default().with_counterpart(server.public_key().clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let router = MessageRouter::assignments(Arc::new(codec))
            .on_execution(move |ctx, _| sink.lock().unwrap().push(ctx.authenticity));

        let message = execution().to_string();
        let sig = server.sign(&message).unwrap();
        let raw = json!({"message": message, "signature": sig}).to_string();
        assert_eq!(router.route("q", None, raw.as_bytes()), RouteOutcome::Dispatched);
        assert_eq!(*seen.lock().unwrap(), vec![Some(Authenticity::Verified)]);
    }

    #[test]
    fn dispatch_preserves_delivery_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = MessageRouter::assignments(Arc::new(EnvelopeCodec::default()))
            .on_execution(move |_, cmd| sink.lock().unwrap().push(cmd.work_process_id))
            .into_handler();

        for id in [3, 1, 2] {
            let mut msg = execution();
            msg["work_process_id"] = json!(id);
            handler(Delivery {
                source: "q".into(),
                routing_key: "agent.u.assignment".into(),
                body: frame(msg),
                properties: Default::default(),
            });
        }
        assert_eq!(*seen.lock().unwrap(), vec![3, 1, 2]);
    }
}
