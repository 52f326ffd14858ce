//! Check-in handshake.
//!
//! Provisions broker credentials for an agent: publish a check-in request
//! (over an anonymous bootstrap connection when the agent has no account
//! yet), wait for the reply, then reconnect with the issued account.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use yardlink_core::codec::{EnvelopeCodec, EnvelopeHeaders, SignaturePolicy};
use yardlink_core::error::{ErrorKind, YardError, YardResult};
use yardlink_core::identity::{Credentials, Identity};
use yardlink_core::messages::{CheckinBody, CheckinMessage, CheckinResponse, CHECKIN};
use yardlink_core::routing::Purpose;
use yardlink_core::signing::{public_key_to_pem, PublicKeyInput};
use yardlink_core::transport::{ConnectParams, Delivery, DeliveryHandler, PublishOptions, ANONYMOUS_USER};

use crate::supervisor::ReconnectSupervisor;
use crate::transport::{AnyTransport, TransportFactory};

/// Failed replies tolerated before the check-in is abandoned.
pub const MAX_CHECKIN_ATTEMPTS: u32 = 3;

/// Token sent by agents that were not issued one.
pub const DEFAULT_REGISTRATION_TOKEN: &str = "0000-0000-0000-0000-0000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unauthenticated,
    AwaitingAnonymousBootstrap,
    WaitingForCheckinResponse,
    Authenticated,
    Failed,
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Authenticated | Self::Failed)
    }

    fn can_move_to(self, next: HandshakeState) -> bool {
        use HandshakeState::*;
        match (self, next) {
            (Authenticated | Failed, _) => false,
            (_, Failed) => true,
            (Unauthenticated, AwaitingAnonymousBootstrap | WaitingForCheckinResponse) => true,
            (AwaitingAnonymousBootstrap, WaitingForCheckinResponse) => true,
            (WaitingForCheckinResponse, Authenticated) => true,
            _ => false,
        }
    }
}

/// Mutable state of one check-in.
#[derive(Debug, Clone)]
pub struct HandshakeSession {
    state: HandshakeState,
    reply_channel_id: Option<String>,
    attempt_count: u32,
    yard_id: String,
}

impl HandshakeSession {
    pub fn new(yard_id: impl Into<String>) -> Self {
        Self {
            state: HandshakeState::Unauthenticated,
            reply_channel_id: None,
            attempt_count: 0,
            yard_id: yard_id.into(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn reply_channel_id(&self) -> Option<&str> {
        self.reply_channel_id.as_deref()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn yard_id(&self) -> &str {
        &self.yard_id
    }

    pub fn transition(&mut self, next: HandshakeState) -> YardResult<()> {
        if !self.state.can_move_to(next) {
            return Err(YardError::Other(format!(
                "invalid handshake transition {:?} -> {:?}",
                self.state, next
            )));
        }
        debug!(from = ?self.state, to = ?next, yard = %self.yard_id, "handshake transition");
        self.state = next;
        Ok(())
    }

    /// Move to `Failed` unless already terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = HandshakeState::Failed;
        }
    }

    /// Count a failed reply. Errors once the budget is spent.
    fn record_failure(&mut self, error: &YardError) -> YardResult<()> {
        self.attempt_count += 1;
        warn!(
            attempt = self.attempt_count,
            error = %error,
            "check-in reply not usable, still waiting"
        );
        if self.attempt_count > MAX_CHECKIN_ATTEMPTS {
            return Err(YardError::CheckinRetriesExhausted {
                attempts: self.attempt_count,
            });
        }
        Ok(())
    }
}

/// Extra acceptance check run on a successful reply.
pub type CheckinGuard = Arc<dyn Fn(&CheckinResponse) -> bool + Send + Sync>;

/// Parameters of one check-in.
#[derive(Clone)]
pub struct CheckinRequest {
    pub yard_uid: String,
    pub status: String,
    pub registration_token: String,
    /// Additional body fields. Each request owns its own map.
    pub extra: Map<String, Value>,
    /// Sign the request with the agent key.
    pub sign: bool,
    pub policy: SignaturePolicy,
    pub guard: Option<CheckinGuard>,
}

impl CheckinRequest {
    pub fn new(yard_uid: impl Into<String>) -> Self {
        Self {
            yard_uid: yard_uid.into(),
            status: "free".into(),
            registration_token: DEFAULT_REGISTRATION_TOKEN.into(),
            extra: Map::new(),
            sign: false,
            policy: SignaturePolicy::AllowUnsigned,
            guard: None,
        }
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn registration_token(mut self, token: impl Into<String>) -> Self {
        self.registration_token = token.into();
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn signed(mut self, sign: bool) -> Self {
        self.sign = sign;
        self
    }

    pub fn policy(mut self, policy: SignaturePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&CheckinResponse) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }
}

impl fmt::Debug for CheckinRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckinRequest")
            .field("yard_uid", &self.yard_uid)
            .field("status", &self.status)
            .field("extra", &self.extra)
            .field("sign", &self.sign)
            .field("policy", &self.policy)
            .field("guard", &self.guard.is_some())
            .finish()
    }
}

/// What a successful check-in produced.
#[derive(Debug, Clone)]
pub struct CheckinOutcome {
    pub uuid: String,
    pub username: String,
    /// Set when the broker issued a new account.
    pub credentials: Option<Credentials>,
    /// Reply body with the password removed.
    pub checkin_data: Map<String, Value>,
    pub attempts: u32,
    pub state: HandshakeState,
}

/// Drives a check-in against one broker.
pub struct HandshakeController<'a> {
    transport: &'a AnyTransport,
    factory: &'a TransportFactory,
    codec: &'a EnvelopeCodec,
    supervisor: &'a ReconnectSupervisor,
    endpoint: &'a ConnectParams,
    /// State the last `run` finished in.
    last_state: Mutex<HandshakeState>,
}

/// Failures that end the check-in at once instead of counting an attempt.
fn is_fatal(error: &YardError) -> bool {
    matches!(
        error.kind(),
        ErrorKind::CheckinRefused | ErrorKind::CheckinGuardRejected | ErrorKind::SignatureVerification
    )
}

impl<'a> HandshakeController<'a> {
    /// `transport` is the agent's primary transport; it is reused when
    /// connected and receives the issued account otherwise. `endpoint`
    /// supplies host, port and TLS settings.
    pub fn new(
        transport: &'a AnyTransport,
        factory: &'a TransportFactory,
        codec: &'a EnvelopeCodec,
        supervisor: &'a ReconnectSupervisor,
        endpoint: &'a ConnectParams,
    ) -> Self {
        Self {
            transport,
            factory,
            codec,
            supervisor,
            endpoint,
            last_state: Mutex::new(HandshakeState::Unauthenticated),
        }
    }

    /// Where the last check-in ended; `Unauthenticated` before any run.
    pub fn state(&self) -> HandshakeState {
        *self.last_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn anonymous_params(&self) -> ConnectParams {
        let mut params = self.endpoint.with_account(ANONYMOUS_USER, ANONYMOUS_USER);
        params.temporary = true;
        params
    }

    /// Run the check-in to completion.
    ///
    /// On success `identity` carries the uuid the server confirmed.
    pub async fn run(
        &self,
        identity: &mut Identity,
        request: CheckinRequest,
    ) -> YardResult<CheckinOutcome> {
        let mut session = HandshakeSession::new(request.yard_uid.clone());
        let mut guest: Option<AnyTransport> = None;

        let result = self
            .drive(&mut session, &mut guest, identity, &request)
            .await;
        if result.is_err() {
            session.fail();
        }
        *self.last_state.lock().unwrap_or_else(PoisonError::into_inner) = session.state();

        if let Some(guest) = guest {
            if let Err(e) = guest.close().await {
                debug!("closing bootstrap connection: {}", e);
            }
        }

        match &result {
            Ok(outcome) => info!(
                uuid = %outcome.uuid,
                username = %outcome.username,
                yard = %request.yard_uid,
                "check-in complete"
            ),
            Err(e) => warn!(yard = %request.yard_uid, state = ?session.state(), "check-in failed: {}", e),
        }
        result
    }

    async fn drive(
        &self,
        session: &mut HandshakeSession,
        guest: &mut Option<AnyTransport>,
        identity: &mut Identity,
        request: &CheckinRequest,
    ) -> YardResult<CheckinOutcome> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let handler: DeliveryHandler = Arc::new(move |delivery| {
            let _ = tx.send(delivery);
        });

        let anonymous = !self.transport.is_connected();
        if anonymous {
            session.transition(HandshakeState::AwaitingAnonymousBootstrap)?;
            let bootstrap = guest.insert(self.factory.build());
            bootstrap.connect(self.anonymous_params()).await?;
        }
        let active: &AnyTransport = match guest.as_ref() {
            Some(g) => g,
            None => self.transport,
        };

        let reply_id = active.open_reply_channel(identity.uuid(), handler).await?;
        session.reply_channel_id = Some(reply_id.clone());
        session.transition(HandshakeState::WaitingForCheckinResponse)?;

        let message = CheckinMessage {
            msg_type: CHECKIN.into(),
            uuid: identity.uuid().to_string(),
            status: request.status.clone(),
            body: CheckinBody {
                yard_uid: request.yard_uid.clone(),
                status: request.status.clone(),
                public_key: identity.public_key_pem()?,
                public_key_format: "PEM".into(),
                registration_token: request.registration_token.clone(),
                extra: request.extra.clone(),
            },
        };
        let envelope = self
            .codec
            .encode_envelope(&message, EnvelopeHeaders::default(), request.sign)?;
        let target = active.scheme().routing_key(identity.uuid(), Purpose::Checkin);
        active
            .publish(
                &target,
                envelope,
                PublishOptions {
                    reply_to: Some(reply_id.clone()),
                    ..PublishOptions::default()
                },
            )
            .await?;
        debug!(%target, reply_to = %reply_id, anonymous, "check-in request published");

        let waiting = wait_for_reply(self.codec, session, &mut rx, request, anonymous);
        let mut response = if active.is_consuming() {
            waiting.await?
        } else {
            tokio::select! {
                reply = waiting => reply?,
                ended = active.start_consuming() => {
                    ended?;
                    return Err(YardError::Transport(
                        "consume loop ended before the check-in reply".into(),
                    ));
                }
            }
        };
        if let Err(e) = active.unsubscribe(&reply_id).await {
            debug!("dropping reply channel: {}", e);
        }

        let current_username = active.username().unwrap_or_default();
        let username = response
            .username()
            .map(str::to_string)
            .unwrap_or(current_username);
        let ca_certificate = response
            .ca_certificate()
            .map(str::to_string)
            .or_else(|| self.endpoint.ca_certificate.clone());

        let counterpart = match response.server_public_key() {
            Some(value) => Some(PublicKeyInput::from_json(value)?.parse()?),
            None => None,
        };
        let counterpart_pem = counterpart.as_ref().map(public_key_to_pem).transpose()?;

        let credentials = match response.take_password() {
            Some(password) => {
                let mut params = self.endpoint.with_account(&username, &password);
                if params.enable_ssl {
                    params.ca_certificate = ca_certificate.clone();
                }
                self.supervisor
                    .connect(&username, || self.transport.connect(params.clone()))
                    .await?;
                Some(Credentials {
                    username: username.clone(),
                    password,
                    ca_certificate,
                    counterpart_public_key: counterpart_pem,
                })
            }
            None => None,
        };

        if let Some(uuid) = response.uuid.clone() {
            identity.set_uuid(uuid);
        }
        session.transition(HandshakeState::Authenticated)?;
        // The server key is trusted only once the account is live.
        if let Some(key) = counterpart {
            self.codec.set_counterpart(Some(key));
        }

        Ok(CheckinOutcome {
            uuid: identity.uuid().to_string(),
            username,
            credentials,
            checkin_data: response.body,
            attempts: session.attempt_count(),
            state: session.state(),
        })
    }
}

/// Consume replies until one is accepted, a fatal error occurs, or the
/// attempt budget is spent.
async fn wait_for_reply(
    codec: &EnvelopeCodec,
    session: &mut HandshakeSession,
    rx: &mut mpsc::UnboundedReceiver<Delivery>,
    request: &CheckinRequest,
    require_account: bool,
) -> YardResult<CheckinResponse> {
    loop {
        let delivery = rx
            .recv()
            .await
            .ok_or_else(|| YardError::Transport("check-in reply channel closed".into()))?;

        match evaluate(codec, &delivery, request, require_account) {
            Ok(Some(response)) => return Ok(response),
            Ok(None) => debug!(source = %delivery.source, "ignoring non check-in reply"),
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => session.record_failure(&e)?,
        }
    }
}

/// Decode, verify and judge one reply. `Ok(None)` for other message types.
fn evaluate(
    codec: &EnvelopeCodec,
    delivery: &Delivery,
    request: &CheckinRequest,
    require_account: bool,
) -> YardResult<Option<CheckinResponse>> {
    let opened = codec.open_frame(&delivery.body, request.policy)?;
    let Some(response) = CheckinResponse::from_message(&opened.message)? else {
        return Ok(None);
    };

    if !response.is_success() {
        return Err(YardError::CheckinRefused {
            code: response.response_code(),
            message: response.message().unwrap_or_default().to_string(),
        });
    }
    if let Some(guard) = &request.guard {
        if !guard(&response) {
            return Err(YardError::CheckinGuardRejected {
                code: response.response_code(),
            });
        }
    }
    if require_account && (response.username().is_none() || response.password().is_none()) {
        return Err(YardError::InvalidMessage(
            "check-in reply carries no broker account".into(),
        ));
    }
    Ok(Some(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use yardlink_core::signing::Signer;

    const SERVER_KEY: &str = include_str!("../tests/fixtures/server_private.pem");

    fn delivery(body: &[u8]) -> Delivery {
        Delivery {
            source: "amq.gen-1".into(),
            routing_key: "amq.gen-1".into(),
            body: body.to_vec(),
            properties: Default::default(),
        }
    }

    fn reply(message: serde_json::Value) -> Delivery {
        let frame = json!({"message": message.to_string(), "signature": null});
        delivery(frame.to_string().as_bytes())
    }

    #[test]
    fn transitions_follow_the_handshake() {
        let mut s = HandshakeSession::new("yard-1");
        assert_eq!(s.state(), HandshakeState::Unauthenticated);
        s.transition(HandshakeState::AwaitingAnonymousBootstrap).unwrap();
        assert!(s.transition(HandshakeState::Authenticated).is_err());
        s.transition(HandshakeState::WaitingForCheckinResponse).unwrap();
        s.transition(HandshakeState::Authenticated).unwrap();
        assert!(s.transition(HandshakeState::Failed).is_err());
        s.fail();
        assert_eq!(s.state(), HandshakeState::Authenticated);
    }

    #[test]
    fn failed_is_terminal() {
        let mut s = HandshakeSession::new("yard-1");
        s.fail();
        assert_eq!(s.state(), HandshakeState::Failed);
        assert!(s.transition(HandshakeState::WaitingForCheckinResponse).is_err());
    }

    #[test]
    fn attempt_budget() {
        let mut s = HandshakeSession::new("yard-1");
        let e = YardError::MalformedEnvelope("x".into());
        for _ in 0..MAX_CHECKIN_ATTEMPTS {
            s.record_failure(&e).unwrap();
        }
        let err = s.record_failure(&e).unwrap_err();
        assert!(matches!(err, YardError::CheckinRetriesExhausted { attempts: 4 }));
    }

    #[test]
    fn requests_own_their_extra_fields() {
        let a = CheckinRequest::new("yard-1").field("name", json!("truck"));
        let b = CheckinRequest::new("yard-1");
        assert_eq!(a.extra.len(), 1);
        assert!(b.extra.is_empty());
        assert_eq!(b.status, "free");
        assert_eq!(b.registration_token, DEFAULT_REGISTRATION_TOKEN);
    }

    #[test]
    fn evaluate_accepts_issued_account() {
        let codec = EnvelopeCodec::default();
        let d = reply(json!({"type": "checkin", "uuid": "u", "body": {
            "response_code": "200", "rbmq_username": "u", "rbmq_password": "pw"}}));
        let r = evaluate(&codec, &d, &CheckinRequest::new("y"), true).unwrap().unwrap();
        assert_eq!(r.password(), Some("pw"));
    }

    #[test]
    fn evaluate_refusal_and_guard() {
        let codec = EnvelopeCodec::default();
        let refused = reply(json!({"type": "checkin", "body": {
            "response_code": 403, "message": "unknown yard"}}));
        let err = evaluate(&codec, &refused, &CheckinRequest::new("y"), true).unwrap_err();
        assert!(matches!(
            err,
            YardError::CheckinRefused { ref code, ref message } if code == "403" && message == "unknown yard"
        ));
        assert!(is_fatal(&err));

        let ok = reply(json!({"type": "checkin", "body": {
            "response_code": "200", "rbmq_username": "u", "rbmq_password": "pw"}}));
        let request = CheckinRequest::new("y").guard(|r| r.ca_certificate().is_some());
        let err = evaluate(&codec, &ok, &request, true).unwrap_err();
        assert!(matches!(err, YardError::CheckinGuardRejected { .. }));
    }

    #[test]
    fn evaluate_ignores_other_types_and_counts_garbage() {
        let codec = EnvelopeCodec::default();
        let other = reply(json!({"type": "assignment_execution", "body": {}}));
        assert!(evaluate(&codec, &other, &CheckinRequest::new("y"), true)
            .unwrap()
            .is_none());

        let garbage = delivery(b"not json");
        let err = evaluate(&codec, &garbage, &CheckinRequest::new("y"), true).unwrap_err();
        assert!(!is_fatal(&err));

        let no_account = reply(json!({"type": "checkin", "body": {"response_code": "200"}}));
        let err = evaluate(&codec, &no_account, &CheckinRequest::new("y"), true).unwrap_err();
        assert!(!is_fatal(&err));
        assert!(evaluate(&codec, &no_account, &CheckinRequest::new("y"), false).is_ok());
    }

    #[test]
    fn evaluate_rejects_bad_signature() {
        let server = Signer::from_pem(SERVER_KEY).unwrap();
        let codec = EnvelopeCodec::default().with_counterpart(server.public_key().clone());
        let message = json!({"type": "checkin", "body": {"response_code": "200"}}).to_string();
        let mut sig = server.sign(&message).unwrap();
        sig[0] ^= 0xff;
        let frame = json!({"message": message, "signature": sig});
        let err = evaluate(&codec, &delivery(frame.to_string().as_bytes()), &CheckinRequest::new("y"), false)
            .unwrap_err();
        assert!(is_fatal(&err));
    }
}
