//! Message shapes exchanged between an agent and the yard server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{YardError, YardResult};

/// Protocol version stamped on every agent message.
pub const VERSION: &str = "3.0.0";

/// Inbound message types.
pub const ASSIGNMENT_EXECUTION: &str = "assignment_execution";
pub const ASSIGNMENT_CANCEL: &str = "assignment_cancel";
pub const RESERVE_FOR_MISSION: &str = "reserve_for_mission";
pub const RELEASE_FROM_MISSION: &str = "release_from_mission";
/// Older name for `reserve_for_mission`, with a `wp_id` body.
pub const WP_CLEARANCE_REQUEST: &str = "wp_clearance_request";

/// Outbound message types.
pub const AGENT_STATE: &str = "agent_state";
pub const AGENT_SENSORS: &str = "agent_sensors";
pub const AGENT_UPDATE: &str = "agent_update";
pub const MISSION_REQUEST: &str = "mission_request";
pub const CHECKIN: &str = "checkin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Succeeded,
    Canceled,
    Aborted,
    Failed,
    ToExecute,
    Executing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[serde(rename = "not_automatable")]
    NotAutomatable,
    #[default]
    Free,
    Busy,
    Ready,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::NotAutomatable => "not_automatable",
            AgentState::Free => "free",
            AgentState::Busy => "busy",
            AgentState::Ready => "ready",
        }
    }
}

// ── Server to agent ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentMetadata {
    pub id: i64,
    pub yard_id: i64,
    pub status: String,
    #[serde(default)]
    pub start_time_stamp: Option<Value>,
    #[serde(default)]
    pub context: Value,
}

/// An assignment execution or cancel command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentCommand {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub work_process_id: i64,
    pub assignment_metadata: AssignmentMetadata,
    #[serde(default)]
    pub body: Value,
    #[serde(rename = "_version", default)]
    pub version: String,
}

/// A request to reserve or release the agent for a work process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkProcessResourcesRequest {
    pub work_process_id: i64,
    pub operation_types_required: Vec<String>,
    pub reserved: bool,
}

/// Body of the legacy `wp_clearance_request`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkProcessClearance {
    pub wp_id: i64,
    pub operation_types_required: Vec<String>,
    pub reserved: bool,
}

impl From<WorkProcessClearance> for WorkProcessResourcesRequest {
    fn from(c: WorkProcessClearance) -> Self {
        Self {
            work_process_id: c.wp_id,
            operation_types_required: c.operation_types_required,
            reserved: c.reserved,
        }
    }
}

// ── Agent to server ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub orientations: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCurrentResources {
    pub operation_types_available: Vec<String>,
    pub work_process_id: i64,
    pub reserved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentCurrentStatus {
    pub id: String,
    pub status: AssignmentStatus,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStateBody {
    pub status: AgentState,
    pub resources: Option<AgentCurrentResources>,
    pub assignment: Option<AssignmentCurrentStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorsBody {
    pub pose: Pose,
    pub sensors: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionRequestBody {
    pub work_process_type_name: String,
    pub data: Value,
    pub tools_uuids: Vec<String>,
    pub yard_uid: Option<String>,
    pub sched_start_at: Option<String>,
}

/// Envelope-ready agent message: `{type, uuid, body, _version}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage<B> {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub uuid: String,
    pub body: B,
    #[serde(rename = "_version")]
    pub version: String,
}

impl<B> AgentMessage<B> {
    pub fn new(msg_type: &str, uuid: &str, body: B) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            uuid: uuid.to_string(),
            body,
            version: VERSION.to_string(),
        }
    }
}

// ── Check-in ────────────────────────────────────────────────────────

/// Body of a check-in request.
///
/// `extra` is flattened last, so caller fields may override the defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckinBody {
    pub yard_uid: String,
    pub status: String,
    pub public_key: String,
    pub public_key_format: String,
    pub registration_token: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckinMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub uuid: String,
    pub status: String,
    pub body: CheckinBody,
}

/// A decoded check-in reply.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckinResponse {
    pub uuid: Option<String>,
    pub body: Map<String, Value>,
}

impl CheckinResponse {
    /// Extract a check-in reply from a decoded message.
    ///
    /// Returns `Ok(None)` for messages of any other type.
    pub fn from_message(message: &Value) -> YardResult<Option<Self>> {
        let obj = message
            .as_object()
            .ok_or_else(|| YardError::InvalidMessage("check-in reply is not an object".into()))?;
        let msg_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| YardError::InvalidMessage("check-in reply has no type".into()))?;
        if msg_type != CHECKIN {
            return Ok(None);
        }
        let body = obj
            .get("body")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| YardError::InvalidMessage("check-in reply has no body".into()))?;
        let uuid = obj.get("uuid").and_then(Value::as_str).map(str::to_string);
        Ok(Some(Self { uuid, body }))
    }

    /// The response code as text; absent codes read as `"500"`.
    pub fn response_code(&self) -> String {
        match self.body.get("response_code") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => "500".to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.response_code() == "200"
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    pub fn message(&self) -> Option<&str> {
        self.text("message")
    }

    pub fn username(&self) -> Option<&str> {
        self.text("rbmq_username")
    }

    pub fn password(&self) -> Option<&str> {
        self.text("rbmq_password")
    }

    pub fn ca_certificate(&self) -> Option<&str> {
        self.text("ca_certificate")
    }

    /// Server public key, as sent (PEM string or byte array).
    pub fn server_public_key(&self) -> Option<&Value> {
        self.body.get("helyos_public_key").filter(|v| !v.is_null())
    }

    /// Remove the one-time password from the body.
    pub fn take_password(&mut self) -> Option<String> {
        match self.body.remove("rbmq_password") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assignment_command_parses_wire_shape() {
        let v = json!({
            "type": "assignment_execution",
            "work_process_id": 12,
            "assignment_metadata": {"id": 3, "yard_id": 1, "status": "executing",
                                    "start_time_stamp": "2024-01-01T00:00:00Z", "context": {}},
            "body": {"path": []},
            "_version": "3.0.0"
        });
        let cmd: AssignmentCommand = serde_json::from_value(v).unwrap();
        assert_eq!(cmd.msg_type, ASSIGNMENT_EXECUTION);
        assert_eq!(cmd.assignment_metadata.id, 3);
        assert_eq!(cmd.version, VERSION);
    }

    #[test]
    fn legacy_clearance_maps_to_reservation() {
        let legacy: WorkProcessClearance = serde_json::from_value(json!({
            "wp_id": 5, "operation_types_required": ["drive"], "reserved": true
        }))
        .unwrap();
        let req = WorkProcessResourcesRequest::from(legacy);
        assert_eq!(req.work_process_id, 5);
        assert!(req.reserved);
    }

    #[test]
    fn agent_state_message_serializes_with_version() {
        let msg = AgentMessage::new(
            AGENT_STATE,
            "agent-7",
            AgentStateBody {
                status: AgentState::NotAutomatable,
                resources: None,
                assignment: Some(AssignmentCurrentStatus {
                    id: "3".into(),
                    status: AssignmentStatus::ToExecute,
                    result: json!({}),
                }),
            },
        );
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "agent_state");
        assert_eq!(v["_version"], "3.0.0");
        assert_eq!(v["body"]["status"], "not_automatable");
        assert_eq!(v["body"]["assignment"]["status"], "to_execute");
        assert!(v["body"]["resources"].is_null());
    }

    #[test]
    fn checkin_extra_fields_flatten_and_override() {
        let mut extra = Map::new();
        extra.insert("name".into(), json!("forklift"));
        extra.insert("status".into(), json!("busy"));
        let body = CheckinBody {
            yard_uid: "yard-1".into(),
            status: "free".into(),
            public_key: "PEM".into(),
            public_key_format: "PEM".into(),
            registration_token: "t".into(),
            extra,
        };
        let v = crate::codec::canonical_json(&body).unwrap();
        let v: Value = serde_json::from_str(&v).unwrap();
        assert_eq!(v["name"], "forklift");
        assert_eq!(v["status"], "busy");
    }

    #[test]
    fn checkin_response_accessors() {
        let mut resp = CheckinResponse::from_message(&json!({
            "type": "checkin", "uuid": "agent-7",
            "body": {"response_code": "200", "rbmq_username": "agent-7", "rbmq_password": "s3cret"}
        }))
        .unwrap()
        .unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.username(), Some("agent-7"));
        assert_eq!(resp.take_password().as_deref(), Some("s3cret"));
        assert!(resp.password().is_none());
    }

    #[test]
    fn checkin_response_code_defaults_to_500() {
        let resp = CheckinResponse::from_message(&json!({"type": "checkin", "body": {}}))
            .unwrap()
            .unwrap();
        assert_eq!(resp.response_code(), "500");
        let numeric = CheckinResponse::from_message(&json!({"type": "checkin", "body": {"response_code": 403}}))
            .unwrap()
            .unwrap();
        assert_eq!(numeric.response_code(), "403");
    }

    #[test]
    fn other_message_types_are_not_checkin_replies() {
        assert_eq!(
            CheckinResponse::from_message(&json!({"type": "agent_state", "body": {}})).unwrap(),
            None
        );
        assert!(CheckinResponse::from_message(&json!({"body": {}})).is_err());
        assert!(CheckinResponse::from_message(&json!({"type": "checkin"})).is_err());
    }
}
