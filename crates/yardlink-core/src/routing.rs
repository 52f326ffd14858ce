//! Routing-key and topic derivation.
//!
//! Every agent channel is `agent.{uuid}.{purpose}` on the queue transport and
//! `agent/{uuid}/{purpose}` on the pub/sub transport.

use std::fmt;
use std::str::FromStr;

use crate::error::YardError;

/// What a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Checkin,
    State,
    Visualization,
    MissionRequest,
    SummaryRequest,
    DatabaseRequest,
    InstantActions,
    Update,
    Assignment,
}

impl Purpose {
    pub const ALL: [Purpose; 9] = [
        Purpose::Checkin,
        Purpose::State,
        Purpose::Visualization,
        Purpose::MissionRequest,
        Purpose::SummaryRequest,
        Purpose::DatabaseRequest,
        Purpose::InstantActions,
        Purpose::Update,
        Purpose::Assignment,
    ];

    /// The routing-key suffix.
    pub fn suffix(self) -> &'static str {
        match self {
            Purpose::Checkin => "checkin",
            Purpose::State => "state",
            Purpose::Visualization => "visualization",
            Purpose::MissionRequest => "mission_req",
            Purpose::SummaryRequest => "summary_req",
            Purpose::DatabaseRequest => "database_req",
            Purpose::InstantActions => "instantActions",
            Purpose::Update => "update",
            Purpose::Assignment => "assignment",
        }
    }

    /// Whether the agent receives (rather than publishes) on this channel.
    pub fn is_downlink(self) -> bool {
        matches!(self, Purpose::InstantActions | Purpose::Assignment)
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

impl FromStr for Purpose {
    type Err = YardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Purpose::ALL
            .into_iter()
            .find(|p| p.suffix() == s)
            .ok_or_else(|| YardError::InvalidMessage(format!("unknown channel purpose: {s}")))
    }
}

/// Separator style of the broker naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingScheme {
    /// `agent.{uuid}.{purpose}`
    Dotted,
    /// `agent/{uuid}/{purpose}`
    Slashed,
}

impl RoutingScheme {
    fn separator(self) -> char {
        match self {
            RoutingScheme::Dotted => '.',
            RoutingScheme::Slashed => '/',
        }
    }

    pub fn routing_key(self, uuid: &str, purpose: Purpose) -> String {
        let sep = self.separator();
        format!("agent{sep}{uuid}{sep}{}", purpose.suffix())
    }

    /// Split a routing key back into uuid and purpose.
    pub fn parse(self, key: &str) -> Option<(String, Purpose)> {
        let sep = self.separator();
        let rest = key.strip_prefix("agent")?.strip_prefix(sep)?;
        let (uuid, suffix) = rest.rsplit_once(sep)?;
        let purpose = suffix.parse().ok()?;
        Some((uuid.to_string(), purpose))
    }
}

/// Reply topic used for check-in on the pub/sub transport.
pub fn checkin_response_topic(uuid: &str) -> String {
    format!("agent/{uuid}/checkinresponse")
}
