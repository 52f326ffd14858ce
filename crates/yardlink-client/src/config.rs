//! Agent configuration at `~/.yardlink/config.toml`.
//!
//! Load order: built-in defaults, then the TOML file (a missing file means
//! defaults), then environment overrides for exchange names and the
//! registration token. CLI flags override all of these.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use yardlink_core::codec::SignaturePolicy;
use yardlink_core::error::{YardError, YardResult};
use yardlink_core::transport::ConnectParams;

use crate::handshake::{CheckinRequest, DEFAULT_REGISTRATION_TOKEN};
use crate::supervisor::{Backoff, RetryPolicy};
use crate::transport::{detect_transport, Exchanges, TransportKind};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub exchanges: Exchanges,
    #[serde(default)]
    pub checkin: CheckinConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker URL (`amqp://`, `amqps://`, `mqtt://`, `mqtts://`). When set
    /// it supplies transport, TLS, host and port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_host")]
    pub host: String,

    /// Port; the transport's default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    #[serde(default)]
    pub enable_ssl: bool,

    /// Path to a PEM CA certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: None,
            transport: default_transport(),
            enable_ssl: false,
            ca_certificate: None,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_transport() -> TransportKind {
    TransportKind::Amqp
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinConfig {
    #[serde(default = "default_registration_token")]
    pub registration_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yard_uid: Option<String>,

    #[serde(default = "default_status")]
    pub status: String,

    /// Refuse check-in replies that are not signed by the server.
    #[serde(default)]
    pub require_signed_response: bool,

    /// Sign outbound agent messages.
    #[serde(default)]
    pub sign_messages: bool,
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            registration_token: default_registration_token(),
            yard_uid: None,
            status: default_status(),
            require_signed_response: false,
            sign_messages: false,
        }
    }
}

fn default_registration_token() -> String {
    DEFAULT_REGISTRATION_TOKEN.to_string()
}

fn default_status() -> String {
    "free".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,

    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,

    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_secs: default_interval_secs(),
            backoff: default_backoff(),
            max_interval_secs: default_max_interval_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_interval_secs() -> f64 {
    3.0
}

fn default_backoff() -> BackoffKind {
    BackoffKind::Fixed
}

fn default_max_interval_secs() -> f64 {
    60.0
}

fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_default()
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let interval = seconds(self.interval_secs);
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed(interval),
            BackoffKind::Exponential => Backoff::Exponential {
                initial: interval,
                max: seconds(self.max_interval_secs),
                multiplier: 2.0,
            },
        };
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff,
        }
    }
}

/// Environment variables that override file settings.
pub const ENV_UPLINK_EXCHANGE: &str = "AGENTS_UL_EXCHANGE";
pub const ENV_DOWNLINK_EXCHANGE: &str = "AGENTS_DL_EXCHANGE";
pub const ENV_ANONYMOUS_EXCHANGE: &str = "AGENT_ANONYMOUS_EXCHANGE";
pub const ENV_MQTT_EXCHANGE: &str = "AGENTS_MQTT_EXCHANGE";
pub const ENV_REGISTRATION_TOKEN: &str = "REGISTRATION_TOKEN";

/// Split `scheme://host[:port][/...]` into host and optional port.
fn url_authority(url: &str) -> YardResult<(String, Option<u16>)> {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| YardError::Config(format!("not a URL: {url}")))?;
    let authority = rest.split('/').next().unwrap_or_default();
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| YardError::Config(format!("bad port in {url}")))?;
            Ok((host.to_string(), Some(port)))
        }
        None if authority.is_empty() => Err(YardError::Config(format!("no host in {url}"))),
        None => Ok((authority.to_string(), None)),
    }
}

impl AgentConfig {
    /// `~/.yardlink/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".yardlink").join("config.toml"))
    }

    /// Load from `path` and apply environment overrides.
    pub fn load(path: &Path) -> YardResult<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config = Self::from_toml(&content)
                .map_err(|e| YardError::Config(format!("{}: {e}", path.display())))?;
            debug!(path = %path.display(), "loaded config");
            config
        } else {
            debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_env_with(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> YardResult<Self> {
        toml::from_str(content).map_err(|e| YardError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> YardResult<String> {
        toml::to_string_pretty(self).map_err(|e| YardError::Config(e.to_string()))
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let targets: [(&str, &mut String); 5] = [
            (ENV_UPLINK_EXCHANGE, &mut self.exchanges.uplink),
            (ENV_DOWNLINK_EXCHANGE, &mut self.exchanges.downlink),
            (ENV_ANONYMOUS_EXCHANGE, &mut self.exchanges.anonymous),
            (ENV_MQTT_EXCHANGE, &mut self.exchanges.mqtt),
            (ENV_REGISTRATION_TOKEN, &mut self.checkin.registration_token),
        ];
        for (key, slot) in targets {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                debug!(%key, "environment override");
                *slot = value;
            }
        }
    }

    /// Transport kind after applying `broker.url`.
    pub fn transport(&self) -> YardResult<TransportKind> {
        match &self.broker.url {
            Some(url) => Ok(detect_transport(url)?.0),
            None => Ok(self.broker.transport),
        }
    }

    /// Broker endpoint (no account) described by this config.
    pub fn endpoint(&self) -> YardResult<ConnectParams> {
        let (kind, tls, host, port) = match &self.broker.url {
            Some(url) => {
                let (kind, tls) = detect_transport(url)?;
                let (host, port) = url_authority(url)?;
                (kind, tls || self.broker.enable_ssl, host, port)
            }
            None => (
                self.broker.transport,
                self.broker.enable_ssl,
                self.broker.host.clone(),
                self.broker.port,
            ),
        };
        let port = port.unwrap_or_else(|| kind.default_port(tls));
        let params = ConnectParams::new(host, port, "", "");
        if !tls {
            return Ok(params);
        }
        let ca = match &self.broker.ca_certificate {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                YardError::Config(format!("cannot read CA certificate {}: {e}", path.display()))
            })?),
            None => None,
        };
        Ok(params.with_tls(ca))
    }

    /// Check-in request prefilled from `[checkin]`.
    pub fn checkin_request(&self, yard_uid: impl Into<String>) -> CheckinRequest {
        let policy = if self.checkin.require_signed_response {
            SignaturePolicy::RequireSigned
        } else {
            SignaturePolicy::AllowUnsigned
        };
        CheckinRequest::new(yard_uid)
            .status(self.checkin.status.clone())
            .registration_token(self.checkin.registration_token.clone())
            .policy(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = AgentConfig::default();
        assert_eq!(c.broker.host, "localhost");
        assert_eq!(c.broker.transport, TransportKind::Amqp);
        assert_eq!(c.exchanges.uplink, "xchange_helyos.agents.ul");
        assert_eq!(c.checkin.registration_token, "0000-0000-0000-0000-0000");
        assert_eq!(c.retry.policy(), RetryPolicy::default());
        assert_eq!(c.endpoint().unwrap().port, 5672);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c = AgentConfig::from_toml(
            r#"
            [broker]
            host = "rabbit.yard"
            transport = "mqtt"

            [retry]
            backoff = "exponential"
            interval_secs = 0.5
            max_interval_secs = 4
            "#,
        )
        .unwrap();
        assert_eq!(c.broker.transport, TransportKind::Mqtt);
        assert_eq!(c.endpoint().unwrap().port, 1883);
        assert_eq!(c.exchanges, Exchanges::default());
        assert_eq!(
            c.retry.policy().backoff,
            Backoff::Exponential {
                initial: Duration::from_millis(500),
                max: Duration::from_secs(4),
                multiplier: 2.0
            }
        );
    }

    #[test]
    fn missing_file_is_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let c = AgentConfig::load(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(c.broker, BrokerConfig::default());
    }

    #[test]
    fn bad_toml_is_config_error() {
        let err = AgentConfig::from_toml("[broker\nhost=").unwrap_err();
        assert!(matches!(err, YardError::Config(_)));
    }

    #[test]
    fn env_overrides_exchanges_and_token() {
        let mut c = AgentConfig::default();
        c.apply_env_with(|key| match key {
            "AGENTS_UL_EXCHANGE" => Some("ul.custom".into()),
            "REGISTRATION_TOKEN" => Some("tok-1".into()),
            "AGENTS_DL_EXCHANGE" => Some(String::new()),
            _ => None,
        });
        assert_eq!(c.exchanges.uplink, "ul.custom");
        assert_eq!(c.exchanges.downlink, "xchange_helyos.agents.dl");
        assert_eq!(c.checkin.registration_token, "tok-1");
    }

    #[test]
    fn url_sets_endpoint() {
        let mut c = AgentConfig::default();
        c.broker.url = Some("amqps://guest@rabbit.yard:5999/vhost".into());
        let p = c.endpoint().unwrap();
        assert_eq!(p.host, "rabbit.yard");
        assert_eq!(p.port, 5999);
        assert!(p.enable_ssl);

        c.broker.url = Some("mqtt://broker.yard".into());
        assert_eq!(c.transport().unwrap(), TransportKind::Mqtt);
        assert_eq!(c.endpoint().unwrap().port, 1883);
    }

    #[test]
    fn ca_certificate_is_read_for_tls() {
        let tmp = tempfile::tempdir().unwrap();
        let ca = tmp.path().join("ca.pem");
        std::fs::write(&ca, "-----BEGIN CERTIFICATE-----\n").unwrap();
        let mut c = AgentConfig::default();
        c.broker.enable_ssl = true;
        c.broker.ca_certificate = Some(ca);
        let p = c.endpoint().unwrap();
        assert_eq!(p.port, 5671);
        assert_eq!(p.ca_certificate.as_deref(), Some("-----BEGIN CERTIFICATE-----\n"));
    }

    #[test]
    fn checkin_request_from_config() {
        let mut c = AgentConfig::default();
        c.checkin.require_signed_response = true;
        c.checkin.status = "busy".into();
        let r = c.checkin_request("yard-9");
        assert_eq!(r.yard_uid, "yard-9");
        assert_eq!(r.status, "busy");
        assert_eq!(r.policy, SignaturePolicy::RequireSigned);
    }

    #[test]
    fn toml_round_trip() {
        let c = AgentConfig::default();
        assert_eq!(AgentConfig::from_toml(&c.to_toml().unwrap()).unwrap(), c);
    }
}
