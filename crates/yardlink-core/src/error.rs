use thiserror::Error;

/// Errors produced by the yardlink protocol layer.
///
/// Every variant maps onto an [`ErrorKind`] so callers can branch on the
/// failure class without matching message text. Display strings never carry
/// passwords.
#[derive(Debug, Error)]
pub enum YardError {
    #[error("anonymous connection failed: {0}")]
    AnonymousConnection(String),

    #[error("anonymous check-in is only available on the queue transport; provision an account for {0}")]
    AnonymousConnectionNotSupported(String),

    #[error("not authenticated: {0}")]
    AuthenticationRequired(String),

    #[error("check-in refused: {message} (code {code})")]
    CheckinRefused { code: String, message: String },

    #[error("check-in response rejected by guard (code {code})")]
    CheckinGuardRejected { code: String },

    #[error("check-in abandoned after {attempts} failed attempts")]
    CheckinRetriesExhausted { attempts: u32 },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not able to connect as {username} after {attempts} attempts")]
    AccountConnection { username: String, attempts: u32 },

    #[error("key error: {0}")]
    Key(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of a [`YardError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AnonymousConnection,
    AuthenticationRequired,
    CheckinRefused,
    CheckinGuardRejected,
    CheckinRetriesExhausted,
    Signing,
    SignatureVerification,
    MalformedEnvelope,
    InvalidMessage,
    Transport,
    AccountConnection,
    Key,
    Config,
    Unsupported,
    Timeout,
    Io,
    Other,
}

impl YardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AnonymousConnection(_) | Self::AnonymousConnectionNotSupported(_) => {
                ErrorKind::AnonymousConnection
            }
            Self::AuthenticationRequired(_) => ErrorKind::AuthenticationRequired,
            Self::CheckinRefused { .. } => ErrorKind::CheckinRefused,
            Self::CheckinGuardRejected { .. } => ErrorKind::CheckinGuardRejected,
            Self::CheckinRetriesExhausted { .. } => ErrorKind::CheckinRetriesExhausted,
            Self::Signing(_) => ErrorKind::Signing,
            Self::SignatureVerification(_) => ErrorKind::SignatureVerification,
            Self::MalformedEnvelope(_) => ErrorKind::MalformedEnvelope,
            Self::InvalidMessage(_) => ErrorKind::InvalidMessage,
            Self::Transport(_) => ErrorKind::Transport,
            Self::AccountConnection { .. } => ErrorKind::AccountConnection,
            Self::Key(_) => ErrorKind::Key,
            Self::Config(_) => ErrorKind::Config,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Timeout => ErrorKind::Timeout,
            Self::Io(_) => ErrorKind::Io,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether the failure is eligible for reconnect-and-retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }
}

impl From<serde_json::Error> for YardError {
    fn from(e: serde_json::Error) -> Self {
        YardError::InvalidMessage(e.to_string())
    }
}

pub type YardResult<T> = Result<T, YardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_variants_share_a_kind() {
        let unreachable = YardError::AnonymousConnection("refused".into());
        let unsupported = YardError::AnonymousConnectionNotSupported("agent-1".into());
        assert_eq!(unreachable.kind(), ErrorKind::AnonymousConnection);
        assert_eq!(unsupported.kind(), ErrorKind::AnonymousConnection);
    }

    #[test]
    fn only_transport_faults_are_transient() {
        assert!(YardError::Transport("reset".into()).is_transient());
        assert!(YardError::Timeout.is_transient());
        assert!(!YardError::SignatureVerification("bad".into()).is_transient());
        assert!(!YardError::CheckinRefused {
            code: "403".into(),
            message: "no".into()
        }
        .is_transient());
    }

    #[test]
    fn refusal_carries_code_and_message() {
        let err = YardError::CheckinRefused {
            code: "403".into(),
            message: "unknown registration token".into(),
        };
        assert_eq!(
            err.to_string(),
            "check-in refused: unknown registration token (code 403)"
        );
    }
}
