//! Error taxonomy for the reconciliation engine.
//!
//! Reconciliation errors are local and recoverable, protocol errors are turned
//! into ordinary terminal turns, and only turn-log invariant violations are
//! treated as contract bugs.

/// A streamed token whose `sequenceNumber` cannot be used for ordering.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid token: {reason}")]
pub struct InvalidTokenError {
    pub reason: String,
}

impl InvalidTokenError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn error_code(&self) -> &str {
        "invalid_token"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TurnLogError {
    /// The trailing turn is missing or is a Human turn.
    #[error("turn log has no trailing AI turn")]
    NoTrailingAiTurn,

    #[error("turn log is not empty ({len} turns); history can only hydrate an empty log")]
    NotEmpty { len: usize },
}

impl TurnLogError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NoTrailingAiTurn => "no_trailing_ai_turn",
            Self::NotEmpty { .. } => "turn_log_not_empty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session {session_id} already has a run in flight")]
    AlreadyRunning { session_id: String },

    #[error("session {session_id} has no model configured")]
    MissingModel { session_id: String },

    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("session {session_id} must be idle to {operation}")]
    NotIdle {
        session_id: String,
        operation: &'static str,
    },

    #[error(transparent)]
    TurnLog(#[from] TurnLogError),

    #[error("history source failed: {0}")]
    History(#[from] CollaboratorError),
}

impl SessionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::AlreadyRunning { .. } => "already_running",
            Self::MissingModel { .. } => "missing_model",
            Self::EmptyPrompt => "empty_prompt",
            Self::NotIdle { .. } => "not_idle",
            Self::TurnLog(inner) => inner.error_code(),
            Self::History(_) => "history_unavailable",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{action} payload is invalid: {source}")]
    InvalidPayload {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Json(_) => "malformed_message",
            Self::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

/// Failure reported by an external collaborator (history fetch, catalog).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("collaborator returned malformed data: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(InvalidTokenError::new("negative").error_code(), "invalid_token");
        assert_eq!(
            TurnLogError::NoTrailingAiTurn.error_code(),
            "no_trailing_ai_turn"
        );
        assert_eq!(
            SessionError::AlreadyRunning {
                session_id: "s1".to_string()
            }
            .error_code(),
            "already_running"
        );
        assert_eq!(
            SessionError::from(TurnLogError::NoTrailingAiTurn).error_code(),
            "no_trailing_ai_turn"
        );
    }

    #[test]
    fn messages_name_the_session() {
        let err = SessionError::MissingModel {
            session_id: "s9".to_string(),
        };
        assert_eq!(err.to_string(), "session s9 has no model configured");
    }
}
