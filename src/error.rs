//! Error types for the co-signing subsystem
//!
//! Discovery and connectivity failures are recoverable and are usually
//! reported through structured results instead of errors. Protocol-sequence
//! violations are surfaced immediately.

use crate::crypto::KeyError;
use crate::session::SessionState;
use thiserror::Error;

/// Errors produced by the discovery, session and connectivity layers
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Subsystem not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Session not ready: {0}")]
    SessionNotReady(String),

    #[error("Session {session_id} is closed ({state})")]
    SessionClosed {
        session_id: String,
        state: SessionState,
    },

    #[error("Out of order protocol message: {0}")]
    OutOfOrderProtocolMessage(String),

    #[error("Participant unreachable: {0}")]
    ParticipantUnreachable(String),

    #[error("Insufficient participants: need {needed}, have {available}")]
    InsufficientParticipants { needed: usize, available: usize },

    #[error("Invalid signer advertisement: {0}")]
    AdvertisementInvalid(String),

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] KeyError),

    #[error("Signing backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// Whether retrying the same call later can succeed.
    ///
    /// Ordering errors are never retryable: the caller has to fix the
    /// sequence of calls first.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::ParticipantUnreachable(_)
                | CoordinatorError::Transport(_)
                | CoordinatorError::InsufficientParticipants { .. }
                | CoordinatorError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(CoordinatorError::ParticipantUnreachable("bob".into()).is_recoverable());
        assert!(CoordinatorError::InsufficientParticipants {
            needed: 3,
            available: 2
        }
        .is_recoverable());
        assert!(!CoordinatorError::OutOfOrderProtocolMessage("sig".into()).is_recoverable());
        assert!(!CoordinatorError::SessionNotReady("s1".into()).is_recoverable());
    }

    #[test]
    fn test_closed_message_names_state() {
        let err = CoordinatorError::SessionClosed {
            session_id: "abc".into(),
            state: SessionState::Aborted,
        };
        assert_eq!(err.to_string(), "Session abc is closed (aborted)");
    }
}
