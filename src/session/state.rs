//! Signing session state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a signing session
///
/// ```text
/// created -> key_aggregation -> keys_aggregated -> nonce_exchange
///         -> nonces_exchanged -> signing -> completed
/// ```
///
/// `failed`, `cancelled` and `aborted` are reachable from every non-terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    KeyAggregation,
    KeysAggregated,
    NonceExchange,
    NoncesExchanged,
    Signing,
    Completed,
    Failed,
    Cancelled,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed
                | SessionState::Cancelled
                | SessionState::Aborted
        )
    }

    /// Position on the happy path, `None` for the failure states
    fn step(&self) -> Option<u8> {
        match self {
            SessionState::Created => Some(0),
            SessionState::KeyAggregation => Some(1),
            SessionState::KeysAggregated => Some(2),
            SessionState::NonceExchange => Some(3),
            SessionState::NoncesExchanged => Some(4),
            SessionState::Signing => Some(5),
            SessionState::Completed => Some(6),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.step(), next.step()) {
            (Some(from), Some(to)) => to == from + 1,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// The session has passed the nonce round
    pub fn nonces_complete(&self) -> bool {
        matches!(
            self,
            SessionState::NoncesExchanged | SessionState::Signing | SessionState::Completed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::KeyAggregation => "key_aggregation",
            SessionState::KeysAggregated => "keys_aggregated",
            SessionState::NonceExchange => "nonce_exchange",
            SessionState::NoncesExchanged => "nonces_exchanged",
            SessionState::Signing => "signing",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
            SessionState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
