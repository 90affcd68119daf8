//! Signing session data model
//!
//! [`WalletSigningSession`] holds all per-session state and the pure state
//! machine rules. The coordinator owns these objects and adds locking and
//! network I/O around them.

use crate::crypto::sha256_hex;
use crate::error::{CoordinatorError, Result};
use crate::session::state::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One co-signer of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub public_key_hex: String,
    pub peer_id: Option<String>,
    pub nickname: Option<String>,
    pub is_me: bool,
    pub has_joined: bool,
    pub has_nonce: bool,
    pub has_partial_sig: bool,
}

impl ParticipantRecord {
    pub fn new(public_key_hex: &str) -> Self {
        Self {
            public_key_hex: public_key_hex.to_string(),
            peer_id: None,
            nickname: None,
            is_me: false,
            has_joined: false,
            has_nonce: false,
            has_partial_sig: false,
        }
    }

    pub fn me(public_key_hex: &str, peer_id: &str) -> Self {
        Self {
            peer_id: Some(peer_id.to_string()),
            is_me: true,
            has_joined: true,
            ..Self::new(public_key_hex)
        }
    }
}

/// Advertisement of a session to invited co-signers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAnnouncement {
    pub session_id: String,
    pub coordinator_peer_id: String,
    pub coordinator_public_key: String,
    pub signers: Vec<String>,
    pub required_signers: usize,
    pub message_hex: String,
    pub message_hash: String,
    pub metadata: BTreeMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

impl SessionAnnouncement {
    /// Structural checks done before joining
    pub fn verify(&self, now: DateTime<Utc>) -> Result<()> {
        if self.expires_at <= now {
            return Err(CoordinatorError::SessionExpired(self.session_id.clone()));
        }

        let message = hex::decode(&self.message_hex)
            .map_err(|_| CoordinatorError::InvalidSession("message is not hex".into()))?;
        if sha256_hex(&message) != self.message_hash {
            return Err(CoordinatorError::InvalidSession(format!(
                "message hash mismatch in announcement {}",
                self.session_id
            )));
        }

        let unique: HashSet<&String> = self.signers.iter().collect();
        if unique.len() != self.signers.len() {
            return Err(CoordinatorError::InvalidSession("duplicate signer".into()));
        }
        if self.signers.len() != self.required_signers || self.required_signers < 2 {
            return Err(CoordinatorError::InsufficientParticipants {
                needed: self.required_signers.max(2),
                available: self.signers.len(),
            });
        }
        if !self.signers.contains(&self.coordinator_public_key) {
            return Err(CoordinatorError::InvalidSession(
                "coordinator is not a signer".into(),
            ));
        }
        Ok(())
    }
}

/// A multi-party signing session as seen by this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletSigningSession {
    pub id: String,
    pub state: SessionState,
    pub is_initiator: bool,
    pub coordinator_peer_id: String,
    pub coordinator_public_key: String,
    /// Sorted by public key; this order is the key aggregation order
    pub participants: Vec<ParticipantRecord>,
    pub message_hex: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub aggregated_key: Option<String>,
    /// Public nonces by participant public key
    pub nonces: BTreeMap<String, String>,
    /// Partial signatures by participant public key
    pub partial_signatures: BTreeMap<String, String>,
    pub final_signature: Option<String>,
    /// Why the session ended, for terminal failure states
    pub reason: Option<String>,
    /// Transitions not yet reported to listeners
    #[serde(skip)]
    transitions: Vec<(SessionState, SessionState)>,
}

impl WalletSigningSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        is_initiator: bool,
        coordinator_peer_id: String,
        coordinator_public_key: String,
        mut participants: Vec<ParticipantRecord>,
        message_hex: String,
        metadata: BTreeMap<String, String>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self> {
        if participants.iter().filter(|p| p.is_me).count() != 1 {
            return Err(CoordinatorError::InvalidSession(
                "exactly one participant must be the local signer".into(),
            ));
        }
        participants.sort_by(|a, b| a.public_key_hex.cmp(&b.public_key_hex));

        let now = Utc::now();
        Ok(Self {
            id,
            state: SessionState::Created,
            is_initiator,
            coordinator_peer_id,
            coordinator_public_key,
            participants,
            message_hex,
            metadata,
            created_at: now,
            updated_at: now,
            expires_at,
            aggregated_key: None,
            nonces: BTreeMap::new(),
            partial_signatures: BTreeMap::new(),
            final_signature: None,
            reason: None,
            transitions: Vec::new(),
        })
    }

    pub fn message_bytes(&self) -> Result<Vec<u8>> {
        hex::decode(&self.message_hex)
            .map_err(|_| CoordinatorError::InvalidSession("message is not hex".into()))
    }

    pub fn public_keys(&self) -> Vec<String> {
        self.participants
            .iter()
            .map(|p| p.public_key_hex.clone())
            .collect()
    }

    pub fn me(&self) -> &ParticipantRecord {
        // Constructor guarantees exactly one
        self.participants
            .iter()
            .find(|p| p.is_me)
            .unwrap_or(&self.participants[0])
    }

    pub fn participant(&self, public_key_hex: &str) -> Option<&ParticipantRecord> {
        self.participants
            .iter()
            .find(|p| p.public_key_hex == public_key_hex)
    }

    fn participant_mut(&mut self, public_key_hex: &str) -> Result<&mut ParticipantRecord> {
        let session_id = &self.id;
        self.participants
            .iter_mut()
            .find(|p| p.public_key_hex == public_key_hex)
            .ok_or_else(|| {
                CoordinatorError::InvalidSession(format!(
                    "{} is not a participant of session {}",
                    public_key_hex, session_id
                ))
            })
    }

    /// Participants other than us
    pub fn remote_participants(&self) -> impl Iterator<Item = &ParticipantRecord> {
        self.participants.iter().filter(|p| !p.is_me)
    }

    /// Peer ids of remote participants we know how to reach
    pub fn remote_peer_ids(&self) -> Vec<String> {
        self.remote_participants()
            .filter_map(|p| p.peer_id.clone())
            .collect()
    }

    pub fn joined_count(&self) -> usize {
        self.participants.iter().filter(|p| p.has_joined).count()
    }

    pub fn all_joined(&self) -> bool {
        self.participants.iter().all(|p| p.has_joined)
    }

    pub fn all_nonces(&self) -> bool {
        self.participants.iter().all(|p| p.has_nonce)
    }

    /// True iff every participant has supplied a partial signature
    pub fn can_finalize(&self) -> bool {
        self.participants.iter().all(|p| p.has_partial_sig)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Invariants that must hold at every point of the session
    pub fn invariants_hold(&self) -> bool {
        self.participants.iter().filter(|p| p.is_me).count() == 1
            && self
                .participants
                .iter()
                .all(|p| !p.has_partial_sig || p.has_nonce)
            && (self.state != SessionState::Completed || self.can_finalize())
    }

    /// Move to `next`, recording the transition for listeners
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoordinatorError::InvalidSession(format!(
                "illegal transition {} -> {} in session {}",
                self.state, next, self.id
            )));
        }
        self.transitions.push((self.state, next));
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// End the session in a failure state
    pub fn terminate(&mut self, state: SessionState, reason: &str) -> Result<()> {
        self.transition(state)?;
        self.reason = Some(reason.to_string());
        Ok(())
    }

    pub fn take_transitions(&mut self) -> Vec<(SessionState, SessionState)> {
        std::mem::take(&mut self.transitions)
    }

    pub fn mark_joined(&mut self, public_key_hex: &str, peer_id: Option<&str>) -> Result<bool> {
        let participant = self.participant_mut(public_key_hex)?;
        let changed = !participant.has_joined;
        participant.has_joined = true;
        if let Some(peer_id) = peer_id {
            participant.peer_id = Some(peer_id.to_string());
        }
        self.updated_at = Utc::now();
        Ok(changed)
    }

    /// Record a public nonce. Identical re-delivery is a no-op; a different
    /// nonce for a key that already has one is rejected.
    pub fn record_nonce(&mut self, public_key_hex: &str, nonce: &str) -> Result<()> {
        match self.nonces.get(public_key_hex) {
            Some(existing) if existing == nonce => return Ok(()),
            Some(_) => {
                return Err(CoordinatorError::OutOfOrderProtocolMessage(format!(
                    "conflicting nonce from {}",
                    public_key_hex
                )))
            }
            None if self.state.nonces_complete() => {
                return Err(CoordinatorError::OutOfOrderProtocolMessage(format!(
                    "nonce from {} after nonce round closed",
                    public_key_hex
                )))
            }
            None => {}
        }

        let participant = self.participant_mut(public_key_hex)?;
        participant.has_nonce = true;
        participant.has_joined = true;
        self.nonces
            .insert(public_key_hex.to_string(), nonce.to_string());
        self.updated_at = Utc::now();

        self.advance_nonce_round()
    }

    /// Close the nonce round once everyone has reported
    pub fn advance_nonce_round(&mut self) -> Result<()> {
        if self.state == SessionState::NonceExchange && self.all_nonces() {
            self.transition(SessionState::NoncesExchanged)?;
        }
        Ok(())
    }

    /// Record a partial signature; the sender's nonce must already be known
    pub fn record_partial_signature(&mut self, public_key_hex: &str, partial: &str) -> Result<()> {
        let participant = self.participant_mut(public_key_hex)?;
        if !participant.has_nonce {
            return Err(CoordinatorError::OutOfOrderProtocolMessage(format!(
                "partial signature from {} before its nonce",
                public_key_hex
            )));
        }
        participant.has_partial_sig = true;
        self.partial_signatures
            .insert(public_key_hex.to_string(), partial.to_string());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Payload invited co-signers need to join
    pub fn announcement(&self) -> Result<SessionAnnouncement> {
        Ok(SessionAnnouncement {
            session_id: self.id.clone(),
            coordinator_peer_id: self.coordinator_peer_id.clone(),
            coordinator_public_key: self.coordinator_public_key.clone(),
            signers: self.public_keys(),
            required_signers: self.participants.len(),
            message_hash: sha256_hex(&self.message_bytes()?),
            message_hex: self.message_hex.clone(),
            metadata: self.metadata.clone(),
            expires_at: self.expires_at,
        })
    }
}
