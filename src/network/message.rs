//! Protocol messages exchanged between co-signers
//!
//! Every message travels inside a signed [`Envelope`] so the receiver can
//! attribute it to a session key, whatever transport carried it.

use crate::crypto::{public_key_from_hex, sha256, verify_signature, KeyPair};
use crate::error::{CoordinatorError, Result};
use crate::session::SessionAnnouncement;
use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x43, 0x4F, 0x53, 0x4E]; // "COSN"

/// Largest accepted frame payload
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// A participant known to have joined, as relayed by the initiator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub public_key: String,
    pub peer_id: Option<String>,
}

/// Session protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// Invitation to a session, sent by the initiator
    SessionAnnounce(SessionAnnouncement),

    /// A co-signer accepted the invitation
    SessionJoin {
        session_id: String,
        public_key: String,
        peer_id: String,
    },

    /// Initiator's view of who has joined so far
    SessionRoster {
        session_id: String,
        joined: Vec<RosterEntry>,
    },

    /// Public nonce of one participant
    Nonce {
        session_id: String,
        public_key: String,
        nonce: String,
    },

    /// Partial signature of one participant
    PartialSignature {
        session_id: String,
        public_key: String,
        partial: String,
    },

    /// The sender gave up on the session
    SessionAbort { session_id: String, reason: String },

    /// Liveness check
    Ping(u64),

    /// Liveness reply
    Pong(u64),
}

impl ProtocolMessage {
    /// Session this message belongs to, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ProtocolMessage::SessionAnnounce(a) => Some(&a.session_id),
            ProtocolMessage::SessionJoin { session_id, .. }
            | ProtocolMessage::SessionRoster { session_id, .. }
            | ProtocolMessage::Nonce { session_id, .. }
            | ProtocolMessage::PartialSignature { session_id, .. }
            | ProtocolMessage::SessionAbort { session_id, .. } => Some(session_id),
            ProtocolMessage::Ping(_) | ProtocolMessage::Pong(_) => None,
        }
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ProtocolMessage::SessionAnnounce(_) => "SessionAnnounce",
            ProtocolMessage::SessionJoin { .. } => "SessionJoin",
            ProtocolMessage::SessionRoster { .. } => "SessionRoster",
            ProtocolMessage::Nonce { .. } => "Nonce",
            ProtocolMessage::PartialSignature { .. } => "PartialSignature",
            ProtocolMessage::SessionAbort { .. } => "SessionAbort",
            ProtocolMessage::Ping(_) => "Ping",
            ProtocolMessage::Pong(_) => "Pong",
        }
    }
}

/// A protocol message signed by the sender's key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from_peer: String,
    /// Compressed public key (hex) that signed this envelope
    pub sender_key: String,
    pub body: ProtocolMessage,
    /// ECDSA signature (hex) over [`Envelope::digest`]
    pub signature: String,
}

impl Envelope {
    /// Sign `body` with `key` on behalf of `from_peer`
    pub fn seal(from_peer: &str, key: &KeyPair, body: ProtocolMessage) -> Result<Self> {
        let digest = Self::digest(from_peer, &body)?;
        let signature = key.sign(&digest)?;
        Ok(Self {
            from_peer: from_peer.to_string(),
            sender_key: key.public_key_hex(),
            body,
            signature: hex::encode(signature),
        })
    }

    fn digest(from_peer: &str, body: &ProtocolMessage) -> Result<Vec<u8>> {
        let mut data = serde_json::to_vec(body)?;
        data.extend_from_slice(from_peer.as_bytes());
        Ok(sha256(&data))
    }

    /// Check the signature and hand out the body
    pub fn open(&self) -> Result<&ProtocolMessage> {
        let invalid = |what: &str| {
            CoordinatorError::InvalidMessage(format!("{} from peer {}", what, self.from_peer))
        };

        let key = public_key_from_hex(&self.sender_key).map_err(|_| invalid("bad sender key"))?;
        let signature = hex::decode(&self.signature).map_err(|_| invalid("malformed signature"))?;
        let digest = Self::digest(&self.from_peer, &self.body)?;

        match verify_signature(&key, &digest, &signature) {
            Ok(true) => Ok(&self.body),
            _ => Err(invalid("bad envelope signature")),
        }
    }

    /// Serialize envelope to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize envelope from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
