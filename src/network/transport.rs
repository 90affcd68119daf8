//! Peer connectivity seam
//!
//! The coordinator never opens sockets itself. It talks to a
//! [`PeerTransport`], which dials peers, reports per-peer connection state and
//! delivers signed envelopes. Inbound envelopes are handed out on an mpsc
//! channel created together with the transport.

use crate::error::Result;
use crate::network::message::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capacity of the inbound envelope channel
pub const INBOUND_CAPACITY: usize = 1024;

/// Connection state of one remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unknown,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        *self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Where to reach a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialTarget {
    pub peer_id: String,
    pub multiaddrs: Vec<String>,
}

impl DialTarget {
    pub fn new(peer_id: &str, multiaddrs: Vec<String>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            multiaddrs,
        }
    }

    /// Target with no known addresses; only transports that can route by
    /// peer id will reach it
    pub fn peer(peer_id: &str) -> Self {
        Self::new(peer_id, Vec::new())
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Our own peer id
    fn local_peer_id(&self) -> &str;

    /// Addresses other peers can dial us on
    fn listen_addrs(&self) -> Vec<String> {
        Vec::new()
    }

    /// Open a connection. Succeeds immediately if already connected.
    async fn connect(&self, target: &DialTarget) -> Result<()>;

    /// Close the connection to a peer, if any
    async fn disconnect(&self, peer_id: &str) -> Result<()>;

    async fn connection_state(&self, peer_id: &str) -> ConnectionState;

    /// Deliver an envelope to a connected peer
    async fn send(&self, peer_id: &str, envelope: Envelope) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Failed).unwrap(),
            "\"failed\""
        );
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Unknown.is_connected());
    }
}
