//! In-process transport
//!
//! All nodes of a [`MemoryNetwork`] live in one process and exchange
//! envelopes over channels. Reachability can be switched per peer, which is
//! how tests and the simulator model offline co-signers.

use crate::error::{CoordinatorError, Result};
use crate::network::message::Envelope;
use crate::network::transport::{ConnectionState, DialTarget, PeerTransport, INBOUND_CAPACITY};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug)]
struct Member {
    inbound: mpsc::Sender<Envelope>,
    reachable: bool,
}

#[derive(Debug, Default)]
struct NetworkState {
    members: HashMap<String, Member>,
    /// Open links, stored with the smaller peer id first
    links: HashSet<(String, String)>,
    /// Last non-connected state seen by (local, remote)
    states: HashMap<(String, String), ConnectionState>,
    /// Dial attempts per target peer
    attempts: HashMap<String, u32>,
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Debug, Default)]
pub struct MemoryNetwork {
    state: RwLock<NetworkState>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a peer. Returns its transport and inbound envelope stream.
    pub async fn register(
        self: &Arc<Self>,
        peer_id: &str,
    ) -> (Arc<MemoryTransport>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        self.state.write().await.members.insert(
            peer_id.to_string(),
            Member {
                inbound: tx,
                reachable: true,
            },
        );

        let transport = Arc::new(MemoryTransport {
            network: self.clone(),
            peer_id: peer_id.to_string(),
        });
        (transport, rx)
    }

    /// Take a peer offline (dropping its links) or bring it back
    pub async fn set_reachable(&self, peer_id: &str, reachable: bool) {
        let mut state = self.state.write().await;
        if let Some(member) = state.members.get_mut(peer_id) {
            member.reachable = reachable;
        }
        if !reachable {
            let dropped: Vec<(String, String)> = state
                .links
                .iter()
                .filter(|(a, b)| a == peer_id || b == peer_id)
                .cloned()
                .collect();
            for (a, b) in dropped {
                state.links.remove(&(a.clone(), b.clone()));
                state
                    .states
                    .insert((a.clone(), b.clone()), ConnectionState::Disconnected);
                state.states.insert((b, a), ConnectionState::Disconnected);
            }
        }
    }

    /// Dial attempts made towards `peer_id` by anyone
    pub async fn connect_attempts(&self, peer_id: &str) -> u32 {
        self.state
            .read()
            .await
            .attempts
            .get(peer_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn is_linked(&self, a: &str, b: &str) -> bool {
        self.state.read().await.links.contains(&link_key(a, b))
    }
}

/// One peer's handle on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    peer_id: String,
}

impl MemoryTransport {
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_peer_id(&self) -> &str {
        &self.peer_id
    }

    fn listen_addrs(&self) -> Vec<String> {
        vec![format!("/memory/{}", self.peer_id)]
    }

    async fn connect(&self, target: &DialTarget) -> Result<()> {
        let mut state = self.network.state.write().await;
        *state.attempts.entry(target.peer_id.clone()).or_insert(0) += 1;

        let key = link_key(&self.peer_id, &target.peer_id);
        if state.links.contains(&key) {
            return Ok(());
        }

        let reachable = |id: &str| state.members.get(id).map(|m| m.reachable).unwrap_or(false);
        if !reachable(&self.peer_id) || !reachable(&target.peer_id) {
            state.states.insert(
                (self.peer_id.clone(), target.peer_id.clone()),
                ConnectionState::Failed,
            );
            log::debug!("{} could not reach {}", self.peer_id, target.peer_id);
            return Err(CoordinatorError::ParticipantUnreachable(
                target.peer_id.clone(),
            ));
        }

        state.links.insert(key);
        log::debug!("{} connected to {}", self.peer_id, target.peer_id);
        Ok(())
    }

    async fn disconnect(&self, peer_id: &str) -> Result<()> {
        let mut state = self.network.state.write().await;
        if state.links.remove(&link_key(&self.peer_id, peer_id)) {
            state.states.insert(
                (self.peer_id.clone(), peer_id.to_string()),
                ConnectionState::Disconnected,
            );
            state.states.insert(
                (peer_id.to_string(), self.peer_id.clone()),
                ConnectionState::Disconnected,
            );
        }
        Ok(())
    }

    async fn connection_state(&self, peer_id: &str) -> ConnectionState {
        let state = self.network.state.read().await;
        if state.links.contains(&link_key(&self.peer_id, peer_id)) {
            return ConnectionState::Connected;
        }
        state
            .states
            .get(&(self.peer_id.clone(), peer_id.to_string()))
            .copied()
            .unwrap_or(ConnectionState::Unknown)
    }

    async fn send(&self, peer_id: &str, envelope: Envelope) -> Result<()> {
        let inbound = {
            let state = self.network.state.read().await;
            if !state.links.contains(&link_key(&self.peer_id, peer_id)) {
                return Err(CoordinatorError::ParticipantUnreachable(peer_id.to_string()));
            }
            state
                .members
                .get(peer_id)
                .map(|m| m.inbound.clone())
                .ok_or_else(|| CoordinatorError::ParticipantUnreachable(peer_id.to_string()))?
        };

        inbound
            .send(envelope)
            .await
            .map_err(|_| CoordinatorError::Transport(format!("{} stopped receiving", peer_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::network::message::ProtocolMessage;

    #[tokio::test]
    async fn test_connect_and_deliver() {
        let network = MemoryNetwork::new();
        let (alice, _alice_rx) = network.register("alice").await;
        let (bob, mut bob_rx) = network.register("bob").await;

        assert_eq!(alice.connection_state("bob").await, ConnectionState::Unknown);
        alice.connect(&DialTarget::peer("bob")).await.unwrap();
        assert_eq!(alice.connection_state("bob").await, ConnectionState::Connected);
        assert_eq!(bob.connection_state("alice").await, ConnectionState::Connected);

        let key = KeyPair::generate();
        let envelope = Envelope::seal("alice", &key, ProtocolMessage::Ping(1)).unwrap();
        alice.send("bob", envelope.clone()).await.unwrap();
        assert_eq!(bob_rx.recv().await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let network = MemoryNetwork::new();
        let (alice, _rx) = network.register("alice").await;
        let (_bob, _bob_rx) = network.register("bob").await;
        network.set_reachable("bob", false).await;

        let result = alice.connect(&DialTarget::peer("bob")).await;
        assert!(matches!(result, Err(CoordinatorError::ParticipantUnreachable(_))));
        assert_eq!(alice.connection_state("bob").await, ConnectionState::Failed);
        assert_eq!(network.connect_attempts("bob").await, 1);

        // Unknown peers are unreachable too
        assert!(alice.connect(&DialTarget::peer("carol")).await.is_err());
    }

    #[tokio::test]
    async fn test_going_offline_drops_links() {
        let network = MemoryNetwork::new();
        let (alice, _rx) = network.register("alice").await;
        let (_bob, _bob_rx) = network.register("bob").await;
        alice.connect(&DialTarget::peer("bob")).await.unwrap();

        network.set_reachable("bob", false).await;
        assert_eq!(
            alice.connection_state("bob").await,
            ConnectionState::Disconnected
        );

        let key = KeyPair::generate();
        let envelope = Envelope::seal("alice", &key, ProtocolMessage::Ping(2)).unwrap();
        assert!(alice.send("bob", envelope).await.is_err());

        network.set_reachable("bob", true).await;
        alice.connect(&DialTarget::peer("bob")).await.unwrap();
        assert!(network.is_linked("bob", "alice").await);
    }
}
