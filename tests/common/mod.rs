#![allow(dead_code)]

use musig_cosign::discovery::{MemoryDirectory, SignerConfig, SignerCriteria, TxTypes};
use musig_cosign::events::{SessionEvent, Subscription};
use musig_cosign::network::MemoryNetwork;
use musig_cosign::session::{SessionAnnouncement, TranscriptBackend};
use musig_cosign::{CoordinatorConfig, KeyPair, SigningNode};
use std::sync::Arc;
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Signing nodes sharing one in-process network and directory
pub struct Cluster {
    pub network: Arc<MemoryNetwork>,
    pub directory: Arc<MemoryDirectory>,
    pub nodes: Vec<SigningNode>,
}

impl Cluster {
    /// Start `names.len()` nodes, each advertising itself as a spend signer
    pub async fn start(names: &[&str]) -> Self {
        let network = MemoryNetwork::new();
        let directory = MemoryDirectory::new();

        let mut nodes = Vec::new();
        for name in names {
            let (transport, inbound) = network.register(name).await;
            let node = SigningNode::new(
                CoordinatorConfig::default(),
                Arc::new(KeyPair::generate()),
                transport,
                inbound,
                directory.clone(),
                Arc::new(TranscriptBackend::new()),
            );
            node.start().await.unwrap();
            node.discovery()
                .advertise_signer(SignerConfig::new(TxTypes::SPEND).with_nickname(name))
                .await
                .unwrap();
            nodes.push(node);
        }

        Self {
            network,
            directory,
            nodes,
        }
    }

    pub fn node(&self, index: usize) -> &SigningNode {
        &self.nodes[index]
    }

    /// Public keys of every node except `index`, as seen through discovery
    pub async fn discover_from(&self, index: usize) -> Vec<String> {
        self.node(index)
            .discovery()
            .discover_signers(&SignerCriteria::for_transaction(TxTypes::SPEND))
            .await
            .unwrap()
            .into_iter()
            .map(|ad| ad.public_key_hex)
            .collect()
    }

    pub async fn stop(&self) {
        for node in &self.nodes {
            node.stop().await.unwrap();
        }
    }
}

/// Wait for an invitation to `session_id`
pub async fn next_announcement(
    events: &mut Subscription<SessionEvent>,
    session_id: &str,
) -> SessionAnnouncement {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Some(SessionEvent::Announced(announcement))
                    if announcement.session_id == session_id =>
                {
                    return announcement
                }
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("no announcement")
}
