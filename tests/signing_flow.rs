mod common;

use common::{next_announcement, Cluster, TIMEOUT};
use musig_cosign::events::SessionEvent;
use musig_cosign::network::PollSchedule;
use musig_cosign::{CoordinatorError, SessionState};
use std::collections::BTreeMap;

fn message() -> String {
    hex::encode(b"pay 21000 sats to the landlord")
}

/// Run every round on every node and return the signatures they produced
async fn sign_all(cluster: &Cluster, session_id: &str) -> Vec<String> {
    for node in &cluster.nodes {
        node.coordinator()
            .wait_until(session_id, TIMEOUT, |s| s.all_joined())
            .await
            .unwrap();
        node.coordinator().share_nonces(session_id).await.unwrap();
    }
    for node in &cluster.nodes {
        node.coordinator()
            .wait_until(session_id, TIMEOUT, |s| s.state.nonces_complete())
            .await
            .unwrap();
        node.coordinator()
            .share_partial_signature(session_id)
            .await
            .unwrap();
    }

    let mut signatures = Vec::new();
    for node in &cluster.nodes {
        node.coordinator()
            .wait_until(session_id, TIMEOUT, |s| s.can_finalize())
            .await
            .unwrap();
        signatures.push(node.coordinator().finalize_session(session_id).await.unwrap());
    }
    signatures
}

/// Create on node 0, announce, and have every other node join
async fn open_session(cluster: &Cluster) -> String {
    let mut invitations: Vec<_> = cluster.nodes[1..]
        .iter()
        .map(|n| n.coordinator().events())
        .collect();

    let initiator = cluster.node(0);
    let keys = cluster.discover_from(0).await;
    let session_id = initiator
        .coordinator()
        .create_signing_session(keys, initiator.identity(), &message(), BTreeMap::new())
        .await
        .unwrap();

    let preflight = initiator
        .connectivity()
        .preflight_session(&session_id)
        .await
        .unwrap();
    assert!(preflight.all_reachable);

    initiator
        .coordinator()
        .announce_session(&session_id)
        .await
        .unwrap();
    for (node, events) in cluster.nodes[1..].iter().zip(invitations.iter_mut()) {
        let announcement = next_announcement(events, &session_id).await;
        assert_eq!(announcement.required_signers, cluster.nodes.len());
        node.coordinator()
            .join_session(announcement, node.identity())
            .await
            .unwrap();
    }

    assert!(initiator
        .coordinator()
        .wait_for_participants(&session_id, &PollSchedule::confirmation())
        .await
        .unwrap());
    session_id
}

#[tokio::test]
async fn two_party_session_completes() {
    let cluster = Cluster::start(&["alice", "bob"]).await;
    let session_id = open_session(&cluster).await;

    let signatures = sign_all(&cluster, &session_id).await;
    assert_eq!(signatures[0], signatures[1]);

    for node in &cluster.nodes {
        let session = node.coordinator().get_session(&session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Completed);
        assert!(session.invariants_hold());
        assert_eq!(session.final_signature.as_deref(), Some(signatures[0].as_str()));
    }
    cluster.stop().await;
}

#[tokio::test]
async fn three_party_session_completes_over_a_mesh() {
    let cluster = Cluster::start(&["alice", "bob", "carol"]).await;
    let session_id = open_session(&cluster).await;

    // Joiners learn each other's peers from the roster
    let bob_view = cluster
        .node(1)
        .coordinator()
        .wait_until(&session_id, TIMEOUT, |s| s.all_joined())
        .await
        .unwrap();
    assert!(bob_view.participants.iter().all(|p| p.peer_id.is_some()));

    let signatures = sign_all(&cluster, &session_id).await;
    assert!(signatures.windows(2).all(|w| w[0] == w[1]));
    assert!(cluster
        .network
        .is_linked("bob", "carol")
        .await);
    cluster.stop().await;
}

#[tokio::test]
async fn unreachable_cosigner_is_reported_and_session_aborted() {
    let cluster = Cluster::start(&["alice", "bob"]).await;
    cluster.network.set_reachable("bob", false).await;

    let alice = cluster.node(0);
    let keys = cluster.discover_from(0).await;
    let session_id = alice
        .coordinator()
        .create_signing_session(keys.clone(), alice.identity(), &message(), BTreeMap::new())
        .await
        .unwrap();

    let report = alice
        .connectivity()
        .preflight_session(&session_id)
        .await
        .unwrap();
    assert!(!report.all_reachable);
    assert_eq!(report.unreachable.len(), 1);
    assert_eq!(report.unreachable[0].public_key_hex, keys[0]);
    assert_eq!(report.unreachable[0].nickname.as_deref(), Some("bob"));

    alice
        .coordinator()
        .abort_session(&session_id, "bob is offline")
        .await
        .unwrap();
    let session = alice.coordinator().get_session(&session_id).await.unwrap();
    assert_eq!(session.state, SessionState::Aborted);
    assert!(!session.reason.unwrap_or_default().is_empty());

    let result = alice.coordinator().share_nonces(&session_id).await;
    assert!(matches!(result, Err(CoordinatorError::SessionClosed { .. })));
    cluster.stop().await;
}

#[tokio::test]
async fn abort_reaches_cosigners() {
    let cluster = Cluster::start(&["alice", "bob", "carol"]).await;
    let session_id = open_session(&cluster).await;
    let mut carol_events = cluster.node(2).coordinator().events();
    cluster
        .node(1)
        .coordinator()
        .wait_until(&session_id, TIMEOUT, |s| s.all_joined())
        .await
        .unwrap();

    cluster
        .node(1)
        .coordinator()
        .abort_session(&session_id, "wrong amount")
        .await
        .unwrap();

    let reason = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(SessionEvent::Terminated { reason, state, .. }) = carol_events.recv().await {
                assert_eq!(state, SessionState::Aborted);
                return reason;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reason, "aborted by bob: wrong amount");

    let alice_view = cluster
        .node(0)
        .coordinator()
        .wait_until(&session_id, TIMEOUT, |s| s.state == SessionState::Aborted)
        .await
        .unwrap();
    assert!(alice_view.reason.unwrap().contains("wrong amount"));
    cluster.stop().await;
}

#[tokio::test]
async fn tampered_announcement_is_refused() {
    let cluster = Cluster::start(&["alice", "bob"]).await;
    let alice = cluster.node(0);
    let bob = cluster.node(1);
    let keys = cluster.discover_from(0).await;

    let session_id = alice
        .coordinator()
        .create_signing_session(keys, alice.identity(), &message(), BTreeMap::new())
        .await
        .unwrap();
    let mut announcement = alice
        .coordinator()
        .announce_session(&session_id)
        .await
        .unwrap();
    announcement.message_hex = hex::encode(b"pay everything to mallory");

    let result = bob
        .coordinator()
        .join_session(announcement, bob.identity())
        .await;
    assert!(matches!(result, Err(CoordinatorError::InvalidSession(_))));
    cluster.stop().await;
}
