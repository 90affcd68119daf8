use musig_cosign::network::{
    ConnectionState, DialTarget, Envelope, PeerTransport, ProtocolMessage, TcpTransport,
};
use musig_cosign::KeyPair;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn wait_for_state(transport: &TcpTransport, peer_id: &str, state: ConnectionState) {
    timeout(WAIT, async {
        while transport.connection_state(peer_id).await != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection state did not change");
}

#[tokio::test]
async fn envelopes_cross_a_tcp_link() {
    let (alice, mut alice_rx) = TcpTransport::bind("alice", "127.0.0.1:0").await.unwrap();
    let (bob, mut bob_rx) = TcpTransport::bind("bob", "127.0.0.1:0").await.unwrap();

    let target = DialTarget::new("bob", vec![bob.local_multiaddr()]);
    alice.connect(&target).await.unwrap();
    assert_eq!(alice.connection_state("bob").await, ConnectionState::Connected);
    wait_for_state(&bob, "alice", ConnectionState::Connected).await;

    let alice_key = KeyPair::generate();
    let ping = Envelope::seal("alice", &alice_key, ProtocolMessage::Ping(7)).unwrap();
    alice.send("bob", ping.clone()).await.unwrap();
    let received = timeout(WAIT, bob_rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, ping);
    assert_eq!(received.open().unwrap(), &ProtocolMessage::Ping(7));

    // The accepted side can answer over the same link
    let bob_key = KeyPair::generate();
    let pong = Envelope::seal("bob", &bob_key, ProtocolMessage::Pong(7)).unwrap();
    bob.send("alice", pong.clone()).await.unwrap();
    assert_eq!(timeout(WAIT, alice_rx.recv()).await.unwrap().unwrap(), pong);

    alice.disconnect("bob").await.unwrap();
    assert_eq!(
        alice.connection_state("bob").await,
        ConnectionState::Disconnected
    );
    wait_for_state(&bob, "alice", ConnectionState::Disconnected).await;
}

#[tokio::test]
async fn dialing_a_closed_port_fails() {
    let (alice, _rx) = TcpTransport::bind("alice", "127.0.0.1:0").await.unwrap();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let target = DialTarget::new("ghost", vec![format!("/ip4/127.0.0.1/tcp/{}", port)]);
    assert!(alice.connect(&target).await.is_err());
    assert_eq!(alice.connection_state("ghost").await, ConnectionState::Failed);

    let undialable = DialTarget::new("nowhere", vec!["/memory/nowhere".to_string()]);
    assert!(alice.connect(&undialable).await.is_err());
}
