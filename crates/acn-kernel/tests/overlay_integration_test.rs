//! Integration tests for ACN overlay routing.
//!
//! Peers and Clients run on an in-process `MemoryNetwork`; the delegate
//! service runs over real TCP+TLS on localhost.

use acn_kernel::{ClientNode, DelegateClient, PeerNode};
use acn_types::config::{AcnConfig, NodeMode};
use acn_types::{AgentRecord, Envelope, LedgerId, LedgerKey, NodeKey, StatusCode};
use acn_wire::host::REGISTER_PROTOCOL;
use acn_wire::protocol::register;
use acn_wire::{Host, MemoryNetwork, WireError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn agent_record(node: &NodeKey) -> AgentRecord {
    let agent = LedgerKey::generate(LedgerId::Fetchai);
    AgentRecord::sign(&agent, &node.public_key()).unwrap()
}

fn peer_config(key: &NodeKey, dir: &Path, bootstrap: Vec<String>) -> AcnConfig {
    let mut config = AcnConfig::default();
    config.node.key = Some(key.to_hex());
    config.node.mode = NodeMode::Peer;
    config.node.bootstrap_peers = bootstrap;
    config.agent = Some(agent_record(key));
    config.peer.storage_path = Some(dir.join(format!("records_{}", key.peer_id())));
    config.peer.lookup_timeout_ms = 5_000;
    config.peer.lookup_retry_ms = 20;
    config.peer.bootstrap_timeout_ms = 1_000;
    config
}

fn client_config(key: &NodeKey, relay: &str) -> AcnConfig {
    let mut config = AcnConfig::default();
    config.node.key = Some(key.to_hex());
    config.node.mode = NodeMode::Client;
    config.node.bootstrap_peers = vec![relay.to_string()];
    config.agent = Some(agent_record(key));
    config.client.bootstrap_timeout_ms = 1_000;
    config.client.relay_stream_timeout_ms = 2_000;
    config
}

/// Attach a channel-backed agent to a node and mark it ready.
fn attach_agent<F>(set: F) -> mpsc::UnboundedReceiver<Envelope>
where
    F: FnOnce(Arc<mpsc::UnboundedSender<Envelope>>),
{
    let (tx, rx) = mpsc::unbounded_channel();
    set(Arc::new(tx));
    rx
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("envelope not delivered in time")
        .expect("agent channel closed")
}

async fn eventually<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Register `record` with `relay` over a raw register stream from `host`.
async fn register_via(host: &dyn Host, relay: &PeerNode, record: AgentRecord) {
    let mut stream = host.open_stream(&relay.peer_id(), REGISTER_PROTOCOL).await.unwrap();
    register(&mut stream, record).await.unwrap();
}

async fn start_peer(
    net: &MemoryNetwork,
    dir: &Path,
    bootstrap: Vec<String>,
) -> (Arc<PeerNode>, mpsc::UnboundedReceiver<Envelope>) {
    let key = NodeKey::generate();
    let node = PeerNode::start(peer_config(&key, dir, bootstrap), net.add_peer(&key))
        .await
        .unwrap();
    let rx = attach_agent(|tx| node.set_envelope_handler(tx));
    node.set_ready(true);
    (node, rx)
}

// ---------------------------------------------------------------------------
// Peer to Peer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_peer_to_peer_over_dht() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let (b, mut b_rx) = start_peer(&net, dir.path(), vec![]).await;
    let (a, mut a_rx) = start_peer(&net, dir.path(), vec![b.multi_addr().unwrap()]).await;
    let a_addr = a.agent_address().unwrap().to_string();
    let b_addr = b.agent_address().unwrap().to_string();

    a.route_envelope(Envelope::new(&b_addr, &a_addr, b"ping".to_vec()))
        .await
        .unwrap();
    let got = recv(&mut b_rx).await;
    assert_eq!(got.sender, a_addr);
    assert_eq!(got.message, b"ping");

    b.route_envelope(Envelope::new(&a_addr, &b_addr, b"pong".to_vec()))
        .await
        .unwrap();
    assert_eq!(recv(&mut a_rx).await.message, b"pong");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_bootstrap_notification_enables_announcement() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let (b, _b_rx) = start_peer(&net, dir.path(), vec![]).await;
    assert!(!b.announcement_enabled());

    let (a, _a_rx) = start_peer(&net, dir.path(), vec![b.multi_addr().unwrap()]).await;
    assert!(a.announcement_enabled());
    eventually(|| b.announcement_enabled()).await;

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_unreachable_bootstrap_is_fatal_without_records() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let key = NodeKey::generate();
    let ghost = NodeKey::generate().peer_id();
    let mut config = peer_config(&key, dir.path(), vec![format!("/memory/77/p2p/{ghost}")]);
    config.peer.bootstrap_timeout_ms = 300;
    let err = PeerNode::start(config, net.add_peer(&key)).await.err().unwrap();
    assert!(err.to_string().contains("bootstrap"));
}

// ---------------------------------------------------------------------------
// Relay clients
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_client_and_peer_exchange_through_relay() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let (relay, _relay_rx) = start_peer(&net, dir.path(), vec![]).await;
    let relay_addr = relay.multi_addr().unwrap();
    let (other, mut other_rx) = start_peer(&net, dir.path(), vec![relay_addr.clone()]).await;

    let client_key = NodeKey::generate();
    let client = ClientNode::start(client_config(&client_key, &relay_addr), net.add_client(&client_key))
        .await
        .unwrap();
    let mut client_rx = attach_agent(|tx| client.set_envelope_handler(tx));
    client.set_ready(true);

    let client_addr = client.agent_address().to_string();
    let other_addr = other.agent_address().unwrap().to_string();
    assert!(relay.relay_clients().contains(&client_addr));

    other
        .route_envelope(Envelope::new(&client_addr, &other_addr, b"to client".to_vec()))
        .await
        .unwrap();
    let got = recv(&mut client_rx).await;
    assert_eq!(got.sender, other_addr);
    assert_eq!(got.message, b"to client");

    client
        .route_envelope(Envelope::new(&other_addr, &client_addr, b"to peer".to_vec()))
        .await
        .unwrap();
    assert_eq!(recv(&mut other_rx).await.message, b"to peer");

    client.close().await;
    other.close().await;
    relay.close().await;
}

#[tokio::test]
async fn test_client_rejects_foreign_sender() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let (relay, _rx) = start_peer(&net, dir.path(), vec![]).await;
    let key = NodeKey::generate();
    let client = ClientNode::start(client_config(&key, &relay.multi_addr().unwrap()), net.add_client(&key))
        .await
        .unwrap();
    let err = client
        .route_envelope(Envelope::new("fetch1x", "fetch1notme", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::ErrorWrongAgentAddress);
    client.close().await;
    relay.close().await;
}

#[tokio::test]
async fn test_registration_with_wrong_key_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let (relay, _rx) = start_peer(&net, dir.path(), vec![]).await;

    let key = NodeKey::generate();
    let host = net.add_client(&key);
    let stolen = agent_record(&NodeKey::generate());
    let mut stream = host.open_stream(&relay.peer_id(), REGISTER_PROTOCOL).await.unwrap();
    match register(&mut stream, stolen.clone()).await {
        Err(WireError::Status(status)) => assert_eq!(status.code, StatusCode::ErrorWrongPublicKey),
        other => panic!("expected a status error, got {other:?}"),
    }
    assert!(!relay.relay_clients().contains(&stolen.address));
    relay.close().await;
}

#[tokio::test]
async fn test_relay_records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let relay_key = NodeKey::generate();
    let relay_config = peer_config(&relay_key, dir.path(), vec![]);

    let client_addr = {
        let net = MemoryNetwork::new();
        let relay = PeerNode::start(relay_config.clone(), net.add_peer(&relay_key))
            .await
            .unwrap();
        let key = NodeKey::generate();
        let client = ClientNode::start(client_config(&key, &relay.multi_addr().unwrap()), net.add_client(&key))
            .await
            .unwrap();
        let addr = client.agent_address().to_string();
        client.close().await;
        relay.close().await;
        addr
    };

    let net = MemoryNetwork::new();
    let relay = PeerNode::start(relay_config, net.add_peer(&relay_key))
        .await
        .unwrap();
    assert!(relay.relay_clients().contains(&client_addr));
    relay.close().await;
}

#[tokio::test]
async fn test_relay_index_replays_to_same_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let relay_key = NodeKey::generate();
    let relay_config = peer_config(&relay_key, dir.path(), vec![]);
    let moving = LedgerKey::generate(LedgerId::Fetchai);
    let fixed = LedgerKey::generate(LedgerId::Cosmos);

    let before = {
        let net = MemoryNetwork::new();
        let relay = PeerNode::start(relay_config.clone(), net.add_peer(&relay_key))
            .await
            .unwrap();
        let first = NodeKey::generate();
        let second = NodeKey::generate();
        let first_host = net.add_client(&first);
        let second_host = net.add_client(&second);

        let moving_addr = AgentRecord::sign(&moving, &first.public_key()).unwrap().address;
        register_via(&*first_host, &relay, AgentRecord::sign(&moving, &first.public_key()).unwrap()).await;
        register_via(&*first_host, &relay, AgentRecord::sign(&fixed, &first.public_key()).unwrap()).await;
        // Same agent moves to another client.
        register_via(&*second_host, &relay, AgentRecord::sign(&moving, &second.public_key()).unwrap()).await;

        let snapshot = relay.relay_clients().snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&moving_addr], second.peer_id());
        relay.close().await;
        snapshot
    };

    let net = MemoryNetwork::new();
    let relay = PeerNode::start(relay_config, net.add_peer(&relay_key))
        .await
        .unwrap();
    assert_eq!(relay.relay_clients().snapshot(), before);
    relay.close().await;
}

#[tokio::test]
async fn test_client_reconnects_after_relay_drop() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let (relay, _rx) = start_peer(&net, dir.path(), vec![]).await;
    let key = NodeKey::generate();
    let host = net.add_client(&key);
    let client = ClientNode::start(
        client_config(&key, &relay.multi_addr().unwrap()),
        Arc::clone(&host) as Arc<dyn Host>,
    )
    .await
    .unwrap();

    net.disconnect(&client.peer_id(), &relay.peer_id());
    let relay_id = relay.peer_id();
    eventually(|| host.is_connected(&relay_id)).await;
    client.close().await;
    relay.close().await;
}

// ---------------------------------------------------------------------------
// Delegate service
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_own_agent_wins_over_delegate_and_relay() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let key = NodeKey::generate();
    let ledger = LedgerKey::generate(LedgerId::Fetchai);
    let own = AgentRecord::sign(&ledger, &key.public_key()).unwrap();
    let own_addr = own.address.clone();
    let mut config = peer_config(&key, dir.path(), vec![]);
    config.agent = Some(own.clone());
    config.delegate.listen_addr = Some("127.0.0.1:0".to_string());
    let peer = PeerNode::start(config, net.add_peer(&key)).await.unwrap();
    let mut peer_rx = attach_agent(|tx| peer.set_envelope_handler(tx));
    peer.set_ready(true);

    // The same address is also served by a delegate client and a relay client.
    let delegate = DelegateClient::connect(peer.delegate_addr().unwrap(), &peer.public_key(), own)
        .await
        .unwrap();
    eventually(|| peer.delegate_clients().contains(&own_addr)).await;
    let relayed = NodeKey::generate();
    let relayed_host = net.add_client(&relayed);
    register_via(&*relayed_host, &peer, AgentRecord::sign(&ledger, &relayed.public_key()).unwrap()).await;
    assert!(peer.relay_clients().contains(&own_addr));

    let streams = net.streams_opened();
    peer.route_envelope(Envelope::new(&own_addr, &own_addr, b"local".to_vec()))
        .await
        .unwrap();
    assert_eq!(recv(&mut peer_rx).await.message, b"local");
    assert!(tokio::time::timeout(Duration::from_millis(300), delegate.recv())
        .await
        .is_err());
    assert_eq!(net.streams_opened(), streams);

    delegate.close().await;
    peer.close().await;
}

#[tokio::test]
async fn test_delegate_client_round_trip_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let key = NodeKey::generate();
    let mut config = peer_config(&key, dir.path(), vec![]);
    config.delegate.listen_addr = Some("127.0.0.1:0".to_string());
    let peer = PeerNode::start(config, net.add_peer(&key)).await.unwrap();
    let mut peer_rx = attach_agent(|tx| peer.set_envelope_handler(tx));
    peer.set_ready(true);
    let peer_addr = peer.agent_address().unwrap().to_string();

    let record = agent_record(&key);
    let delegate = DelegateClient::connect(peer.delegate_addr().unwrap(), &peer.public_key(), record)
        .await
        .unwrap();
    let delegate_addr = delegate.address().to_string();
    eventually(|| peer.delegate_clients().contains(&delegate_addr)).await;

    for i in 0..5u8 {
        delegate
            .send(&Envelope::new(&peer_addr, &delegate_addr, vec![i]))
            .await
            .unwrap();
    }
    for i in 0..5u8 {
        assert_eq!(recv(&mut peer_rx).await.message, vec![i]);
    }

    peer.route_envelope(Envelope::new(&delegate_addr, &peer_addr, b"back".to_vec()))
        .await
        .unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), delegate.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.message, b"back");

    delegate.close().await;
    eventually(|| !peer.delegate_clients().contains(&delegate_addr)).await;
    peer.close().await;
}

#[tokio::test]
async fn test_delegate_rejects_wrong_peer_key() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let key = NodeKey::generate();
    let mut config = peer_config(&key, dir.path(), vec![]);
    config.delegate.listen_addr = Some("127.0.0.1:0".to_string());
    let peer = PeerNode::start(config, net.add_peer(&key)).await.unwrap();

    let impostor = NodeKey::generate();
    let result = DelegateClient::connect(
        peer.delegate_addr().unwrap(),
        &impostor.public_key(),
        agent_record(&impostor),
    )
    .await;
    assert!(result.is_err());
    peer.close().await;
}

#[tokio::test]
async fn test_delegate_sender_spoofing_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let key = NodeKey::generate();
    let mut config = peer_config(&key, dir.path(), vec![]);
    config.delegate.listen_addr = Some("127.0.0.1:0".to_string());
    let peer = PeerNode::start(config, net.add_peer(&key)).await.unwrap();
    let peer_addr = peer.agent_address().unwrap().to_string();

    let delegate = DelegateClient::connect(peer.delegate_addr().unwrap(), &peer.public_key(), agent_record(&key))
        .await
        .unwrap();
    let err = delegate
        .send(&Envelope::new(&peer_addr, "fetch1spoofed", vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::ErrorWrongAgentAddress);
    delegate.close().await;
    peer.close().await;
}
