//! In-process overlay for tests and embedding.
//!
//! A [`MemoryNetwork`] hosts any number of [`MemoryHost`]s sharing one
//! provider table. Peers are dialable; clients are not and can only be
//! reached through a dialable host they are connected to, which mirrors
//! circuit relaying. Streams are `tokio::io::duplex` pairs.

use crate::host::{
    BoxedStream, Host, HostError, HostEvent, InboundStream, Multiaddr, StreamHandler,
};
use acn_types::{ContentKey, NodeKey, PeerId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

/// Buffer size of each in-memory stream direction.
const STREAM_BUFFER: usize = 64 * 1024;

const EVENT_CAPACITY: usize = 256;

/// Shared medium for a set of [`MemoryHost`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<NetworkState>,
}

#[derive(Default)]
struct NetworkState {
    hosts: RwLock<HashMap<PeerId, Arc<HostState>>>,
    providers: RwLock<HashMap<ContentKey, HashSet<PeerId>>>,
    provide_calls: RwLock<HashMap<ContentKey, usize>>,
    streams_opened: AtomicU64,
    next_slot: AtomicU64,
}

struct HostState {
    peer_id: PeerId,
    public_key: String,
    addr: Multiaddr,
    dialable: bool,
    handlers: RwLock<HashMap<String, Arc<dyn StreamHandler>>>,
    connections: RwLock<HashSet<PeerId>>,
    events: broadcast::Sender<HostEvent>,
    closed: AtomicBool,
}

impl HostState {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        let conns = self.connections.read().unwrap_or_else(|e| e.into_inner());
        conns.contains(peer)
    }

    fn connections(&self) -> Vec<PeerId> {
        let conns = self.connections.read().unwrap_or_else(|e| e.into_inner());
        conns.iter().cloned().collect()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dialable host, as a Peer node would run.
    pub fn add_peer(&self, key: &NodeKey) -> Arc<MemoryHost> {
        self.add_host(key, true)
    }

    /// Add a host that cannot accept inbound connections, as a Client node would run.
    pub fn add_client(&self, key: &NodeKey) -> Arc<MemoryHost> {
        self.add_host(key, false)
    }

    fn add_host(&self, key: &NodeKey, dialable: bool) -> Arc<MemoryHost> {
        let peer_id = key.peer_id();
        let slot = self.state.next_slot.fetch_add(1, Ordering::SeqCst);
        let addr = Multiaddr::from_raw(format!("/memory/{slot}/p2p/{peer_id}"));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = Arc::new(HostState {
            peer_id: peer_id.clone(),
            public_key: key.public_key(),
            addr,
            dialable,
            handlers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashSet::new()),
            events,
            closed: AtomicBool::new(false),
        });
        {
            let mut hosts = self.state.hosts.write().unwrap_or_else(|e| e.into_inner());
            hosts.insert(peer_id, Arc::clone(&state));
        }
        Arc::new(MemoryHost {
            state,
            network: self.clone(),
        })
    }

    /// Sever the connection between two hosts, emitting `Disconnected` on both.
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        if let (Some(a), Some(b)) = (self.host(a), self.host(b)) {
            unlink(&a, &b);
        }
    }

    /// Number of `provide` calls made for `key` across all hosts.
    pub fn provide_count(&self, key: &ContentKey) -> usize {
        let calls = self.state.provide_calls.read().unwrap_or_else(|e| e.into_inner());
        calls.get(key).copied().unwrap_or(0)
    }

    /// Number of streams successfully opened across all hosts.
    pub fn streams_opened(&self) -> u64 {
        self.state.streams_opened.load(Ordering::SeqCst)
    }

    fn host(&self, peer: &PeerId) -> Option<Arc<HostState>> {
        let hosts = self.state.hosts.read().unwrap_or_else(|e| e.into_inner());
        hosts.get(peer).cloned()
    }

    /// A host that has not been closed.
    fn live(&self, peer: &PeerId) -> Option<Arc<HostState>> {
        self.host(peer).filter(|h| !h.is_closed())
    }
}

fn link(a: &HostState, b: &HostState) {
    let new_a = {
        let mut conns = a.connections.write().unwrap_or_else(|e| e.into_inner());
        conns.insert(b.peer_id.clone())
    };
    let new_b = {
        let mut conns = b.connections.write().unwrap_or_else(|e| e.into_inner());
        conns.insert(a.peer_id.clone())
    };
    if new_a {
        let _ = a.events.send(HostEvent::Connected(b.peer_id.clone()));
    }
    if new_b {
        let _ = b.events.send(HostEvent::Connected(a.peer_id.clone()));
    }
}

fn unlink(a: &HostState, b: &HostState) {
    let had_a = {
        let mut conns = a.connections.write().unwrap_or_else(|e| e.into_inner());
        conns.remove(&b.peer_id)
    };
    let had_b = {
        let mut conns = b.connections.write().unwrap_or_else(|e| e.into_inner());
        conns.remove(&a.peer_id)
    };
    if had_a {
        let _ = a.events.send(HostEvent::Disconnected(b.peer_id.clone()));
    }
    if had_b {
        let _ = b.events.send(HostEvent::Disconnected(a.peer_id.clone()));
    }
}

/// A [`Host`] living on a [`MemoryNetwork`].
pub struct MemoryHost {
    state: Arc<HostState>,
    network: MemoryNetwork,
}

impl MemoryHost {
    fn ensure_open(&self) -> Result<(), HostError> {
        if self.state.is_closed() {
            Err(HostError::Closed)
        } else {
            Ok(())
        }
    }

    /// Make sure a connection to `target` exists, relaying if it is not dialable.
    fn ensure_connected(&self, target: &Arc<HostState>) -> Result<(), HostError> {
        if self.state.is_connected(&target.peer_id) {
            return Ok(());
        }
        if target.dialable {
            link(&self.state, target);
            return Ok(());
        }
        let relay = target
            .connections()
            .into_iter()
            .filter(|p| *p != self.state.peer_id)
            .filter_map(|p| self.network.live(&p))
            .find(|r| r.dialable || self.state.is_connected(&r.peer_id));
        match relay {
            Some(relay) => {
                link(&self.state, &relay);
                link(&self.state, target);
                Ok(())
            }
            None => Err(HostError::NoRoute(target.peer_id.clone())),
        }
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn peer_id(&self) -> PeerId {
        self.state.peer_id.clone()
    }

    fn public_key(&self) -> String {
        self.state.public_key.clone()
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        vec![self.state.addr.clone()]
    }

    async fn connect(&self, addr: &Multiaddr) -> Result<PeerId, HostError> {
        self.ensure_open()?;
        let target_id = addr
            .peer_id()
            .ok_or_else(|| HostError::InvalidAddress(format!("{addr}: no /p2p/ component")))?;
        if target_id == self.state.peer_id {
            return Err(HostError::InvalidAddress(format!("{addr}: cannot dial self")));
        }
        let dial_err = |reason: &str| HostError::Dial {
            addr: addr.to_string(),
            reason: reason.to_string(),
        };

        if let Some(relay_id) = addr.relay() {
            let relay = self
                .network
                .live(&relay_id)
                .ok_or_else(|| dial_err("relay unreachable"))?;
            if !relay.dialable && !self.state.is_connected(&relay_id) {
                return Err(dial_err("relay does not accept connections"));
            }
            let target = self
                .network
                .live(&target_id)
                .ok_or_else(|| dial_err("target unreachable"))?;
            if !relay.is_connected(&target_id) && !target.dialable {
                return Err(HostError::NoRoute(target_id));
            }
            link(&self.state, &relay);
            link(&self.state, &target);
        } else {
            let target = self
                .network
                .live(&target_id)
                .ok_or_else(|| dial_err("peer unreachable"))?;
            if !target.dialable {
                return Err(dial_err("peer does not accept connections"));
            }
            link(&self.state, &target);
        }
        debug!("memory: {} connected to {}", self.state.peer_id, target_id);
        Ok(target_id)
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxedStream, HostError> {
        self.ensure_open()?;
        let target = self
            .network
            .live(peer)
            .ok_or_else(|| HostError::UnknownPeer(peer.clone()))?;
        self.ensure_connected(&target)?;

        let handler = {
            let handlers = target.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(protocol).cloned()
        };
        let handler = handler.ok_or_else(|| HostError::ProtocolNotSupported {
            peer: peer.clone(),
            protocol: protocol.to_string(),
        })?;

        self.network.state.streams_opened.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        let inbound = InboundStream {
            remote_peer: self.state.peer_id.clone(),
            remote_public_key: self.state.public_key.clone(),
            protocol: protocol.to_string(),
            io: Box::new(remote),
        };
        tokio::spawn(async move {
            handler.handle_stream(inbound).await;
        });
        Ok(Box::new(local))
    }

    fn set_stream_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        let mut handlers = self.state.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(protocol.to_string(), handler);
    }

    fn remove_stream_handler(&self, protocol: &str) {
        let mut handlers = self.state.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(protocol);
    }

    async fn provide(&self, key: &ContentKey) -> Result<(), HostError> {
        self.ensure_open()?;
        {
            let mut calls = self
                .network
                .state
                .provide_calls
                .write()
                .unwrap_or_else(|e| e.into_inner());
            *calls.entry(key.clone()).or_insert(0) += 1;
        }
        if self.state.connections().is_empty() {
            return Err(HostError::NoPeers);
        }
        let mut providers = self
            .network
            .state
            .providers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        providers
            .entry(key.clone())
            .or_default()
            .insert(self.state.peer_id.clone());
        Ok(())
    }

    async fn find_providers(&self, key: &ContentKey) -> Result<Vec<PeerId>, HostError> {
        self.ensure_open()?;
        if self.state.connections().is_empty() {
            return Err(HostError::NoPeers);
        }
        let candidates: Vec<PeerId> = {
            let providers = self
                .network
                .state
                .providers
                .read()
                .unwrap_or_else(|e| e.into_inner());
            providers
                .get(key)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        Ok(candidates
            .into_iter()
            .filter(|p| *p != self.state.peer_id)
            .filter(|p| self.network.live(p).is_some())
            .collect())
    }

    async fn bootstrap(&self, peers: &[Multiaddr]) -> Result<(), HostError> {
        if peers.is_empty() {
            return Ok(());
        }
        let results = futures::future::join_all(peers.iter().map(|p| self.connect(p))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed == peers.len() {
            return Err(HostError::BootstrapFailed(failed));
        }
        Ok(())
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.state.connections()
    }

    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.state.events.subscribe()
    }

    async fn close(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut handlers = self.state.handlers.write().unwrap_or_else(|e| e.into_inner());
            handlers.clear();
        }
        for peer in self.state.connections() {
            if let Some(other) = self.network.host(&peer) {
                unlink(&self.state, &other);
            }
        }
        debug!("memory: {} closed", self.state.peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::handler_fn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::{assert_err, assert_ok};

    fn echo_handler() -> Arc<dyn StreamHandler> {
        handler_fn(|mut stream: InboundStream| async move {
            let mut buf = [0u8; 5];
            if stream.io.read_exact(&mut buf).await.is_ok() {
                let _ = stream.io.write_all(&buf).await;
            }
        })
    }

    async fn echo(host: &MemoryHost, peer: &PeerId) -> Result<Vec<u8>, HostError> {
        let mut stream = host.open_stream(peer, "/echo").await?;
        stream.write_all(b"hello").await?;
        let mut buf = vec![0u8; 5];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    #[tokio::test]
    async fn test_connect_and_stream() {
        let net = MemoryNetwork::new();
        let a = net.add_peer(&NodeKey::generate());
        let b = net.add_peer(&NodeKey::generate());
        b.set_stream_handler("/echo", echo_handler());

        let mut events = b.subscribe();
        let addr = b.listen_addrs()[0].clone();
        assert_eq!(a.connect(&addr).await.unwrap(), b.peer_id());
        assert_eq!(events.recv().await.unwrap(), HostEvent::Connected(a.peer_id()));
        assert!(a.is_connected(&b.peer_id()));

        assert_eq!(echo(&a, &b.peer_id()).await.unwrap(), b"hello");
        assert_eq!(net.streams_opened(), 1);
    }

    #[tokio::test]
    async fn test_inbound_stream_identity() {
        let net = MemoryNetwork::new();
        let key_a = NodeKey::generate();
        let a = net.add_peer(&key_a);
        let b = net.add_peer(&NodeKey::generate());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        b.set_stream_handler(
            "/id",
            handler_fn(move |stream: InboundStream| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((stream.remote_peer, stream.remote_public_key));
                }
            }),
        );
        let _stream = a.open_stream(&b.peer_id(), "/id").await.unwrap();
        let (peer, pk) = rx.recv().await.unwrap();
        assert_eq!(peer, key_a.peer_id());
        assert_eq!(pk, key_a.public_key());
    }

    #[tokio::test]
    async fn test_missing_protocol() {
        let net = MemoryNetwork::new();
        let a = net.add_peer(&NodeKey::generate());
        let b = net.add_peer(&NodeKey::generate());
        let err = a.open_stream(&b.peer_id(), "/none").await.err().unwrap();
        assert!(matches!(err, HostError::ProtocolNotSupported { .. }));
        assert_eq!(net.streams_opened(), 0);
    }

    #[tokio::test]
    async fn test_client_reachable_only_through_relay() {
        let net = MemoryNetwork::new();
        let relay = net.add_peer(&NodeKey::generate());
        let client = net.add_client(&NodeKey::generate());
        let other = net.add_peer(&NodeKey::generate());
        client.set_stream_handler("/echo", echo_handler());

        // Not dialable directly, and not connected to anyone yet
        assert_err!(other.connect(&client.listen_addrs()[0]).await);
        assert_err!(echo(&other, &client.peer_id()).await);

        assert_ok!(client.connect(&relay.listen_addrs()[0]).await);
        let circuit = Multiaddr::circuit(&relay.peer_id(), &client.peer_id());
        assert_eq!(other.connect(&circuit).await.unwrap(), client.peer_id());
        assert_eq!(echo(&other, &client.peer_id()).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_provide_and_find() {
        let net = MemoryNetwork::new();
        let a = net.add_peer(&NodeKey::generate());
        let b = net.add_peer(&NodeKey::generate());
        let key = ContentKey::for_address("fetch1a");

        assert!(matches!(a.provide(&key).await, Err(HostError::NoPeers)));
        a.connect(&b.listen_addrs()[0]).await.unwrap();
        a.provide(&key).await.unwrap();
        assert_eq!(net.provide_count(&key), 2);

        assert_eq!(b.find_providers(&key).await.unwrap(), vec![a.peer_id()]);
        assert!(a.find_providers(&key).await.unwrap().is_empty());

        a.close().await;
        assert!(matches!(b.find_providers(&key).await, Err(HostError::NoPeers)));
    }

    #[tokio::test]
    async fn test_close_emits_disconnect() {
        let net = MemoryNetwork::new();
        let a = net.add_peer(&NodeKey::generate());
        let b = net.add_peer(&NodeKey::generate());
        a.connect(&b.listen_addrs()[0]).await.unwrap();
        let mut events = b.subscribe();

        a.close().await;
        assert_eq!(
            events.recv().await.unwrap(),
            HostEvent::Disconnected(a.peer_id())
        );
        assert!(b.connected_peers().is_empty());
        assert!(matches!(
            a.open_stream(&b.peer_id(), "/echo").await,
            Err(HostError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_tolerates_partial_failure() {
        let net = MemoryNetwork::new();
        let a = net.add_peer(&NodeKey::generate());
        let b = net.add_peer(&NodeKey::generate());
        let gone = net.add_peer(&NodeKey::generate());
        let gone_addr = gone.listen_addrs()[0].clone();
        gone.close().await;

        a.bootstrap(&[gone_addr.clone(), b.listen_addrs()[0].clone()])
            .await
            .unwrap();
        assert!(a.is_connected(&b.peer_id()));
        assert!(matches!(
            a.bootstrap(&[gone_addr]).await,
            Err(HostError::BootstrapFailed(1))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_helper() {
        let net = MemoryNetwork::new();
        let a = net.add_client(&NodeKey::generate());
        let b = net.add_peer(&NodeKey::generate());
        a.connect(&b.listen_addrs()[0]).await.unwrap();
        let mut events = a.subscribe();

        net.disconnect(&a.peer_id(), &b.peer_id());
        assert_eq!(
            events.recv().await.unwrap(),
            HostEvent::Disconnected(b.peer_id())
        );
    }
}
