//! Transport and DHT capability consumed by ACN nodes.
//!
//! A [`Host`] connects to peers, opens typed streams, and provides/finds DHT
//! content keys. Nodes register a [`StreamHandler`] per protocol id and only
//! ever see byte streams, so the routing and PoR logic is independent of the
//! transport implementation.

use acn_types::{AcnError, ContentKey, PeerId};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

/// Relay registration stream.
pub const REGISTER_PROTOCOL: &str = "/aea-register/0.1.0";
/// Address lookup stream.
pub const ADDRESS_PROTOCOL: &str = "/aea-address/0.1.0";
/// Envelope delivery stream.
pub const ENVELOPE_PROTOCOL: &str = "/aea/0.1.0";
/// Zero-payload "peer connected" notification.
pub const NOTIF_PROTOCOL: &str = "/aea-notif/0.1.0";

/// A bidirectional byte stream.
pub trait AcnIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AcnIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AcnIo>;

/// A stream opened by a remote peer.
pub struct InboundStream {
    /// Peer that opened the stream.
    pub remote_peer: PeerId,
    /// Compressed hex public key the transport authenticated for `remote_peer`.
    pub remote_public_key: String,
    pub protocol: String,
    pub io: BoxedStream,
}

impl fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStream")
            .field("remote_peer", &self.remote_peer)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("host is closed")]
    Closed,
    #[error("invalid multiaddress: {0}")]
    InvalidAddress(String),
    #[error("failed to dial {addr}: {reason}")]
    Dial { addr: String, reason: String },
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("no route to peer {0}")]
    NoRoute(PeerId),
    #[error("peer {peer} does not support protocol {protocol}")]
    ProtocolNotSupported { peer: PeerId, protocol: String },
    #[error("routing table is empty")]
    NoPeers,
    #[error("all {0} bootstrap peers failed")]
    BootstrapFailed(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

/// Handler for inbound streams of one protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle_stream(&self, stream: InboundStream);
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> StreamHandler for FnHandler<F>
where
    F: Fn(InboundStream) -> BoxFuture<'static, ()> + Send + Sync + 'static,
{
    async fn handle_stream(&self, stream: InboundStream) {
        (self.0)(stream).await
    }
}

/// Wrap an async closure as a [`StreamHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StreamHandler>
where
    F: Fn(InboundStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(move |stream| -> BoxFuture<'static, ()> {
        Box::pin(f(stream))
    }))
}

/// Overlay transport and DHT.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    fn peer_id(&self) -> PeerId;

    /// Compressed hex public key of this host.
    fn public_key(&self) -> String;

    /// Addresses other nodes can use to reach this host.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Connect to `addr`, returning the peer it resolves to.
    async fn connect(&self, addr: &Multiaddr) -> Result<PeerId, HostError>;

    /// Open a stream for `protocol` to `peer`, dialing if needed.
    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxedStream, HostError>;

    fn set_stream_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>);

    fn remove_stream_handler(&self, protocol: &str);

    /// Announce this host as a provider of `key`.
    async fn provide(&self, key: &ContentKey) -> Result<(), HostError>;

    /// Providers currently known for `key`.
    async fn find_providers(&self, key: &ContentKey) -> Result<Vec<PeerId>, HostError>;

    /// Connect to every bootstrap peer concurrently. Fails only if all fail.
    async fn bootstrap(&self, peers: &[Multiaddr]) -> Result<(), HostError>;

    fn connected_peers(&self) -> Vec<PeerId>;

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected_peers().iter().any(|p| p == peer)
    }

    /// Subscribe to connection events.
    fn subscribe(&self) -> broadcast::Receiver<HostEvent>;

    /// Drop every connection and stop accepting streams.
    async fn close(&self);
}

/// A multiaddress such as `/dns4/acn.example/tcp/9000/p2p/16Uiu2…`.
///
/// Only the `/p2p/` and `/p2p-circuit` components are interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Multiaddr(String);

impl Multiaddr {
    pub(crate) fn from_raw(addr: String) -> Self {
        Multiaddr(addr)
    }

    /// Circuit address reaching `target` through `relay`.
    pub fn circuit(relay: &PeerId, target: &PeerId) -> Self {
        Multiaddr(format!("/p2p/{relay}/p2p-circuit/p2p/{target}"))
    }

    /// Append a `/p2p/<peer>` component.
    pub fn with_peer(&self, peer: &PeerId) -> Self {
        Multiaddr(format!("{}/p2p/{}", self.0.trim_end_matches('/'), peer))
    }

    /// Peer id in the last `/p2p/` component.
    pub fn peer_id(&self) -> Option<PeerId> {
        let parts: Vec<&str> = self.0.split('/').collect();
        parts
            .windows(2)
            .rev()
            .find(|w| w[0] == "p2p")
            .and_then(|w| PeerId::from_str(w[1]).ok())
    }

    pub fn is_circuit(&self) -> bool {
        self.0.split('/').any(|c| c == "p2p-circuit")
    }

    /// Relay peer of a circuit address.
    pub fn relay(&self) -> Option<PeerId> {
        let (before, _) = self.0.split_once("/p2p-circuit")?;
        Multiaddr(before.to_string()).peer_id()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Multiaddr {
    type Err = AcnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches('/');
        if !trimmed.starts_with('/') {
            return Err(AcnError::PeerAddress(format!("{s}: must start with '/'")));
        }
        if trimmed.split('/').skip(1).any(|c| c.is_empty()) {
            return Err(AcnError::PeerAddress(format!("{s}: empty component")));
        }
        Ok(Multiaddr(trimmed.to_string()))
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a list of configured multiaddresses, failing on the first bad one.
pub fn parse_multiaddrs(addrs: &[String]) -> Result<Vec<Multiaddr>, AcnError> {
    addrs.iter().map(|a| Multiaddr::from_str(a)).collect()
}
