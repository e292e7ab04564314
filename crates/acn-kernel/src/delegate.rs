//! Delegate service: agents that cannot join the overlay connect to a Peer
//! over TCP+TLS and exchange framed ACN messages on one long-lived session.
//!
//! Session setup:
//! 1. TLS handshake with the Peer's session certificate.
//! 2. The Peer writes one frame holding its signature over the session key.
//! 3. The agent sends `Register` and gets a `Status` back.
//!
//! Afterwards both sides send `Envelope` messages and acknowledge each one
//! they receive with a `Status`. Envelopes from the agent are forwarded by a
//! worker per (sender, target) pair, so ordering holds per pair.

use crate::error::{KernelError, KernelResult};
use crate::peer::PeerNode;
use crate::tls;
use acn_types::{AgentRecord, Envelope, Status, StatusCode};
use acn_wire::message::{AcnMessage, AcnPayload};
use acn_wire::protocol::{
    read_frame, read_message, read_registration, register, send_status, send_success,
    write_frame, write_message,
};
use acn_wire::{por, WireError};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Acks buffered between the session reader and a waiting delivery.
const ACK_BUFFER: usize = 16;

/// Default time a [`DelegateClient`] waits for the Peer to acknowledge.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// One registered delegate agent.
pub struct DelegateSession {
    record: AgentRecord,
    writer: Mutex<BoxedWriter>,
    acks: Mutex<mpsc::Receiver<Status>>,
}

impl DelegateSession {
    fn new(record: AgentRecord, writer: BoxedWriter, acks: mpsc::Receiver<Status>) -> Self {
        Self {
            record,
            writer: Mutex::new(writer),
            acks: Mutex::new(acks),
        }
    }

    pub fn address(&self) -> &str {
        &self.record.address
    }

    pub fn record(&self) -> &AgentRecord {
        &self.record
    }

    async fn send(&self, msg: &AcnMessage) -> Result<(), WireError> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, msg).await
    }

    async fn send_status(&self, status: Status) -> Result<(), WireError> {
        self.send(&AcnMessage::status(status)).await
    }

    /// Push an envelope to the agent and wait for its acknowledgement.
    ///
    /// Deliveries on one session are serialized so each ack matches the
    /// envelope it follows.
    pub async fn deliver(
        &self,
        sender: AgentRecord,
        envelope: &Envelope,
        timeout: Duration,
    ) -> KernelResult<()> {
        let mut acks = self.acks.lock().await;
        // Late acks of deliveries that already timed out
        while acks.try_recv().is_ok() {}

        self.send(&AcnMessage::envelope(sender, envelope)?).await?;
        match tokio::time::timeout(timeout, acks.recv()).await {
            Ok(Some(status)) if status.is_success() => Ok(()),
            Ok(Some(status)) => Err(WireError::Status(status).into()),
            Ok(None) => Err(WireError::ConnectionClosed.into()),
            Err(_) => Err(KernelError::status(
                StatusCode::ErrorGeneric,
                format!(
                    "delegate client {} did not acknowledge within {timeout:?}",
                    self.address()
                ),
            )),
        }
    }
}

/// Live delegate sessions by agent address.
#[derive(Default)]
pub struct DelegateSessions {
    sessions: DashMap<String, Arc<DelegateSession>>,
}

impl DelegateSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session, returning the one it replaces.
    pub fn insert(&self, session: Arc<DelegateSession>) -> Option<Arc<DelegateSession>> {
        self.sessions.insert(session.address().to_string(), session)
    }

    /// Remove `session` unless a newer session for its address replaced it.
    pub fn remove_if_same(&self, session: &Arc<DelegateSession>) -> bool {
        self.sessions
            .remove_if(session.address(), |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn get(&self, address: &str) -> Option<Arc<DelegateSession>> {
        self.sessions.get(address).map(|s| Arc::clone(s.value()))
    }

    pub fn record(&self, address: &str) -> Option<AgentRecord> {
        self.sessions.get(address).map(|s| s.record.clone())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.sessions.contains_key(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Detaches a session from its Peer when the connection task ends,
/// including when the task is cancelled by shutdown.
struct SessionGuard {
    node: Weak<PeerNode>,
    session: Arc<DelegateSession>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(node) = self.node.upgrade() {
            node.detach_delegate(&self.session);
        }
    }
}

/// Accept delegate connections until the Peer goes away.
pub(crate) async fn serve(listener: TcpListener, acceptor: TlsAcceptor, node: Weak<PeerNode>) {
    loop {
        match listener.accept().await {
            Ok((tcp, addr)) => {
                let Some(peer) = node.upgrade() else {
                    break;
                };
                debug!("ACN: accepted delegate connection from {}", addr);
                let acceptor = acceptor.clone();
                let weak = node.clone();
                peer.supervisor().spawn("delegate-conn", async move {
                    if let Err(e) = handle_connection(tcp, addr, acceptor, weak).await {
                        debug!("ACN: delegate connection from {} ended: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("ACN: delegate accept error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn handle_connection(
    tcp: TcpStream,
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    node: Weak<PeerNode>,
) -> KernelResult<()> {
    let peer = node.upgrade().ok_or(KernelError::ShuttingDown)?;
    let delay = peer.registration_delay();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mut stream = acceptor
        .accept(tcp)
        .await
        .map_err(|e| KernelError::Tls(format!("handshake with {addr} failed: {e}")))?;
    let signature = peer
        .tls_identity()
        .map(|t| t.signature().to_vec())
        .ok_or_else(|| KernelError::Tls("no session identity".into()))?;
    write_frame(&mut stream, &signature).await?;

    let record = read_registration(&mut stream).await?;
    if let Err(status) = por::check(&record, &record.address, &peer.public_key()) {
        warn!(
            addr = %record.address,
            "ACN: rejected delegate registration from {}: {}", addr, status
        );
        send_status(&mut stream, status.clone()).await?;
        return Err(status.into());
    }
    send_success(&mut stream).await?;

    let (reader, writer) = tokio::io::split(stream);
    let (ack_tx, ack_rx) = mpsc::channel(ACK_BUFFER);
    let session = Arc::new(DelegateSession::new(record, Box::new(writer), ack_rx));
    peer.attach_delegate(Arc::clone(&session)).await;
    let pair_queue_size = peer.pair_queue_size();
    info!(
        "ACN: delegate client {} registered from {}",
        session.address(),
        addr
    );
    drop(peer);

    let _guard = SessionGuard {
        node: node.clone(),
        session: Arc::clone(&session),
    };
    run_session(reader, &session, ack_tx, node, pair_queue_size).await
}

async fn run_session<R>(
    mut reader: R,
    session: &DelegateSession,
    acks: mpsc::Sender<Status>,
    node: Weak<PeerNode>,
    pair_queue_size: usize,
) -> KernelResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut pairs: HashMap<String, mpsc::Sender<Envelope>> = HashMap::new();
    loop {
        let msg = match read_message(&mut reader).await {
            Ok(msg) => msg,
            Err(WireError::ConnectionClosed) => {
                info!("ACN: delegate client {} disconnected", session.address());
                return Ok(());
            }
            Err(e @ (WireError::Json(_) | WireError::VersionMismatch { .. })) => {
                session.send_status(e.to_status()).await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match msg.payload {
            AcnPayload::Status { status } => {
                if acks.try_send(status).is_err() {
                    debug!(addr = %session.address(), "ACN: dropping unsolicited ack");
                }
            }
            AcnPayload::Envelope { envelope, .. } => {
                let envelope = match Envelope::from_bytes(&envelope) {
                    Ok(env) => env,
                    Err(e) => {
                        session
                            .send_status(Status::error(StatusCode::ErrorDecode, e.to_string()))
                            .await?;
                        continue;
                    }
                };
                if envelope.sender != session.address() {
                    session
                        .send_status(Status::error(
                            StatusCode::ErrorWrongAgentAddress,
                            format!(
                                "envelope sender {} does not match registered address {}",
                                envelope.sender,
                                session.address()
                            ),
                        ))
                        .await?;
                    continue;
                }
                session.send_status(Status::success()).await?;
                forward(&mut pairs, envelope, &node, pair_queue_size);
            }
            other => {
                let err = WireError::UnexpectedPayload {
                    expected: "envelope",
                    got: other.kind(),
                };
                session.send_status(err.to_status()).await?;
            }
        }
    }
}

/// Hand an acknowledged envelope to the worker of its (sender, target) pair.
fn forward(
    pairs: &mut HashMap<String, mpsc::Sender<Envelope>>,
    envelope: Envelope,
    node: &Weak<PeerNode>,
    capacity: usize,
) {
    let target = envelope.to.clone();
    let queue = match pairs.get(&target) {
        Some(tx) if !tx.is_closed() => tx.clone(),
        _ => {
            let Some(tx) = spawn_pair_worker(node, capacity) else {
                return;
            };
            pairs.insert(target.clone(), tx.clone());
            tx
        }
    };
    match queue.try_send(envelope) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(env)) => {
            warn!(
                sender = %env.sender,
                to = %env.to,
                capacity,
                "ACN: delegate pair queue full, dropping envelope"
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(to = %target, "ACN: delegate pair worker stopped");
        }
    }
}

fn spawn_pair_worker(node: &Weak<PeerNode>, capacity: usize) -> Option<mpsc::Sender<Envelope>> {
    let peer = node.upgrade()?;
    let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));
    let weak = node.clone();
    peer.supervisor().spawn("delegate-pair", async move {
        while let Some(envelope) = rx.recv().await {
            let Some(peer) = weak.upgrade() else {
                break;
            };
            let (sender, to) = (envelope.sender.clone(), envelope.to.clone());
            if let Err(e) = peer.route_envelope(envelope).await {
                warn!(
                    sender = %sender,
                    to = %to,
                    error = %e,
                    "ACN: failed to route envelope from delegate client"
                );
            }
        }
    });
    Some(tx)
}

/// Agent side of a delegate session.
pub struct DelegateClient {
    record: AgentRecord,
    writer: Arc<Mutex<BoxedWriter>>,
    acks: Mutex<mpsc::Receiver<Status>>,
    inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    ack_timeout: Duration,
    reader: JoinHandle<()>,
}

impl DelegateClient {
    /// Connect, check the Peer's session signature against
    /// `peer_public_key`, and register `record`.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        peer_public_key: &str,
        record: AgentRecord,
    ) -> KernelResult<Self> {
        let tcp = TcpStream::connect(addr).await.map_err(WireError::Io)?;
        let mut stream = tls::client_connector()?
            .connect(tls::server_name()?, tcp)
            .await
            .map_err(|e| KernelError::Tls(e.to_string()))?;

        let cert = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .cloned()
            .ok_or_else(|| KernelError::Tls("peer presented no certificate".into()))?;
        let signature = read_frame(&mut stream).await?;
        tls::verify_session(peer_public_key, &cert, &signature)?;

        register(&mut stream, record.clone()).await?;
        debug!(addr = %record.address, "ACN: registered with delegate service");

        let (reader, writer) = tokio::io::split(stream);
        let writer: Arc<Mutex<BoxedWriter>> = Arc::new(Mutex::new(Box::new(writer)));
        let (ack_tx, ack_rx) = mpsc::channel(ACK_BUFFER);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(client_reader(reader, Arc::clone(&writer), ack_tx, inbox_tx));

        Ok(Self {
            record,
            writer,
            acks: Mutex::new(ack_rx),
            inbox: Mutex::new(inbox_rx),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            reader,
        })
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.record.address
    }

    /// Send an envelope and wait for the Peer to acknowledge it.
    pub async fn send(&self, envelope: &Envelope) -> KernelResult<()> {
        let mut acks = self.acks.lock().await;
        while acks.try_recv().is_ok() {}
        {
            let msg = AcnMessage::envelope(self.record.clone(), envelope)?;
            let mut writer = self.writer.lock().await;
            write_message(&mut *writer, &msg).await?;
        }
        match tokio::time::timeout(self.ack_timeout, acks.recv()).await {
            Ok(Some(status)) if status.is_success() => Ok(()),
            Ok(Some(status)) => Err(WireError::Status(status).into()),
            Ok(None) => Err(WireError::ConnectionClosed.into()),
            Err(_) => Err(KernelError::Timeout(format!(
                "delegate ack after {:?}",
                self.ack_timeout
            ))),
        }
    }

    /// Next envelope delivered by the Peer, or `None` once the session ends.
    pub async fn recv(&self) -> Option<Envelope> {
        self.inbox.lock().await.recv().await
    }

    pub async fn close(self) {
        use tokio::io::AsyncWriteExt;
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl Drop for DelegateClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn client_reader<R>(
    mut reader: R,
    writer: Arc<Mutex<BoxedWriter>>,
    acks: mpsc::Sender<Status>,
    inbox: mpsc::UnboundedSender<Envelope>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let msg = match read_message(&mut reader).await {
            Ok(msg) => msg,
            Err(e) => {
                debug!("ACN: delegate session closed: {}", e);
                return;
            }
        };
        let reply = match msg.payload {
            AcnPayload::Status { status } => {
                let _ = acks.try_send(status);
                continue;
            }
            AcnPayload::Envelope { envelope, .. } => match Envelope::from_bytes(&envelope) {
                Ok(envelope) => {
                    if inbox.send(envelope).is_err() {
                        return;
                    }
                    Status::success()
                }
                Err(e) => Status::error(StatusCode::ErrorDecode, e.to_string()),
            },
            other => WireError::UnexpectedPayload {
                expected: "envelope",
                got: other.kind(),
            }
            .to_status(),
        };
        let mut writer = writer.lock().await;
        if let Err(e) = send_status(&mut *writer, reply).await {
            debug!("ACN: failed to acknowledge delegate envelope: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acn_types::{LedgerId, LedgerKey, NodeKey};

    fn session_pair(address: &str) -> (Arc<DelegateSession>, mpsc::Sender<Status>, tokio::io::DuplexStream) {
        let key = LedgerKey::generate(LedgerId::Fetchai);
        let mut record = AgentRecord::sign(&key, &NodeKey::generate().public_key()).unwrap();
        record.address = address.to_string();
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(ACK_BUFFER);
        (
            Arc::new(DelegateSession::new(record, Box::new(local), rx)),
            tx,
            remote,
        )
    }

    #[test]
    fn test_sessions_replace_and_remove() {
        let sessions = DelegateSessions::new();
        let (first, _, _io1) = session_pair("fetch1a");
        let (second, _, _io2) = session_pair("fetch1a");

        assert!(sessions.insert(Arc::clone(&first)).is_none());
        assert!(sessions.insert(Arc::clone(&second)).is_some());
        // The stale session does not evict its replacement.
        assert!(!sessions.remove_if_same(&first));
        assert!(sessions.contains("fetch1a"));
        assert!(sessions.remove_if_same(&second));
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_deliver_waits_for_ack() {
        let (session, acks, mut remote) = session_pair("fetch1a");
        let env = Envelope::new("fetch1a", "fetch1b", b"hello".to_vec());

        let pending = {
            let session = Arc::clone(&session);
            let env = env.clone();
            let sender = session.record().clone();
            tokio::spawn(async move { session.deliver(sender, &env, Duration::from_secs(5)).await })
        };

        let msg = read_message(&mut remote).await.unwrap();
        match msg.payload {
            AcnPayload::Envelope { envelope, .. } => {
                assert_eq!(Envelope::from_bytes(&envelope).unwrap(), env);
            }
            other => panic!("unexpected {}", other.kind()),
        }
        acks.send(Status::success()).await.unwrap();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_deliver_error_ack() {
        let (session, acks, _remote) = session_pair("fetch1a");
        acks.send(Status::error(StatusCode::ErrorGeneric, "stale")).await.unwrap();

        let pending = {
            let session = Arc::clone(&session);
            let sender = session.record().clone();
            tokio::spawn(async move {
                session
                    .deliver(sender, &Envelope::new("fetch1a", "b", vec![]), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        acks.send(Status::error(StatusCode::ErrorAgentNotReady, "busy"))
            .await
            .unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ErrorAgentNotReady);
    }

    #[tokio::test]
    async fn test_deliver_timeout_is_generic() {
        let (session, _acks, _remote) = session_pair("fetch1a");
        let err = session
            .deliver(
                session.record().clone(),
                &Envelope::new("fetch1a", "b", vec![]),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ErrorGeneric);
    }
}
