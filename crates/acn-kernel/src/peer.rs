//! Peer node: a full DHT participant that also relays for Clients and
//! serves delegate and mailbox agents.

use crate::agent::{AgentLink, EnvelopeProcessor};
use crate::delegate::{self, DelegateSession, DelegateSessions};
use crate::error::{with_timeout, KernelError, KernelResult};
use crate::mailbox::MailboxSessions;
use crate::monitoring::{Latency, Monitor};
use crate::supervisor::Supervisor;
use crate::tls::TlsIdentity;
use acn_store::RecordStore;
use acn_types::config::AcnConfig;
use acn_types::{AgentRecord, ContentKey, Envelope, NodeKey, PeerId, Status, StatusCode};
use acn_wire::host::{
    handler_fn, parse_multiaddrs, ADDRESS_PROTOCOL, ENVELOPE_PROTOCOL, NOTIF_PROTOCOL,
    REGISTER_PROTOCOL,
};
use acn_wire::message::AcnMessage;
use acn_wire::protocol::{
    deliver_envelope, lookup, read_envelope, read_lookup_request, read_registration, send_status,
    write_message,
};
use acn_wire::{
    por, AddressRegistry, AnnouncementSet, Host, HostError, HostEvent, InboundStream, Multiaddr,
    StreamHandler,
};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// First bootstrap retry sleep; doubles up to [`BACKOFF_MAX`].
const BACKOFF_START: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// How long `close` waits for background tasks.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a notifier to show up as connected.
const NOTIF_POLL: Duration = Duration::from_millis(50);

/// Largest notification payload read before it is discarded.
const MAX_NOTIF_SIZE: u64 = 1024;

pub struct PeerNode {
    config: AcnConfig,
    key: NodeKey,
    host: Arc<dyn Host>,
    own: Option<AgentRecord>,
    agent: AgentLink,
    relay_clients: AddressRegistry,
    delegates: DelegateSessions,
    mailboxes: MailboxSessions,
    announced: AnnouncementSet,
    announce_enabled: AtomicBool,
    store: Option<RecordStore>,
    tls: Option<TlsIdentity>,
    delegate_addr: OnceLock<SocketAddr>,
    monitor: Monitor,
    supervisor: Arc<Supervisor>,
}

impl PeerNode {
    /// Start a Peer on `host`, with metrics enabled per `[monitoring]`.
    pub async fn start(config: AcnConfig, host: Arc<dyn Host>) -> KernelResult<Arc<Self>> {
        let monitor = Monitor::from_config(&config.monitoring);
        Self::start_with_monitor(config, host, monitor).await
    }

    pub async fn start_with_monitor(
        config: AcnConfig,
        host: Arc<dyn Host>,
        monitor: Monitor,
    ) -> KernelResult<Arc<Self>> {
        config.validate()?;
        let key = crate::node_key(&config)?;
        if host.public_key() != key.public_key() {
            return Err(KernelError::BootFailed(format!(
                "host identity {} does not match node.key",
                host.peer_id()
            )));
        }

        let own = config.agent.clone();
        if let Some(record) = &own {
            if let Err(status) = por::check(record, &record.address, &key.public_key()) {
                error!(addr = %record.address, "ACN: invalid agent record: {}", status);
                return Err(status.into());
            }
        }

        let store = if config.peer.enable_relay {
            let path = config
                .peer
                .storage_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("./agent_records_store_{}", key.peer_id())));
            Some(RecordStore::open(path)?)
        } else {
            None
        };

        let tls = if config.delegate.listen_addr.is_some() || config.mailbox.listen_addr.is_some() {
            Some(TlsIdentity::generate(&key)?)
        } else {
            None
        };

        let node = Arc::new(Self {
            mailboxes: MailboxSessions::new(config.mailbox.queue_size),
            config,
            key,
            host,
            own,
            agent: AgentLink::new(),
            relay_clients: AddressRegistry::new(),
            delegates: DelegateSessions::new(),
            announced: AnnouncementSet::new(),
            announce_enabled: AtomicBool::new(false),
            store,
            tls,
            delegate_addr: OnceLock::new(),
            monitor,
            supervisor: Arc::new(Supervisor::new()),
        });

        if let Err(e) = node.boot().await {
            error!("ACN: peer {} failed to start: {}", node.peer_id(), e);
            node.close().await;
            return Err(e);
        }
        info!(
            "ACN: peer started (peer_id={}, relay={}, relay_clients={})",
            node.peer_id(),
            node.config.peer.enable_relay,
            node.relay_clients.len()
        );
        Ok(node)
    }

    async fn boot(self: &Arc<Self>) -> KernelResult<()> {
        self.replay_store()?;
        self.install_handlers();
        self.spawn_connection_watcher();
        self.bootstrap().await?;
        if let Some(addr) = self.config.delegate.listen_addr.clone() {
            self.start_delegate_service(&addr).await?;
        }
        Ok(())
    }

    /// Repopulate the relay index from disk before touching the network.
    fn replay_store(&self) -> KernelResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        for (address, record) in store.replay()? {
            match PeerId::from_public_key(&record.peer_public_key) {
                Ok(peer_id) => {
                    self.relay_clients.register(record, peer_id);
                }
                Err(e) => warn!(addr = %address, error = %e, "ACN: skipping stored record"),
            }
        }
        if !self.relay_clients.is_empty() {
            info!(
                "ACN: restored {} relay client records from {}",
                self.relay_clients.len(),
                store.path().display()
            );
        }
        Ok(())
    }

    fn install_handlers(self: &Arc<Self>) {
        self.host.set_stream_handler(
            ENVELOPE_PROTOCOL,
            bind(self, |node, stream| async move { node.handle_envelope_stream(stream).await }),
        );
        self.host.set_stream_handler(
            ADDRESS_PROTOCOL,
            bind(self, |node, stream| async move { node.handle_address_stream(stream).await }),
        );
        self.host.set_stream_handler(
            NOTIF_PROTOCOL,
            bind(self, |node, stream| async move { node.handle_notif_stream(stream).await }),
        );
        if self.config.peer.enable_relay {
            self.host.set_stream_handler(
                REGISTER_PROTOCOL,
                bind(self, |node, stream| async move { node.handle_register_stream(stream).await }),
            );
        }
    }

    /// Re-announce on every new connection; the first one also lifts the
    /// announcement gate.
    fn spawn_connection_watcher(self: &Arc<Self>) {
        let mut events = self.host.subscribe();
        let weak = Arc::downgrade(self);
        self.supervisor.spawn("peer-connections", async move {
            loop {
                match events.recv().await {
                    Ok(HostEvent::Connected(peer)) => {
                        let Some(node) = weak.upgrade() else {
                            break;
                        };
                        debug!("ACN: connected to {}", peer);
                        node.enable_announcement().await;
                    }
                    Ok(HostEvent::Disconnected(peer)) => {
                        debug!("ACN: disconnected from {}", peer);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "ACN: connection watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    async fn bootstrap(&self) -> KernelResult<()> {
        let peers = parse_multiaddrs(&self.config.node.bootstrap_peers)?;
        if peers.is_empty() {
            info!("ACN: no bootstrap peers, waiting for inbound connections");
            return Ok(());
        }

        if let Err(e) = self.bootstrap_with_backoff(&peers).await {
            if self.relay_clients.is_empty() {
                return Err(KernelError::BootFailed(format!("bootstrap failed: {e}")));
            }
            warn!(
                error = %e,
                "ACN: bootstrap failed, continuing with {} stored records",
                self.relay_clients.len()
            );
            return Ok(());
        }

        self.notify_bootstrap_peers(&peers).await;
        self.enable_announcement().await;
        Ok(())
    }

    async fn bootstrap_with_backoff(&self, peers: &[Multiaddr]) -> KernelResult<()> {
        let deadline = Instant::now() + self.config.peer.bootstrap_timeout();
        let mut backoff = BACKOFF_START;
        loop {
            match self.host.bootstrap(peers).await {
                Ok(()) => return Ok(()),
                Err(e) if Instant::now() + backoff >= deadline => return Err(e.into()),
                Err(e) => {
                    debug!(error = %e, "ACN: bootstrap attempt failed, retrying in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    /// Tell each bootstrap peer we joined so it starts announcing.
    async fn notify_bootstrap_peers(&self, peers: &[Multiaddr]) {
        for addr in peers {
            let Some(peer) = addr.peer_id() else {
                continue;
            };
            let notify = async {
                let mut stream = self.host.open_stream(&peer, NOTIF_PROTOCOL).await?;
                stream
                    .write_all(NOTIF_PROTOCOL.as_bytes())
                    .await
                    .map_err(HostError::from)?;
                stream.shutdown().await.map_err(HostError::from)?;
                Ok::<(), KernelError>(())
            };
            match with_timeout(self.config.peer.new_stream_timeout(), "notification", notify).await {
                Ok(()) => debug!("ACN: notified bootstrap peer {}", peer),
                Err(e) => warn!(error = %e, "ACN: failed to notify bootstrap peer {}", peer),
            }
        }
    }

    async fn start_delegate_service(self: &Arc<Self>, listen_addr: &str) -> KernelResult<()> {
        let acceptor = self
            .tls
            .as_ref()
            .ok_or_else(|| KernelError::Tls("no session identity".into()))?
            .acceptor()?;
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| KernelError::BootFailed(format!("delegate bind {listen_addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| KernelError::BootFailed(e.to_string()))?;
        let _ = self.delegate_addr.set(local_addr);
        info!(
            "ACN: delegate service listening on {} (peer_id={})",
            local_addr,
            self.peer_id()
        );
        self.supervisor.spawn(
            "delegate-accept",
            delegate::serve(listener, acceptor, Arc::downgrade(self)),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Address announcement and lookup
    // -----------------------------------------------------------------------

    pub fn announcement_enabled(&self) -> bool {
        self.announce_enabled.load(Ordering::SeqCst)
    }

    /// Lift the announcement gate and announce every address this node serves.
    async fn enable_announcement(&self) {
        if !self.announce_enabled.swap(true, Ordering::SeqCst) {
            info!("ACN: address announcement enabled");
        }
        self.announce_all().await;
    }

    async fn announce_all(&self) {
        let mut addresses: Vec<String> = self.own.iter().map(|r| r.address.clone()).collect();
        addresses.extend(self.relay_clients.addresses());
        addresses.extend(self.delegates.addresses());
        addresses.extend(self.mailboxes.addresses());
        for address in addresses {
            if let Err(e) = self.register_agent_address(&address).await {
                warn!(addr = %address, error = %e, "ACN: failed to announce address");
            }
        }
    }

    /// Provide `address` on the DHT once. No-op while announcement is gated.
    pub async fn register_agent_address(&self, address: &str) -> KernelResult<()> {
        if !self.announcement_enabled() {
            debug!(addr = %address, "ACN: announcement disabled, deferring");
            return Ok(());
        }
        if !self.announced.insert(address) {
            return Ok(());
        }
        let started = std::time::Instant::now();
        let key = ContentKey::for_address(address);
        match with_timeout(
            self.config.peer.register_timeout(),
            "DHT provide",
            self.host.provide(&key),
        )
        .await
        {
            Ok(()) => {
                self.monitor.observe(Latency::DhtStore, started);
                debug!(addr = %address, op = "register", "ACN: announced address");
                Ok(())
            }
            Err(e) => {
                // Allow a later retry.
                self.announced.remove(address);
                Err(e)
            }
        }
    }

    /// Find a valid record for `address` through the DHT.
    pub async fn lookup_address_dht(&self, address: &str) -> KernelResult<AgentRecord> {
        let started = std::time::Instant::now();
        let key = ContentKey::for_address(address);
        let me = self.peer_id();
        let search = async {
            loop {
                let providers = match self.host.find_providers(&key).await {
                    Ok(providers) => providers,
                    Err(e) => {
                        debug!(addr = %address, error = %e, "ACN: provider query failed");
                        Vec::new()
                    }
                };
                for provider in providers.into_iter().filter(|p| *p != me) {
                    match self.lookup_from(&provider, address).await {
                        Ok(record) => return Ok::<_, KernelError>(record),
                        Err(e) => debug!(
                            addr = %address,
                            error = %e,
                            "ACN: provider {} did not resolve address", provider
                        ),
                    }
                }
                tokio::time::sleep(self.config.peer.lookup_retry()).await;
            }
        };
        match with_timeout(self.config.peer.lookup_timeout(), "DHT lookup", search).await {
            Ok(record) => {
                self.monitor.observe(Latency::DhtLookup, started);
                Ok(record)
            }
            Err(KernelError::Timeout(_)) => Err(KernelError::status(
                StatusCode::ErrorUnknownAgentAddress,
                format!("agent address {address} not found on the DHT"),
            )),
            Err(e) => Err(e),
        }
    }

    async fn lookup_from(&self, provider: &PeerId, address: &str) -> KernelResult<AgentRecord> {
        let mut stream = with_timeout(
            self.config.peer.new_stream_timeout(),
            "open address stream",
            self.host.open_stream(provider, ADDRESS_PROTOCOL),
        )
        .await?;
        let record = lookup(&mut stream, address).await?;
        por::check(&record, address, &record.peer_public_key)?;
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Record of an agent this node represents, in lookup order.
    fn local_record(&self, address: &str) -> Option<AgentRecord> {
        if let Some(own) = self.own.as_ref().filter(|r| r.address == address) {
            return Some(own.clone());
        }
        self.relay_clients
            .record(address)
            .or_else(|| self.mailboxes.record(address))
            .or_else(|| self.delegates.record(address))
    }

    fn is_own_address(&self, address: &str) -> bool {
        self.own.as_ref().is_some_and(|r| r.address == address)
    }

    /// Deliver `envelope` to its target, wherever it lives.
    pub async fn route_envelope(&self, envelope: Envelope) -> KernelResult<()> {
        let timer = self.monitor.start_route();
        let result = self.route(envelope).await;
        timer.finish(result.is_ok());
        result
    }

    async fn route(&self, envelope: Envelope) -> KernelResult<()> {
        let sender = self.local_record(&envelope.sender).ok_or_else(|| {
            KernelError::status(
                StatusCode::ErrorWrongAgentAddress,
                format!("envelope sender {} is not registered locally", envelope.sender),
            )
        })?;
        let target = envelope.to.clone();
        debug!(to = %target, sender = %envelope.sender, op = "route", "ACN: routing envelope");

        if self.mailboxes.contains(&target) {
            self.mailboxes.enqueue(&target, envelope);
            return Ok(());
        }
        if self.is_own_address(&target) {
            return self.agent.deliver(envelope, self.supervisor.subscribe()).await;
        }
        if let Some(session) = self.delegates.get(&target) {
            return session
                .deliver(sender, &envelope, self.config.peer.status_timeout())
                .await;
        }

        let peer = match self.relay_clients.peer_id(&target) {
            Some(peer) => peer,
            None => {
                let record = self.lookup_address_dht(&target).await?;
                PeerId::from_public_key(&record.peer_public_key)?
            }
        };
        self.deliver_to_peer(&peer, sender, &envelope).await
    }

    async fn deliver_to_peer(
        &self,
        peer: &PeerId,
        sender: AgentRecord,
        envelope: &Envelope,
    ) -> KernelResult<()> {
        let mut stream = with_timeout(
            self.config.peer.new_stream_timeout(),
            "open envelope stream",
            self.host.open_stream(peer, ENVELOPE_PROTOCOL),
        )
        .await?;
        deliver_envelope(&mut stream, sender, envelope).await?;
        debug!(to = %envelope.to, "ACN: envelope delivered to {}", peer);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound streams
    // -----------------------------------------------------------------------

    async fn handle_envelope_stream(self: Arc<Self>, mut stream: InboundStream) {
        let (record, envelope) = match read_envelope(&mut stream.io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!("ACN: bad envelope stream from {}: {}", stream.remote_peer, e);
                return;
            }
        };
        if let Err(status) = por::check(&record, &envelope.sender, &stream.remote_public_key) {
            warn!(
                sender = %envelope.sender,
                "ACN: rejected envelope from {}: {}", stream.remote_peer, status
            );
            let _ = send_status(&mut stream.io, status).await;
            return;
        }

        let status = match self.deliver_inbound(record, envelope).await {
            Ok(()) => Status::success(),
            Err(e) => {
                debug!(error = %e, "ACN: inbound envelope not delivered");
                e.to_status()
            }
        };
        if let Err(e) = send_status(&mut stream.io, status).await {
            debug!("ACN: failed to answer {}: {}", stream.remote_peer, e);
        }
    }

    async fn deliver_inbound(&self, sender: AgentRecord, envelope: Envelope) -> KernelResult<()> {
        let target = envelope.to.clone();
        if self.mailboxes.contains(&target) {
            self.mailboxes.enqueue(&target, envelope);
            return Ok(());
        }
        if let Some(session) = self.delegates.get(&target) {
            return session
                .deliver(sender, &envelope, self.config.peer.status_timeout())
                .await
                .map_err(|e| {
                    KernelError::status(
                        StatusCode::ErrorAgentNotReady,
                        format!("delegate client {target} did not take the envelope: {e}"),
                    )
                });
        }
        if self.is_own_address(&target) {
            if !self.agent.has_processor() {
                return Err(KernelError::status(
                    StatusCode::ErrorAgentNotReady,
                    "agent has no envelope handler",
                ));
            }
            return self.agent.deliver(envelope, self.supervisor.subscribe()).await;
        }
        Err(KernelError::status(
            StatusCode::ErrorUnknownAgentAddress,
            format!("agent address {target} is not served by this peer"),
        ))
    }

    async fn handle_address_stream(self: Arc<Self>, mut stream: InboundStream) {
        let address = match read_lookup_request(&mut stream.io).await {
            Ok(address) => address,
            Err(e) => {
                debug!("ACN: bad lookup stream from {}: {}", stream.remote_peer, e);
                return;
            }
        };
        debug!(addr = %address, op = "lookup", "ACN: lookup request from {}", stream.remote_peer);

        let record = match self.local_record(&address) {
            Some(record) => Ok(record),
            // Only relay clients get a DHT lookup on their behalf.
            None if self.is_relay_client(&stream.remote_peer) => {
                self.lookup_address_dht(&address).await
            }
            None => Err(KernelError::status(
                StatusCode::ErrorUnknownAgentAddress,
                format!("agent address {address} is unknown"),
            )),
        };
        let reply = match record {
            Ok(record) => write_message(&mut stream.io, &AcnMessage::lookup_response(record)).await,
            Err(e) => send_status(&mut stream.io, e.to_status()).await,
        };
        if let Err(e) = reply {
            debug!("ACN: failed to answer lookup from {}: {}", stream.remote_peer, e);
        }
    }

    fn is_relay_client(&self, peer: &PeerId) -> bool {
        self.relay_clients.snapshot().values().any(|p| p == peer)
    }

    async fn handle_register_stream(self: Arc<Self>, mut stream: InboundStream) {
        let delay = self.registration_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let started = std::time::Instant::now();
        let record = match read_registration(&mut stream.io).await {
            Ok(record) => record,
            Err(e) => {
                debug!("ACN: bad register stream from {}: {}", stream.remote_peer, e);
                return;
            }
        };
        let address = record.address.clone();
        if let Err(status) = por::check(&record, &address, &stream.remote_public_key) {
            warn!(addr = %address, "ACN: rejected registration from {}: {}", stream.remote_peer, status);
            let _ = send_status(&mut stream.io, status).await;
            return;
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.append(&record) {
                error!(addr = %address, error = %e, "ACN: failed to persist relay client record");
                let _ = send_status(
                    &mut stream.io,
                    Status::error(StatusCode::ErrorGeneric, format!("cannot store record: {e}")),
                )
                .await;
                return;
            }
        }
        self.relay_clients.register(record, stream.remote_peer.clone());
        if let Err(e) = send_status(&mut stream.io, Status::success()).await {
            debug!("ACN: failed to confirm registration to {}: {}", stream.remote_peer, e);
        }
        self.monitor.relay_client_registered();
        self.monitor.observe(Latency::Register, started);
        info!(addr = %address, op = "register", "ACN: relay client {} registered", stream.remote_peer);

        if let Err(e) = self.register_agent_address(&address).await {
            warn!(addr = %address, error = %e, "ACN: failed to announce relay client address");
        }
    }

    async fn handle_notif_stream(self: Arc<Self>, mut stream: InboundStream) {
        let mut payload = Vec::new();
        let _ = (&mut stream.io)
            .take(MAX_NOTIF_SIZE)
            .read_to_end(&mut payload)
            .await;
        debug!("ACN: notification from {}", stream.remote_peer);

        let deadline = Instant::now() + self.config.peer.notif_timeout();
        while !self.host.is_connected(&stream.remote_peer) && Instant::now() < deadline {
            tokio::time::sleep(NOTIF_POLL).await;
        }
        self.enable_announcement().await;
    }

    // -----------------------------------------------------------------------
    // Delegate and mailbox sessions
    // -----------------------------------------------------------------------

    pub(crate) async fn attach_delegate(&self, session: Arc<DelegateSession>) {
        let address = session.address().to_string();
        if self.delegates.insert(session).is_some() {
            debug!(addr = %address, "ACN: replaced existing delegate session");
        } else {
            self.monitor.delegate_client_connected();
        }
        if let Err(e) = self.register_agent_address(&address).await {
            warn!(addr = %address, error = %e, "ACN: failed to announce delegate client address");
        }
    }

    pub(crate) fn detach_delegate(&self, session: &Arc<DelegateSession>) {
        if self.delegates.remove_if_same(session) {
            self.monitor.delegate_client_disconnected();
            debug!(addr = %session.address(), "ACN: delegate session removed");
        }
    }

    /// Open a mailbox session for `record`, returning its token.
    pub async fn register_mailbox(&self, record: AgentRecord) -> KernelResult<String> {
        por::check(&record, &record.address, &self.public_key())?;
        let address = record.address.clone();
        let token = self.mailboxes.register(record);
        self.monitor.set_mailbox_clients(self.mailboxes.len());
        info!(addr = %address, op = "register", "ACN: mailbox client registered");
        if let Err(e) = self.register_agent_address(&address).await {
            warn!(addr = %address, error = %e, "ACN: failed to announce mailbox client address");
        }
        Ok(token)
    }

    pub fn unregister_mailbox(&self, token: &str) -> Option<String> {
        let address = self.mailboxes.unregister(token)?;
        self.monitor.set_mailbox_clients(self.mailboxes.len());
        info!(addr = %address, "ACN: mailbox client unregistered");
        Some(address)
    }

    pub fn mailbox_address(&self, token: &str) -> Option<String> {
        self.mailboxes.address(token)
    }

    pub fn pop_mailbox(&self, token: &str) -> Option<Envelope> {
        self.mailboxes.pop(token)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn peer_id(&self) -> PeerId {
        self.key.peer_id()
    }

    pub fn public_key(&self) -> String {
        self.key.public_key()
    }

    pub fn agent_address(&self) -> Option<&str> {
        self.own.as_ref().map(|r| r.address.as_str())
    }

    pub fn multi_addr(&self) -> Option<String> {
        self.host.listen_addrs().first().map(|a| a.to_string())
    }

    /// Bound address of the delegate service, if it runs.
    pub fn delegate_addr(&self) -> Option<SocketAddr> {
        self.delegate_addr.get().copied()
    }

    pub fn tls_identity(&self) -> Option<&TlsIdentity> {
        self.tls.as_ref()
    }

    pub fn tls_signature_hex(&self) -> Option<String> {
        self.tls.as_ref().map(TlsIdentity::signature_hex)
    }

    pub fn relay_clients(&self) -> &AddressRegistry {
        &self.relay_clients
    }

    pub fn delegate_clients(&self) -> &DelegateSessions {
        &self.delegates
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn config(&self) -> &AcnConfig {
        &self.config
    }

    pub(crate) fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub(crate) fn registration_delay(&self) -> Duration {
        self.config.peer.registration_delay()
    }

    pub(crate) fn pair_queue_size(&self) -> usize {
        self.config.delegate.pair_queue_size
    }

    pub fn set_envelope_handler(&self, processor: Arc<dyn EnvelopeProcessor>) {
        self.agent.set_processor(processor);
    }

    pub fn set_ready(&self, ready: bool) {
        self.agent.set_ready(ready);
    }

    /// Stop background tasks, drop every connection and detach from the host.
    pub async fn close(&self) {
        self.supervisor.shutdown();
        for protocol in [ENVELOPE_PROTOCOL, ADDRESS_PROTOCOL, NOTIF_PROTOCOL, REGISTER_PROTOCOL] {
            self.host.remove_stream_handler(protocol);
        }
        self.host.close().await;
        self.supervisor.join(CLOSE_GRACE).await;
        info!("ACN: peer {} closed", self.peer_id());
    }
}

/// Stream handler holding only a weak reference to its node.
fn bind<F, Fut>(node: &Arc<PeerNode>, f: F) -> Arc<dyn StreamHandler>
where
    F: Fn(Arc<PeerNode>, InboundStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak = Arc::downgrade(node);
    handler_fn(move |stream| {
        let fut = weak.upgrade().map(|node| f(node, stream));
        async move {
            if let Some(fut) = fut {
                fut.await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use acn_types::config::NodeMode;
    use acn_types::{LedgerId, LedgerKey};
    use acn_wire::MemoryNetwork;
    use tokio::sync::mpsc;

    fn peer_config(key: &NodeKey, dir: &std::path::Path) -> AcnConfig {
        let mut config = AcnConfig::default();
        config.node.key = Some(key.to_hex());
        config.node.mode = NodeMode::Peer;
        config.peer.storage_path = Some(dir.join(format!("records_{}", key.peer_id())));
        config.peer.lookup_timeout_ms = 300;
        config.peer.lookup_retry_ms = 20;
        config
    }

    fn agent_record(node: &NodeKey) -> (LedgerKey, AgentRecord) {
        let agent = LedgerKey::generate(LedgerId::Fetchai);
        let record = AgentRecord::sign(&agent, &node.public_key()).unwrap();
        (agent, record)
    }

    #[tokio::test]
    async fn test_start_rejects_foreign_agent_record() {
        let dir = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let key = NodeKey::generate();
        let mut config = peer_config(&key, dir.path());
        let (_, record) = agent_record(&NodeKey::generate());
        config.agent = Some(record);

        let host = net.add_peer(&key);
        let err = PeerNode::start(config, host).await.err().unwrap();
        assert_eq!(err.status_code(), StatusCode::ErrorWrongPublicKey);
    }

    #[tokio::test]
    async fn test_start_rejects_mismatched_host() {
        let dir = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let key = NodeKey::generate();
        let host = net.add_peer(&NodeKey::generate());
        let err = PeerNode::start(peer_config(&key, dir.path()), host).await.err().unwrap();
        assert!(matches!(err, KernelError::BootFailed(_)));
    }

    #[tokio::test]
    async fn test_announcement_is_gated_then_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let key = NodeKey::generate();
        let node = PeerNode::start(peer_config(&key, dir.path()), net.add_peer(&key))
            .await
            .unwrap();

        let content = ContentKey::for_address("fetch1gated");
        node.register_agent_address("fetch1gated").await.unwrap();
        assert!(!node.announcement_enabled());
        assert_eq!(net.provide_count(&content), 0);

        let other_key = NodeKey::generate();
        let other = net.add_peer(&other_key);
        other.connect(&node.host.listen_addrs()[0]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !node.announcement_enabled() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        node.register_agent_address("fetch1gated").await.unwrap();
        node.register_agent_address("fetch1gated").await.unwrap();
        assert_eq!(net.provide_count(&content), 1);
        node.close().await;
    }

    #[tokio::test]
    async fn test_route_to_own_agent_is_local() {
        let dir = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let key = NodeKey::generate();
        let (_, record) = agent_record(&key);
        let address = record.address.clone();
        let mut config = peer_config(&key, dir.path());
        config.agent = Some(record);

        let node = PeerNode::start(config, net.add_peer(&key)).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        node.set_envelope_handler(Arc::new(tx));
        node.set_ready(true);

        node.route_envelope(Envelope::new(&address, &address, b"self".to_vec()))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().message, b"self");
        node.close().await;
    }

    #[tokio::test]
    async fn test_unknown_sender_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let key = NodeKey::generate();
        let node = PeerNode::start(peer_config(&key, dir.path()), net.add_peer(&key))
            .await
            .unwrap();
        let err = node
            .route_envelope(Envelope::new("fetch1to", "fetch1stranger", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ErrorWrongAgentAddress);
        node.close().await;
    }

    #[tokio::test]
    async fn test_mailbox_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let key = NodeKey::generate();
        let (_, own) = agent_record(&key);
        let mut config = peer_config(&key, dir.path());
        config.agent = Some(own.clone());
        let node = PeerNode::start(config, net.add_peer(&key)).await.unwrap();

        let (_, mailbox_record) = agent_record(&key);
        let token = node.register_mailbox(mailbox_record.clone()).await.unwrap();
        node.route_envelope(Envelope::new(&mailbox_record.address, &own.address, b"m".to_vec()))
            .await
            .unwrap();
        let env = node.pop_mailbox(&token).unwrap();
        assert_eq!(env.message, b"m");
        assert!(node.pop_mailbox(&token).is_none());

        let (_, foreign) = agent_record(&NodeKey::generate());
        let err = node.register_mailbox(foreign).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ErrorWrongPublicKey);
        node.close().await;
    }

    #[tokio::test]
    async fn test_unknown_target_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let key = NodeKey::generate();
        let (_, own) = agent_record(&key);
        let mut config = peer_config(&key, dir.path());
        config.agent = Some(own.clone());
        let node = PeerNode::start(config, net.add_peer(&key)).await.unwrap();

        let err = node
            .route_envelope(Envelope::new("fetch1nobody", &own.address, vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ErrorUnknownAgentAddress);
        node.close().await;
    }
}
