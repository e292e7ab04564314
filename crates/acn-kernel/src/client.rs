//! Client node: reaches the overlay through a single relay Peer.
//!
//! A Client never joins the DHT. It registers its agent with one bootstrap
//! Peer, asks that Peer to resolve addresses, and dials targets through it.

use crate::agent::{AgentLink, EnvelopeProcessor};
use crate::error::{with_timeout, KernelError, KernelResult};
use crate::monitoring::{Latency, Monitor};
use crate::supervisor::Supervisor;
use acn_types::config::AcnConfig;
use acn_types::{AgentRecord, Envelope, NodeKey, PeerId, Status, StatusCode};
use acn_wire::host::{handler_fn, parse_multiaddrs, ADDRESS_PROTOCOL, ENVELOPE_PROTOCOL, REGISTER_PROTOCOL};
use acn_wire::message::AcnMessage;
use acn_wire::protocol::{
    deliver_envelope, lookup, read_envelope, read_lookup_request, register, send_status,
    write_message,
};
use acn_wire::{por, BoxedStream, Host, HostEvent, InboundStream, Multiaddr, StreamHandler};
use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pause between relay reconnection attempts.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
const CLOSE_GRACE: Duration = Duration::from_secs(5);

pub struct ClientNode {
    config: AcnConfig,
    key: NodeKey,
    host: Arc<dyn Host>,
    record: AgentRecord,
    relay_addr: Multiaddr,
    relay_peer: PeerId,
    /// Serializes reconnect-and-register sequences.
    relay_lock: Mutex<()>,
    agent: AgentLink,
    monitor: Monitor,
    supervisor: Arc<Supervisor>,
}

impl ClientNode {
    pub async fn start(config: AcnConfig, host: Arc<dyn Host>) -> KernelResult<Arc<Self>> {
        let monitor = Monitor::from_config(&config.monitoring);
        Self::start_with_monitor(config, host, monitor).await
    }

    pub async fn start_with_monitor(
        config: AcnConfig,
        host: Arc<dyn Host>,
        monitor: Monitor,
    ) -> KernelResult<Arc<Self>> {
        let mut config = config;
        config.node.mode = acn_types::config::NodeMode::Client;
        config.validate()?;
        let key = crate::node_key(&config)?;
        if host.public_key() != key.public_key() {
            return Err(KernelError::BootFailed(format!(
                "host identity {} does not match node.key",
                host.peer_id()
            )));
        }

        let record = config
            .agent
            .clone()
            .ok_or_else(|| KernelError::BootFailed("client requires an agent record".into()))?;
        if let Err(status) = por::check(&record, &record.address, &key.public_key()) {
            error!(addr = %record.address, "ACN: invalid agent record: {}", status);
            return Err(status.into());
        }

        let bootstrap = parse_multiaddrs(&config.node.bootstrap_peers)?;
        let relay_addr = bootstrap
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| KernelError::BootFailed("no bootstrap peers".into()))?;
        let relay_peer = relay_addr.peer_id().ok_or_else(|| {
            KernelError::BootFailed(format!("bootstrap peer {relay_addr} has no /p2p/ component"))
        })?;

        let node = Arc::new(Self {
            config,
            key,
            host,
            record,
            relay_addr,
            relay_peer,
            relay_lock: Mutex::new(()),
            agent: AgentLink::new(),
            monitor,
            supervisor: Arc::new(Supervisor::new()),
        });

        if let Err(e) = node.boot().await {
            error!("ACN: client {} failed to start: {}", node.peer_id(), e);
            node.close().await;
            return Err(e);
        }
        info!(
            "ACN: client started (peer_id={}, addr={}, relay={})",
            node.peer_id(),
            node.record.address,
            node.relay_peer
        );
        Ok(node)
    }

    async fn boot(self: &Arc<Self>) -> KernelResult<()> {
        self.host.set_stream_handler(
            ENVELOPE_PROTOCOL,
            bind(self, |node, stream| async move { node.handle_envelope_stream(stream).await }),
        );
        self.host.set_stream_handler(
            ADDRESS_PROTOCOL,
            bind(self, |node, stream| async move { node.handle_address_stream(stream).await }),
        );

        self.connect_relay_with_backoff().await?;
        self.register_with_relay().await?;
        self.spawn_relay_watcher();
        Ok(())
    }

    async fn connect_relay_with_backoff(&self) -> KernelResult<()> {
        let deadline = Instant::now() + self.config.client.bootstrap_timeout();
        let mut backoff = self.config.client.backoff_start();
        loop {
            match self.host.connect(&self.relay_addr).await {
                Ok(_) => return Ok(()),
                Err(e) if Instant::now() + backoff >= deadline => {
                    return Err(KernelError::BootFailed(format!(
                        "cannot reach relay {}: {e}",
                        self.relay_addr
                    )))
                }
                Err(e) => {
                    debug!(error = %e, "ACN: relay dial failed, retrying in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    async fn register_with_relay(&self) -> KernelResult<()> {
        let started = std::time::Instant::now();
        let mut stream = with_timeout(
            self.config.client.new_stream_timeout(),
            "open register stream",
            self.host.open_stream(&self.relay_peer, REGISTER_PROTOCOL),
        )
        .await?;
        register(&mut stream, self.record.clone()).await?;
        self.monitor.observe(Latency::Register, started);
        info!(
            addr = %self.record.address,
            op = "register",
            "ACN: registered with relay {}", self.relay_peer
        );
        Ok(())
    }

    /// Redial the relay and register again.
    async fn reconnect_relay(&self) -> KernelResult<()> {
        let _guard = self.relay_lock.lock().await;
        if !self.host.is_connected(&self.relay_peer) {
            with_timeout(
                self.config.client.reconnect_timeout(),
                "relay reconnect",
                self.host.connect(&self.relay_addr),
            )
            .await?;
        }
        self.register_with_relay().await
    }

    fn spawn_relay_watcher(self: &Arc<Self>) {
        let mut events = self.host.subscribe();
        let weak = Arc::downgrade(self);
        self.supervisor.spawn("client-relay-watch", async move {
            loop {
                match events.recv().await {
                    Ok(HostEvent::Disconnected(peer)) => {
                        let Some(node) = weak.upgrade() else {
                            break;
                        };
                        if peer != node.relay_peer {
                            continue;
                        }
                        warn!("ACN: lost connection to relay {}, reconnecting", peer);
                        while let Err(e) = node.reconnect_relay().await {
                            debug!(error = %e, "ACN: relay reconnect failed");
                            tokio::time::sleep(RECONNECT_INTERVAL).await;
                        }
                        info!("ACN: reconnected to relay {}", peer);
                    }
                    Ok(HostEvent::Connected(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "ACN: relay watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Open a stream to the relay, re-registering between failed attempts.
    async fn open_relay_stream(&self, protocol: &str) -> KernelResult<BoxedStream> {
        let deadline = Instant::now() + self.config.client.relay_stream_timeout();
        let mut backoff = self.config.client.backoff_start();
        loop {
            match self.host.open_stream(&self.relay_peer, protocol).await {
                Ok(stream) => return Ok(stream),
                Err(e) if Instant::now() + backoff >= deadline => {
                    return Err(KernelError::Timeout(format!(
                        "relay stream {protocol}: {e}"
                    )))
                }
                Err(e) => {
                    debug!(error = %e, "ACN: relay stream failed, retrying in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    if let Err(e) = self.reconnect_relay().await {
                        debug!(error = %e, "ACN: re-registration with relay failed");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    pub async fn route_envelope(&self, envelope: Envelope) -> KernelResult<()> {
        let timer = self.monitor.start_route();
        let result = self.route(envelope).await;
        timer.finish(result.is_ok());
        result
    }

    async fn route(&self, envelope: Envelope) -> KernelResult<()> {
        if envelope.sender != self.record.address {
            return Err(KernelError::status(
                StatusCode::ErrorWrongAgentAddress,
                format!("envelope sender {} is not this client's agent", envelope.sender),
            ));
        }
        let target = envelope.to.clone();
        debug!(to = %target, op = "route", "ACN: routing envelope");
        if target == self.record.address {
            return self.agent.deliver(envelope, self.supervisor.subscribe()).await;
        }

        let record = self.lookup_address(&target).await?;
        let target_peer = PeerId::from_public_key(&record.peer_public_key)?;
        if target_peer != self.relay_peer {
            let circuit = Multiaddr::circuit(&self.relay_peer, &target_peer);
            with_timeout(
                self.config.client.new_stream_timeout(),
                "circuit dial",
                self.host.connect(&circuit),
            )
            .await?;
        }
        let mut stream = with_timeout(
            self.config.client.new_stream_timeout(),
            "open envelope stream",
            self.host.open_stream(&target_peer, ENVELOPE_PROTOCOL),
        )
        .await?;
        deliver_envelope(&mut stream, self.record.clone(), &envelope).await?;
        debug!(to = %target, "ACN: envelope delivered to {}", target_peer);
        Ok(())
    }

    /// Resolve `address` through the relay.
    pub async fn lookup_address(&self, address: &str) -> KernelResult<AgentRecord> {
        let started = std::time::Instant::now();
        let mut stream = self.open_relay_stream(ADDRESS_PROTOCOL).await?;
        let record = lookup(&mut stream, address).await?;
        por::check(&record, address, &record.peer_public_key)?;
        self.monitor.observe(Latency::DhtLookup, started);
        Ok(record)
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
        let status = if let Err(status) =
            por::check(&record, &envelope.sender, &stream.remote_public_key)
        {
            warn!(sender = %envelope.sender, "ACN: rejected envelope from {}: {}", stream.remote_peer, status);
            status
        } else if envelope.to != self.record.address {
            Status::error(
                StatusCode::ErrorUnknownAgentAddress,
                format!("agent address {} is not served by this client", envelope.to),
            )
        } else if !self.agent.has_processor() {
            Status::error(StatusCode::ErrorAgentNotReady, "agent has no envelope handler")
        } else {
            match self.agent.deliver(envelope, self.supervisor.subscribe()).await {
                Ok(()) => Status::success(),
                Err(e) => e.to_status(),
            }
        };
        if let Err(e) = send_status(&mut stream.io, status).await {
            debug!("ACN: failed to answer {}: {}", stream.remote_peer, e);
        }
    }

    async fn handle_address_stream(self: Arc<Self>, mut stream: InboundStream) {
        let address = match read_lookup_request(&mut stream.io).await {
            Ok(address) => address,
            Err(e) => {
                debug!("ACN: bad lookup stream from {}: {}", stream.remote_peer, e);
                return;
            }
        };
        let reply = if address == self.record.address {
            write_message(&mut stream.io, &AcnMessage::lookup_response(self.record.clone())).await
        } else {
            send_status(
                &mut stream.io,
                Status::error(
                    StatusCode::ErrorUnknownAgentAddress,
                    format!("agent address {address} is unknown"),
                ),
            )
            .await
        };
        if let Err(e) = reply {
            debug!("ACN: failed to answer lookup from {}: {}", stream.remote_peer, e);
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn peer_id(&self) -> PeerId {
        self.key.peer_id()
    }

    pub fn agent_address(&self) -> &str {
        &self.record.address
    }

    pub fn relay_peer(&self) -> &PeerId {
        &self.relay_peer
    }

    /// Circuit address through the relay.
    pub fn multi_addr(&self) -> String {
        Multiaddr::circuit(&self.relay_peer, &self.peer_id()).to_string()
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn set_envelope_handler(&self, processor: Arc<dyn EnvelopeProcessor>) {
        self.agent.set_processor(processor);
    }

    pub fn set_ready(&self, ready: bool) {
        self.agent.set_ready(ready);
    }

    pub async fn close(&self) {
        self.supervisor.shutdown();
        self.host.remove_stream_handler(ENVELOPE_PROTOCOL);
        self.host.remove_stream_handler(ADDRESS_PROTOCOL);
        self.host.close().await;
        self.supervisor.join(CLOSE_GRACE).await;
        info!("ACN: client {} closed", self.peer_id());
    }
}

fn bind<F, Fut>(node: &Arc<ClientNode>, f: F) -> Arc<dyn StreamHandler>
where
    F: Fn(Arc<ClientNode>, InboundStream) -> Fut + Send + Sync + 'static,
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
