//! ACN nodes and the services they host.
//!
//! ## Architecture
//!
//! - **PeerNode**: DHT participant; relays for Clients and hosts delegate and mailbox agents
//! - **ClientNode**: reaches the overlay through one relay Peer
//! - **delegate**: TCP+TLS service for agents that connect to a Peer directly
//! - **mailbox**: per-agent envelope queues behind the HTTPS mailbox service
//! - **Monitor**: Prometheus metrics shared by both node kinds
//! - **Supervisor**: owns background tasks and the shutdown signal

pub mod agent;
pub mod client;
pub mod config;
pub mod delegate;
pub mod error;
pub mod logging;
pub mod mailbox;
pub mod monitoring;
pub mod peer;
pub mod supervisor;
pub mod tls;

pub use agent::{AgentLink, EnvelopeProcessor};
pub use client::ClientNode;
pub use delegate::DelegateClient;
pub use error::{KernelError, KernelResult};
pub use monitoring::Monitor;
pub use peer::PeerNode;

use acn_types::config::{AcnConfig, NodeMode};
use acn_types::{AcnError, Envelope, NodeKey};
use acn_wire::Host;
use async_trait::async_trait;
use std::sync::Arc;

/// Identity key named by `node.key`.
pub fn node_key(config: &AcnConfig) -> KernelResult<NodeKey> {
    let hex = config
        .node
        .key
        .as_deref()
        .ok_or_else(|| AcnError::Config("node.key (private key) is required".into()))?;
    Ok(NodeKey::from_hex(hex.trim())?)
}

/// Operations an agent runtime needs from the node it is attached to.
#[async_trait]
pub trait AcnNode: Send + Sync {
    /// Deliver an envelope sent by the local agent.
    async fn route_envelope(&self, envelope: Envelope) -> KernelResult<()>;

    /// Install the callback receiving envelopes addressed to the local agent.
    fn set_envelope_handler(&self, processor: Arc<dyn EnvelopeProcessor>);

    fn set_ready(&self, ready: bool);

    fn multi_addr(&self) -> Option<String>;

    async fn close(&self);
}

#[async_trait]
impl AcnNode for PeerNode {
    async fn route_envelope(&self, envelope: Envelope) -> KernelResult<()> {
        PeerNode::route_envelope(self, envelope).await
    }

    fn set_envelope_handler(&self, processor: Arc<dyn EnvelopeProcessor>) {
        PeerNode::set_envelope_handler(self, processor)
    }

    fn set_ready(&self, ready: bool) {
        PeerNode::set_ready(self, ready)
    }

    fn multi_addr(&self) -> Option<String> {
        PeerNode::multi_addr(self)
    }

    async fn close(&self) {
        PeerNode::close(self).await
    }
}

#[async_trait]
impl AcnNode for ClientNode {
    async fn route_envelope(&self, envelope: Envelope) -> KernelResult<()> {
        ClientNode::route_envelope(self, envelope).await
    }

    fn set_envelope_handler(&self, processor: Arc<dyn EnvelopeProcessor>) {
        ClientNode::set_envelope_handler(self, processor)
    }

    fn set_ready(&self, ready: bool) {
        ClientNode::set_ready(self, ready)
    }

    fn multi_addr(&self) -> Option<String> {
        Some(ClientNode::multi_addr(self))
    }

    async fn close(&self) {
        ClientNode::close(self).await
    }
}

/// Start the node kind selected by `node.mode`.
pub async fn start_node(config: AcnConfig, host: Arc<dyn Host>) -> KernelResult<Arc<dyn AcnNode>> {
    match config.node.mode {
        NodeMode::Peer => Ok(PeerNode::start(config, host).await? as Arc<dyn AcnNode>),
        NodeMode::Client => Ok(ClientNode::start(config, host).await? as Arc<dyn AcnNode>),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_key_required() {
        let config = AcnConfig::default();
        let err = node_key(&config).unwrap_err();
        assert!(matches!(err, KernelError::Acn(AcnError::Config(_))));
    }

    #[test]
    fn test_node_key_from_hex() {
        let key = NodeKey::generate();
        let mut config = AcnConfig::default();
        config.node.key = Some(format!(" {} ", key.to_hex()));
        assert_eq!(node_key(&config).unwrap().peer_id(), key.peer_id());
    }
}
