//! ACN node configuration.
//!
//! Every section carries `#[serde(default)]`, so a config file only needs
//! to name the values it overrides. Durations are in milliseconds.

use crate::error::{AcnError, AcnResult};
use crate::record::AgentRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcnConfig {
    /// Log level filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON log lines instead of the human-readable format.
    pub log_json: bool,
    pub node: NodeConfig,
    /// Record of the agent this node represents, if any.
    pub agent: Option<AgentRecord>,
    pub peer: PeerConfig,
    pub client: ClientConfig,
    pub delegate: DelegateConfig,
    pub mailbox: MailboxConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for AcnConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            node: NodeConfig::default(),
            agent: None,
            peer: PeerConfig::default(),
            client: ClientConfig::default(),
            delegate: DelegateConfig::default(),
            mailbox: MailboxConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl AcnConfig {
    /// Check the settings without which a node cannot be constructed.
    pub fn validate(&self) -> AcnResult<()> {
        if self.node.key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(AcnError::Config("node.key (private key) is required".into()));
        }
        if self.node.mode == NodeMode::Client {
            if self.node.bootstrap_peers.is_empty() {
                return Err(AcnError::Config(
                    "a client node requires at least one bootstrap peer".into(),
                ));
            }
            if self.agent.is_none() {
                return Err(AcnError::Config(
                    "a client node requires an [agent] record".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Role of the node on the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    Peer,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hex-encoded secp256k1 identity key.
    pub key: Option<String>,
    pub mode: NodeMode,
    /// Multiaddresses of peers to bootstrap from.
    pub bootstrap_peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            key: None,
            mode: NodeMode::Peer,
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Peer node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Accept relay registrations from clients.
    pub enable_relay: bool,
    /// Record store file. Defaults to `./agent_records_store_<peer_id>`.
    pub storage_path: Option<PathBuf>,
    /// Sleep before handling each client registration.
    pub registration_delay_ms: u64,
    /// Overall DHT address lookup budget.
    pub lookup_timeout_ms: u64,
    /// Pause between DHT provider queries while nothing is found.
    pub lookup_retry_ms: u64,
    pub new_stream_timeout_ms: u64,
    /// Budget for a single DHT provide.
    pub register_timeout_ms: u64,
    /// How long a delegate client has to acknowledge an envelope.
    pub status_timeout_ms: u64,
    pub bootstrap_timeout_ms: u64,
    /// How long a notification waits for the notifier to show up as connected.
    pub notif_timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            enable_relay: true,
            storage_path: None,
            registration_delay_ms: 0,
            lookup_timeout_ms: 20_000,
            lookup_retry_ms: 200,
            new_stream_timeout_ms: 10_000,
            register_timeout_ms: 3_000,
            status_timeout_ms: 5_000,
            bootstrap_timeout_ms: 60_000,
            notif_timeout_ms: 5_000,
        }
    }
}

impl PeerConfig {
    pub fn registration_delay(&self) -> Duration {
        Duration::from_millis(self.registration_delay_ms)
    }
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
    pub fn lookup_retry(&self) -> Duration {
        Duration::from_millis(self.lookup_retry_ms)
    }
    pub fn new_stream_timeout(&self) -> Duration {
        Duration::from_millis(self.new_stream_timeout_ms)
    }
    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }
    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }
    pub fn notif_timeout(&self) -> Duration {
        Duration::from_millis(self.notif_timeout_ms)
    }
}

/// Client node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Budget for opening a stream to the relay peer, retries included.
    pub relay_stream_timeout_ms: u64,
    /// Budget for opening a stream to a target peer through the relay.
    pub new_stream_timeout_ms: u64,
    pub bootstrap_timeout_ms: u64,
    /// Per-attempt budget when reconnecting to a lost relay.
    pub reconnect_timeout_ms: u64,
    /// First backoff sleep; doubles after every failed attempt.
    pub backoff_start_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_stream_timeout_ms: 300_000,
            new_stream_timeout_ms: 60_000,
            bootstrap_timeout_ms: 60_000,
            reconnect_timeout_ms: 5_000,
            backoff_start_ms: 100,
        }
    }
}

impl ClientConfig {
    pub fn relay_stream_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_stream_timeout_ms)
    }
    pub fn new_stream_timeout(&self) -> Duration {
        Duration::from_millis(self.new_stream_timeout_ms)
    }
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }
    pub fn backoff_start(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }
}

/// TCP+TLS delegate service. Disabled unless `listen_addr` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegateConfig {
    pub listen_addr: Option<String>,
    /// Capacity of each (sender, target) forwarding queue.
    pub pair_queue_size: usize,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            pair_queue_size: 1000,
        }
    }
}

/// HTTPS mailbox service. Disabled unless `listen_addr` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    pub listen_addr: Option<String>,
    /// Capacity of each session's inbound envelope queue.
    pub queue_size: usize,
    /// GCRA budget in tokens per minute per client IP.
    pub rate_limit_per_minute: u32,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            queue_size: 1000,
            rate_limit_per_minute: 600,
        }
    }
}

/// Prometheus exporter. Disabled unless `listen_addr` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub listen_addr: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AcnConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.node.mode, NodeMode::Peer);
        assert_eq!(config.peer.lookup_timeout(), Duration::from_secs(20));
        assert_eq!(config.client.backoff_start(), Duration::from_millis(100));
        assert_eq!(config.delegate.pair_queue_size, 1000);
        assert!(config.mailbox.listen_addr.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config: AcnConfig = toml::from_str(
            r#"
            log_level = "debug"

            [node]
            key = "aa"
            mode = "client"
            bootstrap_peers = ["/dns4/acn.example/tcp/9000/p2p/16Uiu2HAm"]

            [peer]
            lookup_timeout_ms = 500
        "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.node.mode, NodeMode::Client);
        assert_eq!(config.peer.lookup_timeout_ms, 500);
        assert_eq!(config.peer.new_stream_timeout_ms, 10_000);
    }

    #[test]
    fn test_validate() {
        let mut config = AcnConfig::default();
        assert!(config.validate().is_err());

        config.node.key = Some("aa".into());
        assert!(config.validate().is_ok());

        config.node.mode = NodeMode::Client;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("bootstrap"), "{err}");
    }
}
