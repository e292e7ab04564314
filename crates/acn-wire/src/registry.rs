//! Address registry mapping agent addresses to the records and peers that hold them.
//!
//! An [`AddressRegistry`] is a thread-safe index a node keeps for each class
//! of agent it knows about (relay clients, delegate clients, mailbox
//! sessions). Entries never expire; re-registration overwrites.

use acn_types::{AgentRecord, PeerId};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// A registered agent.
#[derive(Debug, Clone)]
pub struct AddressEntry {
    /// The PoR-validated record presented at registration.
    pub record: AgentRecord,
    /// Network identity through which the agent is reached.
    pub peer_id: PeerId,
    /// When the entry was (re-)registered.
    pub registered_at: DateTime<Utc>,
}

/// Thread-safe index of registered agents.
#[derive(Debug, Clone, Default)]
pub struct AddressRegistry {
    entries: Arc<RwLock<HashMap<String, AddressEntry>>>,
}

impl AddressRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or overwrite the entry for `record.address`.
    ///
    /// Returns the previous entry, if any.
    pub fn register(&self, record: AgentRecord, peer_id: PeerId) -> Option<AddressEntry> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            record.address.clone(),
            AddressEntry {
                record,
                peer_id,
                registered_at: Utc::now(),
            },
        )
    }

    /// Remove an address.
    pub fn unregister(&self, address: &str) -> Option<AddressEntry> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(address)
    }

    /// Get the entry for an address.
    pub fn lookup(&self, address: &str) -> Option<AddressEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(address).cloned()
    }

    /// Get only the record for an address.
    pub fn record(&self, address: &str) -> Option<AgentRecord> {
        self.lookup(address).map(|e| e.record)
    }

    /// Get only the peer id for an address.
    pub fn peer_id(&self, address: &str) -> Option<PeerId> {
        self.lookup(address).map(|e| e.peer_id)
    }

    pub fn contains(&self, address: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(address)
    }

    /// All registered addresses.
    pub fn addresses(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.keys().cloned().collect()
    }

    /// Point-in-time `address -> peer id` view.
    pub fn snapshot(&self) -> HashMap<String, PeerId> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .map(|(addr, entry)| (addr.clone(), entry.peer_id.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Addresses this node has already provided on the DHT.
#[derive(Debug, Clone, Default)]
pub struct AnnouncementSet {
    announced: Arc<RwLock<HashSet<String>>>,
}

impl AnnouncementSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `address` as announced. Returns `false` if it already was.
    pub fn insert(&self, address: &str) -> bool {
        let mut announced = self.announced.write().unwrap_or_else(|e| e.into_inner());
        announced.insert(address.to_string())
    }

    /// Forget an address whose announcement failed, so it can be retried.
    pub fn remove(&self, address: &str) -> bool {
        let mut announced = self.announced.write().unwrap_or_else(|e| e.into_inner());
        announced.remove(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        let announced = self.announced.read().unwrap_or_else(|e| e.into_inner());
        announced.contains(address)
    }

    pub fn len(&self) -> usize {
        let announced = self.announced.read().unwrap_or_else(|e| e.into_inner());
        announced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
