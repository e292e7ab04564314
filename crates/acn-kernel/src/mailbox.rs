//! Sessions of agents that poll a Peer for their envelopes over HTTPS.
//!
//! Each registered agent gets a random token and a bounded queue. A new
//! registration for an address replaces the previous session, token included.

use acn_types::{AgentRecord, Envelope};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

struct Mailbox {
    record: AgentRecord,
    token: String,
    queue: VecDeque<Envelope>,
}

#[derive(Default)]
struct Inner {
    by_token: HashMap<String, String>,
    by_address: HashMap<String, Mailbox>,
}

/// Registry of mailbox sessions keyed by token and by agent address.
pub struct MailboxSessions {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl MailboxSessions {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Open a session for an already validated record, returning its token.
    pub fn register(&self, record: AgentRecord) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let address = record.address.clone();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = inner.by_address.remove(&address) {
            debug!(addr = %address, "Mailbox: replacing existing session");
            inner.by_token.remove(&old.token);
        }
        inner.by_token.insert(token.clone(), address.clone());
        inner.by_address.insert(
            address,
            Mailbox {
                record,
                token: token.clone(),
                queue: VecDeque::new(),
            },
        );
        token
    }

    /// Close a session, returning the address it belonged to.
    pub fn unregister(&self, token: &str) -> Option<String> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let address = inner.by_token.remove(token)?;
        inner.by_address.remove(&address);
        Some(address)
    }

    pub fn address(&self, token: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_token.get(token).cloned()
    }

    pub fn record(&self, address: &str) -> Option<AgentRecord> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_address.get(address).map(|m| m.record.clone())
    }

    pub fn contains(&self, address: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_address.contains_key(address)
    }

    /// Queue an envelope for `address`. A full queue drops the new envelope.
    ///
    /// Returns `false` when the envelope was not queued.
    pub fn enqueue(&self, address: &str, envelope: Envelope) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(mailbox) = inner.by_address.get_mut(address) else {
            return false;
        };
        if mailbox.queue.len() >= self.capacity {
            warn!(addr = %address, capacity = self.capacity, "Mailbox full, dropping envelope");
            return false;
        }
        mailbox.queue.push_back(envelope);
        true
    }

    /// Oldest queued envelope of the session owning `token`.
    pub fn pop(&self, token: &str) -> Option<Envelope> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let address = inner.by_token.get(token)?.clone();
        inner.by_address.get_mut(&address)?.queue.pop_front()
    }

    pub fn queued(&self, address: &str) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_address.get(address).map_or(0, |m| m.queue.len())
    }

    pub fn addresses(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_address.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: &str) -> AgentRecord {
        AgentRecord {
            address: address.to_string(),
            public_key: "02aa".to_string(),
            ledger_id: "fetchai".to_string(),
            peer_public_key: "03bb".to_string(),
            signature: "c2ln".to_string(),
        }
    }

    #[test]
    fn test_register_issues_hex_token() {
        let sessions = MailboxSessions::new(10);
        let token = sessions.register(record("fetch1a"));
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(sessions.address(&token).as_deref(), Some("fetch1a"));
        assert!(sessions.contains("fetch1a"));
    }

    #[test]
    fn test_reregister_replaces_session() {
        let sessions = MailboxSessions::new(10);
        let first = sessions.register(record("fetch1a"));
        sessions.enqueue("fetch1a", Envelope::new("fetch1a", "fetch1b", vec![1]));
        let second = sessions.register(record("fetch1a"));
        assert_ne!(first, second);
        assert!(sessions.address(&first).is_none());
        assert!(sessions.pop(&second).is_none());
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn test_fifo_and_overflow_drops_newest() {
        let sessions = MailboxSessions::new(2);
        let token = sessions.register(record("fetch1a"));
        for i in 0..3u8 {
            let queued = sessions.enqueue("fetch1a", Envelope::new("fetch1a", "fetch1b", vec![i]));
            assert_eq!(queued, i < 2);
        }
        assert_eq!(sessions.queued("fetch1a"), 2);
        assert_eq!(sessions.pop(&token).unwrap().message, vec![0]);
        assert_eq!(sessions.pop(&token).unwrap().message, vec![1]);
        assert!(sessions.pop(&token).is_none());
    }

    #[test]
    fn test_unregister() {
        let sessions = MailboxSessions::new(2);
        let token = sessions.register(record("fetch1a"));
        assert_eq!(sessions.unregister(&token).as_deref(), Some("fetch1a"));
        assert!(sessions.unregister(&token).is_none());
        assert!(!sessions.enqueue("fetch1a", Envelope::new("fetch1a", "x", vec![])));
        assert!(sessions.is_empty());
    }
}
