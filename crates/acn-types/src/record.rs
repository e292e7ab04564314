//! Agent records and envelopes, the two payloads the overlay carries.

use crate::error::AcnResult;
use crate::ledger::LedgerKey;
use crate::serde_compat::base64_bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signed binding of an agent's ledger identity to a network peer identity.
///
/// `signature` is made with the agent's ledger key over the UTF-8 bytes of
/// `peer_public_key`. Records are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Ledger-derived agent address.
    pub address: String,
    /// Agent's ledger public key.
    pub public_key: String,
    /// Ledger the address and signature belong to.
    pub ledger_id: String,
    /// Compressed hex public key of the node representing the agent.
    pub peer_public_key: String,
    /// Ledger signature over `peer_public_key`.
    pub signature: String,
}

impl AgentRecord {
    /// Produce a record for `key`, authorising the node `peer_public_key`.
    pub fn sign(key: &LedgerKey, peer_public_key: &str) -> AcnResult<Self> {
        Ok(Self {
            address: key.address()?,
            public_key: key.public_key(),
            ledger_id: key.ledger().as_str().to_string(),
            peer_public_key: peer_public_key.to_string(),
            signature: key.sign(peer_public_key.as_bytes())?,
        })
    }
}

/// Opaque addressed message exchanged between agents.
///
/// The overlay routes on `to` and checks `sender`; `message` is never inspected.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub to: String,
    pub sender: String,
    #[serde(with = "base64_bytes")]
    pub message: Vec<u8>,
}

impl Envelope {
    pub fn new(to: impl Into<String>, sender: impl Into<String>, message: impl Into<Vec<u8>>) -> Self {
        Self {
            to: to.into(),
            sender: sender.into(),
            message: message.into(),
        }
    }

    /// Serialize for embedding in an ACN `Envelope` message.
    pub fn to_bytes(&self) -> AcnResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> AcnResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("to", &self.to)
            .field("sender", &self.sender)
            .field("message_len", &self.message.len())
            .finish()
    }
}
