//! Core types for the Agent Communication Network (ACN).
//!
//! This crate defines the data shared by every ACN component: agent records,
//! envelopes, status codes, node identities, DHT content keys, the ledger
//! capability used to prove record authenticity, and node configuration.
//! It contains no networking.

pub mod config;
pub mod content;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod record;
pub mod serde_compat;
pub mod status;

pub use content::ContentKey;
pub use error::{AcnError, AcnResult};
pub use identity::{NodeKey, PeerId};
pub use ledger::{LedgerId, LedgerKey};
pub use record::{AgentRecord, Envelope};
pub use status::{Status, StatusCode};
