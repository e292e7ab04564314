//! ACN message types.
//!
//! Every ACN interaction exchanges [`AcnMessage`]s: JSON objects framed on the
//! underlying stream with a 4-byte big-endian length header. Exactly one
//! payload variant is populated per message and every message carries the
//! protocol version.

use acn_types::serde_compat::base64_bytes;
use acn_types::{AcnResult, AgentRecord, Envelope, Status};
use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// A framed ACN message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcnMessage {
    /// Protocol version of the sender.
    pub version: String,
    /// Message variant.
    #[serde(flatten)]
    pub payload: AcnPayload,
}

/// The five ACN payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AcnPayload {
    /// Register an agent record with a relay or delegate peer.
    #[serde(rename = "register")]
    Register { record: AgentRecord },
    /// Ask for the record of an agent address.
    #[serde(rename = "lookup_request")]
    LookupRequest { agent_address: String },
    /// Record returned for a lookup.
    #[serde(rename = "lookup_response")]
    LookupResponse { record: AgentRecord },
    /// Deliver a serialized [`Envelope`], asserting the sender's record.
    #[serde(rename = "envelope")]
    Envelope {
        record: AgentRecord,
        #[serde(with = "base64_bytes")]
        envelope: Vec<u8>,
    },
    /// Result of the interaction.
    #[serde(rename = "status")]
    Status { status: Status },
}

impl AcnPayload {
    /// Variant name, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            AcnPayload::Register { .. } => "register",
            AcnPayload::LookupRequest { .. } => "lookup_request",
            AcnPayload::LookupResponse { .. } => "lookup_response",
            AcnPayload::Envelope { .. } => "envelope",
            AcnPayload::Status { .. } => "status",
        }
    }
}

impl AcnMessage {
    pub fn new(payload: AcnPayload) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            payload,
        }
    }

    pub fn register(record: AgentRecord) -> Self {
        Self::new(AcnPayload::Register { record })
    }

    pub fn lookup_request(agent_address: impl Into<String>) -> Self {
        Self::new(AcnPayload::LookupRequest {
            agent_address: agent_address.into(),
        })
    }

    pub fn lookup_response(record: AgentRecord) -> Self {
        Self::new(AcnPayload::LookupResponse { record })
    }

    /// Wrap an envelope together with its sender's record.
    pub fn envelope(record: AgentRecord, envelope: &Envelope) -> AcnResult<Self> {
        Ok(Self::new(AcnPayload::Envelope {
            record,
            envelope: envelope.to_bytes()?,
        }))
    }

    pub fn status(status: Status) -> Self {
        Self::new(AcnPayload::Status { status })
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// Encode a message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &AcnMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    Ok(encode_frame(&json))
}

/// Prefix a raw body with its 4-byte big-endian length.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let len = body.len() as u32;
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(body);
    bytes
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into an AcnMessage.
pub fn decode_message(body: &[u8]) -> Result<AcnMessage, serde_json::Error> {
    serde_json::from_slice(body)
}
