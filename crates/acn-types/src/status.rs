//! ACN status codes: the uniform result of every ACN interaction.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of ACN result codes.
///
/// The numeric values are part of the wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum StatusCode {
    /// The interaction succeeded.
    Success,
    /// The message version is not supported by the receiver.
    ErrorUnsupportedVersion,
    /// A well-formed message of the wrong variant was received.
    ErrorUnexpectedPayload,
    /// A local failure unrelated to the counterparty's input.
    ErrorGeneric,
    /// A nested payload (e.g. the serialized envelope) could not be decoded.
    ErrorDecode,
    /// The frame body is not a well-formed ACN message.
    ErrorSerialization,
    /// Record address does not match the expected or derived address.
    ErrorWrongAgentAddress,
    /// Record peer public key does not match the transport identity.
    ErrorWrongPublicKey,
    /// Signature over the peer public key does not verify.
    ErrorInvalidProof,
    /// Ledger id is not one of the supported ledgers.
    ErrorUnsupportedLedger,
    /// No record is known for the requested agent address.
    ErrorUnknownAgentAddress,
    /// The target agent is not ready to accept envelopes.
    ErrorAgentNotReady,
}

impl StatusCode {
    /// Wire value of this code.
    pub fn as_u32(self) -> u32 {
        match self {
            StatusCode::Success => 0,
            StatusCode::ErrorUnsupportedVersion => 1,
            StatusCode::ErrorUnexpectedPayload => 2,
            StatusCode::ErrorGeneric => 3,
            StatusCode::ErrorDecode => 4,
            StatusCode::ErrorSerialization => 5,
            StatusCode::ErrorWrongAgentAddress => 10,
            StatusCode::ErrorWrongPublicKey => 11,
            StatusCode::ErrorInvalidProof => 12,
            StatusCode::ErrorUnsupportedLedger => 13,
            StatusCode::ErrorUnknownAgentAddress => 20,
            StatusCode::ErrorAgentNotReady => 21,
        }
    }

    /// Canonical upper-case name, as used in logs and error strings.
    pub fn name(self) -> &'static str {
        match self {
            StatusCode::Success => "SUCCESS",
            StatusCode::ErrorUnsupportedVersion => "ERROR_UNSUPPORTED_VERSION",
            StatusCode::ErrorUnexpectedPayload => "ERROR_UNEXPECTED_PAYLOAD",
            StatusCode::ErrorGeneric => "ERROR_GENERIC",
            StatusCode::ErrorDecode => "ERROR_DECODE",
            StatusCode::ErrorSerialization => "ERROR_SERIALIZATION",
            StatusCode::ErrorWrongAgentAddress => "ERROR_WRONG_AGENT_ADDRESS",
            StatusCode::ErrorWrongPublicKey => "ERROR_WRONG_PUBLIC_KEY",
            StatusCode::ErrorInvalidProof => "ERROR_INVALID_PROOF",
            StatusCode::ErrorUnsupportedLedger => "ERROR_UNSUPPORTED_LEDGER",
            StatusCode::ErrorUnknownAgentAddress => "ERROR_UNKNOWN_AGENT_ADDRESS",
            StatusCode::ErrorAgentNotReady => "ERROR_AGENT_NOT_READY",
        }
    }

    pub fn is_success(self) -> bool {
        self == StatusCode::Success
    }
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> u32 {
        code.as_u32()
    }
}

impl TryFrom<u32> for StatusCode {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => StatusCode::Success,
            1 => StatusCode::ErrorUnsupportedVersion,
            2 => StatusCode::ErrorUnexpectedPayload,
            3 => StatusCode::ErrorGeneric,
            4 => StatusCode::ErrorDecode,
            5 => StatusCode::ErrorSerialization,
            10 => StatusCode::ErrorWrongAgentAddress,
            11 => StatusCode::ErrorWrongPublicKey,
            12 => StatusCode::ErrorInvalidProof,
            13 => StatusCode::ErrorUnsupportedLedger,
            20 => StatusCode::ErrorUnknownAgentAddress,
            21 => StatusCode::ErrorAgentNotReady,
            other => return Err(format!("unknown status code {other}")),
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of an ACN interaction: a code plus free-form diagnostic messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    #[serde(default)]
    pub msgs: Vec<String>,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: StatusCode::Success,
            msgs: Vec::new(),
        }
    }

    /// An error status with a single diagnostic message.
    pub fn error(code: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msgs: vec![msg.into()],
        }
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Diagnostic messages joined for display.
    pub fn message(&self) -> String {
        self.msgs.join(": ")
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.msgs.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message())
        }
    }
}
