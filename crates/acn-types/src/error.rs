//! Shared error types for the ACN.

use crate::status::{Status, StatusCode};
use thiserror::Error;

/// Top-level error type for ACN data-model and ledger operations.
#[derive(Error, Debug)]
pub enum AcnError {
    /// A counterparty (or a local check) answered with a non-success status.
    #[error("{0}")]
    Status(Status),

    /// The ledger id is not one of the supported ledgers.
    #[error("Unsupported ledger: {0}")]
    UnsupportedLedger(String),

    /// A public key could not be parsed for the given encoding.
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// A private key could not be parsed.
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// A signature could not be parsed or produced.
    #[error("Signature error: {0}")]
    Signature(String),

    /// An address could not be derived from a public key.
    #[error("Address derivation failed: {0}")]
    Address(String),

    /// A multiaddress or peer id could not be parsed.
    #[error("Invalid peer address: {0}")]
    PeerAddress(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AcnError {
    /// Shorthand for a status error with a single message.
    pub fn status(code: StatusCode, msg: impl Into<String>) -> Self {
        AcnError::Status(Status::error(code, msg))
    }

    /// The ACN status code that best describes this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AcnError::Status(status) => status.code,
            AcnError::UnsupportedLedger(_) => StatusCode::ErrorUnsupportedLedger,
            AcnError::InvalidPublicKey(_) => StatusCode::ErrorWrongPublicKey,
            AcnError::Signature(_) => StatusCode::ErrorInvalidProof,
            AcnError::Address(_) => StatusCode::ErrorWrongAgentAddress,
            AcnError::Serialization(_) => StatusCode::ErrorSerialization,
            AcnError::InvalidPrivateKey(_) | AcnError::PeerAddress(_) | AcnError::Config(_) => {
                StatusCode::ErrorGeneric
            }
        }
    }
}

impl From<Status> for AcnError {
    fn from(status: Status) -> Self {
        AcnError::Status(status)
    }
}

impl From<serde_json::Error> for AcnError {
    fn from(e: serde_json::Error) -> Self {
        AcnError::Serialization(e.to_string())
    }
}

/// Alias for ACN results.
pub type AcnResult<T> = Result<T, AcnError>;
