//! Kernel-specific error types.

use acn_store::StoreError;
use acn_types::{AcnError, Status, StatusCode};
use acn_wire::{HostError, WireError};
use thiserror::Error;

/// Kernel error type wrapping the lower layers with node-level context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A data-model, ledger or status error.
    #[error(transparent)]
    Acn(#[from] AcnError),

    /// A wire protocol exchange failed.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The transport could not dial, open a stream, or reach the DHT.
    #[error(transparent)]
    Host(#[from] HostError),

    /// The persistent record store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// TLS setup or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// An operation exceeded its time budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The node is closing.
    #[error("Node is shutting down")]
    ShuttingDown,

    /// The node failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

impl KernelError {
    /// Shorthand for an error carrying an ACN status.
    pub fn status(code: StatusCode, msg: impl Into<String>) -> Self {
        KernelError::Acn(AcnError::status(code, msg))
    }

    /// The ACN status code describing this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            KernelError::Acn(e) => e.status_code(),
            KernelError::Wire(e) => e.status_code(),
            _ => StatusCode::ErrorGeneric,
        }
    }

    /// Convert into a status suitable for replying to a counterparty.
    pub fn to_status(&self) -> Status {
        match self {
            KernelError::Acn(AcnError::Status(status)) => status.clone(),
            KernelError::Wire(e) => e.to_status(),
            other => Status::error(other.status_code(), other.to_string()),
        }
    }
}

impl From<Status> for KernelError {
    fn from(status: Status) -> Self {
        KernelError::Acn(AcnError::Status(status))
    }
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;

/// Run `fut` with a deadline, mapping expiry to [`KernelError::Timeout`].
pub(crate) async fn with_timeout<T, E, F>(
    duration: std::time::Duration,
    what: &str,
    fut: F,
) -> KernelResult<T>
where
    F: std::future::Future<Output = Result<T, E>>,
    KernelError: From<E>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result.map_err(KernelError::from),
        Err(_) => Err(KernelError::Timeout(format!("{what} after {duration:?}"))),
    }
}
