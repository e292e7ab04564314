//! HTTP surfaces of an ACN Peer.
//!
//! - **mailbox**: HTTPS polling API for agents without a persistent socket
//! - **metrics**: Prometheus exposition of the Peer's monitor
//! - **AcnService**: a Peer plus whichever of the two its config enables

pub mod error;
pub mod mailbox;
pub mod metrics;
pub mod rate_limiter;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{start_mailbox, start_metrics, AcnService, ServiceHandle, TlsListener};
