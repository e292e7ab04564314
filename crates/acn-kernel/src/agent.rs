//! Link between a node and the local agent runtime.
//!
//! The agent hands envelopes to the node through `route_envelope` and
//! receives envelopes addressed to it through an [`EnvelopeProcessor`]. Local
//! delivery waits for the agent's readiness signal; the wait has no deadline
//! and ends early only on node shutdown.

use crate::error::{KernelError, KernelResult};
use crate::supervisor::ShutdownSignal;
use acn_types::{Envelope, StatusCode};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Callback invoked for every envelope delivered to the local agent.
#[async_trait]
pub trait EnvelopeProcessor: Send + Sync + 'static {
    async fn process_envelope(&self, envelope: Envelope) -> Result<(), String>;
}

/// Forward delivered envelopes into a channel.
#[async_trait]
impl EnvelopeProcessor for mpsc::UnboundedSender<Envelope> {
    async fn process_envelope(&self, envelope: Envelope) -> Result<(), String> {
        self.send(envelope)
            .map_err(|_| "agent inbox closed".to_string())
    }
}

/// Processor slot plus readiness signal.
pub struct AgentLink {
    processor: RwLock<Option<Arc<dyn EnvelopeProcessor>>>,
    ready: watch::Sender<bool>,
}

impl AgentLink {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            processor: RwLock::new(None),
            ready,
        }
    }

    pub fn set_processor(&self, processor: Arc<dyn EnvelopeProcessor>) {
        let mut slot = self.processor.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(processor);
    }

    pub fn processor(&self) -> Option<Arc<dyn EnvelopeProcessor>> {
        let slot = self.processor.read().unwrap_or_else(|e| e.into_inner());
        slot.clone()
    }

    pub fn has_processor(&self) -> bool {
        self.processor().is_some()
    }

    /// Flip the readiness signal. Pending deliveries proceed once it is `true`.
    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Block until the agent is ready or the node shuts down.
    pub async fn wait_ready(&self, mut shutdown: ShutdownSignal) -> KernelResult<()> {
        let mut rx = self.ready.subscribe();
        tokio::select! {
            res = rx.wait_for(|ready| *ready) => {
                res.map(|_| ()).map_err(|_| KernelError::ShuttingDown)
            }
            _ = shutdown.cancelled() => Err(KernelError::ShuttingDown),
        }
    }

    /// Deliver an envelope to the local agent once it is ready.
    pub async fn deliver(&self, envelope: Envelope, shutdown: ShutdownSignal) -> KernelResult<()> {
        if !self.is_ready() {
            debug!(to = %envelope.to, "Waiting for local agent to become ready");
        }
        self.wait_ready(shutdown).await?;
        let processor = self.processor().ok_or_else(|| {
            KernelError::status(StatusCode::ErrorAgentNotReady, "agent is not ready")
        })?;
        processor
            .process_envelope(envelope)
            .await
            .map_err(|e| KernelError::status(StatusCode::ErrorGeneric, e))
    }
}

impl Default for AgentLink {
    fn default() -> Self {
        Self::new()
    }
}
