use async_trait::async_trait;
use driftwood_proto::{IceCandidate, Mode, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("peer connection not prepared")]
    NotPrepared,
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("{operation} failed: {reason}")]
    Operation {
        operation: &'static str,
        reason: String,
    },
}

impl EngineError {
    pub fn operation(operation: &'static str, reason: impl ToString) -> Self {
        EngineError::Operation {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Peer-connection backend driven by the negotiation worker. Calls arrive one
/// at a time, in the order the negotiator emitted them.
#[async_trait]
pub trait PeerEngine: Send + 'static {
    /// Builds a fresh peer connection for `mode`. Locally gathered ICE
    /// candidates are pushed into `candidates` until [`PeerEngine::release`].
    async fn prepare(
        &mut self,
        mode: Mode,
        candidates: mpsc::UnboundedSender<IceCandidate>,
    ) -> Result<(), EngineError>;

    /// Creates an offer and installs it as the local description.
    async fn create_offer(&mut self) -> Result<SessionDescription, EngineError>;

    async fn rollback(&mut self) -> Result<(), EngineError>;

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    /// Creates an answer and installs it as the local description.
    async fn create_answer(&mut self) -> Result<SessionDescription, EngineError>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn release(&mut self);
}
