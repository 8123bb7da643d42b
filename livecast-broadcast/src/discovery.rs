// Orchestrator discovery seam.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DiscoveryError;
use crate::storage::ObjectStore;

/// Payment ticket parameters advertised by an orchestrator, kept as the raw
/// wire bytes; interpreting them is the payment layer's business.
#[derive(Debug, Clone, Default)]
pub struct TicketParams {
    pub recipient: Vec<u8>,
    pub face_value: Vec<u8>,
    pub win_prob: Vec<u8>,
    pub recipient_rand_hash: Vec<u8>,
    pub seed: Vec<u8>,
}

/// One discovered orchestrator.
#[derive(Clone)]
pub struct OrchestratorInfo {
    /// Transport address of the transcoding endpoint; unique key for the
    /// session pool.
    pub transcoder: String,
    /// Storage the orchestrator prefers segments to be uploaded into.
    pub storage: Option<Arc<dyn ObjectStore>>,
    pub ticket_params: Option<TicketParams>,
}

impl OrchestratorInfo {
    #[must_use]
    pub fn new(transcoder: &str) -> Self {
        Self {
            transcoder: transcoder.to_string(),
            storage: None,
            ticket_params: None,
        }
    }
}

impl std::fmt::Debug for OrchestratorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorInfo")
            .field("transcoder", &self.transcoder)
            .field("has_storage", &self.storage.is_some())
            .field("ticket_params", &self.ticket_params)
            .finish()
    }
}

/// Source of transcoding capacity.
#[async_trait]
pub trait OrchestratorPool: Send + Sync {
    /// Return up to `count` candidate orchestrators.
    async fn get_orchestrators(&self, count: usize)
        -> Result<Vec<OrchestratorInfo>, DiscoveryError>;

    /// Number of orchestrators known to the pool.
    fn size(&self) -> usize;
}
