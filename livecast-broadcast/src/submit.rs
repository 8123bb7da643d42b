// RPC, payment and signature seams.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::discovery::TicketParams;
use crate::error::SubmitError;
use crate::media::MediaSegment;
use crate::session::BroadcastSession;

/// One transcoded rendition advertised in a submit response.
#[derive(Debug, Clone)]
pub struct TranscodedSegment {
    pub uri: String,
}

/// Successful submit response: one rendition URI per profile, in profile
/// order, plus the orchestrator's signature over the rendition hashes.
#[derive(Debug, Clone)]
pub struct TranscodeResult {
    pub segments: Vec<TranscodedSegment>,
    pub sig: Bytes,
    /// Wall-clock transcode time reported by the orchestrator.
    pub transcode_duration: Option<Duration>,
}

/// Sends one segment to an orchestrator and returns its rendition URIs.
///
/// `Ok(None)` models an orchestrator that answered without a usable body;
/// the dispatcher treats it like a failure and drops the session.
#[async_trait]
pub trait SegmentSubmitter: Send + Sync {
    async fn submit(
        &self,
        session: &BroadcastSession,
        segment: &MediaSegment,
        uploaded_uri: Option<&str>,
    ) -> Result<Option<TranscodeResult>, SubmitError>;
}

/// Verifies an orchestrator signature over a message digest.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, recipient: &[u8], msg: &[u8], sig: &[u8]) -> bool;
}

/// Opens payment sessions against orchestrators that advertise ticket
/// parameters.
pub trait PaymentSender: Send + Sync {
    fn start_session(&self, params: &TicketParams) -> String;
}
