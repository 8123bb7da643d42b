// Broadcaster-side segment dispatch.
//
// A broadcaster ingests a live stream, saves each source segment to object
// storage and farms it out to remote orchestrators for transcoding. This
// crate owns the two hard parts of that pipeline: the per-stream pool of
// orchestrator sessions and the per-segment dispatch state machine (upload,
// submit, rendition fan-out, signature verification, retry).
//
// Everything network-facing (storage drivers, orchestrator discovery, the
// RPC submit call, playlists, payments, signature checking) is an injected
// trait, so the core is fully testable with in-memory fakes.

pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod media;
pub mod playlist;
pub mod session;
pub mod storage;
pub mod stream;
pub mod submit;

pub use config::BroadcastConfig;
pub use discovery::{OrchestratorInfo, OrchestratorPool, TicketParams};
pub use dispatch::{StopStreamPredicate, StreamDispatcher};
pub use error::{DiscoveryError, DispatchError, PlaylistError, StorageError, SubmitError};
pub use media::{MediaSegment, Profile};
pub use playlist::PlaylistManager;
pub use session::{BroadcastSession, OrchestratorSessionFactory, SessionFactory, SessionManager};
pub use storage::{MemoryDriver, MemoryStore, ObjectStore, StorageDriver};
pub use stream::{BroadcastStream, BroadcastStreamParams};
pub use submit::{
    PaymentSender, SegmentSubmitter, SignatureVerifier, TranscodeResult, TranscodedSegment,
};
