use thiserror::Error;

/// Failures from an object-storage session.
///
/// `SessionEnded` renders as the literal `"Session ended"`; remote stores
/// signal an expired session with exactly that message and the dispatcher
/// classifies on it.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Session ended")]
    SessionEnded,

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Failures from orchestrator discovery.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("no orchestrators available")]
    NoOrchestrators,

    #[error("discovery canceled")]
    Canceled,

    #[error("discovery backend error: {0}")]
    Backend(String),
}

/// Failures from submitting a segment to an orchestrator.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("orchestrator busy")]
    OrchestratorBusy,

    #[error("orchestrator capacity reached")]
    OrchestratorCapped,

    #[error("segment submit timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response: {0}")]
    Response(String),
}

impl SubmitError {
    /// True when the error condemns the session itself rather than the
    /// attempt: a saturated orchestrator or a broken transport connection.
    /// String matching covers transport errors surfaced through wrapped
    /// error types.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Self::OrchestratorBusy | Self::OrchestratorCapped => true,
            _ => {
                let msg = self.to_string();
                msg.contains("dial tcp") || msg.contains("unexpected EOF")
            }
        }
    }
}

/// Failures inserting into a playlist.
#[derive(Error, Debug)]
pub enum PlaylistError {
    #[error("playlist insert failed: {0}")]
    Insert(String),
}

/// One failed dispatch attempt for a segment. The retry loop treats every
/// variant the same way: log, back off, try a fresh session.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("empty response from orchestrator")]
    EmptyResponse,

    #[error("segment signature verification failed")]
    SignatureMismatch,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Playlist(#[from] PlaylistError),
}
