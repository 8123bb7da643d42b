// Per-stream wiring.
//
// Owns the session pool and dispatcher for one live stream, reports the
// stream lifecycle to the monitor and tears everything down exactly once,
// whether the embedder closes the stream or the dispatcher hits a
// stream-fatal error and cancels it from below.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use livecast_monitor::Monitor;

use crate::config::BroadcastConfig;
use crate::discovery::OrchestratorPool;
use crate::dispatch::{StopStreamPredicate, StreamDispatcher};
use crate::media::{MediaSegment, Profile};
use crate::playlist::PlaylistManager;
use crate::session::{OrchestratorSessionFactory, SessionManager};
use crate::storage::StorageDriver;
use crate::submit::{PaymentSender, SegmentSubmitter, SignatureVerifier};

/// Everything a stream needs wired in.
pub struct BroadcastStreamParams {
    pub nonce: u64,
    pub source_profile: Profile,
    pub profiles: Vec<Profile>,
    pub playlist: Arc<dyn PlaylistManager>,
    pub pool: Arc<dyn OrchestratorPool>,
    pub node_storage: Arc<dyn StorageDriver>,
    pub payment: Option<Arc<dyn PaymentSender>>,
    pub submitter: Arc<dyn SegmentSubmitter>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub monitor: Arc<Monitor>,
    pub config: BroadcastConfig,
    pub stop_stream: Option<StopStreamPredicate>,
}

/// One live stream being dispatched to the transcoding network.
pub struct BroadcastStream {
    nonce: u64,
    dispatcher: Arc<StreamDispatcher>,
    sessions: Arc<SessionManager>,
    monitor: Arc<Monitor>,
    cancel: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

impl BroadcastStream {
    /// Set the stream up: report creation, size and fill the session pool,
    /// build the dispatcher.
    pub async fn new(params: BroadcastStreamParams) -> Arc<Self> {
        params.monitor.stream_created(params.nonce);

        let num_orchs = params.config.target_pool_size(params.pool.size());
        let factory = Arc::new(OrchestratorSessionFactory::new(
            Arc::clone(&params.pool),
            Arc::clone(&params.playlist),
            Arc::clone(&params.node_storage),
            params.payment.clone(),
            params.profiles.clone(),
        ));
        let sessions =
            SessionManager::new(factory, Arc::clone(&params.monitor), num_orchs).await;

        let cancel = CancellationToken::new();
        let mut dispatcher = StreamDispatcher::new(
            params.nonce,
            params.source_profile,
            params.profiles,
            params.playlist,
            Arc::clone(&sessions),
            params.submitter,
            params.verifier,
            Arc::clone(&params.monitor),
            params.config,
            cancel.clone(),
        );
        if let Some(stop) = params.stop_stream {
            dispatcher = dispatcher.with_stop_predicate(stop);
        }

        let stream = Arc::new(Self {
            nonce: params.nonce,
            dispatcher: Arc::new(dispatcher),
            sessions,
            monitor: params.monitor,
            cancel,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        // The dispatcher cancels the token on stream-fatal errors; finish
        // the teardown from here when that happens.
        let watcher = Arc::clone(&stream);
        tokio::spawn(async move {
            watcher.cancel.cancelled().await;
            watcher.finish();
        });

        stream
    }

    #[must_use]
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Ingest one source segment and dispatch it for transcoding.
    pub async fn process_segment(&self, segment: MediaSegment) {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.monitor.stream_started(self.nonce);
        }
        self.dispatcher.process_segment(segment).await;
    }

    /// End the stream. Idempotent; in-flight retries find no sessions and
    /// drain out.
    pub fn close(&self) {
        self.cancel.cancel();
        self.finish();
    }

    fn finish(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(nonce = self.nonce, "stream ended");
        self.sessions.cleanup();
        self.monitor.stream_ended(self.nonce);
    }
}
