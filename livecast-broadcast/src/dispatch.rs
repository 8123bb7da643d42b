// Per-segment dispatch state machine.
//
// One call per source segment: save it to the broadcaster's storage, insert
// it into the source playlist, then hand the transcode work to a background
// task that retries against fresh sessions until the segment is delivered or
// there is nothing left to try against. Renditions are downloaded
// concurrently; the orchestrator's signature is verified over the rendition
// hashes in profile-index order.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use sha3::{Digest, Keccak256};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use livecast_monitor::{Monitor, SegmentTranscodeError, SegmentUploadError};

use crate::config::BroadcastConfig;
use crate::error::{DispatchError, StorageError};
use crate::media::{MediaSegment, Profile};
use crate::playlist::PlaylistManager;
use crate::session::{BroadcastSession, SessionManager};
use crate::submit::{SegmentSubmitter, SignatureVerifier, TranscodeResult};

/// Decides whether an error should take the whole stream down. The default
/// never does; embedders supply one to bail on conditions they consider
/// unrecoverable.
pub type StopStreamPredicate = Arc<dyn Fn(&DispatchError) -> bool + Send + Sync>;

/// Drives every segment of one stream through upload, submission, rendition
/// fan-out and verification.
pub struct StreamDispatcher {
    nonce: u64,
    source_profile: Profile,
    profiles: Vec<Profile>,
    playlist: Arc<dyn PlaylistManager>,
    sessions: Arc<SessionManager>,
    submitter: Arc<dyn SegmentSubmitter>,
    verifier: Arc<dyn SignatureVerifier>,
    monitor: Arc<Monitor>,
    stop_stream: Option<StopStreamPredicate>,
    cancel: CancellationToken,
    config: BroadcastConfig,
}

impl StreamDispatcher {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        nonce: u64,
        source_profile: Profile,
        profiles: Vec<Profile>,
        playlist: Arc<dyn PlaylistManager>,
        sessions: Arc<SessionManager>,
        submitter: Arc<dyn SegmentSubmitter>,
        verifier: Arc<dyn SignatureVerifier>,
        monitor: Arc<Monitor>,
        config: BroadcastConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            nonce,
            source_profile,
            profiles,
            playlist,
            sessions,
            submitter,
            verifier,
            monitor,
            stop_stream: None,
            cancel,
            config,
        }
    }

    /// Install a stream-fatal error predicate.
    #[must_use]
    pub fn with_stop_predicate(mut self, predicate: StopStreamPredicate) -> Self {
        self.stop_stream = Some(predicate);
        self
    }

    /// Ingest one source segment.
    ///
    /// The source stages run inline; any error there drops the segment,
    /// since the segmenter has already moved on and there is nothing to
    /// retry. On success the transcode stages continue in a background task.
    pub async fn process_segment(self: &Arc<Self>, segment: MediaSegment) {
        let seq_no = segment.seq_no;
        self.monitor
            .segment_emerged(self.nonce, seq_no, self.profiles.len());

        let store = self.playlist.storage();
        let name = format!("{}/{}.ts", self.source_profile.name, seq_no);
        let uri = match store.save(&name, segment.data.clone()).await {
            Ok(uri) => uri,
            Err(err) => {
                error!(seq_no, %err, "saving source segment failed");
                self.monitor.segment_upload_failed(
                    self.nonce,
                    seq_no,
                    SegmentUploadError::Unknown,
                );
                return;
            }
        };
        // With external storage the returned URI, not the object name, is
        // what orchestrators can reach.
        let source_uri = store.is_external().then(|| uri.clone());

        if let Err(err) = self
            .playlist
            .insert_segment(&self.source_profile, seq_no, &uri, segment.duration_secs)
            .await
        {
            error!(seq_no, %err, "inserting source segment failed");
            self.monitor
                .segment_upload_failed(self.nonce, seq_no, SegmentUploadError::Unknown);
            return;
        }
        self.monitor.segment_source_appeared(&self.source_profile.name);
        debug!(seq_no, "source segment appeared");

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.dispatch_loop(segment, name, source_uri).await;
        });
    }

    async fn dispatch_loop(
        self: &Arc<Self>,
        segment: MediaSegment,
        name: String,
        source_uri: Option<String>,
    ) {
        let mut backoff = self.config.retry_backoff();
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self
                .transcode_segment(&segment, &name, source_uri.as_deref())
                .await
            {
                Ok(()) => return,
                Err(err) => {
                    warn!(seq_no = segment.seq_no, %err, "segment dispatch failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_retry_backoff());
                }
            }
        }
    }

    /// One dispatch attempt. `Ok(())` ends the retry loop: either the
    /// segment went through or there are no sessions to try against.
    async fn transcode_segment(
        self: &Arc<Self>,
        segment: &MediaSegment,
        name: &str,
        source_uri: Option<&str>,
    ) -> Result<(), DispatchError> {
        let seq_no = segment.seq_no;
        let Some(session) = self.sessions.select() else {
            debug!(seq_no, "no sessions available");
            self.monitor.segment_transcode_failed(
                self.nonce,
                seq_no,
                SegmentTranscodeError::NoOrchestrators,
            );
            return Ok(());
        };

        let mut upload_uri = source_uri.map(str::to_owned);
        if let Some(orch_store) = &session.orchestrator_store {
            match orch_store.save(name, segment.data.clone()).await {
                Ok(uri) => upload_uri = Some(uri),
                Err(err) => {
                    error!(seq_no, %err, "uploading segment to orchestrator storage failed");
                    self.monitor.segment_upload_failed(
                        self.nonce,
                        seq_no,
                        SegmentUploadError::ObjectStorage,
                    );
                    self.sessions.remove(&session);
                    return Err(err.into());
                }
            }
        }

        debug!(seq_no, transcoder = session.transcoder(), "submitting segment");
        let submitted_at = Instant::now();
        let result = match self
            .submitter
            .submit(&session, segment, upload_uri.as_deref())
            .await
        {
            Ok(Some(result)) => {
                self.monitor.segment_uploaded(submitted_at.elapsed());
                result
            }
            Ok(None) => {
                self.sessions.remove(&session);
                return Err(DispatchError::EmptyResponse);
            }
            Err(err) => {
                self.sessions.remove(&session);
                if err.is_session_fatal() {
                    debug!(
                        seq_no,
                        transcoder = session.transcoder(),
                        "dropped session after transport failure"
                    );
                }
                let err = DispatchError::from(err);
                if self.should_stop_stream(&err) {
                    warn!(seq_no, %err, "stopping stream");
                    self.cancel.cancel();
                }
                return Err(err);
            }
        };

        self.sessions.complete(Arc::clone(&session));

        let profiles_label = Profile::names(&session.profiles);
        if let Some(duration) = result.transcode_duration {
            self.monitor.segment_transcoded(duration, &profiles_label);
        }

        let (seg_hashes, first_error) = self.download_renditions(segment, &session, &result).await;

        let hashed = seg_hashes.iter().filter(|hash| hash.is_some()).count();
        let all_success = hashed == result.segments.len();
        self.monitor.segment_fully_transcoded(
            self.nonce,
            seq_no,
            &profiles_label,
            all_success,
            first_error,
        );

        if let Some(params) = &session.orchestrator.ticket_params {
            let digest = aggregate_hash(&seg_hashes);
            if !self.verifier.verify(&params.recipient, &digest, &result.sig) {
                error!(seq_no, "rendition signature check failed");
                return Err(DispatchError::SignatureMismatch);
            }
        }

        debug!(seq_no, "segment validated");
        Ok(())
    }

    /// Download, store and insert every rendition concurrently. Returns the
    /// per-profile Keccak-256 hashes (index-ordered) and the first error
    /// reported, if any; later errors are logged but not re-counted.
    async fn download_renditions(
        self: &Arc<Self>,
        segment: &MediaSegment,
        session: &Arc<BroadcastSession>,
        result: &TranscodeResult,
    ) -> (Vec<Option<[u8; 32]>>, Option<SegmentTranscodeError>) {
        let seg_hashes: Arc<Mutex<Vec<Option<[u8; 32]>>>> =
            Arc::new(Mutex::new(vec![None; result.segments.len()]));
        let first_error: Arc<Mutex<Option<SegmentTranscodeError>>> = Arc::new(Mutex::new(None));

        let mut tasks = JoinSet::new();
        for (index, rendition) in result.segments.iter().enumerate() {
            let this = Arc::clone(self);
            let session = Arc::clone(session);
            let seg_hashes = Arc::clone(&seg_hashes);
            let first_error = Arc::clone(&first_error);
            let uri = rendition.uri.clone();
            let seq_no = segment.seq_no;
            let duration_secs = segment.duration_secs;
            tasks.spawn(async move {
                this.download_rendition(
                    &session,
                    seq_no,
                    duration_secs,
                    index,
                    uri,
                    &seg_hashes,
                    &first_error,
                )
                .await;
            });
        }
        while tasks.join_next().await.is_some() {}

        let hashes = Arc::try_unwrap(seg_hashes)
            .map(|hashes| hashes.into_inner())
            .unwrap_or_else(|shared| shared.lock().clone());
        let first = *first_error.lock();
        (hashes, first)
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_rendition(
        &self,
        session: &BroadcastSession,
        seq_no: u64,
        duration_secs: f64,
        index: usize,
        mut uri: String,
        seg_hashes: &Mutex<Vec<Option<[u8; 32]>>>,
        first_error: &Mutex<Option<SegmentTranscodeError>>,
    ) {
        let Some(profile) = session.profiles.get(index) else {
            self.report_rendition_error(
                first_error,
                seq_no,
                SegmentTranscodeError::UnknownResponse,
                &uri,
                "rendition without a matching profile",
            );
            return;
        };

        let store = &session.broadcaster_store;
        if !store.is_own(&uri) {
            let data = match store.fetch(&uri).await {
                Ok(data) => data,
                Err(err) => {
                    self.report_rendition_error(
                        first_error,
                        seq_no,
                        SegmentTranscodeError::Download,
                        &uri,
                        &err.to_string(),
                    );
                    return;
                }
            };
            let name = format!("{}/{seq_no}.ts", profile.name);
            match store.save(&name, data.clone()).await {
                Ok(new_uri) => uri = new_uri,
                Err(StorageError::SessionEnded) => {
                    self.report_rendition_error(
                        first_error,
                        seq_no,
                        SegmentTranscodeError::SessionEnded,
                        &uri,
                        "Session ended",
                    );
                    return;
                }
                Err(err) => {
                    self.report_rendition_error(
                        first_error,
                        seq_no,
                        SegmentTranscodeError::SaveData,
                        &uri,
                        &err.to_string(),
                    );
                    return;
                }
            }
            let mut hasher = Keccak256::new();
            hasher.update(&data);
            seg_hashes.lock()[index] = Some(hasher.finalize().into());
        }

        self.monitor
            .segment_transcoded_appeared(self.nonce, seq_no, &profile.name);
        if let Err(err) = self
            .playlist
            .insert_segment(profile, seq_no, &uri, duration_secs)
            .await
        {
            self.report_rendition_error(
                first_error,
                seq_no,
                SegmentTranscodeError::Playlist,
                &uri,
                &err.to_string(),
            );
        }
    }

    fn report_rendition_error(
        &self,
        first_error: &Mutex<Option<SegmentTranscodeError>>,
        seq_no: u64,
        code: SegmentTranscodeError,
        uri: &str,
        detail: &str,
    ) {
        error!(seq_no, code = code.as_str(), uri, detail, "rendition failed");
        let mut slot = first_error.lock();
        if slot.is_none() {
            *slot = Some(code);
            self.monitor
                .segment_transcode_failed(self.nonce, seq_no, code);
        }
    }

    fn should_stop_stream(&self, err: &DispatchError) -> bool {
        self.stop_stream.as_ref().is_some_and(|pred| pred(err))
    }
}

/// Keccak-256 over the recorded rendition hashes in profile-index order.
/// This is the message the orchestrator's signature must cover.
fn aggregate_hash(hashes: &[Option<[u8; 32]>]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for hash in hashes.iter().flatten() {
        hasher.update(hash);
    }
    hasher.finalize().into()
}
