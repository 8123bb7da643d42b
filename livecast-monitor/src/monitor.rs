// Metrics façade shared by the session manager, the segment dispatcher and
// the watchdog.
//
// All series live in an embedded Prometheus registry owned by the `Monitor`
// instance, so tests and embedders construct as many independent monitors as
// they need instead of sharing process-global state.
//
// Source segments are counted only when their outcome is known: a segment
// emerging from the segmenter records a timestamp here, and the emerged
// counter is bumped when the segment reaches a terminal state (uploaded
// renditions, a failure, or the watchdog declaring it lost). This keeps
// "source observed" from ever running ahead of "outcome observed".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::{error, warn};

use crate::averager::SuccessAverager;
use crate::codes::{SegmentTranscodeError, SegmentUploadError};
use crate::{TIME_TO_WAIT_FOR_ERROR, WATCHDOG_PAUSE};

/// Namespace prefixed to every series in the registry.
pub const METRICS_NAMESPACE: &str = "livepeer";

#[derive(Debug, Clone, Copy)]
struct EmergeEntry {
    at: Instant,
    profiles: u64,
}

#[derive(Default)]
struct MonitorState {
    // nonce -> seqNo -> emerge bookkeeping
    emerge_times: HashMap<u64, HashMap<u64, EmergeEntry>>,
    // nonce -> sliding success window
    success: HashMap<u64, SuccessAverager>,
}

/// Thread-safe telemetry recorder for one broadcaster node.
pub struct Monitor {
    registry: Registry,

    segment_source_appeared: IntCounterVec,
    segment_emerged: IntCounter,
    segment_emerged_with_profiles: IntCounter,
    segment_uploaded: IntCounter,
    segment_upload_failed: IntCounterVec,
    segment_transcoded: IntCounterVec,
    segment_transcode_failed: IntCounterVec,
    segment_transcoded_appeared: IntCounterVec,
    segment_transcoded_all_appeared: IntCounterVec,
    broadcast_client_start_failed: IntCounter,
    stream_create_failed: IntCounter,
    stream_created: IntCounter,
    stream_started: IntCounter,
    stream_ended: IntCounter,
    max_sessions: IntGauge,
    current_sessions: IntGauge,
    discovery_errors: IntCounterVec,
    success_rate: Gauge,
    transcode_time: HistogramVec,
    transcode_latency: HistogramVec,
    transcode_overall_latency: HistogramVec,
    upload_time: Histogram,

    state: Mutex<MonitorState>,
}

impl Monitor {
    /// Build a monitor with every series registered under
    /// [`METRICS_NAMESPACE`], tagged with `node_id`/`node_type`, and a
    /// `versions` gauge carrying the build labels.
    #[must_use]
    pub fn new(node_id: &str, node_type: &str, version: &str) -> Self {
        let registry = Registry::new();
        let base_labels: HashMap<String, String> = HashMap::from([
            ("node_id".to_string(), node_id.to_string()),
            ("node_type".to_string(), node_type.to_string()),
        ]);

        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(METRICS_NAMESPACE)
                .const_labels(base_labels.clone())
        };
        let hist_opts = |name: &str, help: &str, buckets: Vec<f64>| {
            HistogramOpts::new(name, help)
                .namespace(METRICS_NAMESPACE)
                .const_labels(base_labels.clone())
                .buckets(buckets)
        };

        let segment_source_appeared = IntCounterVec::new(
            opts(
                "segment_source_appeared_total",
                "Source segments inserted into the source playlist",
            ),
            &["profile"],
        )
        .expect("failed to create segment_source_appeared_total");
        let segment_emerged = IntCounter::with_opts(opts(
            "segment_source_emerged_total",
            "Source segments with a known terminal outcome",
        ))
        .expect("failed to create segment_source_emerged_total");
        let segment_emerged_with_profiles = IntCounter::with_opts(opts(
            "segment_source_emerged_with_profiles_total",
            "Source segments with a known terminal outcome, weighted by profile count",
        ))
        .expect("failed to create segment_source_emerged_with_profiles_total");
        let segment_uploaded = IntCounter::with_opts(opts(
            "segment_source_uploaded_total",
            "Source segments uploaded to an orchestrator",
        ))
        .expect("failed to create segment_source_uploaded_total");
        let segment_upload_failed = IntCounterVec::new(
            opts(
                "segment_source_upload_failed_total",
                "Source segment upload failures",
            ),
            &["error_code"],
        )
        .expect("failed to create segment_source_upload_failed_total");
        let segment_transcoded = IntCounterVec::new(
            opts("segment_transcoded_total", "Segments transcoded"),
            &["profiles"],
        )
        .expect("failed to create segment_transcoded_total");
        let segment_transcode_failed = IntCounterVec::new(
            opts(
                "segment_transcode_failed_total",
                "Segment transcode failures",
            ),
            &["error_code"],
        )
        .expect("failed to create segment_transcode_failed_total");
        let segment_transcoded_appeared = IntCounterVec::new(
            opts(
                "segment_transcoded_appeared_total",
                "Transcoded renditions inserted into their playlists",
            ),
            &["profile"],
        )
        .expect("failed to create segment_transcoded_appeared_total");
        let segment_transcoded_all_appeared = IntCounterVec::new(
            opts(
                "segment_transcoded_all_appeared_total",
                "Segments whose every rendition appeared",
            ),
            &["profiles"],
        )
        .expect("failed to create segment_transcoded_all_appeared_total");
        let broadcast_client_start_failed = IntCounter::with_opts(opts(
            "broadcast_client_start_failed_total",
            "Broadcast client start failures",
        ))
        .expect("failed to create broadcast_client_start_failed_total");
        let stream_create_failed = IntCounter::with_opts(opts(
            "stream_create_failed_total",
            "Stream creation failures",
        ))
        .expect("failed to create stream_create_failed_total");
        let stream_created = IntCounter::with_opts(opts("stream_created_total", "Streams created"))
            .expect("failed to create stream_created_total");
        let stream_started = IntCounter::with_opts(opts("stream_started_total", "Streams started"))
            .expect("failed to create stream_started_total");
        let stream_ended = IntCounter::with_opts(opts("stream_ended_total", "Streams ended"))
            .expect("failed to create stream_ended_total");
        let max_sessions = IntGauge::with_opts(opts(
            "max_sessions_total",
            "Maximum concurrent transcode sessions",
        ))
        .expect("failed to create max_sessions_total");
        let current_sessions = IntGauge::with_opts(opts(
            "current_sessions_total",
            "Streams currently transcoding",
        ))
        .expect("failed to create current_sessions_total");
        let discovery_errors = IntCounterVec::new(
            opts("discovery_errors_total", "Orchestrator discovery errors"),
            &["error_code"],
        )
        .expect("failed to create discovery_errors_total");
        let success_rate = Gauge::with_opts(opts(
            "success_rate",
            "Transcoded segments divided by emerged segments, averaged over live streams",
        ))
        .expect("failed to create success_rate");
        let transcode_time = HistogramVec::new(
            hist_opts(
                "transcode_time_seconds",
                "Transcoding time",
                vec![
                    0.0, 0.250, 0.500, 0.750, 1.0, 1.250, 1.500, 2.0, 2.500, 3.0, 3.500, 4.0,
                    4.500, 5.0, 10.0,
                ],
            ),
            &["profiles"],
        )
        .expect("failed to create transcode_time_seconds");
        let latency_buckets = vec![
            0.0, 0.500, 0.750, 1.0, 1.500, 2.0, 2.500, 3.0, 3.500, 4.0, 4.500, 5.0, 10.0,
        ];
        let transcode_latency = HistogramVec::new(
            hist_opts(
                "transcode_latency_seconds",
                "Latency from source segment emerging until one rendition appeared",
                latency_buckets.clone(),
            ),
            &["profile"],
        )
        .expect("failed to create transcode_latency_seconds");
        let transcode_overall_latency = HistogramVec::new(
            hist_opts(
                "transcode_overall_latency_seconds",
                "Latency from source segment emerging until every rendition appeared",
                latency_buckets,
            ),
            &["profiles"],
        )
        .expect("failed to create transcode_overall_latency_seconds");
        let upload_time = Histogram::with_opts(hist_opts(
            "upload_time_seconds",
            "Upload-to-orchestrator time",
            vec![0.0, 0.05, 0.1, 0.15, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0],
        ))
        .expect("failed to create upload_time_seconds");

        let versions = IntGaugeVec::new(
            Opts::new("versions", "Version information")
                .namespace(METRICS_NAMESPACE)
                .const_labels(base_labels.clone()),
            &["version", "os", "arch"],
        )
        .expect("failed to create versions");
        versions
            .with_label_values(&[version, std::env::consts::OS, std::env::consts::ARCH])
            .set(1);

        macro_rules! register {
            ($($metric:expr),+ $(,)?) => {
                $(registry
                    .register(Box::new($metric.clone()))
                    .expect("failed to register metric");)+
            };
        }
        register!(
            segment_source_appeared,
            segment_emerged,
            segment_emerged_with_profiles,
            segment_uploaded,
            segment_upload_failed,
            segment_transcoded,
            segment_transcode_failed,
            segment_transcoded_appeared,
            segment_transcoded_all_appeared,
            broadcast_client_start_failed,
            stream_create_failed,
            stream_created,
            stream_started,
            stream_ended,
            max_sessions,
            current_sessions,
            discovery_errors,
            success_rate,
            transcode_time,
            transcode_latency,
            transcode_overall_latency,
            upload_time,
            versions,
        );

        Self {
            registry,
            segment_source_appeared,
            segment_emerged,
            segment_emerged_with_profiles,
            segment_uploaded,
            segment_upload_failed,
            segment_transcoded,
            segment_transcode_failed,
            segment_transcoded_appeared,
            segment_transcoded_all_appeared,
            broadcast_client_start_failed,
            stream_create_failed,
            stream_created,
            stream_started,
            stream_ended,
            max_sessions,
            current_sessions,
            discovery_errors,
            success_rate,
            transcode_time,
            transcode_latency,
            transcode_overall_latency,
            upload_time,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// The registry backing this monitor, for embedding into a scrape
    /// endpoint.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode the current series in Prometheus text format.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|_| prometheus::Error::Msg("invalid UTF-8".to_string()))
    }

    // ---- stream lifecycle ----

    pub fn stream_created(&self, nonce: u64) {
        self.stream_created.inc();
        self.state.lock().success.insert(nonce, SuccessAverager::new());
    }

    pub fn stream_started(&self, _nonce: u64) {
        self.stream_started.inc();
    }

    /// Tear down per-stream state.
    ///
    /// The emerge map is dropped immediately. The success window is dropped
    /// only if every slot is resolved; otherwise it is flagged and kept so
    /// the final rate stays scrapeable until the watchdog reaps it.
    pub fn stream_ended(&self, nonce: u64) {
        self.stream_ended.inc();
        let now = Instant::now();
        let mut state = self.state.lock();
        state.emerge_times.remove(&nonce);
        if let Some(avg) = state.success.get_mut(&nonce) {
            if avg.can_be_removed(now) {
                state.success.remove(&nonce);
            } else {
                avg.mark_removed(now);
            }
        }
        self.send_success(&state, now);
    }

    pub fn stream_create_failed(&self, nonce: u64, reason: &str) {
        warn!(nonce, reason, "stream create failed");
        self.stream_create_failed.inc();
    }

    pub fn broadcast_client_failed(&self) {
        self.broadcast_client_start_failed.inc();
    }

    // ---- node-level gauges ----

    pub fn max_sessions(&self, sessions: usize) {
        self.max_sessions.set(sessions as i64);
    }

    pub fn current_sessions(&self, sessions: usize) {
        self.current_sessions.set(sessions as i64);
    }

    /// Record a discovery error, normalising verbose transport messages to
    /// stable label tokens.
    pub fn discovery_error(&self, code: &str) {
        error!(code, "discovery error");
        let code = if code.contains("OrchestratorCapped") {
            "OrchestratorCapped"
        } else if code.contains("Canceled") {
            "Canceled"
        } else {
            code
        };
        self.discovery_errors.with_label_values(&[code]).inc();
    }

    // ---- segment lifecycle ----

    /// A source segment came out of the segmenter. Only the timestamp is
    /// recorded; the emerged counter is deferred until the outcome is known.
    pub fn segment_emerged(&self, nonce: u64, seq_no: u64, profiles: usize) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(avg) = state.success.get_mut(&nonce) {
            avg.add_emerged(seq_no, now);
        }
        state.emerge_times.entry(nonce).or_default().insert(
            seq_no,
            EmergeEntry {
                at: now,
                profiles: profiles as u64,
            },
        );
    }

    pub fn segment_source_appeared(&self, profile: &str) {
        self.segment_source_appeared
            .with_label_values(&[profile])
            .inc();
    }

    pub fn segment_uploaded(&self, upload_time: Duration) {
        self.segment_uploaded.inc();
        self.upload_time.observe(upload_time.as_secs_f64());
    }

    pub fn segment_upload_failed(&self, nonce: u64, seq_no: u64, code: SegmentUploadError) {
        self.segment_upload_failed
            .with_label_values(&[code.as_str()])
            .inc();
        let now = Instant::now();
        let mut state = self.state.lock();
        self.close_emerged(&mut state, nonce, seq_no);
        if let Some(avg) = state.success.get_mut(&nonce) {
            avg.add_transcoded(seq_no, true, now);
        }
        self.send_success(&state, now);
    }

    pub fn segment_transcoded(&self, transcode_time: Duration, profiles: &str) {
        self.segment_transcoded.with_label_values(&[profiles]).inc();
        self.transcode_time
            .with_label_values(&[profiles])
            .observe(transcode_time.as_secs_f64());
    }

    pub fn segment_transcode_failed(&self, nonce: u64, seq_no: u64, code: SegmentTranscodeError) {
        self.segment_transcode_failed
            .with_label_values(&[code.as_str()])
            .inc();
        let now = Instant::now();
        let mut state = self.state.lock();
        self.close_emerged(&mut state, nonce, seq_no);
        if let Some(avg) = state.success.get_mut(&nonce) {
            // A storage session expiring says nothing about the orchestrator,
            // so it must not lower the stream's rate.
            avg.add_transcoded(seq_no, code != SegmentTranscodeError::SessionEnded, now);
        }
        self.send_success(&state, now);
    }

    /// Every rendition of the segment has been processed.
    pub fn segment_fully_transcoded(
        &self,
        nonce: u64,
        seq_no: u64,
        profiles: &str,
        all_success: bool,
        err_code: Option<SegmentTranscodeError>,
    ) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let entry = state
            .emerge_times
            .get(&nonce)
            .and_then(|per_stream| per_stream.get(&seq_no))
            .copied();
        if let Some(entry) = entry {
            if all_success {
                self.transcode_overall_latency
                    .with_label_values(&[profiles])
                    .observe(now.duration_since(entry.at).as_secs_f64());
            }
            self.close_emerged(&mut state, nonce, seq_no);
        }
        if all_success {
            self.segment_transcoded_all_appeared
                .with_label_values(&[profiles])
                .inc();
        }
        let failed = !all_success && err_code != Some(SegmentTranscodeError::SessionEnded);
        if let Some(avg) = state.success.get_mut(&nonce) {
            avg.add_transcoded(seq_no, failed, now);
        }
        self.send_success(&state, now);
    }

    /// One transcoded rendition was inserted into its playlist. Does not
    /// close the emerge entry; the segment may still be waiting on siblings.
    pub fn segment_transcoded_appeared(&self, nonce: u64, seq_no: u64, profile: &str) {
        let now = Instant::now();
        let state = self.state.lock();
        if let Some(entry) = state
            .emerge_times
            .get(&nonce)
            .and_then(|per_stream| per_stream.get(&seq_no))
        {
            self.transcode_latency
                .with_label_values(&[profile])
                .observe(now.duration_since(entry.at).as_secs_f64());
        }
        self.segment_transcoded_appeared
            .with_label_values(&[profile])
            .inc();
    }

    // ---- watchdog ----

    /// Age out unresolved segments, refresh the aggregate success gauge and
    /// reap ended-stream averagers past their retention window.
    pub fn sweep(&self, now: Instant) {
        let mut state = self.state.lock();
        for (nonce, per_stream) in &mut state.emerge_times {
            per_stream.retain(|seq_no, entry| {
                let age = now.duration_since(entry.at);
                if age <= TIME_TO_WAIT_FOR_ERROR {
                    return true;
                }
                // Closing the books late: the segment emerged but nothing
                // ever came back for it.
                self.segment_emerged.inc();
                self.segment_emerged_with_profiles.inc_by(entry.profiles);
                self.segment_transcode_failed
                    .with_label_values(&[SegmentTranscodeError::LostSegment.as_str()])
                    .inc();
                error!(nonce = *nonce, seq_no = *seq_no, ?age, "lost segment");
                false
            });
        }
        self.send_success(&state, now);
        state.success.retain(|_, avg| !avg.reapable(now));
    }

    /// Spawn the process-wide watchdog task. Call once.
    pub fn spawn_watchdog(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(WATCHDOG_PAUSE).await;
                monitor.sweep(Instant::now());
            }
        })
    }

    // ---- internals ----

    fn close_emerged(&self, state: &mut MonitorState, nonce: u64, seq_no: u64) {
        if let Some(per_stream) = state.emerge_times.get_mut(&nonce) {
            if let Some(entry) = per_stream.remove(&seq_no) {
                self.segment_emerged.inc();
                self.segment_emerged_with_profiles.inc_by(entry.profiles);
            }
        }
    }

    fn send_success(&self, state: &MonitorState, now: Instant) {
        self.success_rate.set(Self::aggregate_success(state, now));
    }

    fn aggregate_success(state: &MonitorState, now: Instant) -> f64 {
        let mut streams = 0u32;
        let mut total = 0f64;
        for avg in state.success.values() {
            let (rate, has) = avg.success_rate(now);
            if has {
                streams += 1;
                total += rate;
            }
        }
        if streams > 0 {
            total / f64::from(streams)
        } else {
            1.0
        }
    }

    #[cfg(test)]
    fn tracked_averagers(&self) -> usize {
        self.state.lock().success.len()
    }
}
