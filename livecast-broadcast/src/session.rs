// Per-stream orchestrator session pool.
//
// Sessions are handed out LIFO so the most recently used connection (and its
// warm state) is preferred. A selection that observes the pool below half of
// its target size kicks off an asynchronous refresh; the discovery call runs
// without the pool lock held so concurrent dispatches keep flowing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use livecast_monitor::Monitor;

use crate::discovery::{OrchestratorInfo, OrchestratorPool};
use crate::error::DiscoveryError;
use crate::media::Profile;
use crate::playlist::PlaylistManager;
use crate::storage::{ObjectStore, StorageDriver};
use crate::submit::PaymentSender;

/// Handle to one orchestrator for the duration of a stream.
pub struct BroadcastSession {
    pub orchestrator: OrchestratorInfo,
    pub manifest_id: String,
    pub profiles: Vec<Profile>,
    /// The broadcaster-side store renditions are downloaded into. For
    /// external storage this is a per-orchestrator session so orchestrators
    /// cannot front-run each other's uploads.
    pub broadcaster_store: Arc<dyn ObjectStore>,
    /// Store the orchestrator wants source segments uploaded into.
    pub orchestrator_store: Option<Arc<dyn ObjectStore>>,
    pub payment_session_id: Option<String>,
}

impl BroadcastSession {
    /// Transport address; unique key within the pool.
    #[must_use]
    pub fn transcoder(&self) -> &str {
        &self.orchestrator.transcoder
    }
}

impl std::fmt::Debug for BroadcastSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastSession")
            .field("transcoder", &self.transcoder())
            .field("manifest_id", &self.manifest_id)
            .field("payment_session_id", &self.payment_session_id)
            .finish()
    }
}

/// Creates fresh sessions for a stream; implemented over discovery below and
/// by fakes in tests.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_sessions(&self, count: usize)
        -> Result<Vec<BroadcastSession>, DiscoveryError>;
}

/// Builds sessions from the discovery pool: wires up per-orchestrator
/// storage, starts payment sessions where ticket parameters are advertised.
pub struct OrchestratorSessionFactory {
    pool: Arc<dyn OrchestratorPool>,
    playlist: Arc<dyn PlaylistManager>,
    node_storage: Arc<dyn StorageDriver>,
    payment: Option<Arc<dyn PaymentSender>>,
    profiles: Vec<Profile>,
}

impl OrchestratorSessionFactory {
    #[must_use]
    pub fn new(
        pool: Arc<dyn OrchestratorPool>,
        playlist: Arc<dyn PlaylistManager>,
        node_storage: Arc<dyn StorageDriver>,
        payment: Option<Arc<dyn PaymentSender>>,
        profiles: Vec<Profile>,
    ) -> Self {
        Self {
            pool,
            playlist,
            node_storage,
            payment,
            profiles,
        }
    }
}

#[async_trait]
impl SessionFactory for OrchestratorSessionFactory {
    async fn create_sessions(
        &self,
        count: usize,
    ) -> Result<Vec<BroadcastSession>, DiscoveryError> {
        let infos = self.pool.get_orchestrators(count).await?;
        if infos.is_empty() {
            return Err(DiscoveryError::NoOrchestrators);
        }
        let manifest_id = self.playlist.manifest_id();
        let mut sessions = Vec::with_capacity(infos.len());
        for info in infos {
            let payment_session_id = match (&self.payment, &info.ticket_params) {
                (Some(sender), Some(params)) => Some(sender.start_session(params)),
                _ => None,
            };
            let orchestrator_store = info.storage.clone();
            let mut broadcaster_store = self.playlist.storage();
            if broadcaster_store.is_external() {
                let prefix = format!("{manifest_id}/{}", random_session_id());
                broadcaster_store = self.node_storage.new_session(&prefix);
            }
            sessions.push(BroadcastSession {
                orchestrator: info,
                manifest_id: manifest_id.clone(),
                profiles: self.profiles.clone(),
                broadcaster_store,
                orchestrator_store,
                payment_session_id,
            });
        }
        Ok(sessions)
    }
}

fn random_session_id() -> String {
    let id: u128 = rand::thread_rng().gen();
    format!("{id:032x}")
}

struct PoolState {
    // Available sessions; selection pops from the back.
    sess_list: Vec<Arc<BroadcastSession>>,
    // Membership by transport address. An address present here but absent
    // from sess_list is in flight and returns on complete.
    sess_map: HashMap<String, Arc<BroadcastSession>>,
    refreshing: bool,
    finished: bool,
}

/// Dynamic pool of [`BroadcastSession`]s for one stream.
pub struct SessionManager {
    num_orchs: usize,
    factory: Arc<dyn SessionFactory>,
    monitor: Arc<Monitor>,
    inner: Mutex<PoolState>,
}

impl SessionManager {
    /// Build the manager and run the initial refresh. `num_orchs` is the
    /// target pool size, see [`crate::BroadcastConfig::target_pool_size`].
    pub async fn new(
        factory: Arc<dyn SessionFactory>,
        monitor: Arc<Monitor>,
        num_orchs: usize,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            num_orchs,
            factory,
            monitor,
            inner: Mutex::new(PoolState {
                sess_list: Vec::new(),
                sess_map: HashMap::new(),
                refreshing: false,
                finished: false,
            }),
        });
        manager.refresh_sessions().await;
        manager
    }

    /// Pop the most recently returned session, or `None` when the pool is
    /// drained. Schedules a background refresh whenever the pool is below
    /// half its target.
    pub fn select(self: &Arc<Self>) -> Option<Arc<BroadcastSession>> {
        let mut state = self.inner.lock();
        if state.sess_list.len() < self.num_orchs.div_ceil(2) {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.refresh_sessions().await;
            });
        }
        state.sess_list.pop()
    }

    /// Return a session to the pool after a successful dispatch. Dropped
    /// silently if the session was removed while in flight, so a failed
    /// orchestrator cannot be resurrected by a racing success.
    pub fn complete(&self, session: Arc<BroadcastSession>) {
        let mut state = self.inner.lock();
        if state.sess_map.contains_key(session.transcoder()) {
            state.sess_list.push(session);
        }
    }

    /// Evict a session by transport address. Any copy still in `sess_list`
    /// is filtered out when its dispatch tries to complete.
    pub fn remove(&self, session: &BroadcastSession) {
        debug!(transcoder = session.transcoder(), "removing session");
        self.inner.lock().sess_map.remove(session.transcoder());
    }

    /// Fetch fresh sessions and prepend the previously unknown ones.
    ///
    /// At most one refresh runs per stream; the factory call happens without
    /// the pool lock held. A factory error or empty result leaves the pool
    /// untouched.
    pub async fn refresh_sessions(&self) {
        {
            let mut state = self.inner.lock();
            if state.finished || state.refreshing {
                return;
            }
            state.refreshing = true;
        }

        let created = self.factory.create_sessions(self.num_orchs).await;

        let mut state = self.inner.lock();
        state.refreshing = false;
        if state.finished {
            return;
        }
        let sessions = match created {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(%err, "session refresh failed");
                self.monitor.discovery_error(&err.to_string());
                return;
            }
        };
        if sessions.is_empty() {
            return;
        }

        let mut fresh: Vec<Arc<BroadcastSession>> = Vec::with_capacity(sessions.len());
        for session in sessions {
            if state.sess_map.contains_key(session.transcoder()) {
                continue;
            }
            let session = Arc::new(session);
            state
                .sess_map
                .insert(session.transcoder().to_string(), Arc::clone(&session));
            fresh.push(session);
        }
        // Prepend: LIFO selection keeps draining the older sessions first,
        // which are the ones with warm connections.
        fresh.append(&mut state.sess_list);
        state.sess_list = fresh;
    }

    /// Tear the pool down at stream end. Subsequent refreshes are no-ops and
    /// late lookups see a defined empty pool.
    pub fn cleanup(&self) {
        let mut state = self.inner.lock();
        state.finished = true;
        state.sess_list.clear();
        state.sess_map = HashMap::new();
    }

    /// Number of sessions currently available for selection.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.lock().sess_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::TicketParams;
    use crate::error::PlaylistError;
    use crate::storage::{MemoryDriver, MemoryStore};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_session(addr: &str) -> BroadcastSession {
        BroadcastSession {
            orchestrator: OrchestratorInfo::new(addr),
            manifest_id: "manifest".to_string(),
            profiles: Vec::new(),
            broadcaster_store: Arc::new(MemoryStore::new("bcast")),
            orchestrator_store: None,
            payment_session_id: None,
        }
    }

    fn test_monitor() -> Arc<Monitor> {
        Arc::new(Monitor::new("node-test", "broadcaster", "0.0.0-test"))
    }

    struct StubFactory {
        batches: Mutex<VecDeque<Result<Vec<BroadcastSession>, DiscoveryError>>>,
        calls: AtomicUsize,
        gate: Option<Arc<tokio::sync::Semaphore>>,
    }

    impl StubFactory {
        fn new(batches: Vec<Result<Vec<BroadcastSession>, DiscoveryError>>) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches.into()),
                calls: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn gated(
            batches: Vec<Result<Vec<BroadcastSession>, DiscoveryError>>,
            gate: Arc<tokio::sync::Semaphore>,
        ) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches.into()),
                calls: AtomicUsize::new(0),
                gate: Some(gate),
            })
        }
    }

    #[async_trait]
    impl SessionFactory for StubFactory {
        async fn create_sessions(
            &self,
            _count: usize,
        ) -> Result<Vec<BroadcastSession>, DiscoveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.unwrap();
            }
            self.batches
                .lock()
                .pop_front()
                .unwrap_or(Ok(Vec::new()))
        }
    }

    #[tokio::test]
    async fn test_initial_refresh_fills_pool_lifo() {
        let factory = StubFactory::new(vec![Ok(vec![
            test_session("orch-a"),
            test_session("orch-b"),
            test_session("orch-c"),
        ])]);
        let manager = SessionManager::new(factory, test_monitor(), 3).await;
        assert_eq!(manager.available(), 3);
        assert_eq!(manager.select().unwrap().transcoder(), "orch-c");
        assert_eq!(manager.select().unwrap().transcoder(), "orch-b");
    }

    #[tokio::test]
    async fn test_select_on_empty_pool_returns_none() {
        let factory = StubFactory::new(vec![Ok(Vec::new())]);
        let manager = SessionManager::new(factory, test_monitor(), 2).await;
        assert!(manager.select().is_none());
    }

    #[tokio::test]
    async fn test_complete_returns_session_only_while_mapped() {
        let factory = StubFactory::new(vec![Ok(vec![
            test_session("orch-a"),
            test_session("orch-b"),
        ])]);
        let manager = SessionManager::new(factory, test_monitor(), 2).await;

        let sess = manager.select().unwrap();
        assert_eq!(sess.transcoder(), "orch-b");
        manager.complete(Arc::clone(&sess));
        assert_eq!(manager.available(), 2);

        let sess = manager.select().unwrap();
        manager.remove(&sess);
        manager.complete(sess);
        // Removed while in flight: must not be resurrected.
        assert_eq!(manager.available(), 1);
        assert_eq!(manager.select().unwrap().transcoder(), "orch-a");
    }

    #[tokio::test]
    async fn test_refresh_dedups_and_prepends() {
        let factory = StubFactory::new(vec![
            Ok(vec![test_session("orch-a"), test_session("orch-b")]),
            Ok(vec![test_session("orch-a"), test_session("orch-c")]),
        ]);
        let manager = SessionManager::new(factory, test_monitor(), 4).await;
        manager.refresh_sessions().await;

        // orch-a is already pooled; orch-c lands at the front so the older
        // sessions keep being drained first.
        assert_eq!(manager.available(), 3);
        assert_eq!(manager.select().unwrap().transcoder(), "orch-b");
        assert_eq!(manager.select().unwrap().transcoder(), "orch-a");
        assert_eq!(manager.select().unwrap().transcoder(), "orch-c");
    }

    #[tokio::test]
    async fn test_empty_refresh_leaves_pool_and_allows_retry() {
        let factory = StubFactory::new(vec![
            Ok(vec![test_session("orch-a")]),
            Ok(Vec::new()),
            Ok(vec![test_session("orch-b")]),
        ]);
        let manager = SessionManager::new(factory.clone(), test_monitor(), 1).await;

        manager.refresh_sessions().await;
        assert_eq!(manager.available(), 1);

        // The refreshing flag was cleared, so a later refresh still works.
        manager.refresh_sessions().await;
        assert_eq!(manager.available(), 2);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_factory_error_records_discovery_metric() {
        let monitor = test_monitor();
        let factory = StubFactory::new(vec![Err(DiscoveryError::Backend(
            "OrchestratorCapped: at capacity".to_string(),
        ))]);
        let manager = SessionManager::new(factory, Arc::clone(&monitor), 1).await;
        assert_eq!(manager.available(), 0);
        let text = monitor.gather().unwrap();
        assert!(text.contains("error_code=\"OrchestratorCapped\""));
    }

    #[tokio::test]
    async fn test_cleanup_stops_refreshes() {
        let factory = StubFactory::new(vec![
            Ok(vec![test_session("orch-a")]),
            Ok(vec![test_session("orch-b")]),
        ]);
        let manager = SessionManager::new(factory.clone(), test_monitor(), 1).await;
        manager.cleanup();
        assert_eq!(manager.available(), 0);

        manager.refresh_sessions().await;
        assert_eq!(manager.available(), 0);
        // The second batch was never requested.
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_select_below_half_target_triggers_refresh() {
        let factory = StubFactory::new(vec![
            Ok(vec![test_session("orch-a")]),
            Ok(vec![test_session("orch-b"), test_session("orch-c")]),
        ]);
        let manager = SessionManager::new(factory.clone(), test_monitor(), 4).await;

        // One session against a target of four: selection sees the shortage
        // and schedules a refresh.
        let sess = manager.select().unwrap();
        assert_eq!(sess.transcoder(), "orch-a");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while factory.calls.load(Ordering::SeqCst) < 2 {
            assert!(tokio::time::Instant::now() < deadline, "refresh never ran");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        while manager.available() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "pool never refilled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.available(), 2);
    }

    struct StubPool {
        infos: Vec<OrchestratorInfo>,
    }

    #[async_trait]
    impl OrchestratorPool for StubPool {
        async fn get_orchestrators(
            &self,
            _count: usize,
        ) -> Result<Vec<OrchestratorInfo>, DiscoveryError> {
            Ok(self.infos.clone())
        }

        fn size(&self) -> usize {
            self.infos.len()
        }
    }

    struct StubPlaylist {
        storage: Arc<dyn ObjectStore>,
    }

    #[async_trait]
    impl crate::playlist::PlaylistManager for StubPlaylist {
        fn manifest_id(&self) -> String {
            "manifest".to_string()
        }

        fn storage(&self) -> Arc<dyn ObjectStore> {
            Arc::clone(&self.storage)
        }

        async fn insert_segment(
            &self,
            _profile: &Profile,
            _seq_no: u64,
            _uri: &str,
            _duration_secs: f64,
        ) -> Result<(), PlaylistError> {
            Ok(())
        }
    }

    struct StubPayment;

    impl PaymentSender for StubPayment {
        fn start_session(&self, _params: &TicketParams) -> String {
            "pm-session-1".to_string()
        }
    }

    #[tokio::test]
    async fn test_factory_wires_payment_and_per_orchestrator_storage() {
        let mut ticketed = OrchestratorInfo::new("orch-a");
        ticketed.ticket_params = Some(TicketParams {
            recipient: vec![0xaa; 20],
            ..TicketParams::default()
        });
        let mut with_storage = OrchestratorInfo::new("orch-b");
        with_storage.storage = Some(Arc::new(MemoryStore::new("orch-b-in")));

        let external = MemoryDriver::external();
        let playlist = Arc::new(StubPlaylist {
            storage: external.new_session("playlist"),
        });
        let factory = OrchestratorSessionFactory::new(
            Arc::new(StubPool {
                infos: vec![ticketed, with_storage],
            }),
            playlist,
            Arc::new(MemoryDriver::external()),
            Some(Arc::new(StubPayment)),
            vec![Profile::new("P240p30fps", 600_000, 30, "426x240")],
        );

        let sessions = factory.create_sessions(2).await.unwrap();
        assert_eq!(sessions.len(), 2);

        assert_eq!(
            sessions[0].payment_session_id.as_deref(),
            Some("pm-session-1")
        );
        assert!(sessions[1].payment_session_id.is_none());

        assert!(sessions[0].orchestrator_store.is_none());
        assert!(sessions[1].orchestrator_store.is_some());

        // With external storage every orchestrator gets its own session, so
        // a blob saved through one is not owned by the other.
        let uri = sessions[0]
            .broadcaster_store
            .save("0.ts", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(sessions[0].broadcaster_store.is_own(&uri));
        assert!(!sessions[1].broadcaster_store.is_own(&uri));
    }

    #[tokio::test]
    async fn test_factory_with_empty_pool_errors() {
        let factory = OrchestratorSessionFactory::new(
            Arc::new(StubPool { infos: Vec::new() }),
            Arc::new(StubPlaylist {
                storage: Arc::new(MemoryStore::new("playlist")),
            }),
            Arc::new(MemoryDriver::new()),
            None,
            Vec::new(),
        );
        assert!(matches!(
            factory.create_sessions(4).await,
            Err(DiscoveryError::NoOrchestrators)
        ));
    }

    #[tokio::test]
    async fn test_at_most_one_refresh_in_flight() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let factory = StubFactory::gated(
            vec![Ok(vec![test_session("orch-a")])],
            Arc::clone(&gate),
        );
        let manager = Arc::new(SessionManager {
            num_orchs: 2,
            factory: factory.clone() as Arc<dyn SessionFactory>,
            monitor: test_monitor(),
            inner: Mutex::new(PoolState {
                sess_list: Vec::new(),
                sess_map: HashMap::new(),
                refreshing: false,
                finished: false,
            }),
        });

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.refresh_sessions().await })
        };
        // Give the first refresh time to claim the flag and park in the
        // factory, then try again: the second call must bail out at once.
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.refresh_sessions().await;
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);

        gate.add_permits(1);
        first.await.unwrap();
        assert_eq!(manager.available(), 1);
    }
}
