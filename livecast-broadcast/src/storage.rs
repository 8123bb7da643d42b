// Object storage seams.
//
// A stream works against named-blob "sessions": the broadcaster's own store
// and, optionally, a store the orchestrator asked to be fed through. Real
// drivers (S3 and friends) live outside this crate; the in-memory backend
// here backs local mode and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::error::StorageError;

/// One storage session: save blobs by name, fetch them back by URI.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `name`, returning the URI it is reachable at.
    async fn save(&self, name: &str, data: Bytes) -> Result<String, StorageError>;

    /// Fetch the bytes behind `uri`.
    async fn fetch(&self, uri: &str) -> Result<Bytes, StorageError>;

    /// True when saved blobs are reachable from outside the broadcaster,
    /// so their URIs can be handed to playlists and orchestrators directly.
    fn is_external(&self) -> bool;

    /// True when `uri` points into this session.
    fn is_own(&self, uri: &str) -> bool;
}

/// Creates storage sessions scoped under a key prefix.
pub trait StorageDriver: Send + Sync {
    fn new_session(&self, prefix: &str) -> Arc<dyn ObjectStore>;
}

/// In-memory storage backend. Sessions created from one driver share the
/// same object map, so a blob saved through one session is fetchable through
/// any other, the way sessions of one remote bucket behave.
pub struct MemoryDriver {
    objects: Arc<DashMap<String, Bytes>>,
    external: bool,
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Arc::new(DashMap::new()),
            external: false,
        }
    }

    /// A driver whose sessions report themselves as externally reachable.
    #[must_use]
    pub fn external() -> Self {
        Self {
            objects: Arc::new(DashMap::new()),
            external: true,
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageDriver for MemoryDriver {
    fn new_session(&self, prefix: &str) -> Arc<dyn ObjectStore> {
        Arc::new(MemoryStore {
            prefix: prefix.to_string(),
            external: self.external,
            ended: AtomicBool::new(false),
            objects: Arc::clone(&self.objects),
        })
    }
}

/// One in-memory storage session.
pub struct MemoryStore {
    prefix: String,
    external: bool,
    ended: AtomicBool,
    objects: Arc<DashMap<String, Bytes>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            external: false,
            ended: AtomicBool::new(false),
            objects: Arc::new(DashMap::new()),
        }
    }

    /// Expire the session: subsequent calls fail with `Session ended`.
    pub fn end_session(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    fn check_ended(&self) -> Result<(), StorageError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(StorageError::SessionEnded);
        }
        Ok(())
    }

    fn key_for(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn save(&self, name: &str, data: Bytes) -> Result<String, StorageError> {
        self.check_ended()?;
        let key = self.key_for(name);
        self.objects.insert(key.clone(), data);
        Ok(format!("mem://{key}"))
    }

    async fn fetch(&self, uri: &str) -> Result<Bytes, StorageError> {
        self.check_ended()?;
        let key = uri
            .strip_prefix("mem://")
            .ok_or_else(|| StorageError::NotFound(uri.to_string()))?;
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound(uri.to_string()))
    }

    fn is_external(&self) -> bool {
        self.external
    }

    fn is_own(&self, uri: &str) -> bool {
        uri.strip_prefix("mem://")
            .is_some_and(|key| key.starts_with(&format!("{}/", self.prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_fetch_round_trip() {
        let store = MemoryStore::new("stream-1");
        let uri = store
            .save("source/0.ts", Bytes::from_static(b"segment"))
            .await
            .unwrap();
        assert_eq!(uri, "mem://stream-1/source/0.ts");
        assert!(store.is_own(&uri));
        assert_eq!(
            store.fetch(&uri).await.unwrap(),
            Bytes::from_static(b"segment")
        );
    }

    #[tokio::test]
    async fn test_fetch_unknown_uri() {
        let store = MemoryStore::new("stream-1");
        assert!(matches!(
            store.fetch("mem://stream-1/missing.ts").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ended_session_refuses_io() {
        let store = MemoryStore::new("stream-1");
        store.end_session();
        let err = store
            .save("source/0.ts", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Session ended");
    }

    #[tokio::test]
    async fn test_driver_sessions_share_objects() {
        let driver = MemoryDriver::new();
        let writer = driver.new_session("a");
        let reader = driver.new_session("b");
        let uri = writer
            .save("0.ts", Bytes::from_static(b"shared"))
            .await
            .unwrap();
        assert!(!reader.is_own(&uri));
        assert_eq!(
            reader.fetch(&uri).await.unwrap(),
            Bytes::from_static(b"shared")
        );
    }

    #[test]
    fn test_external_flag() {
        let driver = MemoryDriver::external();
        assert!(driver.new_session("a").is_external());
        assert!(!MemoryStore::new("a").is_external());
    }
}
