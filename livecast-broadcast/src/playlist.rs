// Playlist seam.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PlaylistError;
use crate::media::Profile;
use crate::storage::ObjectStore;

/// Per-stream playlist set: one source playlist plus one per rendition
/// profile, all sharing the broadcaster's storage session.
#[async_trait]
pub trait PlaylistManager: Send + Sync {
    fn manifest_id(&self) -> String;

    /// The broadcaster-side storage session backing this stream.
    fn storage(&self) -> Arc<dyn ObjectStore>;

    async fn insert_segment(
        &self,
        profile: &Profile,
        seq_no: u64,
        uri: &str,
        duration_secs: f64,
    ) -> Result<(), PlaylistError>;
}
