//! Two-stage resolution: game id → music-track id → playable source URI.
//!
//! Stage one reads the persistent identifier store.  Stage two consults the
//! in-process `SourceCache` and only falls back to the backend on a miss.
//! Every failure is logged here and reported to the caller as `None`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use theme_proto::store::IdentifierStore;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::backend::MusicBackend;

/// A playable source for one game.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub track_id: String,
    pub source: String,
    /// Volume preference from the game's entry, 0.0–1.0.
    pub volume: Option<f32>,
}

#[derive(Default)]
struct CacheInner {
    /// Bumped by `clear()`.  Lookups that began under an older epoch may not
    /// insert.
    epoch: u64,
    sources: HashMap<String, String>,
}

/// Ephemeral map of track id → source URI.  Never keyed by game id.
#[derive(Default)]
pub struct SourceCache {
    inner: RwLock<CacheInner>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, track_id: &str) -> Option<String> {
        self.inner.read().await.sources.get(track_id).cloned()
    }

    pub async fn epoch(&self) -> u64 {
        self.inner.read().await.epoch
    }

    /// Insert unless the cache was cleared since `epoch` was read.
    pub async fn insert_if_current(&self, epoch: u64, track_id: &str, source: &str) -> bool {
        let mut inner = self.inner.write().await;
        if inner.epoch != epoch {
            return false;
        }
        inner
            .sources
            .insert(track_id.to_string(), source.to_string());
        true
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.epoch += 1;
        inner.sources.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sources.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub struct SourceResolver {
    store: Arc<dyn IdentifierStore>,
    backend: Arc<dyn MusicBackend>,
    cache: SourceCache,
    resolve_timeout: Duration,
}

impl SourceResolver {
    pub fn new(
        store: Arc<dyn IdentifierStore>,
        backend: Arc<dyn MusicBackend>,
        resolve_timeout: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            cache: SourceCache::new(),
            resolve_timeout,
        }
    }

    pub fn cache(&self) -> &SourceCache {
        &self.cache
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
        debug!("resolver: source cache cleared");
    }

    /// Full lookup for `game_id`.  `playing` is the game whose audio is live
    /// when the request was issued; asking for it again yields `None` without
    /// touching either stage.
    pub async fn resolve(&self, game_id: &str, playing: Option<&str>) -> Option<Resolution> {
        let (track_id, volume) = self.lookup_track(game_id, playing).await?;
        let source = self.resolve_source(&track_id).await?;
        Some(Resolution {
            track_id,
            source,
            volume,
        })
    }

    /// Stage one: game id → track id (+ volume preference).
    pub async fn lookup_track(
        &self,
        game_id: &str,
        playing: Option<&str>,
    ) -> Option<(String, Option<f32>)> {
        if playing == Some(game_id) {
            return None;
        }
        match self.store.get(game_id).await {
            Ok(Some(entry)) => match entry.track_id() {
                Some(track_id) => Some((track_id.to_string(), entry.volume)),
                None => {
                    info!("resolver: no track id stored for game {}", game_id);
                    None
                }
            },
            Ok(None) => {
                info!("resolver: no entry for game {}", game_id);
                None
            }
            Err(e) => {
                warn!("resolver: store read failed for game {}: {}", game_id, e);
                None
            }
        }
    }

    /// Stage two: track id → source URI, cache first.
    pub async fn resolve_source(&self, track_id: &str) -> Option<String> {
        if let Some(source) = self.cache.get(track_id).await {
            debug!("resolver: cache hit for track {}", track_id);
            return Some(source);
        }

        let epoch = self.cache.epoch().await;
        let call = self.backend.resolve_music_path(track_id);
        let source = match tokio::time::timeout(self.resolve_timeout, call).await {
            Ok(Ok(Some(source))) if !source.is_empty() => source,
            Ok(Ok(_)) => {
                info!("resolver: backend has no music for track {}", track_id);
                return None;
            }
            Ok(Err(e)) => {
                warn!("resolver: backend error for track {}: {}", track_id, e);
                return None;
            }
            Err(_) => {
                warn!(
                    "resolver: backend timed out after {:?} for track {}",
                    self.resolve_timeout, track_id
                );
                return None;
            }
        };

        if !self.cache.insert_if_current(epoch, track_id, &source).await {
            debug!("resolver: cache cleared during lookup of {}, not caching", track_id);
        }
        Some(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, ThemeError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use theme_proto::store::{IdentifierCacheEntry, MemoryStore, StoreError};

    struct CountingBackend {
        calls: AtomicUsize,
        answer: Option<String>,
        fail: bool,
        delay: Duration,
    }

    impl CountingBackend {
        fn answering(path: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                answer: Some(path.to_string()),
                fail: false,
                delay: Duration::ZERO,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                answer: None,
                fail: true,
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MusicBackend for CountingBackend {
        async fn resolve_music_path(&self, _video_id: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(ThemeError::backend("conversion failed"));
            }
            Ok(self.answer.clone())
        }

        async fn converted_files_exist(&self) -> Result<bool> {
            Ok(false)
        }

        async fn change_convert_quality(&self, _quality: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_converted_files(&self) -> Result<()> {
            Ok(())
        }

        async fn install_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl IdentifierStore for BrokenStore {
        async fn get(
            &self,
            _game_id: &str,
        ) -> std::result::Result<Option<IdentifierCacheEntry>, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk gone")))
        }

        async fn set(
            &self,
            _game_id: &str,
            _entry: IdentifierCacheEntry,
        ) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    async fn store_with(entries: &[(&str, &str)]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (game, track) in entries {
            store
                .set(game, IdentifierCacheEntry::new(track))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_second_resolution_served_from_cache() {
        let backend = Arc::new(CountingBackend::answering("/audio/a.ogg"));
        let resolver = SourceResolver::new(
            store_with(&[("A", "v1")]).await,
            backend.clone(),
            Duration::from_secs(1),
        );

        let first = resolver.resolve("A", None).await.unwrap();
        let second = resolver.resolve("A", None).await.unwrap();
        assert_eq!(first.source, "/audio/a.ogg");
        assert_eq!(first, second);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_games_sharing_a_track_share_the_entry() {
        let backend = Arc::new(CountingBackend::answering("/audio/shared.ogg"));
        let resolver = SourceResolver::new(
            store_with(&[("A", "v1"), ("B", "v1")]).await,
            backend.clone(),
            Duration::from_secs(1),
        );

        resolver.resolve("A", None).await.unwrap();
        let b = resolver.resolve("B", None).await.unwrap();
        assert_eq!(b.track_id, "v1");
        assert_eq!(backend.calls(), 1);
        assert_eq!(resolver.cache().len().await, 1);
        assert!(resolver.cache().get("A").await.is_none());
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let backend = Arc::new(CountingBackend::failing());
        let resolver = SourceResolver::new(
            store_with(&[("C", "v3")]).await,
            backend.clone(),
            Duration::from_secs(1),
        );

        assert!(resolver.resolve("C", None).await.is_none());
        assert!(resolver.resolve("C", None).await.is_none());
        assert_eq!(backend.calls(), 2);
        assert!(resolver.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_entry_skips_backend() {
        let backend = Arc::new(CountingBackend::answering("/audio/a.ogg"));
        let resolver = SourceResolver::new(
            store_with(&[]).await,
            backend.clone(),
            Duration::from_secs(1),
        );
        assert!(resolver.resolve("unknown", None).await.is_none());
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_currently_playing_game_short_circuits() {
        let backend = Arc::new(CountingBackend::answering("/audio/a.ogg"));
        let resolver = SourceResolver::new(
            store_with(&[("A", "v1")]).await,
            backend.clone(),
            Duration::from_secs(1),
        );
        assert!(resolver.resolve("A", Some("A")).await.is_none());
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_none() {
        let backend = Arc::new(CountingBackend::answering("/audio/a.ogg"));
        let resolver =
            SourceResolver::new(Arc::new(BrokenStore), backend.clone(), Duration::from_secs(1));
        assert!(resolver.resolve("A", None).await.is_none());
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let backend = Arc::new(CountingBackend {
            delay: Duration::from_millis(200),
            ..CountingBackend::answering("/audio/slow.ogg")
        });
        let resolver = SourceResolver::new(
            store_with(&[("A", "v1")]).await,
            backend.clone(),
            Duration::from_millis(20),
        );
        assert!(resolver.resolve("A", None).await.is_none());
        assert!(resolver.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_clear_during_lookup_prevents_insert() {
        let backend = Arc::new(CountingBackend {
            delay: Duration::from_millis(50),
            ..CountingBackend::answering("/audio/a.ogg")
        });
        let resolver = Arc::new(SourceResolver::new(
            store_with(&[("A", "v1")]).await,
            backend.clone(),
            Duration::from_secs(1),
        ));

        let pending = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve("A", None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolver.clear_cache().await;

        let result = pending.await.unwrap();
        assert_eq!(result.unwrap().source, "/audio/a.ogg");
        assert!(resolver.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_volume_preference_carried() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                "A",
                IdentifierCacheEntry {
                    video_id: Some("v1".into()),
                    volume: Some(0.25),
                },
            )
            .await
            .unwrap();
        let resolver = SourceResolver::new(
            store,
            Arc::new(CountingBackend::answering("/audio/a.ogg")),
            Duration::from_secs(1),
        );
        assert_eq!(resolver.resolve("A", None).await.unwrap().volume, Some(0.25));
    }
}
