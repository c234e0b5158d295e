//! Artwork lookup for the mirrored track.
//!
//! Image decoding is left to consumers: an [`Artwork`] is just a handle
//! (an URL) they can fetch themselves.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::model::TrackIdentity;

/// Handle to the artwork of a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artwork {
    pub url: String,
}

impl Artwork {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Resolves artwork for a track identity.
///
/// Implementations may do network I/O. A failure is reported as `None`.
#[async_trait]
pub trait ArtworkResolver: Send + Sync {
    /// `hint` is whatever the control surface reported alongside the track, if anything.
    async fn resolve(&self, identity: &TrackIdentity, hint: Option<&str>) -> Option<Artwork>;
}

/// Uses the art URL reported by the control surface as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReportedArtwork;

#[async_trait]
impl ArtworkResolver for ReportedArtwork {
    async fn resolve(&self, _identity: &TrackIdentity, hint: Option<&str>) -> Option<Artwork> {
        hint.map(str::trim)
            .filter(|url| !url.is_empty())
            .map(Artwork::new)
    }
}

/// Never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoArtwork;

#[async_trait]
impl ArtworkResolver for NoArtwork {
    async fn resolve(&self, _identity: &TrackIdentity, _hint: Option<&str>) -> Option<Artwork> {
        None
    }
}

/// Composite-key cache in front of a resolver.
///
/// Created once at startup and shared by every consumer; it lives for the
/// whole process. Misses are not cached so a later lookup can still succeed.
pub struct ArtworkCache {
    resolver: Arc<dyn ArtworkResolver>,
    entries: Mutex<HashMap<String, Artwork>>,
}

impl ArtworkCache {
    pub fn new(resolver: Arc<dyn ArtworkResolver>) -> Self {
        Self {
            resolver,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Artwork>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Cached artwork for `identity`, without consulting the resolver.
    pub fn cached(&self, identity: &TrackIdentity) -> Option<Artwork> {
        self.entries().get(&identity.key()).cloned()
    }

    pub async fn resolve(&self, identity: &TrackIdentity, hint: Option<&str>) -> Option<Artwork> {
        if let Some(hit) = self.cached(identity) {
            return Some(hit);
        }
        let key = identity.key();

        // No lock is held while the resolver runs
        let artwork = self.resolver.resolve(identity, hint).await?;
        debug!(key = %key, url = %artwork.url, "artwork resolved");
        self.entries().insert(key, artwork.clone());
        Some(artwork)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ArtworkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtworkCache")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and answers only for a given hint.
    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ArtworkResolver for CountingResolver {
        async fn resolve(&self, _identity: &TrackIdentity, hint: Option<&str>) -> Option<Artwork> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            hint.map(Artwork::new)
        }
    }

    #[tokio::test]
    async fn test_reported_artwork() {
        let identity = TrackIdentity::new("a", "b", "c");
        assert_eq!(
            ReportedArtwork.resolve(&identity, Some("file:///tmp/a.png")).await,
            Some(Artwork::new("file:///tmp/a.png"))
        );
        assert_eq!(ReportedArtwork.resolve(&identity, Some("  ")).await, None);
        assert_eq!(ReportedArtwork.resolve(&identity, None).await, None);
        assert_eq!(NoArtwork.resolve(&identity, Some("x")).await, None);
    }

    #[tokio::test]
    async fn test_cache_hits_skip_resolver() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let cache = ArtworkCache::new(resolver.clone());
        let identity = TrackIdentity::new("Song X", "Artist Y", "Album Z");

        let first = cache.resolve(&identity, Some("http://art/1")).await;
        let second = cache.resolve(&identity, Some("http://art/2")).await;

        assert_eq!(first, Some(Artwork::new("http://art/1")));
        assert_eq!(second, first);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.cached(&identity), first);
    }

    #[tokio::test]
    async fn test_misses_are_not_cached() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let cache = ArtworkCache::new(resolver.clone());
        let identity = TrackIdentity::new("Song X", "Artist Y", "Album Z");

        assert_eq!(cache.resolve(&identity, None).await, None);
        assert!(cache.is_empty());

        let found = cache.resolve(&identity, Some("http://art/1")).await;
        assert!(found.is_some());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }
}
