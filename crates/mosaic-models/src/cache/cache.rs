//! Bounded conditioning cache with access-count eviction.

use mosaic_abstraction::{Conditioning, PipelineIdentity};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use super::types::{
    CacheEntry, CacheStats, ImageCaptionKey, ImageFingerprint, ModelScoped, PromptCacheKey,
};

/// Cache of prompt embeddings.
pub type PromptEmbeddingCache = EmbeddingCache<PromptCacheKey, Conditioning>;

/// Cache of image-conditioned encodings.
pub type ImageCaptionCache = EmbeddingCache<ImageCaptionKey, Conditioning>;

/// Bounded map from a derived key to a computed conditioning artifact.
///
/// When full, inserting a new key evicts the entry with the fewest accesses,
/// oldest first. The entry most recently returned by [`EmbeddingCache::get`]
/// is never chosen while another candidate exists.
pub struct EmbeddingCache<K, V> {
    inner: Mutex<CacheInner<K, V>>,
    capacity: usize,
}

struct CacheInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    stats: CacheStats,
    next_sequence: u64,
    last_hit: Option<K>,
}

impl<K, V> fmt::Debug for EmbeddingCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("capacity", &self.capacity)
            .field("len", &self.lock().entries.len())
            .finish_non_exhaustive()
    }
}

impl<K, V> EmbeddingCache<K, V> {
    /// Create a cache holding at most `capacity` entries (at least 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
                next_sequence: 0,
                last_hit: None,
            }),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Snapshot of the cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let mut stats = inner.stats.clone();
        stats.cache_size = inner.entries.len();
        stats
    }

    /// Remove every entry.
    pub fn invalidate_all(&self) {
        let mut inner = self.lock();
        let cleared_count = inner.entries.len();
        inner.entries.clear();
        inner.last_hit = None;
        info!(cleared_count, "Cleared conditioning cache");
    }
}

impl<K, V> EmbeddingCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Look up an artifact, counting the access.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_entry(key).map(|(artifact, _)| artifact)
    }

    /// Look up an artifact and its secondary counterpart, counting the access.
    pub fn get_entry(&self, key: &K) -> Option<(V, Option<V>)> {
        let mut inner = self.lock();
        let found = inner.entries.get_mut(key).map(|entry| {
            entry.touch();
            (entry.artifact.clone(), entry.secondary.clone(), entry.access_count)
        });

        match found {
            Some((artifact, secondary, access_count)) => {
                inner.stats.total_hits += 1;
                inner.last_hit = Some(key.clone());
                debug!(access_count, "Conditioning cache hit");
                Some((artifact, secondary))
            }
            None => {
                inner.stats.total_misses += 1;
                debug!("Conditioning cache miss");
                None
            }
        }
    }

    /// Whether a key is present. Does not count as an access.
    pub fn contains(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Insert or replace an artifact.
    ///
    /// Replacing keeps the entry's access count and age.
    pub fn set(&self, key: K, artifact: V, secondary: Option<V>) {
        let mut inner = self.lock();

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.artifact = artifact;
            entry.secondary = secondary;
            return;
        }

        if inner.entries.len() >= self.capacity {
            if let Some(victim) = Self::find_victim(&inner) {
                inner.entries.remove(&victim);
                inner.stats.total_evictions += 1;
                if inner.last_hit.as_ref() == Some(&victim) {
                    inner.last_hit = None;
                }
                info!(capacity = self.capacity, "Evicted conditioning cache entry");
            }
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.entries.insert(key, CacheEntry::new(artifact, secondary, sequence));
        inner.stats.cache_size = inner.entries.len();
    }

    /// The entry to evict: fewest accesses, then oldest, sparing the last hit.
    fn find_victim(inner: &CacheInner<K, V>) -> Option<K> {
        let protected = inner.last_hit.as_ref().filter(|_| inner.entries.len() > 1);
        inner
            .entries
            .iter()
            .filter(|(key, _)| Some(*key) != protected)
            .min_by_key(|(_, entry)| entry.eviction_rank())
            .map(|(key, _)| key.clone())
    }

    /// Remove one entry. Returns `true` if it was present.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut inner = self.lock();
        let removed = inner.entries.remove(key).is_some();
        if removed && inner.last_hit.as_ref() == Some(key) {
            inner.last_hit = None;
        }
        removed
    }

    /// Remove every entry whose key matches. Returns the number removed.
    pub fn invalidate_where(&self, predicate: impl Fn(&K) -> bool) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !predicate(key));
        if inner.last_hit.as_ref().is_some_and(|key| predicate(key)) {
            inner.last_hit = None;
        }
        let removed = before - inner.entries.len();
        debug!(removed, "Invalidated conditioning cache entries");
        removed
    }
}

impl<K, V> EmbeddingCache<K, V>
where
    K: Eq + Hash + Clone + ModelScoped,
    V: Clone,
{
    /// Remove every entry of a model, across revisions.
    pub fn invalidate_model(&self, model_id: &str) -> usize {
        self.invalidate_where(|key| key.model_id() == model_id)
    }
}

impl EmbeddingCache<ImageCaptionKey, Conditioning> {
    /// Remove every entry derived from an image.
    pub fn invalidate_image(&self, fingerprint: &ImageFingerprint) -> usize {
        self.invalidate_where(|key| &key.image_hash == fingerprint)
    }
}

/// The prompt and image caches shared by every session of one broker.
///
/// Keys carry the model identity, so entries stay valid across unloads and
/// family switches.
#[derive(Debug)]
pub struct ConditioningCaches {
    pub prompt: PromptEmbeddingCache,
    pub image: ImageCaptionCache,
}

impl ConditioningCaches {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { prompt: PromptEmbeddingCache::new(capacity), image: ImageCaptionCache::new(capacity) }
    }

    /// Capacity of each cache.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.prompt.capacity()
    }

    /// Remove every entry of a model from both caches.
    pub fn invalidate_model(&self, model_id: &str) -> usize {
        self.prompt.invalidate_model(model_id) + self.image.invalidate_model(model_id)
    }

    /// Remove every entry of one model revision from both caches.
    pub fn invalidate_identity(&self, identity: &PipelineIdentity) -> usize {
        let matches = |model_id: &str, revision: &str| {
            model_id == identity.model_id && revision == identity.revision
        };
        self.prompt.invalidate_where(|key| matches(key.model_id(), key.revision()))
            + self.image.invalidate_where(|key| matches(key.model_id(), key.revision()))
    }

    pub fn invalidate_all(&self) {
        self.prompt.invalidate_all();
        self.image.invalidate_all();
    }
}
