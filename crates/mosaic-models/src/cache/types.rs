//! Core data types for conditioning caches.

use mosaic_abstraction::PipelineIdentity;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Instant;

/// Bytes taken from each end of a file by the sampled fingerprint.
const SAMPLE_EDGE_BYTES: usize = 64 * 1024;
/// Number of interior windows hashed by the sampled fingerprint.
const SAMPLE_WINDOWS: usize = 32;
/// Size of each interior window.
const SAMPLE_WINDOW_BYTES: usize = 4 * 1024;

/// Keys that belong to one model snapshot. Used for model-wide invalidation.
pub trait ModelScoped {
    fn model_id(&self) -> &str;
    fn revision(&self) -> &str;
}

/// Cache key for prompt embeddings.
///
/// Every field participates in equality; the quantization descriptor keeps
/// embeddings from differently quantized encoders apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PromptCacheKey {
    pub model_id: String,
    pub revision: String,
    pub quantization: String,
    pub prompt: String,
}

impl PromptCacheKey {
    #[must_use]
    pub fn new(identity: &PipelineIdentity, quantization: &str, prompt: &str) -> Self {
        Self {
            model_id: identity.model_id.clone(),
            revision: identity.revision.clone(),
            quantization: quantization.to_string(),
            prompt: prompt.to_string(),
        }
    }
}

impl ModelScoped for PromptCacheKey {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn revision(&self) -> &str {
        &self.revision
    }
}

/// How image bytes are fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashMode {
    /// SHA-256 over every byte.
    #[default]
    Full,
    /// SHA-256 over the length, both ends and evenly spaced interior windows.
    /// Much faster on large files, but can miss edits between windows.
    Sampled,
}

/// Content fingerprint of an encoded image file.
///
/// Always computed from the bytes as read from disk, never from decoded pixels,
/// so the same file fingerprints the same regardless of how it is decoded later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageFingerprint {
    Full(String),
    Sampled(String),
}

impl ImageFingerprint {
    #[must_use]
    pub fn compute(bytes: &[u8], mode: HashMode) -> Self {
        match mode {
            HashMode::Full => Self::full(bytes),
            HashMode::Sampled => Self::sampled(bytes),
        }
    }

    #[must_use]
    pub fn full(bytes: &[u8]) -> Self {
        Self::Full(hex::encode(Sha256::digest(bytes)))
    }

    #[must_use]
    pub fn sampled(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((bytes.len() as u64).to_le_bytes());

        if bytes.len() <= 2 * SAMPLE_EDGE_BYTES + SAMPLE_WINDOWS * SAMPLE_WINDOW_BYTES {
            hasher.update(bytes);
        } else {
            hasher.update(&bytes[..SAMPLE_EDGE_BYTES]);
            let interior = &bytes[SAMPLE_EDGE_BYTES..bytes.len() - SAMPLE_EDGE_BYTES];
            let stride = interior.len() / SAMPLE_WINDOWS;
            for window in 0..SAMPLE_WINDOWS {
                let start = window * stride;
                hasher.update(&interior[start..start + SAMPLE_WINDOW_BYTES.min(stride)]);
            }
            hasher.update(&bytes[bytes.len() - SAMPLE_EDGE_BYTES..]);
        }

        Self::Sampled(hex::encode(hasher.finalize()))
    }

    /// The hex digest.
    #[must_use]
    pub fn digest(&self) -> &str {
        match self {
            Self::Full(digest) | Self::Sampled(digest) => digest,
        }
    }
}

impl fmt::Display for ImageFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(digest) => write!(f, "sha256:{digest}"),
            Self::Sampled(digest) => write!(f, "sampled-sha256:{digest}"),
        }
    }
}

/// Cache key for image-conditioned encodings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageCaptionKey {
    pub model_id: String,
    pub revision: String,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub image_hash: ImageFingerprint,
}

impl ImageCaptionKey {
    /// Build a key from the encoded image file bytes.
    #[must_use]
    pub fn from_image_data(
        identity: &PipelineIdentity,
        prompt: &str,
        negative_prompt: Option<&str>,
        image_data: &[u8],
        mode: HashMode,
    ) -> Self {
        Self::new(identity, prompt, negative_prompt, ImageFingerprint::compute(image_data, mode))
    }

    /// Build a key from a fingerprint computed earlier.
    #[must_use]
    pub fn new(
        identity: &PipelineIdentity,
        prompt: &str,
        negative_prompt: Option<&str>,
        image_hash: ImageFingerprint,
    ) -> Self {
        Self {
            model_id: identity.model_id.clone(),
            revision: identity.revision.clone(),
            prompt: prompt.to_string(),
            negative_prompt: negative_prompt.map(ToString::to_string),
            image_hash,
        }
    }
}

impl ModelScoped for ImageCaptionKey {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn revision(&self) -> &str {
        &self.revision
    }
}

/// A cached artifact with usage metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached conditioning artifact.
    pub artifact: V,
    /// Optional counterpart, e.g. the negative-prompt encoding.
    pub secondary: Option<V>,
    /// When the entry was first inserted.
    pub created_at: Instant,
    /// Number of times the entry was stored or hit. Starts at 1.
    pub access_count: u64,
    /// Insertion order, breaks ties between entries created in the same instant.
    pub(crate) sequence: u64,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(artifact: V, secondary: Option<V>, sequence: u64) -> Self {
        Self {
            artifact,
            secondary,
            created_at: Instant::now(),
            access_count: 1,
            sequence,
        }
    }

    /// Record a hit.
    pub fn touch(&mut self) {
        self.access_count += 1;
    }

    /// Eviction order: fewest accesses first, then oldest.
    pub(crate) fn eviction_rank(&self) -> (u64, Instant, u64) {
        (self.access_count, self.created_at, self.sequence)
    }
}

/// Cache statistics for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Total number of cache hits.
    pub total_hits: u64,
    /// Total number of cache misses.
    pub total_misses: u64,
    /// Total number of capacity evictions.
    pub total_evictions: u64,
    /// Current number of entries.
    pub cache_size: usize,
}
