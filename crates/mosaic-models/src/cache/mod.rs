//! Conditioning caches.
//!
//! Encoded prompts and image-conditioned encodings are expensive to compute
//! and cheap to keep. These caches key them by content-derived fingerprints
//! and bound their size with access-count eviction.

#[allow(clippy::module_inception)]
pub mod cache;
pub mod types;

pub use cache::{ConditioningCaches, EmbeddingCache, ImageCaptionCache, PromptEmbeddingCache};
pub use types::{
    CacheEntry, CacheStats, HashMode, ImageCaptionKey, ImageFingerprint, ModelScoped,
    PromptCacheKey,
};
