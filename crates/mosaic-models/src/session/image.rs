use mosaic_abstraction::{
    ConditioningPair, PipelineFamily, PipelineIdentity, PixelTensor, SamplingParameters,
};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::SessionCore;
use crate::cache::{CacheStats, ImageCaptionCache, ImageCaptionKey, PromptCacheKey, PromptEmbeddingCache};
use crate::config::SessionConfig;
use crate::error::{Outcome, Result};

/// Session for the text-to-image and image-edit pipeline.
///
/// Handles are obtained from [`crate::ModelSessionBroker`]. Once the broker
/// unloads the pipeline, every operation fails with
/// [`crate::SessionError::NoSessionLoaded`].
pub struct ImageSession {
    core: SessionCore,
}

impl ImageSession {
    pub(crate) const fn new(core: SessionCore) -> Self {
        Self { core }
    }

    pub(crate) const fn core(&self) -> &SessionCore {
        &self.core
    }

    #[must_use]
    pub const fn family(&self) -> PipelineFamily {
        self.core.family()
    }

    #[must_use]
    pub const fn identity(&self) -> &PipelineIdentity {
        self.core.identity()
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        self.core.config()
    }

    /// Quantization descriptor of the loaded transformer.
    #[must_use]
    pub fn quantization(&self) -> &str {
        self.core.quantization()
    }

    /// Encode a text prompt and an optional negative prompt.
    ///
    /// # Errors
    /// Returns `NoSessionLoaded` after unload, or the engine's error verbatim.
    pub async fn encode(
        &self,
        prompt: &str,
        negative_prompt: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Outcome<ConditioningPair>> {
        self.core.encode_text(prompt, negative_prompt, cancel).await
    }

    /// Encode an edit instruction conditioned on the source image file bytes.
    ///
    /// # Errors
    /// Returns `NoSessionLoaded` after unload, or the engine's error verbatim.
    pub async fn encode_edit(
        &self,
        image: &[u8],
        prompt: &str,
        negative_prompt: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Outcome<ConditioningPair>> {
        self.core.encode_with_image(image, prompt, negative_prompt, cancel).await
    }

    /// Run the sampling loop.
    ///
    /// # Errors
    /// Returns `NoSessionLoaded` after unload, or the engine's error verbatim.
    pub async fn generate(
        &self,
        conditioning: &ConditioningPair,
        parameters: &SamplingParameters,
        cancel: &CancellationToken,
    ) -> Result<Outcome<PixelTensor>> {
        self.core.generate(conditioning, parameters, cancel).await
    }

    /// Apply a LoRA adapter. Re-applying the same path and scale is a no-op returning `false`.
    ///
    /// # Errors
    /// Returns `NoSessionLoaded` after unload, or the engine's error verbatim.
    pub async fn apply_lora(&self, path: &Path, scale: f32) -> Result<bool> {
        self.core.apply_lora(path, scale).await
    }

    /// # Errors
    /// Returns `NoSessionLoaded` after unload, or the engine's error verbatim.
    pub async fn clear_lora(&self) -> Result<bool> {
        self.core.clear_lora().await
    }

    /// Drop the cached conditioning of this model revision without unloading
    /// weights. Returns the number of entries removed.
    pub async fn clear_cache(&self) -> usize {
        self.core.clear_cache().await
    }

    pub async fn is_loaded(&self) -> bool {
        self.core.is_loaded().await
    }

    pub async fn encoders_resident(&self) -> bool {
        self.core.encoders_resident().await
    }

    #[must_use]
    pub fn prompt_cache(&self) -> &PromptEmbeddingCache {
        self.core.prompt_cache()
    }

    #[must_use]
    pub fn image_cache(&self) -> &ImageCaptionCache {
        self.core.image_cache()
    }

    /// Key under which a prompt is cached by this session.
    #[must_use]
    pub fn prompt_key(&self, prompt: &str) -> PromptCacheKey {
        self.core.prompt_key(prompt)
    }

    /// Key under which an edit encoding is cached by this session.
    #[must_use]
    pub fn edit_key(&self, image: &[u8], prompt: &str, negative_prompt: Option<&str>) -> ImageCaptionKey {
        self.core.image_key(image, prompt, negative_prompt)
    }

    /// Statistics of the prompt and image caches.
    #[must_use]
    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        self.core.cache_stats()
    }
}
