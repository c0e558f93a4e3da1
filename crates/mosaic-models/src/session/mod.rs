//! Pipeline sessions.
//!
//! A session wraps one loaded engine. Every operation takes the session lock,
//! so calls on the same session run one after another in arrival order. The
//! conditioning caches consulted before the engine runs belong to the broker
//! and outlive any one session.

mod image;
mod layered;

pub use image::ImageSession;
pub use layered::{DEFAULT_LAYERS, LayeredSession};

use mosaic_abstraction::{
    ComponentKind, Conditioning, ConditioningPair, EncodeRequest, PipelineFamily,
    PipelineIdentity, PixelTensor, SamplingParameters, SamplingStep,
};
use mosaic_weights::{
    ComponentWeights, SnapshotLayout, WeightKeyMapper, WeightsResult, load_component,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{
    CacheStats, ConditioningCaches, ImageCaptionCache, ImageCaptionKey, PromptCacheKey,
    PromptEmbeddingCache,
};
use crate::config::SessionConfig;
use crate::engine::ModelEngine;
use crate::error::{Outcome, Result, SessionError};

/// Load components of a snapshot on a blocking worker.
pub(crate) async fn load_components(
    layout: SnapshotLayout,
    kinds: Vec<ComponentKind>,
    mapper: WeightKeyMapper,
) -> Result<Vec<ComponentWeights>> {
    let loaded = tokio::task::spawn_blocking(move || {
        kinds
            .into_iter()
            .map(|kind| load_component(&layout, kind, &mapper))
            .collect::<WeightsResult<Vec<_>>>()
    })
    .await
    .map_err(|e| SessionError::Worker(e.to_string()))??;
    Ok(loaded)
}

#[derive(Debug, Clone, PartialEq)]
struct AppliedLora {
    path: PathBuf,
    scale_bits: u32,
}

struct SessionState {
    engine: Option<Arc<dyn ModelEngine>>,
    encoders_resident: bool,
    lora: Option<AppliedLora>,
}

/// State and behavior shared by both session kinds.
pub(crate) struct SessionCore {
    family: PipelineFamily,
    identity: PipelineIdentity,
    layout: SnapshotLayout,
    mapper: WeightKeyMapper,
    config: SessionConfig,
    quantization: String,
    caches: Arc<ConditioningCaches>,
    state: Mutex<SessionState>,
}

impl SessionCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        family: PipelineFamily,
        identity: PipelineIdentity,
        layout: SnapshotLayout,
        mapper: WeightKeyMapper,
        config: SessionConfig,
        quantization: String,
        caches: Arc<ConditioningCaches>,
        engine: Arc<dyn ModelEngine>,
    ) -> Self {
        Self {
            family,
            identity,
            layout,
            mapper,
            caches,
            config,
            quantization,
            state: Mutex::new(SessionState {
                engine: Some(engine),
                encoders_resident: true,
                lora: None,
            }),
        }
    }

    pub(crate) const fn family(&self) -> PipelineFamily {
        self.family
    }

    pub(crate) const fn identity(&self) -> &PipelineIdentity {
        &self.identity
    }

    pub(crate) const fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn quantization(&self) -> &str {
        &self.quantization
    }

    pub(crate) fn prompt_cache(&self) -> &PromptEmbeddingCache {
        &self.caches.prompt
    }

    pub(crate) fn image_cache(&self) -> &ImageCaptionCache {
        &self.caches.image
    }

    pub(crate) fn prompt_key(&self, prompt: &str) -> PromptCacheKey {
        PromptCacheKey::new(&self.identity, &self.quantization, prompt)
    }

    pub(crate) fn image_key(
        &self,
        image: &[u8],
        prompt: &str,
        negative_prompt: Option<&str>,
    ) -> ImageCaptionKey {
        ImageCaptionKey::from_image_data(
            &self.identity,
            prompt,
            negative_prompt,
            image,
            self.config.hash_mode,
        )
    }

    pub(crate) async fn is_loaded(&self) -> bool {
        self.state.lock().await.engine.is_some()
    }

    pub(crate) async fn encoders_resident(&self) -> bool {
        self.state.lock().await.encoders_resident
    }

    pub(crate) fn cache_stats(&self) -> (CacheStats, CacheStats) {
        (self.caches.prompt.stats(), self.caches.image.stats())
    }

    fn engine(&self, state: &SessionState) -> Result<Arc<dyn ModelEngine>> {
        state.engine.clone().ok_or(SessionError::NoSessionLoaded(self.family))
    }

    /// Reload the text encoder if an earlier encode released it.
    async fn ensure_encoders(&self, state: &mut SessionState, engine: &dyn ModelEngine) -> Result<()> {
        if state.encoders_resident {
            return Ok(());
        }

        let weights = load_components(
            self.layout.clone(),
            vec![ComponentKind::TextEncoder],
            self.mapper,
        )
        .await?;
        for component in weights {
            engine.load_weights(component).await?;
        }
        state.encoders_resident = true;
        info!(model_id = %self.identity.model_id, family = %self.family, "Reloaded text encoder");
        Ok(())
    }

    async fn release_encoders(&self, state: &mut SessionState, engine: &dyn ModelEngine) {
        match engine.release_encoders().await {
            Ok(()) => {
                state.encoders_resident = false;
                debug!(model_id = %self.identity.model_id, "Released encoder weights");
            }
            Err(e) => {
                warn!(model_id = %self.identity.model_id, error = %e, "Failed to release encoder weights");
            }
        }
    }

    /// Encode a prompt and an optional negative prompt, each cached on its own.
    pub(crate) async fn encode_text(
        &self,
        prompt: &str,
        negative_prompt: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Outcome<ConditioningPair>> {
        let mut state = self.state.lock().await;
        let engine = self.engine(&state)?;
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let mut misses: Vec<(PromptCacheKey, Conditioning)> = Vec::new();
        let positive = self.encode_prompt(&mut state, engine.as_ref(), prompt, &mut misses).await?;
        let negative = match negative_prompt {
            Some(text) => {
                Some(self.encode_prompt(&mut state, engine.as_ref(), text, &mut misses).await?)
            }
            None => None,
        };

        if cancel.is_cancelled() {
            debug!(model_id = %self.identity.model_id, "Encode cancelled, discarding result");
            return Ok(Outcome::Cancelled);
        }

        let ran_engine = !misses.is_empty();
        for (key, conditioning) in misses {
            self.caches.prompt.set(key, conditioning, None);
        }
        if ran_engine && self.config.release_encoders_after_encoding {
            self.release_encoders(&mut state, engine.as_ref()).await;
        }
        Ok(Outcome::Completed(ConditioningPair { positive, negative }))
    }

    /// Look one prompt up in the cache, running the encoder on a miss.
    /// Misses are collected instead of written so a cancelled call leaves the cache untouched.
    async fn encode_prompt(
        &self,
        state: &mut SessionState,
        engine: &dyn ModelEngine,
        text: &str,
        misses: &mut Vec<(PromptCacheKey, Conditioning)>,
    ) -> Result<Conditioning> {
        let key = self.prompt_key(text);
        if let Some(hit) = self.caches.prompt.get(&key) {
            return Ok(hit);
        }
        if let Some((_, pending)) = misses.iter().find(|(pending, _)| *pending == key) {
            return Ok(pending.clone());
        }

        self.ensure_encoders(state, engine).await?;
        let conditioning = engine.encode(EncodeRequest::Text { prompt: text }).await?;
        misses.push((key, conditioning.clone()));
        Ok(conditioning)
    }

    /// Encode a prompt conditioned on an image. The pair is cached under one key.
    pub(crate) async fn encode_with_image(
        &self,
        image: &[u8],
        prompt: &str,
        negative_prompt: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Outcome<ConditioningPair>> {
        let mut state = self.state.lock().await;
        let engine = self.engine(&state)?;
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let key = self.image_key(image, prompt, negative_prompt);
        if let Some((positive, negative)) = self.caches.image.get_entry(&key) {
            return Ok(Outcome::Completed(ConditioningPair { positive, negative }));
        }

        self.ensure_encoders(&mut state, engine.as_ref()).await?;
        let positive = engine.encode(EncodeRequest::Image { prompt, image }).await?;
        let negative = match negative_prompt {
            Some(text) => Some(engine.encode(EncodeRequest::Image { prompt: text, image }).await?),
            None => None,
        };

        if cancel.is_cancelled() {
            debug!(model_id = %self.identity.model_id, "Image encode cancelled, discarding result");
            return Ok(Outcome::Cancelled);
        }

        self.caches.image.set(key, positive.clone(), negative.clone());
        if self.config.release_encoders_after_encoding {
            self.release_encoders(&mut state, engine.as_ref()).await;
        }
        Ok(Outcome::Completed(ConditioningPair { positive, negative }))
    }

    /// Run the sampling loop. Results are never cached.
    pub(crate) async fn generate(
        &self,
        conditioning: &ConditioningPair,
        parameters: &SamplingParameters,
        cancel: &CancellationToken,
    ) -> Result<Outcome<PixelTensor>> {
        let state = self.state.lock().await;
        let engine = self.engine(&state)?;
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let on_step = |_: SamplingStep| !cancel.is_cancelled();
        let pixels = engine.sample(conditioning, parameters, &on_step).await?;
        drop(state);

        if cancel.is_cancelled() {
            debug!(model_id = %self.identity.model_id, "Generation cancelled, discarding result");
            return Ok(Outcome::Cancelled);
        }
        Ok(Outcome::Completed(pixels))
    }

    /// Apply a LoRA adapter. Returns `false` when the same adapter is already applied.
    pub(crate) async fn apply_lora(&self, path: &Path, scale: f32) -> Result<bool> {
        let mut state = self.state.lock().await;
        let engine = self.engine(&state)?;
        let requested = AppliedLora { path: path.to_path_buf(), scale_bits: scale.to_bits() };
        if state.lora.as_ref() == Some(&requested) {
            debug!(path = %path.display(), scale, "LoRA adapter already applied");
            return Ok(false);
        }

        engine.apply_lora(path, scale).await?;
        state.lora = Some(requested);
        info!(path = %path.display(), scale, "Applied LoRA adapter");
        Ok(true)
    }

    /// Remove the applied LoRA adapter. Returns `false` when none was applied.
    pub(crate) async fn clear_lora(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        let engine = self.engine(&state)?;
        if state.lora.is_none() {
            return Ok(false);
        }
        engine.clear_lora().await?;
        state.lora = None;
        Ok(true)
    }

    /// Drop the cached conditioning of this session's model revision.
    pub(crate) async fn clear_cache(&self) -> usize {
        let _state = self.state.lock().await;
        self.caches.invalidate_identity(&self.identity)
    }

    /// Detach the engine after in-flight work finishes. Returns the engine so
    /// the caller can clear its compute cache.
    pub(crate) async fn shutdown(&self) -> Option<Arc<dyn ModelEngine>> {
        let mut state = self.state.lock().await;
        let engine = state.engine.take()?;

        if state.lora.take().is_some() {
            if let Err(e) = engine.clear_lora().await {
                warn!(error = %e, "Failed to clear LoRA adapter during unload");
            }
        }
        engine.unload().await;
        state.encoders_resident = false;
        info!(model_id = %self.identity.model_id, family = %self.family, "Session unloaded");
        Some(engine)
    }
}
