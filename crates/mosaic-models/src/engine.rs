//! The model engine seam.
//!
//! The engine owns the numeric forward pass. Sessions drive it through this
//! trait and never look inside the artifacts it produces.

use async_trait::async_trait;
use mosaic_abstraction::{
    Conditioning, ConditioningPair, EncodeRequest, EngineError, PipelineFamily, PixelTensor,
    SamplingParameters, SamplingStep,
};
use mosaic_weights::ComponentWeights;
use std::path::Path;
use std::sync::Arc;

/// Called after every sampling step. Returning `false` asks the engine to stop early.
pub type StepCallback<'a> = &'a (dyn Fn(SamplingStep) -> bool + Send + Sync);

/// An opaque model engine holding the weights of one pipeline.
///
/// Engines are not assumed to be reentrant; sessions serialize every call.
#[async_trait]
pub trait ModelEngine: Send + Sync {
    /// Assign a component's parameters to the engine's module tree.
    async fn load_weights(&self, weights: ComponentWeights) -> Result<(), EngineError>;

    /// Run the text (or vision-language) encoder.
    async fn encode(&self, request: EncodeRequest<'_>) -> Result<Conditioning, EngineError>;

    /// Run the sampling loop and decode the result.
    async fn sample(
        &self,
        conditioning: &ConditioningPair,
        parameters: &SamplingParameters,
        on_step: StepCallback<'_>,
    ) -> Result<PixelTensor, EngineError>;

    /// Drop the encoder weights. They are loaded again through [`ModelEngine::load_weights`].
    async fn release_encoders(&self) -> Result<(), EngineError>;

    /// Apply a LoRA adapter, replacing any adapter applied before.
    async fn apply_lora(&self, path: &Path, scale: f32) -> Result<(), EngineError>;

    /// Remove the applied LoRA adapter, if any.
    async fn clear_lora(&self) -> Result<(), EngineError>;

    /// Release every weight reference held by the engine.
    async fn unload(&self);

    /// Set the engine's compute-cache byte budget.
    fn set_cache_limit(&self, bytes: u64);

    /// Drop all cached intermediate buffers.
    fn clear_cache(&self);

    /// Identifier used in logs.
    fn engine_id(&self) -> &str;
}

/// Creates a fresh engine for each pipeline load.
pub trait EngineFactory: Send + Sync {
    fn create(&self, family: PipelineFamily) -> Arc<dyn ModelEngine>;
}
