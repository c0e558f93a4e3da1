//! Sessions, caches and the pipeline broker for Mosaic.
//!
//! This crate sits between a model engine and its consumers:
//!
//! - [`ModelSessionBroker`] keeps at most one pipeline family resident.
//! - [`ImageSession`] and [`LayeredSession`] serialize calls to their engine
//!   and consult conditioning caches before encoding.
//! - [`EmbeddingCache`] bounds cached conditioning with access-count eviction.
//! - [`ResourceCachePolicy`] sets the engine's compute-cache budget.
//!
//! [`MockEngine`] stands in for a real engine in tests and demos.

pub mod broker;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod resource;
pub mod session;

use async_trait::async_trait;
use mosaic_abstraction::{
    ComponentKind, Conditioning, ConditioningPair, EncodeRequest, EngineError, PipelineFamily,
    PixelTensor, SamplingParameters, SamplingStep,
};
use mosaic_weights::ComponentWeights;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

pub use broker::ModelSessionBroker;
pub use cache::{
    CacheStats, ConditioningCaches, EmbeddingCache, HashMode, ImageCaptionCache, ImageCaptionKey, ImageFingerprint,
    PromptCacheKey, PromptEmbeddingCache,
};
pub use config::{BrokerConfig, BrokerConfigError, SessionConfig};
pub use engine::{EngineFactory, ModelEngine, StepCallback};
pub use error::{Outcome, Result, SessionError};
pub use resource::{CachePreset, ResourceCachePolicy};
pub use session::{DEFAULT_LAYERS, ImageSession, LayeredSession};

/// Calls observed by a [`MockEngine`], in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    LoadWeights(ComponentKind),
    Encode(String),
    Sample { steps_run: u32 },
    ReleaseEncoders,
    ApplyLora(PathBuf, f32),
    ClearLora,
    Unload,
}

type EncodeHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct MockEngineState {
    calls: Vec<MockCall>,
    encoder_loaded: bool,
    decoded_values: usize,
    cache_limit: Option<u64>,
    cache_clears: usize,
    fail_encode: Option<EngineError>,
    fail_sample: Option<EngineError>,
    encode_hook: Option<EncodeHook>,
    encode_delay: Option<Duration>,
}

/// A mock implementation of [`ModelEngine`] for testing and demonstration.
///
/// Encodings are derived from the prompt bytes, so equal prompts encode equally.
/// Encoding fails while the text encoder is not loaded.
pub struct MockEngine {
    id: String,
    state: Mutex<MockEngineState>,
}

impl std::fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEngine").field("id", &self.id).finish_non_exhaustive()
    }
}

impl MockEngine {
    /// Creates a new `MockEngine` with the given ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), state: Mutex::new(MockEngineState::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, MockEngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Number of calls matching a predicate.
    pub fn count_calls(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    #[must_use]
    pub fn encode_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, MockCall::Encode(_)))
    }

    #[must_use]
    pub fn cache_limit(&self) -> Option<u64> {
        self.lock().cache_limit
    }

    #[must_use]
    pub fn cache_clears(&self) -> usize {
        self.lock().cache_clears
    }

    /// Number of floating-point values decoded from loaded weights.
    #[must_use]
    pub fn decoded_values(&self) -> usize {
        self.lock().decoded_values
    }

    #[must_use]
    pub fn is_unloaded(&self) -> bool {
        self.lock().calls.contains(&MockCall::Unload)
    }

    /// Fail the next encode call with `error`.
    pub fn fail_next_encode(&self, error: EngineError) {
        self.lock().fail_encode = Some(error);
    }

    /// Fail the next sample call with `error`.
    pub fn fail_next_sample(&self, error: EngineError) {
        self.lock().fail_sample = Some(error);
    }

    /// Run `hook` with the prompt during every encode, before it returns.
    pub fn on_encode(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.lock().encode_hook = Some(Arc::new(hook));
    }

    /// Sleep this long inside every encode call.
    pub fn set_encode_delay(&self, delay: Duration) {
        self.lock().encode_delay = Some(delay);
    }

    fn record(&self, call: MockCall) {
        self.lock().calls.push(call);
    }

    fn conditioning_for(prompt: &str, image: Option<&[u8]>) -> Conditioning {
        let mut values: Vec<f32> = prompt.bytes().map(f32::from).collect();
        if let Some(image) = image {
            values.push(image.iter().map(|&b| f32::from(b)).sum());
        }
        let tokens = values.len().max(1);
        values.resize(tokens, 0.0);
        Conditioning::new(vec![tokens, 1], values)
    }
}

#[async_trait]
impl ModelEngine for MockEngine {
    async fn load_weights(&self, weights: ComponentWeights) -> std::result::Result<(), EngineError> {
        debug!(
            engine_id = %self.id,
            component = %weights.kind,
            parameters = weights.len(),
            "MockEngine loading weights"
        );
        let mut decoded = 0;
        for parameter in weights.parameters.iter().filter(|p| p.dtype.is_float() && !p.prepacked) {
            let values = parameter
                .to_f32()
                .map_err(|e| EngineError::InvalidInput(format!("{}: {e}", parameter.module_path)))?;
            decoded += values.len();
        }

        let mut state = self.lock();
        state.decoded_values += decoded;
        if weights.kind == ComponentKind::TextEncoder {
            state.encoder_loaded = true;
        }
        state.calls.push(MockCall::LoadWeights(weights.kind));
        Ok(())
    }

    async fn encode(&self, request: EncodeRequest<'_>) -> std::result::Result<Conditioning, EngineError> {
        let prompt = request.prompt().to_string();
        self.record(MockCall::Encode(prompt.clone()));

        let (delay, hook) = {
            let mut state = self.lock();
            if let Some(error) = state.fail_encode.take() {
                return Err(error);
            }
            if !state.encoder_loaded {
                return Err(EngineError::InvalidInput("text encoder is not loaded".to_string()));
            }
            (state.encode_delay, state.encode_hook.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(hook) = hook {
            hook(&prompt);
        }

        let image = match request {
            EncodeRequest::Image { image, .. } => Some(image),
            EncodeRequest::Text { .. } => None,
        };
        Ok(Self::conditioning_for(&prompt, image))
    }

    async fn sample(
        &self,
        conditioning: &ConditioningPair,
        parameters: &SamplingParameters,
        on_step: StepCallback<'_>,
    ) -> std::result::Result<PixelTensor, EngineError> {
        if let Some(error) = self.lock().fail_sample.take() {
            return Err(error);
        }

        let mut steps_run = 0;
        for step in 0..parameters.steps {
            steps_run += 1;
            if !on_step(SamplingStep { step, total: parameters.steps }) {
                break;
            }
        }
        self.record(MockCall::Sample { steps_run });

        let layers = parameters.layers.unwrap_or(1);
        let channels = if parameters.layers.is_some() { 4 } else { 3 };
        let len = layers as usize * parameters.height as usize * parameters.width as usize * channels as usize;
        let fill = conditioning.positive.values.first().copied().unwrap_or(0.0) / 255.0;
        Ok(PixelTensor {
            layers,
            height: parameters.height,
            width: parameters.width,
            channels,
            data: vec![fill; len],
        })
    }

    async fn release_encoders(&self) -> std::result::Result<(), EngineError> {
        let mut state = self.lock();
        state.encoder_loaded = false;
        state.calls.push(MockCall::ReleaseEncoders);
        Ok(())
    }

    async fn apply_lora(&self, path: &Path, scale: f32) -> std::result::Result<(), EngineError> {
        self.record(MockCall::ApplyLora(path.to_path_buf(), scale));
        Ok(())
    }

    async fn clear_lora(&self) -> std::result::Result<(), EngineError> {
        self.record(MockCall::ClearLora);
        Ok(())
    }

    async fn unload(&self) {
        let mut state = self.lock();
        state.encoder_loaded = false;
        state.calls.push(MockCall::Unload);
    }

    fn set_cache_limit(&self, bytes: u64) {
        self.lock().cache_limit = Some(bytes);
    }

    fn clear_cache(&self) {
        self.lock().cache_clears += 1;
    }

    fn engine_id(&self) -> &str {
        &self.id
    }
}

/// Hands out [`MockEngine`]s and keeps them for inspection.
#[derive(Debug, Default)]
pub struct MockEngineFactory {
    engines: Mutex<Vec<(PipelineFamily, Arc<MockEngine>)>>,
}

impl MockEngineFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(PipelineFamily, Arc<MockEngine>)>> {
        self.engines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every engine created so far, oldest first.
    #[must_use]
    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.lock().iter().map(|(_, engine)| Arc::clone(engine)).collect()
    }

    /// Engines created for one family, oldest first.
    #[must_use]
    pub fn engines_for(&self, family: PipelineFamily) -> Vec<Arc<MockEngine>> {
        self.lock()
            .iter()
            .filter(|(f, _)| *f == family)
            .map(|(_, engine)| Arc::clone(engine))
            .collect()
    }

    /// The most recently created engine.
    #[must_use]
    pub fn latest(&self) -> Option<Arc<MockEngine>> {
        self.lock().last().map(|(_, engine)| Arc::clone(engine))
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(&self, family: PipelineFamily) -> Arc<dyn ModelEngine> {
        let mut engines = self.lock();
        let engine = Arc::new(MockEngine::new(format!("mock-{family}-{}", engines.len())));
        engines.push((family, Arc::clone(&engine)));
        engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaic_weights::QuantizationPlan;

    fn weights(kind: ComponentKind) -> ComponentWeights {
        ComponentWeights {
            kind,
            parameters: Vec::new(),
            quantization: QuantizationPlan::unquantized(),
            unmapped: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_engine_encode_requires_text_encoder() {
        let engine = MockEngine::new("mock");
        assert!(engine.encode(EncodeRequest::Text { prompt: "cat" }).await.is_err());

        engine.load_weights(weights(ComponentKind::TextEncoder)).await.unwrap();
        let first = engine.encode(EncodeRequest::Text { prompt: "cat" }).await.unwrap();
        let second = engine.encode(EncodeRequest::Text { prompt: "cat" }).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.shape, vec![3, 1]);

        engine.release_encoders().await.unwrap();
        assert!(engine.encode(EncodeRequest::Text { prompt: "cat" }).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_engine_sample_stops_when_callback_declines() {
        let engine = MockEngine::new("mock");
        let pair = ConditioningPair {
            positive: Conditioning::new(vec![1, 1], vec![255.0]),
            negative: None,
        };
        let parameters = SamplingParameters { steps: 10, width: 2, height: 2, ..Default::default() };

        let stop_after_three = |step: SamplingStep| step.step < 2;
        let pixels = engine.sample(&pair, &parameters, &stop_after_three).await.unwrap();

        assert_eq!(pixels.shape(), [1, 2, 2, 3]);
        assert_eq!(engine.calls(), vec![MockCall::Sample { steps_run: 3 }]);
    }

    #[tokio::test]
    async fn test_mock_engine_injected_failure_is_one_shot() {
        let engine = MockEngine::new("mock");
        engine.load_weights(weights(ComponentKind::TextEncoder)).await.unwrap();
        engine.fail_next_encode(EngineError::OutOfMemory("device".to_string()));

        assert!(matches!(
            engine.encode(EncodeRequest::Text { prompt: "a" }).await,
            Err(EngineError::OutOfMemory(_))
        ));
        assert!(engine.encode(EncodeRequest::Text { prompt: "a" }).await.is_ok());
    }

    #[tokio::test]
    async fn test_encode_hook_may_call_back_into_engine() {
        let engine = Arc::new(MockEngine::new("mock"));
        engine.load_weights(weights(ComponentKind::TextEncoder)).await.unwrap();

        let inner = Arc::clone(&engine);
        let seen = Arc::new(Mutex::new(0));
        let seen_in_hook = Arc::clone(&seen);
        engine.on_encode(move |_| {
            *seen_in_hook.lock().unwrap() = inner.encode_calls();
            inner.set_cache_limit(7);
        });

        engine.encode(EncodeRequest::Text { prompt: "loop" }).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(engine.cache_limit(), Some(7));
    }

    #[tokio::test]
    async fn test_load_weights_decodes_float_parameters() {
        use mosaic_weights::{DType, KeyTransform, LoadedParameter, ParameterData};

        let engine = MockEngine::new("mock");
        let bytes: Vec<u8> = [1.0f32, 2.0, 3.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut component = weights(ComponentKind::Vae);
        component.parameters.push(LoadedParameter {
            module_path: "decoder.conv_in.bias".to_string(),
            dtype: DType::F32,
            shape: vec![3],
            transform: KeyTransform::None,
            prepacked: false,
            data: ParameterData::Owned(bytes.into()),
        });
        component.parameters.push(LoadedParameter {
            module_path: "decoder.count".to_string(),
            dtype: DType::U8,
            shape: vec![1],
            transform: KeyTransform::None,
            prepacked: false,
            data: ParameterData::Owned(vec![9u8].into()),
        });

        engine.load_weights(component).await.unwrap();
        assert_eq!(engine.decoded_values(), 3);
    }

    #[test]
    fn test_factory_tracks_engines() {
        let factory = MockEngineFactory::new();
        let engine = factory.create(PipelineFamily::Layered);
        factory.create(PipelineFamily::Image);

        assert_eq!(engine.engine_id(), "mock-layered-0");
        assert_eq!(factory.engines().len(), 2);
        assert_eq!(factory.engines_for(PipelineFamily::Image).len(), 1);
        assert_eq!(factory.latest().map(|e| e.engine_id().to_string()), Some("mock-image-1".to_string()));
    }
}
