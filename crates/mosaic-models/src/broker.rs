//! Arbiter of which pipeline family is resident.
//!
//! Layered and image pipelines never coexist. A request reads and maps the new
//! snapshot first, then unloads the resident pipeline, then hands the weights
//! to a fresh engine: a snapshot that fails to parse leaves the resident
//! session untouched, and at most one engine holds weights at a time.
//!
//! The conditioning caches belong to the broker, so switching families does
//! not discard embeddings computed for the same model revision.

use mosaic_abstraction::{PipelineFamily, PipelineIdentity};
use mosaic_weights::{ComponentWeights, SnapshotLayout, WeightKeyMapper};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::ConditioningCaches;
use crate::config::{BrokerConfig, SessionConfig};
use crate::engine::EngineFactory;
use crate::error::Result;
use crate::resource::ResourceCachePolicy;
use crate::session::{ImageSession, LayeredSession, SessionCore, load_components};

/// What a resident session was created from. Equal requests reuse the session.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionRequest {
    path: PathBuf,
    identity: PipelineIdentity,
    config: SessionConfig,
}

struct Resident<S> {
    request: SessionRequest,
    session: Arc<S>,
}

enum ResidentPipelineState {
    None,
    Layered(Resident<LayeredSession>),
    Image(Resident<ImageSession>),
}

struct BrokerState {
    resident: ResidentPipelineState,
    caches: Arc<ConditioningCaches>,
}

impl BrokerState {
    /// The shared caches, rebuilt when a request asks for another capacity.
    fn caches_for(&mut self, config: &SessionConfig) -> Arc<ConditioningCaches> {
        if self.caches.capacity() != config.max_cached_embeddings {
            info!(
                from = self.caches.capacity(),
                to = config.max_cached_embeddings,
                "Resizing conditioning caches"
            );
            self.caches = Arc::new(ConditioningCaches::new(config.max_cached_embeddings));
        }
        Arc::clone(&self.caches)
    }
}

impl ResidentPipelineState {
    const fn family(&self) -> Option<PipelineFamily> {
        match self {
            Self::None => None,
            Self::Layered(_) => Some(PipelineFamily::Layered),
            Self::Image(_) => Some(PipelineFamily::Image),
        }
    }
}

/// Creates, hands out and unloads pipeline sessions.
///
/// All requests and unloads are serialized in arrival order.
pub struct ModelSessionBroker {
    config: BrokerConfig,
    factory: Arc<dyn EngineFactory>,
    mapper: WeightKeyMapper,
    state: Mutex<BrokerState>,
}

impl ModelSessionBroker {
    /// Create a broker with nothing resident.
    ///
    /// # Errors
    /// Returns `SessionError::Config` if the configuration is invalid.
    pub fn new(config: BrokerConfig, factory: Arc<dyn EngineFactory>) -> Result<Self> {
        config.validate()?;
        let caches = Arc::new(ConditioningCaches::new(config.session.max_cached_embeddings));
        Ok(Self {
            mapper: WeightKeyMapper::new(config.channel_order),
            config,
            factory,
            state: Mutex::new(BrokerState { resident: ResidentPipelineState::None, caches }),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The family currently resident, if any.
    pub async fn resident_family(&self) -> Option<PipelineFamily> {
        self.state.lock().await.resident.family()
    }

    /// Drop cached conditioning of every revision of a model. Returns the
    /// number of entries removed.
    pub async fn invalidate_model(&self, model_id: &str) -> usize {
        let state = self.state.lock().await;
        let removed = state.caches.invalidate_model(model_id);
        debug!(model_id, removed, "Invalidated cached conditioning");
        removed
    }

    /// Get a layered session for a snapshot, loading it if needed.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, the snapshot cannot be
    /// loaded, or the engine rejects the weights. A snapshot that cannot be read
    /// leaves the resident session in place; an engine rejection happens after
    /// the unload and leaves nothing resident.
    pub async fn request_layered_session(
        &self,
        path: impl AsRef<Path>,
        identity: PipelineIdentity,
        config: SessionConfig,
    ) -> Result<Arc<LayeredSession>> {
        config.validate()?;
        let request = SessionRequest { path: path.as_ref().to_path_buf(), identity, config };

        let mut state = self.state.lock().await;
        if let ResidentPipelineState::Layered(resident) = &state.resident {
            if resident.request == request {
                debug!(model_id = %request.identity.model_id, "Reusing resident layered session");
                return Ok(Arc::clone(&resident.session));
            }
        }

        let (layout, components) = self.read_snapshot(PipelineFamily::Layered, &request).await?;
        self.unload_resident(&mut state.resident).await;
        let caches = state.caches_for(&request.config);
        let core = self.start_session(PipelineFamily::Layered, &request, layout, components, caches).await?;
        let session = Arc::new(LayeredSession::new(core));
        state.resident = ResidentPipelineState::Layered(Resident { request, session: Arc::clone(&session) });
        Ok(session)
    }

    /// Get an image session for a snapshot, loading it if needed.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, the snapshot cannot be
    /// loaded, or the engine rejects the weights. Failures leave the resident
    /// state as described for [`Self::request_layered_session`].
    pub async fn request_image_session(
        &self,
        path: impl AsRef<Path>,
        identity: PipelineIdentity,
        config: SessionConfig,
    ) -> Result<Arc<ImageSession>> {
        config.validate()?;
        let request = SessionRequest { path: path.as_ref().to_path_buf(), identity, config };

        let mut state = self.state.lock().await;
        if let ResidentPipelineState::Image(resident) = &state.resident {
            if resident.request == request {
                debug!(model_id = %request.identity.model_id, "Reusing resident image session");
                return Ok(Arc::clone(&resident.session));
            }
        }

        let (layout, components) = self.read_snapshot(PipelineFamily::Image, &request).await?;
        self.unload_resident(&mut state.resident).await;
        let caches = state.caches_for(&request.config);
        let core = self.start_session(PipelineFamily::Image, &request, layout, components, caches).await?;
        let session = Arc::new(ImageSession::new(core));
        state.resident = ResidentPipelineState::Image(Resident { request, session: Arc::clone(&session) });
        Ok(session)
    }

    /// Unload a family. Does nothing if it is not resident.
    pub async fn unload(&self, family: PipelineFamily) {
        let mut state = self.state.lock().await;
        if state.resident.family() == Some(family) {
            self.unload_resident(&mut state.resident).await;
        } else {
            debug!(%family, "Nothing to unload");
        }
    }

    /// Unload whatever is resident.
    pub async fn unload_all(&self) {
        let mut state = self.state.lock().await;
        self.unload_resident(&mut state.resident).await;
    }

    fn policy_for(&self, config: &SessionConfig) -> ResourceCachePolicy {
        ResourceCachePolicy::new(self.config.resource_preset)
            .with_limit(self.config.compute_cache_limit)
            .with_limit(config.compute_cache_limit)
    }

    async fn unload_resident(&self, state: &mut ResidentPipelineState) {
        match std::mem::replace(state, ResidentPipelineState::None) {
            ResidentPipelineState::None => {}
            ResidentPipelineState::Layered(resident) => {
                self.shutdown(resident.session.core(), &resident.request).await;
            }
            ResidentPipelineState::Image(resident) => {
                self.shutdown(resident.session.core(), &resident.request).await;
            }
        }
    }

    async fn shutdown(&self, core: &SessionCore, request: &SessionRequest) {
        if let Some(engine) = core.shutdown().await {
            self.policy_for(&request.config).clear(engine.as_ref());
            info!(
                family = %core.family(),
                model_id = %request.identity.model_id,
                "Unloaded pipeline"
            );
        }
    }

    /// Parse headers, map keys and resolve quantization without touching the
    /// resident session.
    async fn read_snapshot(
        &self,
        family: PipelineFamily,
        request: &SessionRequest,
    ) -> Result<(SnapshotLayout, Vec<ComponentWeights>)> {
        info!(
            %family,
            model_id = %request.identity.model_id,
            revision = %request.identity.revision,
            path = %request.path.display(),
            "Loading pipeline"
        );

        let layout = SnapshotLayout::new(&request.path);
        let components = load_components(layout.clone(), family.components().to_vec(), self.mapper)
            .await
            .inspect_err(|e| warn!(%family, error = %e, "Snapshot unreadable, keeping resident pipeline"))?;
        Ok((layout, components))
    }

    async fn start_session(
        &self,
        family: PipelineFamily,
        request: &SessionRequest,
        layout: SnapshotLayout,
        components: Vec<ComponentWeights>,
        caches: Arc<ConditioningCaches>,
    ) -> Result<SessionCore> {
        let engine = self.factory.create(family);
        let mut quantization = None;
        for component in components {
            if component.kind.is_transformer() {
                quantization = Some(component.quantization.descriptor());
            }
            if let Err(e) = engine.load_weights(component).await {
                warn!(engine_id = engine.engine_id(), error = %e, "Engine rejected weights");
                engine.unload().await;
                return Err(e.into());
            }
        }

        self.policy_for(&request.config).apply(engine.as_ref());
        let quantization = quantization.unwrap_or_else(|| "unquantized".to_string());
        info!(%family, engine_id = engine.engine_id(), %quantization, "Pipeline resident");

        Ok(SessionCore::new(
            family,
            request.identity.clone(),
            layout,
            self.mapper,
            request.config.clone(),
            quantization,
            caches,
            engine,
        ))
    }
}

impl std::fmt::Debug for ModelSessionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSessionBroker").field("config", &self.config).finish_non_exhaustive()
    }
}

