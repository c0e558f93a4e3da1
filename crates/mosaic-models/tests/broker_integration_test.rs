//! Integration tests for pipeline residency and reload behavior.

mod common;

use common::{broker, identity, snapshot};
use mosaic_abstraction::{ComponentKind, PipelineFamily, PipelineIdentity};
use mosaic_models::{
    BrokerConfig, CachePreset, MockCall, MockEngineFactory, ModelSessionBroker, SessionConfig,
    SessionError,
};
use mosaic_weights::WeightsError;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_same_request_returns_same_session() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let (broker, factory) = broker()?;

    let first = broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await?;
    let second = broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await?;

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(factory.engines().len(), 1);
    assert_eq!(broker.resident_family().await, Some(PipelineFamily::Image));
    Ok(())
}

#[tokio::test]
async fn test_load_pushes_every_component_and_applies_policy() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let (broker, factory) = broker()?;

    let session = broker.request_layered_session(dir.path(), identity(), SessionConfig::default()).await?;
    let engine = factory.latest().unwrap();

    let loaded: Vec<ComponentKind> = engine
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            MockCall::LoadWeights(kind) => Some(kind),
            _ => None,
        })
        .collect();
    assert_eq!(loaded, PipelineFamily::Layered.components().to_vec());
    assert_eq!(engine.cache_limit(), Some(CachePreset::Balanced.limit_bytes()));
    assert_eq!(session.quantization(), "q8g32-affine");
    Ok(())
}

#[tokio::test]
async fn test_session_limit_overrides_broker_preset() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let factory = Arc::new(MockEngineFactory::new());
    let config = BrokerConfig { resource_preset: CachePreset::HighMemory, ..BrokerConfig::default() };
    let broker = ModelSessionBroker::new(config, factory.clone())?;

    let session_config = SessionConfig { compute_cache_limit: Some(64 << 20), ..SessionConfig::default() };
    broker.request_image_session(dir.path(), identity(), session_config).await?;

    assert_eq!(factory.latest().unwrap().cache_limit(), Some(64 << 20));
    Ok(())
}

#[tokio::test]
async fn test_switching_family_unloads_and_forces_reload() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let (broker, factory) = broker()?;

    let layered = broker.request_layered_session(dir.path(), identity(), SessionConfig::default()).await?;
    let layered_engine = factory.latest().unwrap();

    broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await?;
    assert_eq!(broker.resident_family().await, Some(PipelineFamily::Image));
    assert!(layered_engine.is_unloaded());
    assert_eq!(layered_engine.cache_clears(), 1);
    assert!(!layered.is_loaded().await);

    let reloaded = broker.request_layered_session(dir.path(), identity(), SessionConfig::default()).await?;
    assert!(!Arc::ptr_eq(&layered, &reloaded));
    assert!(reloaded.is_loaded().await);
    assert_eq!(factory.engines_for(PipelineFamily::Layered).len(), 2);
    assert!(factory.engines_for(PipelineFamily::Image)[0].is_unloaded());
    Ok(())
}

#[tokio::test]
async fn test_stale_handle_reports_no_session() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let (broker, _factory) = broker()?;
    let cancel = CancellationToken::new();

    let image = broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await?;
    broker.request_layered_session(dir.path(), identity(), SessionConfig::default()).await?;

    let result = image.encode("a red fox", None, &cancel).await;
    assert!(matches!(result, Err(SessionError::NoSessionLoaded(PipelineFamily::Image))));
    assert!(matches!(
        image.apply_lora(Path::new("style.safetensors"), 1.0).await,
        Err(SessionError::NoSessionLoaded(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_different_identity_reloads_same_family() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let (broker, factory) = broker()?;

    let main = broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await?;
    let edit = broker
        .request_image_session(dir.path(), PipelineIdentity::new("Qwen/Qwen-Image-Edit"), SessionConfig::default())
        .await?;

    assert!(!Arc::ptr_eq(&main, &edit));
    assert!(!main.is_loaded().await);
    assert_eq!(factory.engines().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_unload_is_noop_when_not_resident() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let (broker, factory) = broker()?;

    broker.unload(PipelineFamily::Image).await;
    broker.unload_all().await;
    assert_eq!(broker.resident_family().await, None);

    broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await?;
    broker.unload(PipelineFamily::Layered).await;
    assert_eq!(broker.resident_family().await, Some(PipelineFamily::Image));

    broker.unload(PipelineFamily::Image).await;
    assert_eq!(broker.resident_family().await, None);
    assert!(factory.latest().unwrap().is_unloaded());
    Ok(())
}

#[tokio::test]
async fn test_unload_clears_applied_lora() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let (broker, factory) = broker()?;

    let session = broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await?;
    session.apply_lora(Path::new("style.safetensors"), 0.8).await?;
    broker.unload_all().await;

    let calls = factory.latest().unwrap().calls();
    let clear = calls.iter().position(|c| *c == MockCall::ClearLora).unwrap();
    let unload = calls.iter().position(|c| *c == MockCall::Unload).unwrap();
    assert!(clear < unload);
    Ok(())
}

#[tokio::test]
async fn test_missing_snapshot_leaves_nothing_resident() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let (broker, factory) = broker()?;

    let result = broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await;

    assert!(matches!(
        result,
        Err(SessionError::Weights(WeightsError::MissingArchives { .. }))
    ));
    assert_eq!(broker.resident_family().await, None);
    assert!(factory.engines().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_invalid_session_config_is_rejected() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let (broker, _factory) = broker()?;

    let config = SessionConfig { max_cached_embeddings: 0, ..SessionConfig::default() };
    let result = broker.request_layered_session(dir.path(), identity(), config).await;

    assert!(matches!(result, Err(SessionError::Config(_))));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_requests_are_serialized() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let (broker, factory) = broker()?;
    let broker = Arc::new(broker);

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let broker = Arc::clone(&broker);
            let path = dir.path().to_path_buf();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    broker.request_layered_session(&path, identity(), SessionConfig::default()).await.map(|_| ())
                } else {
                    broker.request_image_session(&path, identity(), SessionConfig::default()).await.map(|_| ())
                }
            })
        })
        .collect();
    for task in tasks {
        task.await??;
    }

    // Every engine but the resident one was unloaded before the next load.
    let engines = factory.engines();
    let resident = engines.iter().filter(|engine| !engine.is_unloaded()).count();
    assert_eq!(resident, 1);
    Ok(())
}

#[tokio::test]
async fn test_unreadable_snapshot_keeps_resident_session() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let empty = tempfile::TempDir::new()?;
    let (broker, factory) = broker()?;
    let cancel = CancellationToken::new();

    let first = broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await?;
    let result = broker.request_image_session(empty.path(), identity(), SessionConfig::default()).await;

    assert!(matches!(
        result,
        Err(SessionError::Weights(WeightsError::MissingArchives { .. }))
    ));
    assert!(first.is_loaded().await);
    assert_eq!(broker.resident_family().await, Some(PipelineFamily::Image));
    assert!(first.encode("a red fox", None, &cancel).await.is_ok());
    assert_eq!(factory.engines().len(), 1);
    assert!(!factory.latest().unwrap().is_unloaded());
    Ok(())
}

#[tokio::test]
async fn test_unreadable_snapshot_does_not_switch_family() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let empty = tempfile::TempDir::new()?;
    let (broker, factory) = broker()?;

    let image = broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await?;
    let result = broker.request_layered_session(empty.path(), identity(), SessionConfig::default()).await;

    assert!(matches!(result, Err(SessionError::Weights(_))));
    assert!(image.is_loaded().await);
    assert_eq!(broker.resident_family().await, Some(PipelineFamily::Image));
    assert!(factory.engines_for(PipelineFamily::Layered).is_empty());

    // The resident request is still recognized and reused.
    let again = broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await?;
    assert!(Arc::ptr_eq(&image, &again));
    Ok(())
}

#[tokio::test]
async fn test_conditioning_survives_family_switch() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let (broker, factory) = broker()?;
    let cancel = CancellationToken::new();

    let image = broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await?;
    image.encode("a lighthouse at dusk", None, &cancel).await?;
    assert_eq!(factory.latest().unwrap().encode_calls(), 1);

    let layered = broker.request_layered_session(dir.path(), identity(), SessionConfig::default()).await?;
    let layered_engine = factory.latest().unwrap();
    assert!(layered.prompt_cache().contains(&layered.prompt_key("a lighthouse at dusk")));

    layered.encode("a lighthouse at dusk", None, &cancel).await?;
    assert_eq!(layered_engine.encode_calls(), 0);
    assert!(layered_engine.decoded_values() > 0);
    Ok(())
}

#[tokio::test]
async fn test_invalidate_model_drops_every_revision() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let (broker, factory) = broker()?;
    let cancel = CancellationToken::new();

    let main = broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await?;
    main.encode("a meadow", None, &cancel).await?;
    let pinned = PipelineIdentity::new("Qwen/Qwen-Image").with_revision("v2");
    let revised = broker.request_image_session(dir.path(), pinned, SessionConfig::default()).await?;
    revised.encode("a meadow", None, &cancel).await?;
    assert_eq!(revised.prompt_cache().len(), 2);

    assert_eq!(broker.invalidate_model("Qwen/Qwen-Image-Edit").await, 0);
    assert_eq!(broker.invalidate_model("Qwen/Qwen-Image").await, 2);
    assert!(revised.prompt_cache().is_empty());

    revised.encode("a meadow", None, &cancel).await?;
    assert_eq!(factory.latest().unwrap().encode_calls(), 2);
    Ok(())
}

#[tokio::test]
async fn test_capacity_change_rebuilds_caches() -> anyhow::Result<()> {
    let dir = snapshot()?;
    let (broker, _factory) = broker()?;
    let cancel = CancellationToken::new();

    let first = broker.request_image_session(dir.path(), identity(), SessionConfig::default()).await?;
    first.encode("a meadow", None, &cancel).await?;

    let config = SessionConfig { max_cached_embeddings: 3, ..SessionConfig::default() };
    let resized = broker.request_image_session(dir.path(), identity(), config).await?;
    assert_eq!(resized.prompt_cache().capacity(), 3);
    assert!(resized.prompt_cache().is_empty());
    Ok(())
}
