//! Shared helpers for mosaic-models integration tests.
//!
//! Snapshots are written to temporary directories with the smallest tensors
//! that satisfy every component's required parameters.

#![allow(dead_code)]

use mosaic_abstraction::{ComponentKind, PipelineIdentity};
use mosaic_models::{BrokerConfig, MockEngineFactory, ModelSessionBroker};
use mosaic_weights::{ArchiveTensor, DType, SnapshotLayout, write_archive};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn write_component(root: &Path, kind: ComponentKind, tensors: &[(&str, Vec<usize>)]) -> anyhow::Result<()> {
    let layout = SnapshotLayout::new(root);
    let dir = layout.component_dir(kind);
    std::fs::create_dir_all(&dir)?;

    let data: Vec<Vec<u8>> = tensors
        .iter()
        .map(|(_, shape)| f32_bytes(&vec![1.0; shape.iter().product()]))
        .collect();
    let views: Vec<ArchiveTensor<'_>> = tensors
        .iter()
        .zip(&data)
        .map(|((name, shape), data)| ArchiveTensor { name, dtype: DType::F32, shape, data })
        .collect();
    write_archive(&dir.join("model.safetensors"), &BTreeMap::new(), &views)?;
    Ok(())
}

/// Write a snapshot loadable by both families.
pub fn write_snapshot(root: &Path) -> anyhow::Result<()> {
    write_component(root, ComponentKind::TextEncoder, &[("model.embed_tokens.weight", vec![4, 2])])?;
    write_component(
        root,
        ComponentKind::Transformer,
        &[
            ("img_in.weight", vec![2, 2]),
            ("proj_out.weight", vec![2, 2]),
            ("transformer_blocks.0.img_mlp.linear1.weight", vec![2]),
        ],
    )?;
    write_component(root, ComponentKind::Vae, &[("decoder.conv_in.weight", vec![2, 1, 1, 2])])?;
    std::fs::write(
        SnapshotLayout::new(root).config_path(ComponentKind::Transformer),
        r#"{"quantization_config": {"bits": 8, "group_size": 32}}"#,
    )?;
    Ok(())
}

/// A temporary snapshot directory.
pub fn snapshot() -> anyhow::Result<TempDir> {
    let dir = TempDir::new()?;
    write_snapshot(dir.path())?;
    Ok(dir)
}

pub fn identity() -> PipelineIdentity {
    PipelineIdentity::new("Qwen/Qwen-Image")
}

/// Route library logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn broker() -> anyhow::Result<(ModelSessionBroker, Arc<MockEngineFactory>)> {
    init_tracing();
    let factory = Arc::new(MockEngineFactory::new());
    let broker = ModelSessionBroker::new(BrokerConfig::default(), factory.clone())?;
    Ok((broker, factory))
}
