//! Snapshot component loading.
//!
//! A snapshot keeps each component in its own directory:
//!
//! ```text
//! <root>/quantization_manifest.json      (optional)
//! <root>/<component>/config.json
//! <root>/<component>/*.safetensors
//! ```
//!
//! [`load_component`] opens every archive of a component, maps its keys,
//! applies layout transforms, resolves quantization and swaps in prepacked
//! layers. Only the permuted kernels are copied; everything else stays a view
//! into the memory-mapped archives.

use mosaic_abstraction::ComponentKind;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::archive::{TensorArchive, TensorRecord};
use crate::dtype::DType;
use crate::error::{KeyMappingError, WeightsError, WeightsResult};
use crate::layout::{decode_to_f32, permute_nchw_to_nhwc};
use crate::mapper::{KeyTransform, WeightKeyMapper};
use crate::quantization::{LayerQuantization, QuantizationPlan, QuantizationPlanResolver};

pub const CONFIG_FILE: &str = "config.json";
pub const MANIFEST_FILE: &str = "quantization_manifest.json";
pub const ARCHIVE_EXTENSION: &str = "safetensors";

/// Filesystem layout of a model snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotLayout {
    root: PathBuf,
}

impl SnapshotLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn component_dir(&self, kind: ComponentKind) -> PathBuf {
        self.root.join(kind.directory())
    }

    #[must_use]
    pub fn config_path(&self, kind: ComponentKind) -> PathBuf {
        self.component_dir(kind).join(CONFIG_FILE)
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Archives of a component, sorted by file name.
    pub fn archive_paths(&self, kind: ComponentKind) -> WeightsResult<Vec<PathBuf>> {
        let dir = self.component_dir(kind);
        let missing = || WeightsError::MissingArchives {
            component: kind.to_string(),
            path: dir.display().to_string(),
        };
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == ARCHIVE_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();
        if paths.is_empty() {
            return Err(missing());
        }
        Ok(paths)
    }
}

/// Bytes backing a loaded parameter.
#[derive(Debug, Clone)]
pub enum ParameterData {
    /// View into a memory-mapped archive.
    Mapped {
        archive: Arc<TensorArchive>,
        record: TensorRecord,
    },
    /// Bytes produced by a layout transform.
    Owned(Arc<[u8]>),
}

impl ParameterData {
    pub fn bytes(&self) -> WeightsResult<&[u8]> {
        match self {
            Self::Mapped { archive, record } => archive.read_bytes(record),
            Self::Owned(bytes) => Ok(&bytes[..]),
        }
    }
}

/// A parameter ready to be assigned to the engine's module tree.
#[derive(Debug, Clone)]
pub struct LoadedParameter {
    pub module_path: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub transform: KeyTransform,
    /// Whether the bytes come from a prepacked quantized file.
    pub prepacked: bool,
    pub data: ParameterData,
}

impl LoadedParameter {
    /// Decode a floating-point parameter to `f32` values.
    pub fn to_f32(&self) -> WeightsResult<Vec<f32>> {
        decode_to_f32(self.data.bytes()?, self.dtype)
    }
}

/// Every parameter of one component plus its quantization plan.
#[derive(Debug, Clone)]
pub struct ComponentWeights {
    pub kind: ComponentKind,
    pub parameters: Vec<LoadedParameter>,
    pub quantization: QuantizationPlan,
    /// Keys that could not be mapped; the load went ahead without them.
    pub unmapped: Vec<KeyMappingError>,
}

impl ComponentWeights {
    #[must_use]
    pub fn get(&self, module_path: &str) -> Option<&LoadedParameter> {
        self.parameters.iter().find(|p| p.module_path == module_path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Total size of all parameters in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.parameters
            .iter()
            .map(|p| p.shape.iter().product::<usize>() * p.dtype.size())
            .sum()
    }

    /// Quantization of the layer owning a parameter (`a.b.weight` -> layer `a.b`).
    #[must_use]
    pub fn layer_quantization(&self, module_path: &str) -> LayerQuantization<'_> {
        let layer = module_path.rsplit_once('.').map_or(module_path, |(layer, _)| layer);
        self.quantization.lookup(layer)
    }
}

/// Parameters a component cannot run without.
#[must_use]
pub fn required_parameters(kind: ComponentKind) -> &'static [&'static str] {
    match kind {
        ComponentKind::Transformer | ComponentKind::LayeredTransformer => {
            &["img_in.weight", "proj_out.weight"]
        }
        ComponentKind::Vae => &["decoder.conv_in.weight"],
        ComponentKind::TextEncoder => &["language_model.embed_tokens.weight"],
    }
}

/// Load one component of a snapshot.
pub fn load_component(
    layout: &SnapshotLayout,
    kind: ComponentKind,
    mapper: &WeightKeyMapper,
) -> WeightsResult<ComponentWeights> {
    let mut parameters: Vec<LoadedParameter> = Vec::new();
    let mut unmapped = Vec::new();

    for path in layout.archive_paths(kind)? {
        let archive = Arc::new(TensorArchive::open(&path)?);
        let plan = mapper.plan(&archive, kind);
        unmapped.extend(plan.failures);

        for assignment in plan.assignments {
            let record = assignment.source;
            let parameter = match assignment.transform {
                KeyTransform::TransposeConvNchwToNhwc if !record.dtype.is_float() => {
                    unmapped.push(KeyMappingError::new(
                        &record.name,
                        format!("convolution kernel has non-float dtype {}", record.dtype),
                    ));
                    continue;
                }
                KeyTransform::TransposeConvNchwToNhwc => {
                    let bytes = archive.read_bytes(&record)?;
                    match permute_nchw_to_nhwc(&record.name, bytes, &record.shape, record.dtype.size()) {
                        Ok((permuted, shape)) => LoadedParameter {
                            module_path: assignment.module_path,
                            dtype: record.dtype,
                            shape,
                            transform: assignment.transform,
                            prepacked: false,
                            data: ParameterData::Owned(permuted.into()),
                        },
                        Err(e) => {
                            unmapped.push(KeyMappingError::new(&record.name, e.to_string()));
                            continue;
                        }
                    }
                }
                KeyTransform::None | KeyTransform::RenameOnly => LoadedParameter {
                    module_path: assignment.module_path,
                    dtype: record.dtype,
                    shape: record.shape.clone(),
                    transform: assignment.transform,
                    prepacked: false,
                    data: ParameterData::Mapped { archive: Arc::clone(&archive), record },
                },
            };
            parameters.push(parameter);
        }
    }

    let quantization = match QuantizationPlanResolver::new(kind.directory())
        .resolve(&layout.config_path(kind), Some(&layout.manifest_path()))
    {
        Ok(plan) => plan,
        Err(WeightsError::NoQuantization(_)) => QuantizationPlan::unquantized(),
        Err(e) => return Err(e),
    };

    swap_in_prepacked(&mut parameters, &quantization)?;

    let present: HashSet<&str> = parameters.iter().map(|p| p.module_path.as_str()).collect();
    let missing: Vec<String> = required_parameters(kind)
        .iter()
        .filter(|name| !present.contains(*name))
        .map(ToString::to_string)
        .collect();

    if !unmapped.is_empty() {
        warn!(
            component = %kind,
            count = unmapped.len(),
            keys = ?unmapped.iter().map(|f| f.key.as_str()).collect::<Vec<_>>(),
            "Skipped unmapped checkpoint keys"
        );
    }
    if !missing.is_empty() {
        return Err(WeightsError::MissingRequiredKeys { component: kind.to_string(), missing, unmapped });
    }

    let weights = ComponentWeights { kind, parameters, quantization, unmapped };
    info!(
        component = %kind,
        root = %layout.root().display(),
        parameters = weights.len(),
        bytes = weights.total_bytes(),
        quantization = %weights.quantization.descriptor(),
        "Loaded component weights"
    );
    Ok(weights)
}

/// Replace the float tensors of prepacked layers with the tensors of their quantized file.
fn swap_in_prepacked(parameters: &mut Vec<LoadedParameter>, plan: &QuantizationPlan) -> WeightsResult<()> {
    let mut layers: Vec<_> = plan.prepacked_layers().iter().collect();
    layers.sort_by(|a, b| a.0.cmp(b.0));

    for (layer, prepacked) in layers {
        let archive = Arc::new(TensorArchive::open(&prepacked.quantized_file)?);
        let prefix = format!("{layer}.");
        parameters.retain(|p| !p.module_path.starts_with(&prefix));

        for record in archive.tensors() {
            parameters.push(LoadedParameter {
                module_path: format!("{prefix}{}", record.name),
                dtype: record.dtype,
                shape: record.shape.clone(),
                transform: KeyTransform::None,
                prepacked: true,
                data: ParameterData::Mapped { archive: Arc::clone(&archive), record: record.clone() },
            });
        }
    }
    Ok(())
}
