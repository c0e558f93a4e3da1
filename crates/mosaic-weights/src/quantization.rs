//! Quantization plan resolution.
//!
//! A component's `config.json` may declare a `quantization_config` block that
//! applies to every layer. A snapshot may also ship a manifest listing layers
//! with their own spec, some of which are already quantized on disk. The
//! resolver merges both into a [`QuantizationPlan`] with the precedence
//! prepacked > per-layer override > component default > unquantized.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::archive::TensorArchive;
use crate::error::{WeightsError, WeightsResult};
use crate::numeric::{deserialize_opt_integral, deserialize_opt_integral_list, integral};

/// Group size used when a config names the bit width only.
pub const DEFAULT_GROUP_SIZE: u32 = 64;

/// How quantized values map back to floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationMode {
    /// Per-group scale and bias.
    #[default]
    Affine,
    /// Per-group scale around zero.
    Symmetric,
}

impl FromStr for QuantizationMode {
    type Err = WeightsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "affine" | "asymmetric" => Ok(Self::Affine),
            "symmetric" | "sym" => Ok(Self::Symmetric),
            other => Err(WeightsError::InvalidQuantization(format!("unknown mode '{other}'"))),
        }
    }
}

impl fmt::Display for QuantizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Affine => f.write_str("affine"),
            Self::Symmetric => f.write_str("symmetric"),
        }
    }
}

/// Bit width, group size and mode of a quantized layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuantizationSpec {
    bits: u8,
    group_size: u32,
    mode: QuantizationMode,
}

impl QuantizationSpec {
    /// Create a spec. Only 4 and 8 bit widths and positive group sizes are valid.
    pub fn new(bits: u8, group_size: u32, mode: QuantizationMode) -> WeightsResult<Self> {
        if !matches!(bits, 4 | 8) {
            return Err(WeightsError::InvalidQuantization(format!(
                "bits must be 4 or 8, got {bits}"
            )));
        }
        if group_size == 0 {
            return Err(WeightsError::InvalidQuantization("group_size must be positive".to_string()));
        }
        Ok(Self { bits, group_size, mode })
    }

    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.bits
    }

    #[must_use]
    pub const fn group_size(&self) -> u32 {
        self.group_size
    }

    #[must_use]
    pub const fn mode(&self) -> QuantizationMode {
        self.mode
    }
}

impl fmt::Display for QuantizationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}g{}-{}", self.bits, self.group_size, self.mode)
    }
}

/// A layer stored already quantized, loaded verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepackedLayer {
    pub quantized_file: PathBuf,
    pub spec: QuantizationSpec,
}

/// How a single layer is quantized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerQuantization<'a> {
    Unquantized,
    /// Quantize at load time.
    Runtime(QuantizationSpec),
    /// Load pre-quantized data.
    Prepacked(&'a PrepackedLayer),
}

/// Resolved quantization table for one component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuantizationPlan {
    default: Option<QuantizationSpec>,
    overrides: HashMap<String, QuantizationSpec>,
    prepacked: HashMap<String, PrepackedLayer>,
}

impl QuantizationPlan {
    /// A plan that quantizes nothing.
    #[must_use]
    pub fn unquantized() -> Self {
        Self::default()
    }

    /// The component-wide default spec, if any.
    #[must_use]
    pub fn default_spec(&self) -> Option<QuantizationSpec> {
        self.default
    }

    /// Resolve a layer.
    #[must_use]
    pub fn lookup(&self, layer: &str) -> LayerQuantization<'_> {
        if let Some(prepacked) = self.prepacked.get(layer) {
            return LayerQuantization::Prepacked(prepacked);
        }
        match self.overrides.get(layer).copied().or(self.default) {
            Some(spec) => LayerQuantization::Runtime(spec),
            None => LayerQuantization::Unquantized,
        }
    }

    /// The spec a layer ends up with, regardless of whether it is prepacked.
    #[must_use]
    pub fn quantization(&self, layer: &str) -> Option<QuantizationSpec> {
        match self.lookup(layer) {
            LayerQuantization::Unquantized => None,
            LayerQuantization::Runtime(spec) => Some(spec),
            LayerQuantization::Prepacked(prepacked) => Some(prepacked.spec),
        }
    }

    #[must_use]
    pub fn prepacked_layers(&self) -> &HashMap<String, PrepackedLayer> {
        &self.prepacked
    }

    #[must_use]
    pub fn overrides(&self) -> &HashMap<String, QuantizationSpec> {
        &self.overrides
    }

    #[must_use]
    pub fn is_quantized(&self) -> bool {
        self.default.is_some() || !self.overrides.is_empty() || !self.prepacked.is_empty()
    }

    /// Stable description used to scope caches, e.g. `q8g64-affine`.
    #[must_use]
    pub fn descriptor(&self) -> String {
        let base = self.default.map_or_else(|| "unquantized".to_string(), |spec| spec.to_string());
        let layered = self.overrides.len().max(self.prepacked.len());
        if layered == 0 { base } else { format!("{base}+{layered}layers") }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawSpec {
    #[serde(default, deserialize_with = "deserialize_opt_integral")]
    bits: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_opt_integral")]
    group_size: Option<u64>,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ComponentConfigFile {
    #[serde(default, alias = "quantization")]
    quantization_config: Option<RawSpec>,
}

/// The optional `quantization_manifest.json` shipped with a snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct QuantizationManifest {
    #[serde(default)]
    pub version: Option<Value>,
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_integral")]
    pub group_size: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_opt_integral")]
    pub bits: Option<u64>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub layers: Vec<ManifestLayer>,
}

/// One layer entry of a [`QuantizationManifest`].
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestLayer {
    pub component: String,
    pub name: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_integral_list")]
    pub shape: Option<Vec<u64>>,
    #[serde(default, deserialize_with = "deserialize_opt_integral")]
    pub in_dim: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_opt_integral")]
    pub out_dim: Option<u64>,
    #[serde(default)]
    pub quant_file: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_integral")]
    pub group_size: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_opt_integral")]
    pub bits: Option<u64>,
    #[serde(default)]
    pub mode: Option<String>,
}

impl QuantizationManifest {
    /// Read a manifest; `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> WeightsResult<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Builds the [`QuantizationPlan`] of one component.
#[derive(Debug, Clone)]
pub struct QuantizationPlanResolver {
    component: String,
}

impl QuantizationPlanResolver {
    /// `component` is matched against the manifest's `component` field.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self { component: component.into() }
    }

    /// Resolve the plan from a component config and an optional manifest.
    ///
    /// Fails with [`WeightsError::NoQuantization`] when neither declares
    /// anything for this component.
    pub fn resolve(
        &self,
        config_path: &Path,
        manifest_path: Option<&Path>,
    ) -> WeightsResult<QuantizationPlan> {
        let default = read_component_default(config_path)?;
        let manifest = match manifest_path {
            Some(path) => QuantizationManifest::load(path)?,
            None => None,
        };
        let manifest_dir = manifest_path.and_then(Path::parent).unwrap_or_else(|| Path::new("."));

        let mut plan = QuantizationPlan { default, ..QuantizationPlan::default() };
        if let Some(manifest) = &manifest {
            self.merge_manifest(&mut plan, manifest, manifest_dir)?;
        }

        if !plan.is_quantized() {
            return Err(WeightsError::NoQuantization(self.component.clone()));
        }

        info!(
            component = %self.component,
            default = ?plan.default.map(|s| s.to_string()),
            overrides = plan.overrides.len(),
            prepacked = plan.prepacked.len(),
            "Resolved quantization plan"
        );
        Ok(plan)
    }

    fn merge_manifest(
        &self,
        plan: &mut QuantizationPlan,
        manifest: &QuantizationManifest,
        manifest_dir: &Path,
    ) -> WeightsResult<()> {
        let fallback = RawSpec {
            bits: manifest.bits,
            group_size: manifest.group_size,
            mode: manifest.mode.clone(),
        };

        for layer in manifest.layers.iter().filter(|l| l.component == self.component) {
            let raw = RawSpec {
                bits: layer.bits.or(fallback.bits),
                group_size: layer.group_size.or(fallback.group_size),
                mode: layer.mode.clone().or_else(|| fallback.mode.clone()),
            };
            let spec = if raw.bits.is_some() {
                spec_from_raw(&raw)?
            } else if let Some(default) = plan.default {
                default
            } else {
                return Err(WeightsError::InvalidQuantization(format!(
                    "manifest layer '{}' has no bit width and the component declares no default",
                    layer.name
                )));
            };

            if let Some(existing) = plan.overrides.insert(layer.name.clone(), spec) {
                if existing != spec {
                    return Err(WeightsError::QuantizationMismatch {
                        layer: layer.name.clone(),
                        expected: existing,
                        found: spec,
                    });
                }
            }

            if let Some(quant_file) = &layer.quant_file {
                let quantized_file = manifest_dir.join(quant_file);
                verify_prepacked_file(&layer.name, &quantized_file, spec)?;
                plan.prepacked.insert(layer.name.clone(), PrepackedLayer { quantized_file, spec });
            }
        }

        debug!(
            component = %self.component,
            snapshot = ?manifest.snapshot,
            layers = manifest.layers.len(),
            "Merged quantization manifest"
        );
        Ok(())
    }
}

fn read_component_default(config_path: &Path) -> WeightsResult<Option<QuantizationSpec>> {
    let bytes = match std::fs::read(config_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let config: ComponentConfigFile = serde_json::from_slice(&bytes)?;
    config.quantization_config.as_ref().map(spec_from_raw).transpose()
}

fn spec_from_raw(raw: &RawSpec) -> WeightsResult<QuantizationSpec> {
    let bits = raw
        .bits
        .ok_or_else(|| WeightsError::InvalidQuantization("missing bits".to_string()))?;
    let bits = u8::try_from(bits)
        .map_err(|_| WeightsError::InvalidQuantization(format!("bits {bits} out of range")))?;
    let group_size = raw.group_size.map_or(Ok(DEFAULT_GROUP_SIZE), |g| {
        u32::try_from(g).map_err(|_| WeightsError::InvalidQuantization(format!("group_size {g} out of range")))
    })?;
    let mode = raw.mode.as_deref().map_or(Ok(QuantizationMode::Affine), str::parse)?;
    QuantizationSpec::new(bits, group_size, mode)
}

/// Compare the spec a prepacked archive declares about itself with the manifest's.
fn verify_prepacked_file(layer: &str, path: &Path, expected: QuantizationSpec) -> WeightsResult<()> {
    if !path.exists() {
        debug!(layer, path = %path.display(), "Prepacked file not present yet, skipping verification");
        return Ok(());
    }
    let archive = TensorArchive::open(path)?;
    let metadata = archive.metadata();
    let numeric = |key: &str| {
        metadata
            .get(key)
            .and_then(|v| serde_json::from_str::<Value>(v).ok())
            .and_then(|v| integral(&v))
    };

    if metadata.get("bits").is_none() && metadata.get("group_size").is_none() {
        return Ok(());
    }
    let declared = RawSpec {
        bits: numeric("bits").or(Some(u64::from(expected.bits))),
        group_size: numeric("group_size").or(Some(u64::from(expected.group_size))),
        mode: metadata.get("mode").cloned().or_else(|| Some(expected.mode.to_string())),
    };
    let found = spec_from_raw(&declared)?;
    if found != expected {
        return Err(WeightsError::QuantizationMismatch { layer: layer.to_string(), expected, found });
    }
    Ok(())
}
