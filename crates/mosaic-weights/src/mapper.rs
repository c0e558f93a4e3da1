//! Checkpoint key mapping.
//!
//! Translates flat checkpoint tensor names onto the module tree the engine
//! expects, and flags tensors that need a layout change on the way in.

use mosaic_abstraction::ComponentKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::archive::{TensorArchive, TensorRecord};
use crate::error::KeyMappingError;

/// Memory layout of convolution kernels expected by the numeric backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOrder {
    /// `[O, I, H, W]`, the checkpoint layout.
    First,
    /// `[O, H, W, I]`.
    #[default]
    Last,
}

/// Structural change required when assigning a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyTransform {
    /// The key and layout are used as-is.
    None,
    /// 4D kernel must be permuted to channel-last.
    TransposeConvNchwToNhwc,
    /// The key was renamed; the data is untouched.
    RenameOnly,
}

/// Destination of one checkpoint tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapping {
    pub module_path: String,
    pub transform: KeyTransform,
}

/// One planned parameter assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterAssignment {
    pub source: TensorRecord,
    pub module_path: String,
    pub transform: KeyTransform,
}

/// Mapping result for a whole archive.
#[derive(Debug, Clone, Default)]
pub struct ParameterPlan {
    pub assignments: Vec<ParameterAssignment>,
    pub failures: Vec<KeyMappingError>,
}

/// Maps checkpoint names to module paths. Holds no state besides its layout target.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightKeyMapper {
    channel_order: ChannelOrder,
}

impl WeightKeyMapper {
    #[must_use]
    pub const fn new(channel_order: ChannelOrder) -> Self {
        Self { channel_order }
    }

    #[must_use]
    pub const fn channel_order(&self) -> ChannelOrder {
        self.channel_order
    }

    /// Map a single flat tensor name.
    pub fn map_key(&self, flat_name: &str, kind: ComponentKind) -> Result<KeyMapping, KeyMappingError> {
        if flat_name.is_empty() {
            return Err(KeyMappingError::new(flat_name, "empty key"));
        }
        if flat_name.split('.').any(str::is_empty) {
            return Err(KeyMappingError::new(flat_name, "key has an empty path segment"));
        }

        let stripped = strip_prefixes(flat_name, kind);
        let mut segments: Vec<&str> = stripped.split('.').collect();

        let root = segments[0];
        if !known_roots(kind).contains(&root) {
            return Err(KeyMappingError::new(
                flat_name,
                format!("'{root}' is not a known {kind} module"),
            ));
        }
        if segments.len() < 2 {
            return Err(KeyMappingError::new(flat_name, "key does not name a parameter"));
        }

        rename_segments(&mut segments, kind);
        let module_path = segments.join(".");

        let transform = if self.channel_order == ChannelOrder::Last && is_conv_kernel(&segments, kind) {
            KeyTransform::TransposeConvNchwToNhwc
        } else if module_path != flat_name {
            KeyTransform::RenameOnly
        } else {
            KeyTransform::None
        };

        Ok(KeyMapping { module_path, transform })
    }

    /// Map every tensor of an archive, collecting failures instead of stopping at the first.
    pub fn plan(&self, archive: &TensorArchive, kind: ComponentKind) -> ParameterPlan {
        let mut plan = ParameterPlan::default();
        let mut seen = HashSet::new();

        for record in archive.tensors() {
            match self.map_key(&record.name, kind) {
                Ok(mapping) => {
                    if !seen.insert(mapping.module_path.clone()) {
                        plan.failures.push(KeyMappingError::new(
                            &record.name,
                            format!("'{}' is already assigned by another key", mapping.module_path),
                        ));
                        continue;
                    }
                    plan.assignments.push(ParameterAssignment {
                        source: record.clone(),
                        module_path: mapping.module_path,
                        transform: mapping.transform,
                    });
                }
                Err(failure) => plan.failures.push(failure),
            }
        }

        debug!(
            component = %kind,
            archive = %archive.path().display(),
            mapped = plan.assignments.len(),
            failed = plan.failures.len(),
            "Planned parameter assignments"
        );
        plan
    }
}

fn strip_prefixes(name: &str, kind: ComponentKind) -> String {
    let rules: &[(&str, &str)] = match kind {
        ComponentKind::Transformer | ComponentKind::LayeredTransformer => {
            &[("model.diffusion_model.", ""), ("transformer.", "")]
        }
        ComponentKind::Vae => &[("first_stage_model.", ""), ("vae.", "")],
        ComponentKind::TextEncoder => &[
            ("text_encoder.", ""),
            ("model.language_model.", "language_model."),
            ("model.visual.", "visual."),
            ("model.", "language_model."),
        ],
    };

    let mut current = name.to_string();
    for (prefix, replacement) in rules {
        if let Some(rest) = current.strip_prefix(prefix) {
            current = format!("{replacement}{rest}");
        }
    }
    current
}

fn known_roots(kind: ComponentKind) -> &'static [&'static str] {
    match kind {
        ComponentKind::Transformer | ComponentKind::LayeredTransformer => &[
            "transformer_blocks",
            "img_in",
            "txt_in",
            "txt_norm",
            "time_text_embed",
            "norm_out",
            "proj_out",
            "pos_embed",
        ],
        ComponentKind::Vae => &["encoder", "decoder", "quant_conv", "post_quant_conv"],
        ComponentKind::TextEncoder => &["language_model", "visual", "lm_head"],
    }
}

fn rename_segments(segments: &mut Vec<&str>, kind: ComponentKind) {
    let mut i = 0;
    while i + 1 < segments.len() {
        let replacement: Option<&[&str]> = match (kind, segments[i], segments[i + 1]) {
            (k, "img_mlp" | "txt_mlp", "linear1") if k.is_transformer() => Some(&["net", "0", "proj"]),
            (k, "img_mlp" | "txt_mlp", "linear2") if k.is_transformer() => Some(&["net", "2"]),
            (k, "img_mod" | "txt_mod", "lin") if k.is_transformer() => Some(&["1"]),
            (ComponentKind::TextEncoder, "mlp", "w1") => Some(&["gate_proj"]),
            (ComponentKind::TextEncoder, "mlp", "w3") => Some(&["up_proj"]),
            (ComponentKind::TextEncoder, "mlp", "w2") => Some(&["down_proj"]),
            _ => None,
        };
        if let Some(replacement) = replacement {
            segments.splice(i + 1..i + 2, replacement.iter().copied());
            i += replacement.len();
        }
        i += 1;
    }
}

fn is_conv_kernel(segments: &[&str], kind: ComponentKind) -> bool {
    kind == ComponentKind::Vae
        && segments.len() >= 2
        && segments[segments.len() - 1] == "weight"
        && segments[segments.len() - 2].contains("conv")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> WeightKeyMapper {
        WeightKeyMapper::new(ChannelOrder::Last)
    }

    #[test]
    fn test_layered_mlp_and_modulation_renames() {
        let m = mapper();
        let kind = ComponentKind::LayeredTransformer;
        let cases = [
            ("transformer_blocks.3.img_mlp.linear1", "transformer_blocks.3.img_mlp.net.0.proj"),
            ("transformer_blocks.5.txt_mlp.linear2", "transformer_blocks.5.txt_mlp.net.2"),
            ("transformer_blocks.1.img_mod.lin", "transformer_blocks.1.img_mod.1"),
            ("transformer_blocks.3.img_mlp.linear1.weight", "transformer_blocks.3.img_mlp.net.0.proj.weight"),
            ("transformer_blocks.0.txt_mod.lin.bias", "transformer_blocks.0.txt_mod.1.bias"),
        ];
        for (flat, expected) in cases {
            let mapping = m.map_key(flat, kind).unwrap();
            assert_eq!(mapping.module_path, expected, "mapping {flat}");
            assert_eq!(mapping.transform, KeyTransform::RenameOnly);
        }
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let m = mapper();
        let first = m.map_key("transformer_blocks.3.img_mlp.linear1", ComponentKind::LayeredTransformer);
        for _ in 0..10 {
            let again = m.map_key("transformer_blocks.3.img_mlp.linear1", ComponentKind::LayeredTransformer);
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_generic_keys_pass_through() {
        let mapping = mapper()
            .map_key("transformer_blocks.0.attn.to_q.weight", ComponentKind::Transformer)
            .unwrap();
        assert_eq!(mapping.module_path, "transformer_blocks.0.attn.to_q.weight");
        assert_eq!(mapping.transform, KeyTransform::None);
    }

    #[test]
    fn test_wrapper_prefixes_are_stripped() {
        let m = mapper();
        let mapping = m
            .map_key("model.diffusion_model.img_in.weight", ComponentKind::Transformer)
            .unwrap();
        assert_eq!(mapping.module_path, "img_in.weight");
        assert_eq!(mapping.transform, KeyTransform::RenameOnly);

        let mapping = m
            .map_key("model.layers.2.self_attn.q_proj.weight", ComponentKind::TextEncoder)
            .unwrap();
        assert_eq!(mapping.module_path, "language_model.layers.2.self_attn.q_proj.weight");

        let mapping = m
            .map_key("model.visual.blocks.0.attn.qkv.weight", ComponentKind::TextEncoder)
            .unwrap();
        assert_eq!(mapping.module_path, "visual.blocks.0.attn.qkv.weight");
    }

    #[test]
    fn test_gate_projection_rename() {
        let mapping = mapper()
            .map_key("language_model.layers.4.mlp.w1.weight", ComponentKind::TextEncoder)
            .unwrap();
        assert_eq!(mapping.module_path, "language_model.layers.4.mlp.gate_proj.weight");
        assert_eq!(mapping.transform, KeyTransform::RenameOnly);

        let mapping = mapper()
            .map_key("language_model.layers.4.mlp.w2.weight", ComponentKind::TextEncoder)
            .unwrap();
        assert_eq!(mapping.module_path, "language_model.layers.4.mlp.down_proj.weight");
    }

    #[test]
    fn test_conv_kernels_flagged_for_channel_last() {
        let mapping = mapper()
            .map_key("decoder.up_blocks.0.resnets.1.conv2.weight", ComponentKind::Vae)
            .unwrap();
        assert_eq!(mapping.transform, KeyTransform::TransposeConvNchwToNhwc);

        let bias = mapper()
            .map_key("decoder.up_blocks.0.resnets.1.conv2.bias", ComponentKind::Vae)
            .unwrap();
        assert_eq!(bias.transform, KeyTransform::None);

        let channel_first = WeightKeyMapper::new(ChannelOrder::First)
            .map_key("vae.decoder.conv_in.weight", ComponentKind::Vae)
            .unwrap();
        assert_eq!(channel_first.module_path, "decoder.conv_in.weight");
        assert_eq!(channel_first.transform, KeyTransform::RenameOnly);
    }

    #[test]
    fn test_unknown_keys() {
        let m = mapper();
        assert!(m.map_key("", ComponentKind::Vae).is_err());
        assert!(m.map_key("decoder..conv_in.weight", ComponentKind::Vae).is_err());
        assert!(m.map_key("lora_unet.weight", ComponentKind::Transformer).is_err());
        assert!(m.map_key("decoder", ComponentKind::Vae).is_err());

        let failure = m.map_key("encoder.conv_in.weight", ComponentKind::TextEncoder).unwrap_err();
        assert_eq!(failure.key, "encoder.conv_in.weight");
    }
}
