//! Engine abstraction layer for Mosaic.
//!
//! This module defines the data types exchanged between the session layer and
//! the opaque model engine: component and family identifiers, conditioning
//! artifacts, sampling parameters and the pixel tensors returned by sampling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Represents an error reported by the model engine.
///
/// The session layer never interprets these; they are surfaced to callers verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineError {
    /// The numeric backend failed (kernel launch, device loss, ...).
    #[error("Backend Error: {0}")]
    Backend(String),

    /// The engine could not allocate memory for the requested operation.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The engine rejected its input (bad shape, missing weights, ...).
    #[error("Invalid Input: {0}")]
    InvalidInput(String),

    /// A LoRA adapter could not be applied.
    #[error("Adapter Error: {0}")]
    Adapter(String),

    /// Other unexpected errors.
    #[error("Other Engine Error: {0}")]
    Other(String),
}

/// The weight sets a pipeline is assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Diffusion transformer of the text-to-image / edit pipeline.
    Transformer,
    /// Diffusion transformer of the layered-decomposition pipeline.
    LayeredTransformer,
    /// Image autoencoder.
    Vae,
    /// Text encoder, including its vision tower.
    TextEncoder,
}

impl ComponentKind {
    /// Directory name of this component inside a model snapshot.
    #[must_use]
    pub const fn directory(self) -> &'static str {
        match self {
            Self::Transformer | Self::LayeredTransformer => "transformer",
            Self::Vae => "vae",
            Self::TextEncoder => "text_encoder",
        }
    }

    /// Whether this component is a diffusion transformer.
    #[must_use]
    pub const fn is_transformer(self) -> bool {
        matches!(self, Self::Transformer | Self::LayeredTransformer)
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transformer => "transformer",
            Self::LayeredTransformer => "layered_transformer",
            Self::Vae => "vae",
            Self::TextEncoder => "text_encoder",
        };
        f.write_str(name)
    }
}

/// The two mutually exclusive pipeline families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineFamily {
    /// Layered decomposition of an image into RGBA layers.
    Layered,
    /// Text-to-image and image editing.
    Image,
}

impl PipelineFamily {
    /// Components that make up a pipeline of this family, in load order.
    #[must_use]
    pub const fn components(self) -> &'static [ComponentKind] {
        match self {
            Self::Layered => &[
                ComponentKind::TextEncoder,
                ComponentKind::LayeredTransformer,
                ComponentKind::Vae,
            ],
            Self::Image => &[
                ComponentKind::TextEncoder,
                ComponentKind::Transformer,
                ComponentKind::Vae,
            ],
        }
    }
}

impl fmt::Display for PipelineFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Layered => f.write_str("layered"),
            Self::Image => f.write_str("image"),
        }
    }
}

impl FromStr for PipelineFamily {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "layered" => Ok(Self::Layered),
            "image" | "t2i" | "edit" => Ok(Self::Image),
            _ => Err(()),
        }
    }
}

/// Identifies a model snapshot. Scopes cache keys and detects no-op reloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineIdentity {
    /// The model repository id.
    pub model_id: String,
    /// The snapshot revision.
    #[serde(default = "default_revision")]
    pub revision: String,
}

fn default_revision() -> String {
    "main".to_string()
}

impl PipelineIdentity {
    /// Creates an identity on the default `main` revision.
    #[must_use]
    pub fn new(model_id: impl Into<String>) -> Self {
        Self { model_id: model_id.into(), revision: default_revision() }
    }

    /// Sets the revision.
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }
}

/// An encoded conditioning artifact produced by a text or vision encoder.
///
/// The values are shared, so clones are cheap and cache hits never copy the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Conditioning {
    /// Shape of the embedding, usually `[tokens, hidden]`.
    pub shape: Vec<usize>,
    /// Row-major embedding values.
    pub values: Arc<[f32]>,
    /// Optional attention mask over the token axis.
    pub mask: Option<Arc<[u8]>>,
}

impl Conditioning {
    /// Creates a conditioning artifact without a mask.
    #[must_use]
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values: values.into(), mask: None }
    }

    /// Attaches an attention mask.
    #[must_use]
    pub fn with_mask(mut self, mask: Vec<u8>) -> Self {
        self.mask = Some(mask.into());
        self
    }

    /// Number of tokens (first dimension).
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }
}

/// Positive conditioning plus its optional negative counterpart.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningPair {
    /// Conditioning for the prompt.
    pub positive: Conditioning,
    /// Conditioning for the negative prompt, when classifier-free guidance is used.
    pub negative: Option<Conditioning>,
}

/// What the engine should encode.
#[derive(Debug, Clone, Copy)]
pub enum EncodeRequest<'a> {
    /// Encode a prompt on its own.
    Text {
        /// The prompt text.
        prompt: &'a str,
    },
    /// Encode a prompt together with a reference image.
    Image {
        /// The prompt text.
        prompt: &'a str,
        /// Encoded image file bytes (PNG, JPEG, ...).
        image: &'a [u8],
    },
}

impl EncodeRequest<'_> {
    /// The prompt of this request.
    #[must_use]
    pub fn prompt(&self) -> &str {
        match self {
            Self::Text { prompt } | Self::Image { prompt, .. } => prompt,
        }
    }
}

/// Parameters for the sampling loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParameters {
    /// Number of denoising steps.
    pub steps: u32,
    /// Classifier-free guidance scale.
    pub guidance_scale: f32,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Optional seed for reproducible sampling.
    pub seed: Option<u64>,
    /// Number of output layers (layered decomposition only).
    pub layers: Option<u32>,
}

impl Default for SamplingParameters {
    fn default() -> Self {
        Self {
            steps: 30,
            guidance_scale: 4.0,
            width: 1024,
            height: 1024,
            seed: None,
            layers: None,
        }
    }
}

/// Progress report passed to the step callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingStep {
    /// Zero-based index of the step that just finished.
    pub step: u32,
    /// Total number of steps.
    pub total: u32,
}

/// Decoded pixels returned by the sampling loop, channel-last.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelTensor {
    /// Number of stacked layers (1 for plain images).
    pub layers: u32,
    /// Height in pixels.
    pub height: u32,
    /// Width in pixels.
    pub width: u32,
    /// Channels per pixel (3 for RGB, 4 for RGBA).
    pub channels: u32,
    /// Values in `[0, 1]`, laid out `[layers, height, width, channels]`.
    pub data: Vec<f32>,
}

impl PixelTensor {
    /// Shape as `[layers, height, width, channels]`.
    #[must_use]
    pub fn shape(&self) -> [usize; 4] {
        [
            self.layers as usize,
            self.height as usize,
            self.width as usize,
            self.channels as usize,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_components() {
        assert!(PipelineFamily::Layered.components().contains(&ComponentKind::LayeredTransformer));
        assert!(!PipelineFamily::Image.components().contains(&ComponentKind::LayeredTransformer));
        assert_eq!(ComponentKind::LayeredTransformer.directory(), "transformer");
    }

    #[test]
    fn test_family_from_str() {
        assert_eq!("layered".parse::<PipelineFamily>(), Ok(PipelineFamily::Layered));
        assert_eq!("Edit".parse::<PipelineFamily>(), Ok(PipelineFamily::Image));
        assert!("video".parse::<PipelineFamily>().is_err());
    }

    #[test]
    fn test_identity_default_revision() {
        let identity: PipelineIdentity =
            serde_json::from_str(r#"{"model_id":"Qwen/Qwen-Image"}"#).unwrap();
        assert_eq!(identity.revision, "main");
        assert_eq!(identity, PipelineIdentity::new("Qwen/Qwen-Image"));
    }

    #[test]
    fn test_conditioning_clone_shares_values() {
        let conditioning = Conditioning::new(vec![2, 2], vec![0.0, 1.0, 2.0, 3.0]);
        let clone = conditioning.clone();
        assert!(Arc::ptr_eq(&conditioning.values, &clone.values));
        assert_eq!(clone.token_count(), 2);
    }
}
