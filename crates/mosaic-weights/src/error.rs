use std::fmt;
use thiserror::Error;

use crate::quantization::QuantizationSpec;

pub type WeightsResult<T> = std::result::Result<T, WeightsError>;

/// Errors raised while reading archives, mapping keys or resolving quantization.
#[derive(Debug, Error)]
pub enum WeightsError {
    #[error("corrupt archive header in {path}: {reason}")]
    CorruptHeader { path: String, reason: String },

    #[error("unsupported archive format version '{0}'")]
    UnsupportedVersion(String),

    #[error("malformed metadata for tensor '{tensor}': {reason}")]
    MalformedMetadata { tensor: String, reason: String },

    #[error("tensor '{0}' is not present in the archive")]
    TensorNotFound(String),

    #[error("layout mismatch for tensor '{tensor}': {reason}")]
    LayoutMismatch { tensor: String, reason: String },

    #[error("unsupported dtype conversion from {0}")]
    UnsupportedConversion(String),

    #[error(
        "quantization mismatch for layer '{layer}': resolved {expected}, prepacked {found}"
    )]
    QuantizationMismatch {
        layer: String,
        expected: QuantizationSpec,
        found: QuantizationSpec,
    },

    #[error("invalid quantization config: {0}")]
    InvalidQuantization(String),

    #[error("no quantization declared for component '{0}'")]
    NoQuantization(String),

    #[error("component '{component}' has no archives under {path}")]
    MissingArchives { component: String, path: String },

    #[error("{}", MissingKeysDisplay(.component, .missing, .unmapped))]
    MissingRequiredKeys {
        component: String,
        missing: Vec<String>,
        unmapped: Vec<KeyMappingError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

struct MissingKeysDisplay<'a>(&'a String, &'a Vec<String>, &'a Vec<KeyMappingError>);

impl fmt::Display for MissingKeysDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "component '{}' is missing required parameters [{}]",
            self.0,
            self.1.join(", ")
        )?;
        if !self.2.is_empty() {
            write!(f, "; {} keys could not be mapped:", self.2.len())?;
            for failure in self.2 {
                write!(f, " {failure};")?;
            }
        }
        Ok(())
    }
}

/// A single key that could not be mapped onto the module tree.
///
/// These are collected per archive rather than aborting the load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown key '{key}': {reason}")]
pub struct KeyMappingError {
    pub key: String,
    pub reason: String,
}

impl KeyMappingError {
    pub(crate) fn new(key: &str, reason: impl Into<String>) -> Self {
        Self { key: key.to_string(), reason: reason.into() }
    }
}
