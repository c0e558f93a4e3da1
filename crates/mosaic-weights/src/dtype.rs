//! Element types stored in tensor archives.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tensor element data type, spelled as in the archive header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "F64")]
    F64,
    #[serde(rename = "F32")]
    F32,
    #[serde(rename = "F16")]
    F16,
    #[serde(rename = "BF16")]
    BF16,
    #[serde(rename = "I64")]
    I64,
    #[serde(rename = "I32")]
    I32,
    #[serde(rename = "I16")]
    I16,
    #[serde(rename = "I8")]
    I8,
    #[serde(rename = "U32")]
    U32,
    #[serde(rename = "U8")]
    U8,
    #[serde(rename = "BOOL")]
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::F64 | Self::I64 => 8,
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F16 | Self::BF16 | Self::I16 => 2,
            Self::I8 | Self::U8 | Self::Bool => 1,
        }
    }

    /// Header spelling of this dtype.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::F64 => "F64",
            Self::F32 => "F32",
            Self::F16 => "F16",
            Self::BF16 => "BF16",
            Self::I64 => "I64",
            Self::I32 => "I32",
            Self::I16 => "I16",
            Self::I8 => "I8",
            Self::U32 => "U32",
            Self::U8 => "U8",
            Self::Bool => "BOOL",
        }
    }

    /// Whether this is a floating-point type.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F64 | Self::F32 | Self::F16 | Self::BF16)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "F64" | "FLOAT64" => Ok(Self::F64),
            "F32" | "FLOAT32" => Ok(Self::F32),
            "F16" | "FLOAT16" => Ok(Self::F16),
            "BF16" | "BFLOAT16" => Ok(Self::BF16),
            "I64" => Ok(Self::I64),
            "I32" => Ok(Self::I32),
            "I16" => Ok(Self::I16),
            "I8" => Ok(Self::I8),
            "U32" => Ok(Self::U32),
            "U8" => Ok(Self::U8),
            "BOOL" => Ok(Self::Bool),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(DType::F32.size(), 4);
        assert_eq!(DType::BF16.size(), 2);
        assert_eq!(DType::U8.size(), 1);
        assert_eq!(DType::I64.size(), 8);
    }

    #[test]
    fn test_parse_roundtrips_header_spelling() {
        for dtype in [DType::F64, DType::F32, DType::F16, DType::BF16, DType::I8, DType::U32, DType::Bool] {
            assert_eq!(dtype.as_str().parse::<DType>(), Ok(dtype));
        }
        assert_eq!("bfloat16".parse::<DType>(), Ok(DType::BF16));
        assert!("F8_E4M3".parse::<DType>().is_err());
    }
}
