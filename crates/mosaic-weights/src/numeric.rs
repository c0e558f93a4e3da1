//! Lenient numeric parsing for JSON metadata.
//!
//! Exporters disagree on whether integers are written as `64` or `64.0`.
//! Both are accepted as long as the value is integral.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Largest integer an `f64` represents exactly.
const MAX_EXACT_F64: f64 = 9_007_199_254_740_992.0;

/// Coerce a JSON value to a non-negative integer.
///
/// Returns `None` for negative, non-integral, non-finite or non-numeric values.
pub(crate) fn integral(value: &Value) -> Option<u64> {
    if let Some(v) = value.as_u64() {
        return Some(v);
    }
    let v = value.as_f64()?;
    if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= MAX_EXACT_F64 {
        Some(v as u64)
    } else {
        None
    }
}

/// Coerce a JSON array to a list of non-negative integers.
pub(crate) fn integral_list(value: &Value) -> Option<Vec<u64>> {
    value.as_array()?.iter().map(integral).collect()
}

/// Serde adapter for optional integer fields that may be written as floats.
pub(crate) fn deserialize_opt_integral<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => integral(&v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("expected an integral number, got {v}"))),
    }
}

/// Serde adapter for optional integer lists that may contain floats.
pub(crate) fn deserialize_opt_integral_list<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<u64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => integral_list(&v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("expected a list of integers, got {v}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integral_accepts_both_spellings() {
        assert_eq!(integral(&json!(64)), Some(64));
        assert_eq!(integral(&json!(64.0)), Some(64));
        assert_eq!(integral(&json!(0.0)), Some(0));
    }

    #[test]
    fn test_integral_rejects_fractions_and_negatives() {
        assert_eq!(integral(&json!(64.5)), None);
        assert_eq!(integral(&json!(-1)), None);
        assert_eq!(integral(&json!("64")), None);
    }

    #[test]
    fn test_integral_list() {
        assert_eq!(integral_list(&json!([2, 3.0, 4])), Some(vec![2, 3, 4]));
        assert_eq!(integral_list(&json!([2, 3.5])), None);
        assert_eq!(integral_list(&json!(3)), None);
    }
}
