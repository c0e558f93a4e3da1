//! Layout and dtype conversion for loaded tensors.

use half::{bf16, f16};

use crate::dtype::DType;
use crate::error::{WeightsError, WeightsResult};

/// Permute a 4D convolution kernel from `[O, I, H, W]` to `[O, H, W, I]`.
///
/// Returns the permuted bytes and the new shape.
pub fn permute_nchw_to_nhwc(
    name: &str,
    bytes: &[u8],
    shape: &[usize],
    elem_size: usize,
) -> WeightsResult<(Vec<u8>, Vec<usize>)> {
    let &[o, i, h, w] = shape else {
        return Err(WeightsError::LayoutMismatch {
            tensor: name.to_string(),
            reason: format!("expected a 4D kernel, got shape {shape:?}"),
        });
    };
    if bytes.len() != o * i * h * w * elem_size {
        return Err(WeightsError::LayoutMismatch {
            tensor: name.to_string(),
            reason: format!("{} bytes do not match shape {shape:?}", bytes.len()),
        });
    }

    let mut out = vec![0u8; bytes.len()];
    for oo in 0..o {
        for ii in 0..i {
            for hh in 0..h {
                for ww in 0..w {
                    let src = (((oo * i + ii) * h + hh) * w + ww) * elem_size;
                    let dst = (((oo * h + hh) * w + ww) * i + ii) * elem_size;
                    out[dst..dst + elem_size].copy_from_slice(&bytes[src..src + elem_size]);
                }
            }
        }
    }
    Ok((out, vec![o, h, w, i]))
}

/// Decode little-endian floating-point bytes to `f32`.
pub fn decode_to_f32(bytes: &[u8], dtype: DType) -> WeightsResult<Vec<f32>> {
    let values = match dtype {
        DType::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DType::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
        DType::BF16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
        other => return Err(WeightsError::UnsupportedConversion(other.to_string())),
    };
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permute_moves_input_channels_last() {
        // O=1, I=2, H=1, W=2 with one byte per element:
        // channel 0 = [a, b], channel 1 = [c, d]
        let bytes = [b'a', b'b', b'c', b'd'];
        let (out, shape) = permute_nchw_to_nhwc("k", &bytes, &[1, 2, 1, 2], 1).unwrap();
        assert_eq!(shape, vec![1, 1, 2, 2]);
        assert_eq!(out, vec![b'a', b'c', b'b', b'd']);
    }

    #[test]
    fn test_permute_keeps_element_bytes_together() {
        let bytes: Vec<u8> = (0..8).collect();
        let (out, _) = permute_nchw_to_nhwc("k", &bytes, &[1, 2, 1, 2], 2).unwrap();
        assert_eq!(out, vec![0, 1, 4, 5, 2, 3, 6, 7]);
    }

    #[test]
    fn test_permute_rejects_non_4d() {
        assert!(matches!(
            permute_nchw_to_nhwc("k", &[0; 4], &[2, 2], 1),
            Err(WeightsError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_half_types() {
        let one_f16 = f16::from_f32(1.5).to_bits().to_le_bytes();
        assert_eq!(decode_to_f32(&one_f16, DType::F16).unwrap(), vec![1.5]);

        let one_bf16 = bf16::from_f32(-2.0).to_bits().to_le_bytes();
        assert_eq!(decode_to_f32(&one_bf16, DType::BF16).unwrap(), vec![-2.0]);

        assert!(decode_to_f32(&[0], DType::U8).is_err());
    }
}
