//! Element type conversions.
//!
//! `to_f16` is the narrowing cast applied when pruning with `fp16` enabled.
//! It never fails on numeric range: values outside the f16 range become
//! infinities, following IEEE-754 round-to-nearest narrowing.

use half::{bf16, f16};
use safetensors::Dtype;

use crate::error::{CheckpointError, Result};
use crate::tensor::Tensor;

/// Cast a tensor to F16. Returns the same buffer when already F16.
pub fn to_f16(tensor: &Tensor) -> Result<Tensor> {
    if tensor.dtype() == Dtype::F16 {
        return Ok(tensor.clone());
    }

    let data = tensor.data();
    let values: Vec<f16> = match tensor.dtype() {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|c| f16::from_f32(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect(),
        Dtype::F64 => data
            .chunks_exact(8)
            .map(|c| f16::from_f64(f64::from_le_bytes(le8(c))))
            .collect(),
        Dtype::BF16 => data
            .chunks_exact(2)
            .map(|c| f16::from_f32(bf16::from_le_bytes([c[0], c[1]]).to_f32()))
            .collect(),
        // E5M2 shares the f16 exponent layout: it is the high byte of an f16.
        Dtype::F8_E5M2 => data.iter().map(|&b| f16::from_bits((b as u16) << 8)).collect(),
        Dtype::F8_E4M3 => data.iter().map(|&b| f16::from_f32(f8_e4m3_to_f32(b))).collect(),
        dtype => to_f64_values(data, dtype)?
            .into_iter()
            .map(f16::from_f64)
            .collect(),
    };

    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    Tensor::new(Dtype::F16, tensor.shape().to_vec(), bytes)
}

/// Decode any numeric tensor to f32 values.
pub fn to_f32_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    let data = tensor.data();
    match tensor.dtype() {
        Dtype::F32 => Ok(data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()),
        Dtype::F16 => Ok(data
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect()),
        Dtype::BF16 => Ok(data
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect()),
        Dtype::F8_E5M2 => Ok(data
            .iter()
            .map(|&b| f16::from_bits((b as u16) << 8).to_f32())
            .collect()),
        Dtype::F8_E4M3 => Ok(data.iter().map(|&b| f8_e4m3_to_f32(b)).collect()),
        dtype => Ok(to_f64_values(data, dtype)?
            .into_iter()
            .map(|v| v as f32)
            .collect()),
    }
}

/// Integer, bool and f64 decoding shared by both casts.
fn to_f64_values(data: &[u8], dtype: Dtype) -> Result<Vec<f64>> {
    let values = match dtype {
        Dtype::F64 => data.chunks_exact(8).map(|c| f64::from_le_bytes(le8(c))).collect(),
        Dtype::BOOL => data.iter().map(|&b| if b != 0 { 1.0 } else { 0.0 }).collect(),
        Dtype::U8 => data.iter().map(|&b| b as f64).collect(),
        Dtype::I8 => data.iter().map(|&b| b as i8 as f64).collect(),
        Dtype::I16 => data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f64)
            .collect(),
        Dtype::U16 => data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]) as f64)
            .collect(),
        Dtype::I32 => data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect(),
        Dtype::U32 => data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect(),
        Dtype::I64 => data.chunks_exact(8).map(|c| i64::from_le_bytes(le8(c)) as f64).collect(),
        Dtype::U64 => data.chunks_exact(8).map(|c| u64::from_le_bytes(le8(c)) as f64).collect(),
        other => return Err(CheckpointError::UnsupportedDtype(other)),
    };
    Ok(values)
}

fn le8(c: &[u8]) -> [u8; 8] {
    [c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]
}

/// Decode an OCP E4M3FN byte: bias 7, no infinities, 0x7f/0xff are NaN.
fn f8_e4m3_to_f32(bits: u8) -> f32 {
    let sign = if bits & 0x80 != 0 { -1.0 } else { 1.0 };
    let exp = ((bits >> 3) & 0x0f) as i32;
    let mant = (bits & 0x07) as f32;
    if exp == 0x0f && bits & 0x07 == 0x07 {
        return f32::NAN;
    }
    if exp == 0 {
        sign * mant / 8.0 * 2f32.powi(-6)
    } else {
        sign * (1.0 + mant / 8.0) * 2f32.powi(exp - 7)
    }
}
