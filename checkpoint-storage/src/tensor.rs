//! Dense tensor value held by a checkpoint.
//!
//! A tensor is an element type, a shape and a contiguous little-endian byte
//! buffer. The buffer is reference counted so checkpoints can share tensors
//! without copying weight data.

use std::borrow::Cow;
use std::sync::Arc;

use safetensors::Dtype;

use crate::error::{CheckpointError, Result};

/// Size in bytes of one element of `dtype`.
pub fn element_size(dtype: Dtype) -> Result<usize> {
    match dtype {
        Dtype::BOOL | Dtype::U8 | Dtype::I8 | Dtype::F8_E5M2 | Dtype::F8_E4M3 => Ok(1),
        Dtype::I16 | Dtype::U16 | Dtype::F16 | Dtype::BF16 => Ok(2),
        Dtype::I32 | Dtype::U32 | Dtype::F32 => Ok(4),
        Dtype::I64 | Dtype::U64 | Dtype::F64 => Ok(8),
        other => Err(CheckpointError::UnsupportedDtype(other)),
    }
}

/// A named-value-agnostic tensor: dtype, shape and raw data.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Arc<[u8]>,
}

impl Tensor {
    /// Create a tensor, checking the buffer holds exactly `numel` elements.
    pub fn new(dtype: Dtype, shape: Vec<usize>, data: impl Into<Arc<[u8]>>) -> Result<Self> {
        let data = data.into();
        let expected = shape.iter().product::<usize>() * element_size(dtype)?;
        if data.len() != expected {
            return Err(CheckpointError::BufferSize {
                dtype,
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// Build an F32 tensor from values.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(Dtype::F32, shape, bytes)
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Raw little-endian element bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    /// True when both tensors point at the same underlying buffer.
    pub fn shares_buffer(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl safetensors::View for &Tensor {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}
