//! Protocol-2 pickle emitter for tensor state dicts.
//!
//! Produces the same opcode shapes `torch.save` does for a dict of tensors:
//! each tensor is a `_rebuild_tensor_v2` reduction over a typed storage
//! referenced by persistent id.

use crate::error::{CheckpointError, Result};
use crate::tensor::Tensor;

use super::pickle::{storage_name, OpCode};

#[derive(Default)]
pub struct Pickler {
    buf: Vec<u8>,
}

impl Pickler {
    pub fn new() -> Self {
        let mut pickler = Self::default();
        pickler.op(OpCode::Proto);
        pickler.buf.push(2);
        pickler
    }

    fn op(&mut self, op: OpCode) {
        self.buf.push(op as u8);
    }

    pub fn mark(&mut self) {
        self.op(OpCode::Mark);
    }

    pub fn global(&mut self, module: &str, name: &str) {
        self.op(OpCode::Global);
        self.buf.extend_from_slice(module.as_bytes());
        self.buf.push(b'\n');
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(b'\n');
    }

    pub fn unicode(&mut self, s: &str) {
        self.op(OpCode::BinUnicode);
        self.buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn int(&mut self, v: i64) {
        if (0..=0xff).contains(&v) {
            self.op(OpCode::BinInt1);
            self.buf.push(v as u8);
        } else if (0..=0xffff).contains(&v) {
            self.op(OpCode::BinInt2);
            self.buf.extend_from_slice(&(v as u16).to_le_bytes());
        } else if i32::try_from(v).is_ok() {
            self.op(OpCode::BinInt);
            self.buf.extend_from_slice(&(v as i32).to_le_bytes());
        } else {
            self.op(OpCode::Long1);
            self.buf.push(8);
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    /// Arbitrary-precision int from little-endian two's complement bytes.
    pub fn long1(&mut self, bytes: &[u8]) {
        self.op(OpCode::Long1);
        self.buf.push(bytes.len() as u8);
        self.buf.extend_from_slice(bytes);
    }

    pub fn usize_tuple(&mut self, values: &[usize]) {
        if values.is_empty() {
            self.op(OpCode::EmptyTuple);
            return;
        }
        self.mark();
        for &v in values {
            self.int(v as i64);
        }
        self.op(OpCode::Tuple);
    }

    pub fn empty_dict(&mut self) {
        self.op(OpCode::EmptyDict);
    }

    /// Collect items since the last mark into a list.
    pub fn list(&mut self) {
        self.op(OpCode::List);
    }

    pub fn reduce(&mut self) {
        self.op(OpCode::Reduce);
    }

    pub fn set_item(&mut self) {
        self.op(OpCode::SetItem);
    }

    pub fn set_items(&mut self) {
        self.op(OpCode::SetItems);
    }

    /// Emit a tensor whose data lives in storage `key`.
    pub fn tensor(&mut self, tensor: &Tensor, key: &str) -> Result<()> {
        let storage = storage_name(tensor.dtype())
            .ok_or(CheckpointError::UnsupportedDtype(tensor.dtype()))?;

        self.global("torch._utils", "_rebuild_tensor_v2");
        self.mark();

        self.mark();
        self.unicode("storage");
        self.global("torch", storage);
        self.unicode(key);
        self.unicode("cpu");
        self.int(tensor.numel() as i64);
        self.op(OpCode::Tuple);
        self.op(OpCode::BinPersId);

        self.int(0);
        self.usize_tuple(tensor.shape());
        self.usize_tuple(&contiguous_strides(tensor.shape()));
        self.op(OpCode::NewFalse);
        self.global("collections", "OrderedDict");
        self.op(OpCode::EmptyTuple);
        self.op(OpCode::Reduce);

        self.op(OpCode::Tuple);
        self.op(OpCode::Reduce);
        Ok(())
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.op(OpCode::Stop);
        self.buf
    }
}

/// Row-major strides for `shape`.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}
