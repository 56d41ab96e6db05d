//! Checkpoint container: a map of named tensors, optionally nested.

use std::collections::BTreeMap;

use crate::tensor::Tensor;

/// Top-level key that marks a nested checkpoint.
pub const STATE_DICT_KEY: &str = "state_dict";

/// Named tensors keyed by dot-delimited parameter path.
pub type TensorMap = BTreeMap<String, Tensor>;

/// Whether the tensors sit at the top level or under `"state_dict"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Flat,
    Nested,
}

/// A model checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    layout: Layout,
    tensors: TensorMap,
}

impl Checkpoint {
    pub fn new(layout: Layout, tensors: TensorMap) -> Self {
        Self { layout, tensors }
    }

    /// Tensors stored directly at the top level.
    pub fn flat(tensors: TensorMap) -> Self {
        Self::new(Layout::Flat, tensors)
    }

    /// Tensors wrapped under `"state_dict"`.
    pub fn nested(tensors: TensorMap) -> Self {
        Self::new(Layout::Nested, tensors)
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn is_nested(&self) -> bool {
        self.layout == Layout::Nested
    }

    /// The working tensor map (the `"state_dict"` contents when nested).
    pub fn tensors(&self) -> &TensorMap {
        &self.tensors
    }

    pub fn into_tensors(self) -> TensorMap {
        self.tensors
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total tensor payload in bytes.
    pub fn nbytes(&self) -> usize {
        self.tensors.values().map(Tensor::nbytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layouts() {
        let mut map = TensorMap::new();
        map.insert("a.weight".to_string(), Tensor::from_f32(vec![2], &[1.0, 2.0]).unwrap());

        let flat = Checkpoint::flat(map.clone());
        assert!(!flat.is_nested());
        assert_eq!(flat.len(), 1);
        assert_eq!(flat.nbytes(), 8);

        let nested = Checkpoint::nested(map);
        assert!(nested.is_nested());
        assert!(nested.get("a.weight").is_some());
        assert_ne!(flat, nested);
    }

    #[test]
    fn test_empty_checkpoint() {
        let ckpt = Checkpoint::flat(TensorMap::new());
        assert!(ckpt.is_empty());
        assert_eq!(ckpt.nbytes(), 0);
    }
}
