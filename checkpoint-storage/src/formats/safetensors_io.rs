//! SafeTensors reading and writing.

use std::fs;
use std::path::Path;

use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, TensorMap};
use crate::error::Result;
use crate::tensor::Tensor;

/// Load a SafeTensors file as a flat checkpoint.
pub fn load(path: &Path) -> Result<Checkpoint> {
    let data = fs::read(path)?;
    load_bytes(&data)
}

pub fn load_bytes(data: &[u8]) -> Result<Checkpoint> {
    let st = SafeTensors::deserialize(data)?;

    let mut tensors = TensorMap::new();
    for (name, view) in st.tensors() {
        let tensor = Tensor::new(view.dtype(), view.shape().to_vec(), view.data())?;
        tensors.insert(name, tensor);
    }
    info!(tensors = tensors.len(), "loaded safetensors checkpoint");
    Ok(Checkpoint::flat(tensors))
}

/// Write the checkpoint's tensors. SafeTensors has no nesting, so a nested
/// checkpoint is written flat.
pub fn save(checkpoint: &Checkpoint, path: &Path) -> Result<()> {
    if checkpoint.is_nested() {
        debug!("writing nested checkpoint flat");
    }
    let entries = checkpoint.tensors().iter().map(|(name, t)| (name.as_str(), t));
    safetensors::serialize_to_file(entries, &None, path)?;
    Ok(())
}
