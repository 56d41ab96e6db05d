//! Checkpoint Storage - load, prune and save diffusion model checkpoints.
//!
//! A checkpoint is a map of dot-delimited parameter names to tensors,
//! optionally wrapped under a top-level `"state_dict"` key. Pruning keeps the
//! tensors of selected sub-networks, can substitute EMA weights for UNet
//! weights, and can narrow floating-point tensors to F16.
//!
//! # Sub-networks
//! - UNet: `model.diffusion_model.`
//! - Depth: `depth_model.`
//! - VAE: `first_stage_model.`
//! - Text encoder: `cond_stage_model.`
//!
//! # Formats
//! - SafeTensors (`.safetensors`)
//! - PyTorch zip and legacy containers (any other extension)
//!
//! # Usage
//! ```ignore
//! use checkpoint_storage::{formats, prune, PruneOptions};
//!
//! let ckpt = formats::load("model.ckpt".as_ref())?;
//! let options = PruneOptions { fp16: true, ema: true, ..Default::default() };
//! let pruned = prune(&ckpt, &options)?;
//! formats::save(&pruned, "model-pruned.safetensors".as_ref())?;
//! ```

pub mod cast;
pub mod checkpoint;
pub mod error;
pub mod formats;
pub mod prune;
pub mod tensor;

// Re-exports
pub use checkpoint::{Checkpoint, Layout, TensorMap, STATE_DICT_KEY};
pub use error::{CheckpointError, Result};
pub use formats::CheckpointFormat;
pub use prune::{ema_key, prune, prune_with_report, Group, PruneOptions, PruneReport};
pub use safetensors::Dtype;
pub use tensor::Tensor;
