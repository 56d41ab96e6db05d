//! On-disk checkpoint formats.
//!
//! The format is picked from the file extension: `.safetensors` is
//! SafeTensors, anything else (`.ckpt`, `.pt`, `.pth`, `.bin`) is treated as a
//! PyTorch checkpoint.

mod safetensors_io;
pub mod torch;

use std::fmt;
use std::path::Path;

use crate::checkpoint::Checkpoint;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    SafeTensors,
    Torch,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("safetensors") => Self::SafeTensors,
            _ => Self::Torch,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SafeTensors => "safetensors",
            Self::Torch => "torch",
        }
    }

    pub fn load(self, path: &Path) -> Result<Checkpoint> {
        match self {
            Self::SafeTensors => safetensors_io::load(path),
            Self::Torch => torch::load(path),
        }
    }

    pub fn save(self, checkpoint: &Checkpoint, path: &Path) -> Result<()> {
        match self {
            Self::SafeTensors => safetensors_io::save(checkpoint, path),
            Self::Torch => torch::save(checkpoint, path),
        }
    }
}

impl fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Load a checkpoint in the format implied by `path`.
pub fn load(path: &Path) -> Result<Checkpoint> {
    CheckpointFormat::from_path(path).load(path)
}

/// Save a checkpoint in the format implied by `path`.
pub fn save(checkpoint: &Checkpoint, path: &Path) -> Result<()> {
    CheckpointFormat::from_path(path).save(checkpoint, path)
}
