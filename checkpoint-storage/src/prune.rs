//! Sub-model selection, EMA substitution and optional 16-bit narrowing.
//!
//! A key survives pruning when it starts with the prefix of a group whose
//! keep flag is set. Everything else (optimizer state, EMA copies, metadata,
//! unknown prefixes) is dropped. Output layout always matches input layout.

use rayon::prelude::*;
use safetensors::Dtype;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cast;
use crate::checkpoint::{Checkpoint, TensorMap};
use crate::error::Result;

/// Namespace prepended to EMA copies of model weights.
pub const EMA_PREFIX: &str = "model_ema.";

/// Number of leading characters dropped from a key before EMA lookup.
const EMA_STRIP_CHARS: usize = 6;

/// Sub-model weight groups of a latent diffusion checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Unet,
    Depth,
    Vae,
    Clip,
}

impl Group {
    /// Evaluation order of the selection table.
    pub const ALL: [Group; 4] = [Group::Unet, Group::Depth, Group::Vae, Group::Clip];

    pub fn prefix(self) -> &'static str {
        match self {
            Group::Unet => "model.diffusion_model.",
            Group::Depth => "depth_model.",
            Group::Vae => "first_stage_model.",
            Group::Clip => "cond_stage_model.",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Group::Unet => "unet",
            Group::Depth => "depth",
            Group::Vae => "vae",
            Group::Clip => "clip",
        }
    }
}

/// Pruning switches. Defaults keep every group, no EMA, no cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneOptions {
    pub fp16: bool,
    pub ema: bool,
    pub clip: bool,
    pub vae: bool,
    pub depth: bool,
    pub unet: bool,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            fp16: false,
            ema: false,
            clip: true,
            vae: true,
            depth: true,
            unet: true,
        }
    }
}

impl PruneOptions {
    pub fn keeps(&self, group: Group) -> bool {
        match group {
            Group::Unet => self.unet,
            Group::Depth => self.depth,
            Group::Vae => self.vae,
            Group::Clip => self.clip,
        }
    }

    /// The `(group, prefix, keep)` selection table.
    pub fn selection(&self) -> impl Iterator<Item = (Group, &'static str, bool)> + '_ {
        Group::ALL
            .into_iter()
            .map(move |g| (g, g.prefix(), self.keeps(g)))
    }

    /// Group that retains `key`, if any.
    pub fn select(&self, key: &str) -> Option<Group> {
        self.selection()
            .find(|(_, prefix, keep)| *keep && key.starts_with(*prefix))
            .map(|(group, _, _)| group)
    }
}

/// Name under which the EMA copy of `key` is stored.
///
/// Drops the first six characters, removes every `.` and prepends
/// `model_ema.`, so `model.diffusion_model.out.0.weight` maps to
/// `model_ema.diffusion_modelout0weight`.
pub fn ema_key(key: &str) -> String {
    let tail: String = key
        .chars()
        .skip(EMA_STRIP_CHARS)
        .filter(|&c| c != '.')
        .collect();
    format!("{EMA_PREFIX}{tail}")
}

/// Counters describing what a prune pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub unet: usize,
    pub depth: usize,
    pub vae: usize,
    pub clip: usize,
    pub dropped: usize,
    pub ema_substituted: usize,
    pub cast: usize,
    pub input_bytes: usize,
    pub output_bytes: usize,
}

impl PruneReport {
    pub fn kept(&self) -> usize {
        self.unet + self.depth + self.vae + self.clip
    }

    pub fn kept_in(&self, group: Group) -> usize {
        match group {
            Group::Unet => self.unet,
            Group::Depth => self.depth,
            Group::Vae => self.vae,
            Group::Clip => self.clip,
        }
    }

    fn count(&mut self, group: Group) {
        match group {
            Group::Unet => self.unet += 1,
            Group::Depth => self.depth += 1,
            Group::Vae => self.vae += 1,
            Group::Clip => self.clip += 1,
        }
    }
}

/// Prune a checkpoint, returning a new one with the same layout.
pub fn prune(checkpoint: &Checkpoint, options: &PruneOptions) -> Result<Checkpoint> {
    prune_with_report(checkpoint, options).map(|(pruned, _)| pruned)
}

/// Prune a checkpoint and report per-group counts.
///
/// The input is never modified: EMA lookups always read the original map and
/// retained tensors share their buffers unless cast.
pub fn prune_with_report(
    checkpoint: &Checkpoint,
    options: &PruneOptions,
) -> Result<(Checkpoint, PruneReport)> {
    let sd = checkpoint.tensors();
    let mut report = PruneReport {
        input_bytes: checkpoint.nbytes(),
        ..Default::default()
    };

    // (target key, source key)
    let mut plan: Vec<(&str, &str)> = Vec::with_capacity(sd.len());
    for key in sd.keys() {
        let Some(group) = options.select(key) else {
            debug!(key = %key, "dropping");
            report.dropped += 1;
            continue;
        };
        report.count(group);

        let mut source = key.as_str();
        if options.ema {
            let candidate = ema_key(key);
            if let Some((ema, _)) = sd.get_key_value(&candidate) {
                debug!(key = %key, ema = %ema, "using EMA weights");
                source = ema.as_str();
                report.ema_substituted += 1;
            }
        }
        plan.push((key.as_str(), source));
    }

    let pruned: TensorMap = plan
        .par_iter()
        .map(|&(key, source)| {
            let tensor = &sd[source];
            let tensor = if options.fp16 {
                cast::to_f16(tensor)?
            } else {
                tensor.clone()
            };
            Ok((key.to_string(), tensor))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .collect();

    if options.fp16 {
        report.cast = plan
            .iter()
            .filter(|&&(_, source)| sd[source].dtype() != Dtype::F16)
            .count();
    }
    report.output_bytes = pruned.values().map(|t| t.nbytes()).sum();

    Ok((Checkpoint::new(checkpoint.layout(), pruned), report))
}
