//! Command-line flags layered over a JSON prune config.

use checkpoint_storage::PruneOptions;

/// Switches given on the command line.
///
/// A set flag always wins over the config file; an unset flag leaves the
/// config value alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagOverrides {
    pub fp16: bool,
    pub ema: bool,
    pub no_clip: bool,
    pub no_vae: bool,
    pub no_depth: bool,
    pub no_unet: bool,
}

impl FlagOverrides {
    pub fn apply(self, mut options: PruneOptions) -> PruneOptions {
        options.fp16 |= self.fp16;
        options.ema |= self.ema;
        options.clip &= !self.no_clip;
        options.vae &= !self.no_vae;
        options.depth &= !self.no_depth;
        options.unet &= !self.no_unet;
        options
    }
}
