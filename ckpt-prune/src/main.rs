//! ckpt-prune - Strip training state and unused sub-models from diffusion checkpoints.

use clap::{ArgAction, CommandFactory, Parser};

mod common;
mod config;
mod prune;

use config::prune_config::FlagOverrides;

#[derive(Parser)]
#[command(name = "ckpt-prune", version)]
#[command(about = "Prune Stable Diffusion checkpoints down to their inference weights")]
struct Cli {
    /// Input checkpoint (.ckpt, .pt, .safetensors)
    input: String,

    /// Output checkpoint; the format follows the extension
    output: String,

    /// Convert floating point tensors to fp16
    #[arg(short = 'p', long)]
    fp16: bool,

    /// Use EMA weights where available
    #[arg(short, long)]
    ema: bool,

    /// Remove the CLIP text encoder
    #[arg(short = 'c', long)]
    no_clip: bool,

    /// Remove the VAE
    #[arg(short = 'a', long)]
    no_vae: bool,

    /// Remove the depth model
    #[arg(short = 'd', long)]
    no_depth: bool,

    /// Remove the UNet
    #[arg(short = 'u', long)]
    no_unet: bool,

    /// Path to prune config JSON (optional); flags are applied on top
    #[arg(long)]
    config: Option<String>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn flags(&self) -> FlagOverrides {
        FlagOverrides {
            fp16: self.fp16,
            ema: self.ema,
            no_clip: self.no_clip,
            no_vae: self.no_vae,
            no_depth: self.no_depth,
            no_unet: self.no_unet,
        }
    }
}

/// Parse arguments; usage errors print the full help and exit with status 2.
fn parse_args() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => {
            let _ = err.print();
            eprintln!("\n{}", Cli::command().render_long_help());
            std::process::exit(2);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = parse_args();
    common::init_tracing(cli.verbose);

    prune::run(&cli.input, &cli.output, cli.config.as_deref(), cli.flags())?;

    Ok(())
}
