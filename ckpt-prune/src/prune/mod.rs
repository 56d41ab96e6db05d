//! Prune command - load, filter and re-save a checkpoint.

use anyhow::{Context, Result};
use checkpoint_storage::{prune_with_report, CheckpointFormat, PruneOptions, PruneReport};
use std::path::Path;
use tracing::info;

use crate::common::{format_bytes, load_config};
use crate::config::prune_config::FlagOverrides;

/// Run the prune pipeline from `input` to `output`.
pub fn run(input: &str, output: &str, config_path: Option<&str>, flags: FlagOverrides) -> Result<()> {
    let options: PruneOptions = flags.apply(load_config(config_path)?);
    info!(?options, "prune options");

    let input_path = Path::new(input);
    let output_path = Path::new(output);
    let input_format = CheckpointFormat::from_path(input_path);
    let output_format = CheckpointFormat::from_path(output_path);

    println!("Loading {} ({})", input, input_format);
    let checkpoint = input_format
        .load(input_path)
        .with_context(|| format!("Failed to load checkpoint: {}", input))?;
    println!(
        "  {} tensors{}",
        checkpoint.len(),
        if checkpoint.is_nested() { " under state_dict" } else { "" }
    );

    let (pruned, report) = prune_with_report(&checkpoint, &options)
        .with_context(|| format!("Failed to prune checkpoint: {}", input))?;
    drop(checkpoint);
    info!(kept = report.kept(), dropped = report.dropped, "pruned");

    println!("Saving {} ({})", output, output_format);
    output_format
        .save(&pruned, output_path)
        .with_context(|| format!("Failed to write checkpoint: {}", output))?;

    print_summary(&options, &report);
    Ok(())
}

fn print_summary(options: &PruneOptions, report: &PruneReport) {
    println!("\n=== Pruned checkpoint ===");
    for (group, _, keep) in options.selection() {
        if keep {
            println!("  {:<6} {} tensors", group.name(), report.kept_in(group));
        } else {
            println!("  {:<6} removed", group.name());
        }
    }
    println!("Dropped: {}", report.dropped);
    if options.ema {
        println!("EMA weights used: {}", report.ema_substituted);
    }
    if options.fp16 {
        println!("Cast to fp16: {}", report.cast);
    }
    println!(
        "Size: {} -> {}",
        format_bytes(report.input_bytes),
        format_bytes(report.output_bytes)
    );
}
