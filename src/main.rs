// src/main.rs
// ============================================================================
// WEIGHTPACK CLI
// ============================================================================
//
// Uso:
//   weightpack ./Llama-2-7B-GPTQ -o llama7b.zip
//   weightpack model.safetensors -o model.zip --layers 32 --no-downcast
//
// ============================================================================

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};

use weightpack::{
    mapping::{self, config::architecture, layer_count, load_config},
    ArchiveEncoder, EncodeStats, SafetensorReader,
};

#[derive(Parser, Debug)]
#[command(name = "weightpack")]
#[command(about = "Pack a GPTQ checkpoint into a type-prefixed ZIP archive")]
#[command(version)]
struct Args {
    /// Checkpoint: .safetensors file or folder of shards
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output ZIP archive
    #[arg(short, long, required = true)]
    output: PathBuf,

    /// Decoder layers (default: read from config.json)
    #[arg(short, long)]
    layers: Option<usize>,

    /// Keep embeddings and norms in their stored precision
    #[arg(long)]
    no_downcast: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let start = Instant::now();
    let downcast = !args.no_downcast;

    let layers = resolve_layer_count(&args)?;
    let map = mapping::generate(layers);

    println!("═══════════════════════════════════════════════════════════════");
    println!("  WEIGHTPACK v{}", env!("CARGO_PKG_VERSION"));
    println!("═══════════════════════════════════════════════════════════════");
    println!("  Input:    {}", args.input.display());
    println!("  Layers:   {} ({} entries)", layers, map.len());
    println!("  Downcast: {}", if downcast { "ON (embeddings/norms → FP16)" } else { "OFF" });
    println!("  Output:   {}", args.output.display());
    println!("═══════════════════════════════════════════════════════════════");

    let reader = SafetensorReader::open(&args.input)?;
    info!("Loaded {} tensors from {} file(s)", reader.len(), reader.num_files());

    let progress = ProgressBar::new(map.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>4}/{len:4} {msg}")?
            .progress_chars("█▓░"),
    );

    let encoder = ArchiveEncoder::new(downcast).with_progress(progress.clone());
    let result = encoder.convert(&reader, layers, &args.output);
    progress.finish_and_clear();

    let stats = result.with_context(|| format!("Conversion of {} failed", args.input.display()))?;

    if !stats.unused_keys.is_empty() {
        warn!("{} checkpoint tensors not used by the name map", stats.unused_keys.len());
        for key in stats.unused_keys.iter().take(10) {
            warn!("  - {}", key);
        }
        if stats.unused_keys.len() > 10 {
            warn!("  ... and {} more", stats.unused_keys.len() - 10);
        }
    }

    print_summary(&args, &stats, start)?;
    Ok(())
}

/// --layers gana; si no, config.json del checkpoint
fn resolve_layer_count(args: &Args) -> Result<usize> {
    let config = load_config(&args.input).ok();
    let from_config = config.as_ref().and_then(layer_count);

    if let Some(arch) = config.as_ref().and_then(architecture) {
        if !arch.contains("llama") {
            warn!("Architecture '{}' is not llama; the name map assumes llama layout", arch);
        }
    }

    match (args.layers, from_config) {
        (Some(n), Some(c)) if n != c => {
            warn!("--layers {} differs from config.json ({} layers)", n, c);
            Ok(n)
        }
        (Some(n), _) => Ok(n),
        (None, Some(c)) => {
            info!("Layer count {} from config.json", c);
            Ok(c)
        }
        (None, None) => bail!(
            "Cannot determine layer count: no config.json next to {}; pass --layers",
            args.input.display()
        ),
    }
}

fn print_summary(args: &Args, stats: &EncodeStats, start: Instant) -> Result<()> {
    let elapsed = start.elapsed();
    let file_size = std::fs::metadata(&args.output)?.len();

    println!("\n═══════════════════════════════════════════════════════════════");
    println!("  CONVERSION COMPLETE");
    println!("═══════════════════════════════════════════════════════════════");
    println!("  Time:     {:.1}s", elapsed.as_secs_f64());
    println!("  Size:     {:.1} MB", file_size as f64 / 1024.0 / 1024.0);
    println!(
        "  Entries:  {} (float32:{}, float16:{}, int32:{})",
        stats.total_entries(),
        stats.float32_count,
        stats.float16_count,
        stats.int32_count
    );
    println!("  Downcast: {}", stats.downcast_count);
    println!("  Skipped:  {} optional", stats.skipped_optional);
    println!("  Output:   {}", args.output.display());
    println!("═══════════════════════════════════════════════════════════════");
    Ok(())
}
