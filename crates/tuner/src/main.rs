mod config;
mod layers;
mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device};
use clap::{Args, Parser, Subcommand};
use gemm_core::tuning::parse_tuning_seq;
use gemm_core::{run_tuning_warmup, CandleBackend, KernelVariant, LinearDispatch, WarmupConfig};
use tracing::{info, warn};

use crate::config::TunerConfig;
use crate::layers::SyntheticLayer;

#[derive(Parser)]
#[command(name = "gemm-tuner", about = "Tune, inspect and compare GEMM dispatch caches")]
struct Cli {
    /// Fallback log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

/// Options shared by every command that builds layers.
#[derive(Args)]
struct LayerArgs {
    /// Config file (default: ~/.config/gemm-tuner/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device: cpu, cuda, cuda:N, metal
    #[arg(long)]
    device: Option<String>,

    /// Activation and weight dtype: bf16, fp16, fp32
    #[arg(long)]
    dtype: Option<String>,

    /// Tuning cache file
    #[arg(long)]
    cache: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Measure every configured layer over the tuning sequence and write the cache
    Tune {
        #[command(flatten)]
        layers: LayerArgs,

        /// Largest batch size of the default tuning sequence
        #[arg(long)]
        max_batch: Option<usize>,

        /// Explicit tuning sequence, e.g. "1,2,4,16:256:16"
        #[arg(long)]
        seq: Option<String>,

        /// Untimed runs per candidate
        #[arg(long)]
        warmup_iters: Option<usize>,

        /// Timed runs per candidate
        #[arg(long)]
        timed_iters: Option<usize>,

        /// Keep records already present in the cache file
        #[arg(long)]
        append: bool,
    },

    /// Print the records of a cache file
    Inspect {
        /// Tuning cache file
        path: PathBuf,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Time the default variant against the tuned one per layer and batch size
    Compare {
        #[command(flatten)]
        layers: LayerArgs,

        /// Batch sizes to compare, same syntax as --seq (default: 1,16,128)
        #[arg(long)]
        sizes: Option<String>,

        /// Timed forward calls per measurement
        #[arg(long, default_value_t = 10)]
        iters: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_with_level(&cli.log_level)?;

    match cli.command {
        Command::Tune {
            layers,
            max_batch,
            seq,
            warmup_iters,
            timed_iters,
            append,
        } => {
            let mut config = resolve_config(&layers)?;
            config.merge(&TunerConfig {
                max_batch,
                seq,
                warmup_iters,
                timed_iters,
                ..Default::default()
            });
            tune(&config, append)
        }
        Command::Inspect { path, json } => inspect(&path, json),
        Command::Compare {
            layers,
            sizes,
            iters,
        } => {
            let config = resolve_config(&layers)?;
            let sizes = match sizes {
                Some(s) => parse_tuning_seq(&s)?,
                None => vec![1, 16, 128],
            };
            compare(&config, &sizes, iters.max(1))
        }
    }
}

/// File config overridden by the command line.
fn resolve_config(args: &LayerArgs) -> anyhow::Result<TunerConfig> {
    let mut config = match &args.config {
        Some(path) => TunerConfig::load_from(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => {
            if let Some(path) = TunerConfig::default_path() {
                if path.exists() {
                    info!(path = %path.display(), "Loading config file");
                }
            }
            TunerConfig::load()
        }
    };
    config.merge(&TunerConfig {
        device: args.device.clone(),
        dtype: args.dtype.clone(),
        cache_path: args.cache.clone(),
        ..Default::default()
    });
    Ok(config)
}

fn parse_device(name: &str) -> anyhow::Result<Device> {
    let device = match name {
        "cpu" => Device::Cpu,
        "cuda" => Device::new_cuda(0)?,
        "metal" => Device::new_metal(0)?,
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => {
                let ordinal: usize = ordinal
                    .parse()
                    .with_context(|| format!("invalid CUDA ordinal in '{other}'"))?;
                Device::new_cuda(ordinal)?
            }
            None => anyhow::bail!(
                "Unknown device '{}'. Supported: cpu, cuda, cuda:N, metal",
                other
            ),
        },
    };
    Ok(device)
}

fn parse_dtype(name: &str) -> anyhow::Result<DType> {
    Ok(match name {
        "bf16" | "bfloat16" => DType::BF16,
        "fp16" | "float16" | "half" => DType::F16,
        "fp32" | "float32" | "float" => DType::F32,
        other => anyhow::bail!("Unknown dtype '{}'. Supported: bf16, fp16, fp32", other),
    })
}

fn build_layers(config: &TunerConfig, device: &Device) -> anyhow::Result<Vec<SyntheticLayer>> {
    let dtype = parse_dtype(config.dtype.as_deref().unwrap_or("fp32"))?;
    let specs = config.layers()?;
    Ok(layers::build_all(&specs, dtype, device)?)
}

fn open_dispatch(config: &TunerConfig, device: Device) -> anyhow::Result<LinearDispatch> {
    let backend = Arc::new(CandleBackend::new(device));
    Ok(LinearDispatch::with_params(backend, config.tuning_params())?)
}

fn tune(config: &TunerConfig, append: bool) -> anyhow::Result<()> {
    let device = parse_device(config.device.as_deref().unwrap_or("cpu"))?;
    let layers = build_layers(config, &device)?;
    let dispatch = open_dispatch(config, device)?;
    let path = config.cache_path();

    if append && path.exists() {
        let imported = dispatch.import_from_path(&path)?;
        info!(records = imported, "Keeping existing records");
    }

    let seq = dispatch.tuning_seq();
    info!(
        layers = layers.len(),
        sizes = seq.iter().count(),
        max_batch = seq.max_batch(),
        "Starting tuning"
    );
    let stats = run_tuning_warmup(&dispatch, &WarmupConfig::default(), |batch| {
        for layer in &layers {
            layer.run(&dispatch, batch)?;
        }
        Ok(())
    })?;
    for error in &stats.errors {
        warn!(%error, "Batch size skipped");
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let written = dispatch.export_to_path(&path)?;
    println!(
        "Wrote {} records to {} ({} sizes tuned, {} failed, {} ms)",
        written,
        path.display(),
        stats.tuned_sizes.len(),
        stats.failed_sizes.len(),
        stats.total_time_ms
    );
    Ok(())
}

fn inspect(path: &Path, json: bool) -> anyhow::Result<()> {
    let dispatch = LinearDispatch::new(Arc::new(CandleBackend::cpu()));
    dispatch
        .import_from_path(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let records = dispatch.records();

    if json {
        let rows: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "kind": r.signature.kind,
                    "batch_size": r.signature.batch_size,
                    "input_dim": r.signature.input_dim,
                    "output_dim": r.signature.output_dim,
                    "layout": r.signature.layout.to_string(),
                    "num_experts": r.signature.num_experts,
                    "variant": r.variant.to_string(),
                    "cost_us": r.cost_us,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{} records in {}", records.len(), path.display());
    for r in &records {
        println!("  {:<48} {:<16} {:>10.2} us", r.signature.to_string(), r.variant.to_string(), r.cost_us);
    }
    Ok(())
}

/// Mean wall time per call in microseconds.
fn time_calls(
    layer: &SyntheticLayer,
    dispatch: &LinearDispatch,
    batch: usize,
    iters: usize,
) -> gemm_core::Result<f64> {
    layer.run(dispatch, batch)?;
    let start = Instant::now();
    for _ in 0..iters {
        layer.run(dispatch, batch)?;
    }
    Ok(start.elapsed().as_secs_f64() * 1e6 / iters as f64)
}

fn compare(config: &TunerConfig, sizes: &[usize], iters: usize) -> anyhow::Result<()> {
    let device = parse_device(config.device.as_deref().unwrap_or("cpu"))?;
    let layers = build_layers(config, &device)?;
    let path = config.cache_path();

    let baseline = open_dispatch(config, device.clone())?;
    let tuned = open_dispatch(config, device)?;
    tuned
        .import_from_path(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    println!(
        "{:<16} {:>6} {:<16} {:>12} {:>12} {:>8}",
        "layer", "batch", "tuned", "default us", "tuned us", "speedup"
    );
    for layer in &layers {
        for &batch in sizes {
            let chosen = tuned.select(&layer.signature(batch));
            let default_us = time_calls(layer, &baseline, batch, iters)?;
            let tuned_us = time_calls(layer, &tuned, batch, iters)?;
            let marker = if chosen == KernelVariant::DEFAULT { " (default)" } else { "" };
            println!(
                "{:<16} {:>6} {:<16} {:>12.1} {:>12.1} {:>7.2}x{}",
                layer.spec().name,
                batch,
                chosen.to_string(),
                default_us,
                tuned_us,
                default_us / tuned_us.max(f64::EPSILON),
                marker
            );
        }
    }
    let stats = tuned.cache_stats();
    info!(hits = stats.hits, misses = stats.misses, "Comparison complete");
    Ok(())
}
