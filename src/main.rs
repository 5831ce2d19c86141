//! FaultViT - masked-autoencoder pretraining and ViT fault classification
//!
//! Runs the full pipeline: load (or synthesize) spectrogram sets, standardize
//! each component channel, pretrain the masked autoencoder, transplant the
//! encoder into the classifier and fine-tune it.
//!
//! # Usage
//!
//! ```bash
//! # Synthetic smoke run with built-in defaults
//! cargo run --release
//!
//! # Explicit config, reuse an existing encoder bundle
//! ./faultvit --config faultvit.toml --skip-pretrain
//! ```
//!
//! # Environment Variables
//!
//! - `FAULTVIT_CONFIG`: Path to the TOML config file
//! - `RUST_LOG`: Logging level (default: info)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use tracing::{info, warn};

use faultvit::config::{self, FaultVitConfig};
use faultvit::{FineTuner, Pretrainer, ScalerRegistry, SpectrogramSet};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "faultvit")]
#[command(about = "Masked-autoencoder pretraining and ViT fault diagnosis")]
#[command(version)]
struct CliArgs {
    /// TOML config file (falls back to ./faultvit.toml, then built-in defaults)
    #[arg(long, env = "FAULTVIT_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Skip pretraining and fine-tune from the bundle already on disk
    #[arg(long)]
    skip_pretrain: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Training and validation sets from the configured paths, or synthetic ones.
fn load_sets(cfg: &FaultVitConfig, device: &Device) -> Result<(SpectrogramSet, SpectrogramSet)> {
    let grid = cfg.model.grid();
    let classes = cfg.model.num_classes;

    let (train, val) = match &cfg.data.train_path {
        Some(train_path) => {
            let train = SpectrogramSet::load(Path::new(train_path), &grid, classes, device)
                .with_context(|| format!("loading training set {train_path}"))?;
            let val = match &cfg.data.val_path {
                Some(val_path) => SpectrogramSet::load(Path::new(val_path), &grid, classes, device)
                    .with_context(|| format!("loading validation set {val_path}"))?,
                None => {
                    warn!("No data.val_path configured, validating on the training set");
                    train.clone()
                }
            };
            (train, val)
        }
        None => {
            let n = cfg.data.synthetic_samples;
            info!(samples = n, "No data.train_path configured, using synthetic spectrograms");
            let train = SpectrogramSet::synthetic(n, &grid, classes, cfg.pretrain.seed, device)?;
            let val_seed = cfg.pretrain.seed.wrapping_add(1);
            let val = SpectrogramSet::synthetic((n / 4).max(1), &grid, classes, val_seed, device)?;
            (train, val)
        }
    };

    if cfg.data.components.is_empty() {
        Ok((train, val))
    } else {
        Ok((
            train.with_components(cfg.data.components.clone())?,
            val.with_components(cfg.data.components.clone())?,
        ))
    }
}

fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.json_logs);

    let loaded = match &args.config {
        Some(path) => FaultVitConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => FaultVitConfig::load().context("loading config")?,
    };
    config::init(loaded);
    let cfg = config::get();

    info!(
        img_size = cfg.model.img_size,
        patch_size = cfg.model.patch_size,
        patches = cfg.model.num_patches(),
        embed_dim = cfg.model.embed_dim,
        depth = cfg.model.depth,
        "FaultViT starting"
    );

    #[cfg(feature = "cuda")]
    let device = Device::cuda_if_available(0)?;
    #[cfg(not(feature = "cuda"))]
    let device = Device::Cpu;
    info!(device = ?device, "Tensor device selected");
    let (train, val) = load_sets(cfg, &device)?;

    let mut scalers = ScalerRegistry::new();
    let train = scalers.normalize(&train)?;
    let val = scalers.normalize(&val)?;
    info!(components = scalers.len(), "Channel scalers fitted on the training set");

    let bundle_dir = PathBuf::from(&cfg.pretrain.bundle_dir);
    if args.skip_pretrain {
        info!(dir = %bundle_dir.display(), "Skipping pretraining");
    } else {
        let mut pretrainer = Pretrainer::new(&cfg.model, &cfg.pretrain, &device)?;
        let summary = pretrainer.fit(&train, &val, &bundle_dir)?;
        info!(
            best_epoch = ?summary.best_epoch,
            best_val_loss = ?summary.best_val_loss,
            "Pretraining finished"
        );
    }

    let mut tuner = if cfg.finetune.from_pretrained {
        FineTuner::vit_from_bundle(&cfg.model, &cfg.finetune, &bundle_dir, &device)
            .with_context(|| format!("starting from bundle {}", bundle_dir.display()))?
    } else {
        FineTuner::vit(&cfg.model, &cfg.finetune, &device)?
    };
    let summary = tuner.fit(&train, &val)?;
    let eval = tuner.evaluate(&val)?;
    info!(
        best_epoch = ?summary.best_epoch,
        val_loss = eval.loss,
        val_accuracy = eval.accuracy,
        "Fine-tuning finished"
    );

    Ok(())
}
