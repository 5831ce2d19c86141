//! System-wide default constants.
//!
//! Centralises the built-in values behind every `#[serde(default)]` field
//! in [`super::FaultVitConfig`]. Grouped by subsystem for easy discovery.

// ============================================================================
// Model geometry
// ============================================================================

/// Side length of the (square) spectrogram image fed to the ViT.
pub const IMG_SIZE: usize = 224;

/// Side length of one square patch.
pub const PATCH_SIZE: usize = 16;

/// Channels per image (one per drivetrain component).
pub const IN_CHANNELS: usize = 4;

/// Encoder token width.
pub const EMBED_DIM: usize = 192;

/// Encoder transformer blocks.
pub const DEPTH: usize = 12;

/// Encoder attention heads.
pub const N_HEADS: usize = 3;

/// Decoder token width.
pub const DECODER_EMBED_DIM: usize = 128;

/// Decoder transformer blocks.
pub const DECODER_DEPTH: usize = 4;

/// Decoder attention heads.
pub const DECODER_N_HEADS: usize = 4;

/// Hidden width of the feed-forward sub-layer relative to the token width.
pub const MLP_RATIO: f64 = 4.0;

/// Fault classes (healthy + fault modes).
pub const NUM_CLASSES: usize = 5;

/// LayerNorm epsilon used by every norm in the encoder, decoder and classifier.
pub const LAYER_NORM_EPS: f64 = 1e-6;

/// Standard deviation of the normal init for the classification and mask tokens.
pub const TOKEN_INIT_STD: f64 = 0.02;

// ============================================================================
// Pretraining
// ============================================================================

/// Fraction of patches hidden from the encoder.
pub const MASK_RATIO: f64 = 0.75;

/// Epsilon added to the per-patch variance when normalizing targets.
pub const NORM_PIX_EPS: f64 = 1e-6;

pub const PRETRAIN_EPOCHS: usize = 100;
pub const PRETRAIN_BATCH_SIZE: usize = 32;
pub const PRETRAIN_LR: f64 = 1.5e-4;
pub const PRETRAIN_WEIGHT_DECAY: f64 = 0.05;
pub const PRETRAIN_WARMUP_EPOCHS: usize = 5;

/// Floor of the cosine schedule.
pub const MIN_LR: f64 = 1e-6;

// ============================================================================
// Fine-tuning
// ============================================================================

pub const FINETUNE_EPOCHS: usize = 50;
pub const FINETUNE_BATCH_SIZE: usize = 32;
pub const FINETUNE_LR: f64 = 1e-3;
pub const FINETUNE_WEIGHT_DECAY: f64 = 0.05;
pub const FINETUNE_WARMUP_EPOCHS: usize = 2;

// ============================================================================
// Bundle files
// ============================================================================

/// Directory the pretrainer writes the best encoder bundle to.
pub const BUNDLE_DIR: &str = "./checkpoints/mae_encoder";

/// Manifest file inside a bundle directory.
pub const BUNDLE_MANIFEST_FILE: &str = "manifest.json";

/// Tensor file inside a bundle directory.
pub const BUNDLE_TENSOR_FILE: &str = "encoder.safetensors";

/// Current bundle format version.
pub const BUNDLE_VERSION: u32 = 1;

// ============================================================================
// Scaling
// ============================================================================

/// Floor on a fitted standard deviation so constant channels do not divide by zero.
pub const SCALER_MIN_STD: f64 = 1e-8;

/// Seed for shuffling and masking when none is configured.
pub const SEED: u64 = 42;
