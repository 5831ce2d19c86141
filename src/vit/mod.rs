//! Vision Transformer backbone with masked-autoencoder pretraining.
//!
//! ## Data flow
//!
//! ```text
//! [B,C,H,W] ─► PatchEmbedding ─► + pos_embed ─► MaskPlan (keep len_keep)
//!           ─► [cls | visible] ─► encoder blocks ─► latent [B,1+len_keep,D]
//!           ─► decoder_embed ─► [visible | mask tokens] ─► unshuffle (ids_restore)
//!           ─► [cls | N tokens] ─► decoder blocks ─► decoder_pred ─► [B,N,p*p*C]
//! ```
//!
//! After pretraining the encoder blocks, classification token and
//! positional embedding are written to an [`EncoderBundle`] and
//! transplanted into a [`VitClassifier`] for supervised fine-tuning.
//!
//! All parameters are registered through a `candle_nn::VarBuilder` using the
//! conventional MAE key layout (`blocks.{i}.attn.qkv.weight`, `cls_token`,
//! `pos_embed`, `decoder_blocks.{i}.*`, ...), which is what makes key-based
//! transplant between the autoencoder and the classifier work.

pub mod block;
pub mod classifier;
pub mod decoder;
pub mod encoder;
pub mod loss;
pub mod mae;
pub mod masking;
pub mod patch;
pub mod pos_embed;
pub mod transplant;

#[cfg(test)]
pub(crate) mod test_support;

pub use block::{BlockConfig, LayerNorm, Mlp, MultiHeadAttention, TransformerBlock};
pub use classifier::VitClassifier;
pub use decoder::MaeDecoder;
pub use encoder::{EncoderOutput, MaeEncoder, VitBackbone};
pub use loss::reconstruction_loss;
pub use mae::{MaeOutput, MaskedAutoencoder};
pub use masking::{unshuffle, MaskPlan, MaskedTokens};
pub use patch::{patchify, unpatchify, GridTraversal, PatchEmbedding, PatchGrid};
pub use transplant::{load_pretrained, transplant, BundleManifest, EncoderBundle, TransplantReport};

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building, running or transplanting the models.
///
/// Every variant except `Candle`/`Io` is a configuration error: it means
/// the caller wired incompatible shapes together and is not retryable.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("image shape mismatch: expected [B, {channels}, {size}, {size}], got {actual:?}")]
    ImageShape {
        channels: usize,
        size: usize,
        actual: Vec<usize>,
    },

    #[error("invalid model configuration: {0}")]
    Config(String),

    #[error("mask ratio {0} must be in [0, 1)")]
    MaskRatio(f64),

    #[error("shape mismatch for '{key}': bundle has {bundle:?}, model has {model:?}")]
    ShapeMismatch {
        key: String,
        bundle: Vec<usize>,
        model: Vec<usize>,
    },

    #[error("invalid parameter bundle at {path}: {reason}")]
    Bundle { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
