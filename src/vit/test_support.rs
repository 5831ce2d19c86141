//! Shared fixtures for unit tests.

use crate::config::ModelConfig;

/// 16x16 two-channel images, 4x4 patches: 16 tokens.
pub fn tiny_config() -> ModelConfig {
    ModelConfig {
        img_size: 16,
        patch_size: 4,
        in_channels: 2,
        embed_dim: 16,
        depth: 2,
        n_heads: 2,
        decoder_embed_dim: 8,
        decoder_depth: 1,
        decoder_n_heads: 2,
        mlp_ratio: 2.0,
        num_classes: 3,
        ..ModelConfig::default()
    }
}
