//! Lightweight decoder: refills masked positions and predicts pixel values.

use candle_core::{Module, Tensor};
use candle_nn::{init::Init, Linear, VarBuilder};

use super::block::{BlockConfig, LayerNorm, TransformerBlock};
use super::masking::unshuffle;
use super::{ModelError, Result};
use crate::config::{defaults, ModelConfig};

/// Registered under `decoder_embed.*`, `mask_token`, `decoder_pos_embed`,
/// `decoder_blocks.{i}.*`, `decoder_norm.*` and `decoder_pred.*`.
#[derive(Debug)]
pub struct MaeDecoder {
    decoder_embed: Linear,
    mask_token: Tensor,
    decoder_pos_embed: Tensor,
    blocks: Vec<TransformerBlock>,
    norm: LayerNorm,
    pred: Linear,
    num_patches: usize,
}

impl MaeDecoder {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let grid = cfg.grid();
        let dim = cfg.decoder_embed_dim;
        let block_cfg = BlockConfig {
            dim,
            num_heads: cfg.decoder_n_heads,
            mlp_hidden: cfg.mlp_hidden(dim),
            drop_rate: cfg.drop_rate,
            layer_norm_eps: cfg.layer_norm_eps,
        };

        let decoder_embed = candle_nn::linear(cfg.embed_dim, dim, vb.pp("decoder_embed"))?;
        let mask_token = vb.get_with_hints(
            (1, 1, dim),
            "mask_token",
            Init::Randn {
                mean: 0.0,
                stdev: defaults::TOKEN_INIT_STD,
            },
        )?;
        let decoder_pos_embed = vb.get_with_hints(
            (1, grid.num_patches() + 1, dim),
            "decoder_pos_embed",
            Init::Const(0.0),
        )?;
        let blocks = (0..cfg.decoder_depth)
            .map(|i| TransformerBlock::new(&block_cfg, vb.pp("decoder_blocks").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let norm = LayerNorm::new(dim, cfg.layer_norm_eps, vb.pp("decoder_norm"))?;
        let pred = candle_nn::linear(dim, grid.patch_dim(), vb.pp("decoder_pred"))?;

        Ok(Self {
            decoder_embed,
            mask_token,
            decoder_pos_embed,
            blocks,
            norm,
            pred,
            num_patches: grid.num_patches(),
        })
    }

    /// `latent` `[B, 1 + K, D]` and `ids_restore` `[B, N]` → predictions `[B, N, p*p*C]`.
    pub fn forward(&self, latent: &Tensor, ids_restore: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.decoder_embed.forward(latent)?;
        let (b, t, dim) = x.dims3()?;
        let n = self.num_patches;
        let kept = t.saturating_sub(1);
        if t == 0 || kept > n || ids_restore.dims() != [b, n] {
            return Err(ModelError::Config(format!(
                "decoder expects latent [B, 1..={}, D] and ids_restore [B, {n}], got {:?} and {:?}",
                n + 1,
                latent.dims(),
                ids_restore.dims()
            )));
        }

        let cls = x.narrow(1, 0, 1)?;
        // shuffled order: visible tokens first, then one mask token per removed patch
        let shuffled = if kept == 0 {
            self.mask_token.broadcast_as((b, n, dim))?
        } else if kept == n {
            x.narrow(1, 1, kept)?
        } else {
            let fill = self.mask_token.broadcast_as((b, n - kept, dim))?;
            Tensor::cat(&[&x.narrow(1, 1, kept)?, &fill], 1)?
        };
        let tokens = unshuffle(&shuffled, ids_restore)?;

        let mut x = Tensor::cat(&[&cls, &tokens], 1)?.broadcast_add(&self.decoder_pos_embed)?;
        for block in &self.blocks {
            x = block.forward(&x, train)?;
        }
        let x = self.pred.forward(&self.norm.forward(&x)?)?;
        Ok(x.narrow(1, 1, n)?)
    }
}
