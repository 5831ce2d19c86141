//! Shared ViT trunk and the masking encoder built on it.

use candle_core::{Module, Tensor};
use candle_nn::{init::Init, VarBuilder};
use rand::Rng;

use super::block::{BlockConfig, LayerNorm, TransformerBlock};
use super::masking::MaskPlan;
use super::patch::{PatchEmbedding, PatchGrid};
use super::{ModelError, Result};
use crate::config::{defaults, ModelConfig};

/// Patch embedding, classification token, positional table, blocks and final norm.
///
/// Registered under `patch_embed.*`, `cls_token`, `pos_embed`, `blocks.{i}.*`
/// and `norm.*`, the same names in the autoencoder and the classifier.
#[derive(Debug)]
pub struct VitBackbone {
    patch_embed: PatchEmbedding,
    cls_token: Tensor,
    pos_embed: Tensor,
    blocks: Vec<TransformerBlock>,
    norm: LayerNorm,
    embed_dim: usize,
}

impl VitBackbone {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let errors = cfg.validation_errors();
        if !errors.is_empty() {
            return Err(ModelError::Config(errors.join("; ")));
        }
        let grid = cfg.grid();
        let dim = cfg.embed_dim;
        let block_cfg = BlockConfig {
            dim,
            num_heads: cfg.n_heads,
            mlp_hidden: cfg.mlp_hidden(dim),
            drop_rate: cfg.drop_rate,
            layer_norm_eps: cfg.layer_norm_eps,
        };

        let patch_embed = PatchEmbedding::new(grid, dim, vb.pp("patch_embed"))?;
        let cls_token = vb.get_with_hints(
            (1, 1, dim),
            "cls_token",
            Init::Randn {
                mean: 0.0,
                stdev: defaults::TOKEN_INIT_STD,
            },
        )?;
        let pos_embed =
            vb.get_with_hints((1, grid.num_patches() + 1, dim), "pos_embed", Init::Const(0.0))?;
        let blocks = (0..cfg.depth)
            .map(|i| TransformerBlock::new(&block_cfg, vb.pp("blocks").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let norm = LayerNorm::new(dim, cfg.layer_norm_eps, vb.pp("norm"))?;

        Ok(Self {
            patch_embed,
            cls_token,
            pos_embed,
            blocks,
            norm,
            embed_dim: dim,
        })
    }

    pub const fn grid(&self) -> &PatchGrid {
        self.patch_embed.grid()
    }

    pub const fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn blocks(&self) -> &[TransformerBlock] {
        &self.blocks
    }

    /// Patch tokens with their positional embedding added: `[B, N, D]`.
    pub fn embed_patches(&self, imgs: &Tensor) -> Result<Tensor> {
        let x = self.patch_embed.forward(imgs)?;
        let n = self.patch_embed.num_patches();
        Ok(x.broadcast_add(&self.pos_embed.narrow(1, 1, n)?)?)
    }

    /// Classification token plus its positional slot, repeated per sample: `[B, 1, D]`.
    pub fn cls_tokens(&self, batch: usize) -> Result<Tensor> {
        let cls = self.cls_token.broadcast_add(&self.pos_embed.narrow(1, 0, 1)?)?;
        Ok(cls.broadcast_as((batch, 1, self.embed_dim))?.contiguous()?)
    }

    /// Run `[B, T, D]` tokens through every block and the final norm.
    pub fn encode(&self, tokens: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = tokens.clone();
        for block in &self.blocks {
            x = block.forward(&x, train)?;
        }
        Ok(self.norm.forward(&x)?)
    }

    /// Per-block attention weights from the latest forward pass.
    pub fn attention_maps(&self) -> Vec<Option<Tensor>> {
        self.blocks.iter().map(TransformerBlock::attention_weights).collect()
    }
}

/// Latent tokens and the mask bookkeeping of one encoder pass.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[B, 1 + len_keep, D]`, classification token first.
    pub latent: Tensor,
    /// `[B, N]` f32, 1 = removed.
    pub mask: Tensor,
    /// `[B, N]` u32.
    pub ids_restore: Tensor,
}

/// Encoder half of the masked autoencoder: sees only the visible patches.
#[derive(Debug)]
pub struct MaeEncoder {
    backbone: VitBackbone,
}

impl MaeEncoder {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            backbone: VitBackbone::new(cfg, vb)?,
        })
    }

    pub const fn backbone(&self) -> &VitBackbone {
        &self.backbone
    }

    /// Mask with a fresh random plan drawn from `rng`, then encode.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        imgs: &Tensor,
        mask_ratio: f64,
        rng: &mut R,
        train: bool,
    ) -> Result<EncoderOutput> {
        let batch = self.backbone.grid().check_images(imgs)?;
        let n = self.backbone.grid().num_patches();
        let plan = MaskPlan::generate(batch, n, mask_ratio, rng)?;
        self.forward_with_plan(imgs, &plan, train)
    }

    /// Encode with a caller-supplied plan.
    pub fn forward_with_plan(
        &self,
        imgs: &Tensor,
        plan: &MaskPlan,
        train: bool,
    ) -> Result<EncoderOutput> {
        let tokens = self.backbone.embed_patches(imgs)?;
        let masked = plan.apply(&tokens)?;
        let cls = self.backbone.cls_tokens(plan.batch())?;

        let x = if plan.kept() == 0 {
            cls
        } else {
            Tensor::cat(&[&cls, &masked.visible], 1)?
        };
        let latent = self.backbone.encode(&x, train)?;

        Ok(EncoderOutput {
            latent,
            mask: masked.mask,
            ids_restore: masked.ids_restore,
        })
    }
}
