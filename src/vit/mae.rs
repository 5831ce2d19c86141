//! Masked autoencoder: masking encoder plus pixel-predicting decoder.
//!
//! Only the encoder subset of its parameters survives pretraining; the
//! decoder exists to give the encoder a reconstruction signal.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use rand::Rng;

use super::decoder::MaeDecoder;
use super::encoder::{EncoderOutput, MaeEncoder};
use super::loss::reconstruction_loss;
use super::masking::MaskPlan;
use super::patch::PatchGrid;
use super::Result;
use crate::config::ModelConfig;

/// Everything one masked forward pass produces.
#[derive(Debug, Clone)]
pub struct MaeOutput {
    /// `[B, N, p*p*C]` pixel predictions for every patch.
    pub pred: Tensor,
    /// `[B, N]` f32, 1 = removed.
    pub mask: Tensor,
    /// `[B, 1 + len_keep, D]`.
    pub latent: Tensor,
    /// `[B, N]` u32.
    pub ids_restore: Tensor,
}

/// Encoder and decoder trained together to reconstruct masked patches.
#[derive(Debug)]
pub struct MaskedAutoencoder {
    encoder: MaeEncoder,
    decoder: MaeDecoder,
    grid: PatchGrid,
    norm_pix_loss: bool,
}

impl MaskedAutoencoder {
    pub fn new(cfg: &ModelConfig, norm_pix_loss: bool, vb: VarBuilder) -> Result<Self> {
        let encoder = MaeEncoder::new(cfg, vb.clone())?;
        let decoder = MaeDecoder::new(cfg, vb)?;
        Ok(Self {
            encoder,
            decoder,
            grid: cfg.grid(),
            norm_pix_loss,
        })
    }

    pub const fn encoder(&self) -> &MaeEncoder {
        &self.encoder
    }

    pub const fn grid(&self) -> &PatchGrid {
        &self.grid
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        imgs: &Tensor,
        mask_ratio: f64,
        rng: &mut R,
        train: bool,
    ) -> Result<MaeOutput> {
        let encoded = self.encoder.forward(imgs, mask_ratio, rng, train)?;
        self.decode(encoded, train)
    }

    pub fn forward_with_plan(
        &self,
        imgs: &Tensor,
        plan: &MaskPlan,
        train: bool,
    ) -> Result<MaeOutput> {
        let encoded = self.encoder.forward_with_plan(imgs, plan, train)?;
        self.decode(encoded, train)
    }

    fn decode(&self, encoded: EncoderOutput, train: bool) -> Result<MaeOutput> {
        let pred = self.decoder.forward(&encoded.latent, &encoded.ids_restore, train)?;
        Ok(MaeOutput {
            pred,
            mask: encoded.mask,
            latent: encoded.latent,
            ids_restore: encoded.ids_restore,
        })
    }

    /// Masked-patch reconstruction loss of `out` against `imgs`.
    pub fn loss(&self, imgs: &Tensor, out: &MaeOutput) -> Result<Tensor> {
        reconstruction_loss(imgs, &out.pred, &out.mask, &self.grid, self.norm_pix_loss)
    }
}
