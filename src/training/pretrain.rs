//! Masked-autoencoder pretraining loop.
//!
//! Each epoch shuffles the set, draws fresh masks per batch and steps AdamW
//! at the scheduled rate. Validation reuses one fixed mask seed, and every
//! improvement in validation loss is persisted as an encoder bundle.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info};

use super::{check_finite, EpochReport, LrSchedule, Result, TrainingError};
use crate::config::{ModelConfig, PosEmbedInit, PretrainConfig};
use crate::data::SpectrogramSet;
use crate::vit::{pos_embed, EncoderBundle, MaskPlan, MaskedAutoencoder};

/// Offset mixed into the seed of the fixed validation masks.
const EVAL_SEED_OFFSET: u64 = 0x5eed;

#[derive(Debug, Clone)]
pub struct PretrainSummary {
    pub history: Vec<EpochReport>,
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f32>,
    pub bundle_dir: PathBuf,
}

/// Masked-autoencoder pretraining on unlabelled spectrograms.
pub struct Pretrainer {
    varmap: VarMap,
    model: MaskedAutoencoder,
    optimizer: AdamW,
    schedule: LrSchedule,
    model_cfg: ModelConfig,
    cfg: PretrainConfig,
    rng: StdRng,
    epoch: usize,
    step: usize,
}

impl Pretrainer {
    pub fn new(model_cfg: &ModelConfig, cfg: &PretrainConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = MaskedAutoencoder::new(model_cfg, cfg.norm_pix_loss, vb)?;
        if model_cfg.pos_embed_init == PosEmbedInit::Sincos {
            let side = model_cfg.grid().grid_side();
            pos_embed::install_sincos(&varmap, "pos_embed", side)?;
            pos_embed::install_sincos(&varmap, "decoder_pos_embed", side)?;
        }

        let schedule = LrSchedule::from_config(&cfg.schedule());
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: schedule.lr_at(0.0),
                weight_decay: cfg.weight_decay,
                beta1: 0.9,
                beta2: 0.95,
                ..Default::default()
            },
        )?;
        debug!(params = varmap.all_vars().len(), "Masked autoencoder built");

        Ok(Self {
            varmap,
            model,
            optimizer,
            schedule,
            model_cfg: model_cfg.clone(),
            cfg: cfg.clone(),
            rng: StdRng::seed_from_u64(cfg.seed),
            epoch: 0,
            step: 0,
        })
    }

    pub const fn model(&self) -> &MaskedAutoencoder {
        &self.model
    }

    pub const fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Completed epochs.
    pub const fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    /// One optimizer step on `imgs` with freshly drawn masks.
    pub fn train_step(&mut self, imgs: &Tensor) -> Result<f32> {
        let out = self
            .model
            .forward(imgs, self.cfg.mask_ratio, &mut self.rng, true)?;
        let loss = self.model.loss(imgs, &out)?;
        self.apply(&loss)
    }

    /// One optimizer step with a caller-supplied mask plan.
    pub fn train_step_with_plan(&mut self, imgs: &Tensor, plan: &MaskPlan) -> Result<f32> {
        let out = self.model.forward_with_plan(imgs, plan, true)?;
        let loss = self.model.loss(imgs, &out)?;
        self.apply(&loss)
    }

    fn apply(&mut self, loss: &Tensor) -> Result<f32> {
        let value = check_finite(loss.to_scalar::<f32>()?, self.epoch, self.step)?;
        self.optimizer.backward_step(loss)?;
        self.step += 1;
        Ok(value)
    }

    /// One shuffled pass over `data`; returns the sample-weighted mean loss.
    #[allow(clippy::cast_precision_loss)]
    pub fn train_epoch(&mut self, data: &SpectrogramSet) -> Result<f32> {
        if data.is_empty() {
            return Err(TrainingError::EmptySet("pretraining"));
        }
        let batches = data.batches(self.cfg.batch_size, Some(&mut self.rng))?;
        let total = batches.len() as f64;

        let mut loss_sum = 0.0f64;
        for (i, batch) in batches.iter().enumerate() {
            let lr = self.schedule.lr_at(self.epoch as f64 + i as f64 / total);
            self.optimizer.set_learning_rate(lr);
            let loss = self.train_step(&batch.images)?;
            loss_sum += f64::from(loss) * batch.len() as f64;
        }
        self.epoch += 1;

        #[allow(clippy::cast_possible_truncation)]
        Ok((loss_sum / data.len() as f64) as f32)
    }

    /// Mean masked reconstruction loss over `data`.
    ///
    /// Masks come from a fixed seed so successive epochs are scored on
    /// identical masks.
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate(&self, data: &SpectrogramSet) -> Result<f32> {
        if data.is_empty() {
            return Err(TrainingError::EmptySet("validation"));
        }
        let mut rng = StdRng::seed_from_u64(self.cfg.seed ^ EVAL_SEED_OFFSET);
        let mut loss_sum = 0.0f64;
        for batch in data.batches(self.cfg.batch_size, None)? {
            let out = self
                .model
                .forward(&batch.images, self.cfg.mask_ratio, &mut rng, false)?;
            let loss = self.model.loss(&batch.images, &out)?.to_scalar::<f32>()?;
            loss_sum += f64::from(loss) * batch.len() as f64;
        }
        #[allow(clippy::cast_possible_truncation)]
        Ok((loss_sum / data.len() as f64) as f32)
    }

    /// Deep copy of the current encoder parameters.
    pub fn snapshot(&self, epoch: usize, val_loss: f32) -> Result<EncoderBundle> {
        Ok(EncoderBundle::from_varmap(
            &self.varmap,
            &self.model_cfg,
            epoch,
            val_loss,
        )?)
    }

    /// Train for the configured epochs, writing a bundle to `bundle_dir`
    /// whenever the validation loss improves.
    pub fn fit(
        &mut self,
        train: &SpectrogramSet,
        val: &SpectrogramSet,
        bundle_dir: &Path,
    ) -> Result<PretrainSummary> {
        info!(
            epochs = self.cfg.epochs,
            train = train.len(),
            val = val.len(),
            mask_ratio = self.cfg.mask_ratio,
            "Starting masked-autoencoder pretraining"
        );

        let mut history = Vec::with_capacity(self.cfg.epochs);
        let mut best: Option<(usize, f32)> = None;
        for _ in 0..self.cfg.epochs {
            let epoch = self.epoch;
            let train_loss = self.train_epoch(train)?;
            let val_loss = check_finite(self.evaluate(val)?, epoch, self.step)?;
            let learning_rate = self.optimizer.learning_rate();
            info!(epoch, train_loss, val_loss, learning_rate, "Pretraining epoch complete");

            let improved = match best {
                Some((_, best_loss)) => val_loss < best_loss,
                None => true,
            };
            if improved {
                best = Some((epoch, val_loss));
                self.snapshot(epoch, val_loss)?.save(bundle_dir)?;
                info!(epoch, val_loss, dir = %bundle_dir.display(), "Saved encoder bundle");
            }

            history.push(EpochReport {
                epoch,
                train_loss,
                val_loss,
                val_accuracy: None,
                learning_rate,
            });
        }

        Ok(PretrainSummary {
            history,
            best_epoch: best.map(|(e, _)| e),
            best_val_loss: best.map(|(_, l)| l),
            bundle_dir: bundle_dir.to_path_buf(),
        })
    }
}
