//! Supervised fine-tuning of a classifier with cross-entropy.

use std::path::Path;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info};

use super::{check_finite, EpochReport, LrSchedule, Result, TrainingError};
use crate::branches::MultiBranchClassifier;
use crate::config::{FinetuneConfig, ModelConfig, PosEmbedInit};
use crate::data::{Batch, DataError, SpectrogramSet};
use crate::vit::{self, pos_embed, TransplantReport, VitClassifier};

/// Anything that maps `[B, C, H, W]` images to `[B, classes]` logits.
pub trait ImageClassifier {
    fn logits(&self, imgs: &Tensor, train: bool) -> vit::Result<Tensor>;
}

impl ImageClassifier for VitClassifier {
    fn logits(&self, imgs: &Tensor, train: bool) -> vit::Result<Tensor> {
        self.forward(imgs, train)
    }
}

impl ImageClassifier for MultiBranchClassifier {
    fn logits(&self, imgs: &Tensor, train: bool) -> vit::Result<Tensor> {
        self.forward(imgs, train)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f32,
    /// Fraction of samples whose arg-max logit equals the label.
    pub accuracy: f32,
}

#[derive(Debug, Clone)]
pub struct FinetuneSummary {
    pub history: Vec<EpochReport>,
    pub best_epoch: Option<usize>,
    pub best_val_accuracy: Option<f32>,
}

/// Supervised cross-entropy training of a classifier.
pub struct FineTuner<M> {
    varmap: VarMap,
    model: M,
    optimizer: AdamW,
    schedule: LrSchedule,
    cfg: FinetuneConfig,
    rng: StdRng,
    epoch: usize,
    step: usize,
    transplant: Option<TransplantReport>,
}

impl FineTuner<VitClassifier> {
    /// ViT classifier with freshly initialized weights.
    pub fn vit(model_cfg: &ModelConfig, cfg: &FinetuneConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = VitClassifier::new(model_cfg, vb)?;
        if model_cfg.pos_embed_init == PosEmbedInit::Sincos {
            pos_embed::install_sincos(&varmap, "pos_embed", model_cfg.grid().grid_side())?;
        }
        Self::with_model(varmap, model, cfg)
    }

    /// ViT classifier whose encoder starts from the bundle in `bundle_dir`.
    pub fn vit_from_bundle(
        model_cfg: &ModelConfig,
        cfg: &FinetuneConfig,
        bundle_dir: &Path,
        device: &Device,
    ) -> Result<Self> {
        let mut tuner = Self::vit(model_cfg, cfg, device)?;
        let report = vit::load_pretrained(&tuner.varmap, bundle_dir, device)?;
        tuner.transplant = Some(report);
        Ok(tuner)
    }
}

impl<M: ImageClassifier> FineTuner<M> {
    /// Train `model`, whose parameters all live in `varmap`.
    pub fn with_model(varmap: VarMap, model: M, cfg: &FinetuneConfig) -> Result<Self> {
        let schedule = LrSchedule::from_config(&cfg.schedule());
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: schedule.lr_at(0.0),
                weight_decay: cfg.weight_decay,
                ..Default::default()
            },
        )?;
        debug!(params = varmap.all_vars().len(), "Classifier ready for fine-tuning");
        Ok(Self {
            varmap,
            model,
            optimizer,
            schedule,
            cfg: cfg.clone(),
            rng: StdRng::seed_from_u64(cfg.seed),
            epoch: 0,
            step: 0,
            transplant: None,
        })
    }

    pub const fn model(&self) -> &M {
        &self.model
    }

    pub const fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub const fn epoch(&self) -> usize {
        self.epoch
    }

    /// What the pretrained transplant copied, if this tuner started from a bundle.
    pub const fn transplant_report(&self) -> Option<&TransplantReport> {
        self.transplant.as_ref()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    /// One optimizer step on a labelled batch.
    pub fn train_step(&mut self, imgs: &Tensor, labels: &Tensor) -> Result<f32> {
        let logits = self.model.logits(imgs, true)?;
        let loss = candle_nn::loss::cross_entropy(&logits, labels)?;
        let value = check_finite(loss.to_scalar::<f32>()?, self.epoch, self.step)?;
        self.optimizer.backward_step(&loss)?;
        self.step += 1;
        Ok(value)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn train_epoch(&mut self, data: &SpectrogramSet) -> Result<f32> {
        if data.is_empty() {
            return Err(TrainingError::EmptySet("fine-tuning"));
        }
        let batches = data.batches(self.cfg.batch_size, Some(&mut self.rng))?;
        let total = batches.len() as f64;

        let mut loss_sum = 0.0f64;
        for (i, batch) in batches.iter().enumerate() {
            let labels = labels_of(batch)?;
            let lr = self.schedule.lr_at(self.epoch as f64 + i as f64 / total);
            self.optimizer.set_learning_rate(lr);
            let loss = self.train_step(&batch.images, labels)?;
            loss_sum += f64::from(loss) * batch.len() as f64;
        }
        self.epoch += 1;

        #[allow(clippy::cast_possible_truncation)]
        Ok((loss_sum / data.len() as f64) as f32)
    }

    /// Arg-max class per image.
    pub fn predict(&self, imgs: &Tensor) -> Result<Vec<u32>> {
        let logits = self.model.logits(imgs, false)?;
        Ok(logits.argmax(D::Minus1)?.to_vec1::<u32>()?)
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn evaluate(&self, data: &SpectrogramSet) -> Result<Evaluation> {
        if data.is_empty() {
            return Err(TrainingError::EmptySet("validation"));
        }
        let mut loss_sum = 0.0f64;
        let mut correct = 0.0f64;
        for batch in data.batches(self.cfg.batch_size, None)? {
            let labels = labels_of(&batch)?;
            let logits = self.model.logits(&batch.images, false)?;
            let loss = candle_nn::loss::cross_entropy(&logits, labels)?.to_scalar::<f32>()?;
            loss_sum += f64::from(loss) * batch.len() as f64;
            let hits = logits
                .argmax(D::Minus1)?
                .eq(labels)?
                .to_dtype(DType::F32)?
                .sum_all()?
                .to_scalar::<f32>()?;
            correct += f64::from(hits);
        }
        let n = data.len() as f64;
        Ok(Evaluation {
            loss: (loss_sum / n) as f32,
            accuracy: (correct / n) as f32,
        })
    }

    /// Train for the configured epochs, tracking the best validation accuracy.
    pub fn fit(&mut self, train: &SpectrogramSet, val: &SpectrogramSet) -> Result<FinetuneSummary> {
        info!(
            epochs = self.cfg.epochs,
            train = train.len(),
            val = val.len(),
            pretrained = self.transplant.is_some(),
            "Starting fine-tuning"
        );

        let mut history = Vec::with_capacity(self.cfg.epochs);
        let mut best: Option<(usize, f32)> = None;
        for _ in 0..self.cfg.epochs {
            let epoch = self.epoch;
            let train_loss = self.train_epoch(train)?;
            let eval = self.evaluate(val)?;
            let learning_rate = self.optimizer.learning_rate();
            info!(
                epoch,
                train_loss,
                val_loss = eval.loss,
                val_accuracy = eval.accuracy,
                learning_rate,
                "Fine-tuning epoch complete"
            );

            let improved = match best {
                Some((_, best_acc)) => eval.accuracy > best_acc,
                None => true,
            };
            if improved {
                best = Some((epoch, eval.accuracy));
            }
            history.push(EpochReport {
                epoch,
                train_loss,
                val_loss: eval.loss,
                val_accuracy: Some(eval.accuracy),
                learning_rate,
            });
        }

        Ok(FinetuneSummary {
            history,
            best_epoch: best.map(|(e, _)| e),
            best_val_accuracy: best.map(|(_, a)| a),
        })
    }
}

fn labels_of(batch: &Batch) -> Result<&Tensor> {
    batch
        .labels
        .as_ref()
        .ok_or(TrainingError::Data(DataError::MissingLabels))
}
