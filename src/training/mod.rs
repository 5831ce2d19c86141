//! Pretraining and fine-tuning loops.
//!
//! Both loops follow the same pattern: a `VarMap` owns every trainable
//! parameter, an AdamW optimizer steps it once per mini-batch with the
//! learning rate taken from [`LrSchedule`] at the fractional epoch, and a
//! non-finite loss aborts the run instead of silently corrupting weights.

pub mod finetune;
pub mod pretrain;
pub mod schedule;

pub use finetune::{Evaluation, FineTuner, FinetuneSummary, ImageClassifier};
pub use pretrain::{PretrainSummary, Pretrainer};
pub use schedule::LrSchedule;

use thiserror::Error;

use crate::data::DataError;
use crate::vit::ModelError;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("non-finite loss {loss} at epoch {epoch}, step {step}")]
    NonFiniteLoss { epoch: usize, step: usize, loss: f32 },

    #[error("{0} set is empty")]
    EmptySet(&'static str),
}

pub type Result<T> = std::result::Result<T, TrainingError>;

/// Per-epoch metrics of either training phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    /// Only set during fine-tuning.
    pub val_accuracy: Option<f32>,
    /// Rate used for the last step of the epoch.
    pub learning_rate: f64,
}

fn check_finite(loss: f32, epoch: usize, step: usize) -> Result<f32> {
    if loss.is_finite() {
        Ok(loss)
    } else {
        Err(TrainingError::NonFiniteLoss { epoch, step, loss })
    }
}
