//! FaultViT: drivetrain fault diagnosis from multi-channel vibration spectrograms.
//!
//! ## Architecture
//!
//! - **Vision Transformer**: patch embedding, pre-norm Transformer blocks, classifier head
//! - **Masked Autoencoder**: random patch masking, lightweight decoder, masked-only MSE
//! - **Transplant**: encoder parameter bundles copied key-by-key into the classifier
//! - **Branches**: per-component feature extractors fused into one classifier
//! - **Training**: AdamW loops with warmup + cosine learning-rate schedule

pub mod branches;
pub mod config;
pub mod data;
pub mod scaling;
pub mod training;
pub mod vit;

// Re-export configuration
pub use config::{FaultVitConfig, FinetuneConfig, ModelConfig, PretrainConfig};

// Re-export the model surface
pub use vit::{
    EncoderBundle, MaskPlan, MaskedAutoencoder, ModelError, PatchGrid, TransplantReport,
    VitClassifier,
};

// Re-export data and training
pub use branches::{Component, FeatureExtractor, MultiBranchClassifier};
pub use data::{DataError, SpectrogramSet};
pub use scaling::{ScalerRegistry, StandardScaler};
pub use training::{FineTuner, Pretrainer, TrainingError};
