//! FaultViT configuration: model geometry and training hyperparameters as TOML values.
//!
//! Each struct implements `Default` with values from [`super::defaults`],
//! so an absent config file and an empty one behave identically.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::defaults;
use crate::vit::PatchGrid;

/// Environment variable pointing at the TOML config file.
pub const CONFIG_ENV_VAR: &str = "FAULTVIT_CONFIG";

/// Config file searched in the working directory when the env var is unset.
pub const LOCAL_CONFIG_FILE: &str = "faultvit.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a pretraining + fine-tuning run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultVitConfig {
    /// Shared ViT / MAE architecture scalars
    #[serde(default)]
    pub model: ModelConfig,

    /// Masked-autoencoder pretraining
    #[serde(default)]
    pub pretrain: PretrainConfig,

    /// Supervised fine-tuning of the classifier
    #[serde(default)]
    pub finetune: FinetuneConfig,

    /// Input tensor sets
    #[serde(default)]
    pub data: DataConfig,
}

impl FaultVitConfig {
    /// Load configuration using the standard search order:
    /// 1. `$FAULTVIT_CONFIG`
    /// 2. `./faultvit.toml`
    /// 3. Built-in defaults
    ///
    /// Only a missing file falls through to the next source. A file that
    /// exists but fails to parse or validate is an error.
    pub fn load() -> Result<Self, ConfigError> {
        let env_path = std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from);
        Self::load_from_candidates(env_path.as_deref(), Path::new(LOCAL_CONFIG_FILE))
    }

    /// [`FaultVitConfig::load`] with explicit candidate paths.
    pub fn load_from_candidates(
        env_path: Option<&Path>,
        local: &Path,
    ) -> Result<Self, ConfigError> {
        if let Some(path) = env_path {
            if path.exists() {
                let config = Self::load_from_file(path)?;
                info!(path = %path.display(), "Loaded config from {CONFIG_ENV_VAR}");
                return Ok(config);
            }
            warn!(
                path = %path.display(),
                "{CONFIG_ENV_VAR} points to non-existent file, falling back"
            );
        }

        if local.exists() {
            let config = Self::load_from_file(local)?;
            info!(path = %local.display(), "Loaded local config");
            return Ok(config);
        }

        info!("No {LOCAL_CONFIG_FILE} found, using built-in defaults");
        Ok(Self::default())
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    ///
    /// Unknown keys only produce warnings; range violations are errors.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Save config to a file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        info!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Validate every section for internal consistency.
    ///
    /// All violations are collected into a single [`ConfigError::Validation`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.model.validation_errors();

        Self::check_schedule("pretrain", &self.pretrain.schedule(), &mut errors);
        Self::check_schedule("finetune", &self.finetune.schedule(), &mut errors);

        let r = self.pretrain.mask_ratio;
        if !(0.0..1.0).contains(&r) {
            errors.push(format!("pretrain.mask_ratio ({r}) must be in [0, 1)"));
        }

        if !self.data.components.is_empty()
            && self.data.components.len() != self.model.in_channels
        {
            errors.push(format!(
                "data.components lists {} components but model.in_channels is {}",
                self.data.components.len(),
                self.model.in_channels
            ));
        }

        let (range_errors, range_warnings) = super::validation::validate_training_ranges(self);
        errors.extend(range_errors);
        for w in &range_warnings {
            warn!("{}", w);
        }

        for name in super::validation::non_finite_fields(self) {
            errors.push(format!("{name} must be a finite number"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn check_schedule(section: &str, s: &ScheduleConfig, errors: &mut Vec<String>) {
        if s.batch_size == 0 {
            errors.push(format!("{section}.batch_size must be > 0"));
        }
        if s.epochs == 0 {
            errors.push(format!("{section}.epochs must be > 0"));
        }
        if !(s.learning_rate > 0.0) {
            errors.push(format!("{section}.learning_rate must be > 0"));
        }
        if s.min_lr < 0.0 || s.min_lr > s.learning_rate {
            errors.push(format!(
                "{section}.min_lr ({}) must be in [0, learning_rate ({})]",
                s.min_lr, s.learning_rate
            ));
        }
        if s.weight_decay < 0.0 {
            errors.push(format!("{section}.weight_decay must be >= 0"));
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            Self::Parse(path, e) => write!(f, "Config parse error ({}): {}", path.display(), e),
            Self::Serialize(e) => write!(f, "Config serialization error: {e}"),
            Self::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {e}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Model Config
// ============================================================================

/// How the encoder and decoder positional embeddings start out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PosEmbedInit {
    /// All-zero tables; the embeddings are learned from scratch.
    #[default]
    Zeros,
    /// Fixed 2D sin-cos tables written into the (still trainable) parameters.
    Sincos,
}

/// Architecture scalars shared by the autoencoder and the classifier.
///
/// These are also persisted in every parameter bundle so the shapes can be
/// rebuilt without the original config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_img_size")]
    pub img_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,
    #[serde(default = "default_decoder_embed_dim")]
    pub decoder_embed_dim: usize,
    #[serde(default = "default_decoder_depth")]
    pub decoder_depth: usize,
    #[serde(default = "default_decoder_n_heads")]
    pub decoder_n_heads: usize,
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Dropout applied after attention, MLP and positional embedding (0 disables).
    #[serde(default)]
    pub drop_rate: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pos_embed_init: PosEmbedInit,
}

fn default_img_size() -> usize {
    defaults::IMG_SIZE
}
fn default_patch_size() -> usize {
    defaults::PATCH_SIZE
}
fn default_in_channels() -> usize {
    defaults::IN_CHANNELS
}
fn default_embed_dim() -> usize {
    defaults::EMBED_DIM
}
fn default_depth() -> usize {
    defaults::DEPTH
}
fn default_n_heads() -> usize {
    defaults::N_HEADS
}
fn default_decoder_embed_dim() -> usize {
    defaults::DECODER_EMBED_DIM
}
fn default_decoder_depth() -> usize {
    defaults::DECODER_DEPTH
}
fn default_decoder_n_heads() -> usize {
    defaults::DECODER_N_HEADS
}
fn default_mlp_ratio() -> f64 {
    defaults::MLP_RATIO
}
fn default_num_classes() -> usize {
    defaults::NUM_CLASSES
}
fn default_layer_norm_eps() -> f64 {
    defaults::LAYER_NORM_EPS
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            img_size: default_img_size(),
            patch_size: default_patch_size(),
            in_channels: default_in_channels(),
            embed_dim: default_embed_dim(),
            depth: default_depth(),
            n_heads: default_n_heads(),
            decoder_embed_dim: default_decoder_embed_dim(),
            decoder_depth: default_decoder_depth(),
            decoder_n_heads: default_decoder_n_heads(),
            mlp_ratio: default_mlp_ratio(),
            num_classes: default_num_classes(),
            drop_rate: 0.0,
            layer_norm_eps: default_layer_norm_eps(),
            pos_embed_init: PosEmbedInit::default(),
        }
    }
}

impl ModelConfig {
    /// Patch geometry derived from `img_size`, `patch_size` and `in_channels`.
    pub const fn grid(&self) -> PatchGrid {
        PatchGrid::new(self.img_size, self.patch_size, self.in_channels)
    }

    /// Number of patch tokens (classification token excluded).
    pub const fn num_patches(&self) -> usize {
        self.grid().num_patches()
    }

    /// Hidden width of the feed-forward sub-layer for a given token width.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn mlp_hidden(&self, width: usize) -> usize {
        ((width as f64) * self.mlp_ratio) as usize
    }

    /// Collect every architecture inconsistency as a human-readable message.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.img_size == 0 || self.patch_size == 0 {
            errors.push("model.img_size and model.patch_size must be > 0".to_string());
        } else if self.img_size % self.patch_size != 0 {
            errors.push(format!(
                "model.img_size ({}) must be divisible by model.patch_size ({})",
                self.img_size, self.patch_size
            ));
        }
        if self.in_channels == 0 {
            errors.push("model.in_channels must be > 0".to_string());
        }
        Self::check_heads("model.embed_dim", self.embed_dim, self.n_heads, &mut errors);
        Self::check_heads(
            "model.decoder_embed_dim",
            self.decoder_embed_dim,
            self.decoder_n_heads,
            &mut errors,
        );
        if self.depth == 0 {
            errors.push("model.depth must be > 0".to_string());
        }
        if self.decoder_depth == 0 {
            errors.push("model.decoder_depth must be > 0".to_string());
        }
        if !(self.mlp_ratio > 0.0)
            || self.mlp_hidden(self.embed_dim.min(self.decoder_embed_dim)) == 0
        {
            errors.push(format!(
                "model.mlp_ratio ({}) must give a non-empty hidden layer",
                self.mlp_ratio
            ));
        }
        if self.num_classes < 2 {
            errors.push(format!("model.num_classes ({}) must be >= 2", self.num_classes));
        }
        if !(0.0..1.0).contains(&self.drop_rate) {
            errors.push(format!("model.drop_rate ({}) must be in [0, 1)", self.drop_rate));
        }
        if !(self.layer_norm_eps > 0.0) {
            errors.push("model.layer_norm_eps must be > 0".to_string());
        }
        if self.pos_embed_init == PosEmbedInit::Sincos {
            for (name, width) in [
                ("model.embed_dim", self.embed_dim),
                ("model.decoder_embed_dim", self.decoder_embed_dim),
            ] {
                if width % 4 != 0 {
                    errors.push(format!(
                        "{name} ({width}) must be divisible by 4 when pos_embed_init = \"sincos\""
                    ));
                }
            }
        }

        errors
    }

    fn check_heads(name: &str, width: usize, heads: usize, errors: &mut Vec<String>) {
        if width == 0 || heads == 0 {
            errors.push(format!("{name} and its head count must be > 0"));
        } else if width % heads != 0 {
            errors.push(format!("{name} ({width}) must be divisible by its head count ({heads})"));
        }
    }
}

// ============================================================================
// Training Configs
// ============================================================================

/// Optimizer and schedule scalars common to both training phases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub min_lr: f64,
    pub weight_decay: f64,
    pub warmup_epochs: usize,
}

/// Masked-autoencoder pretraining.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainConfig {
    #[serde(default = "default_mask_ratio")]
    pub mask_ratio: f64,
    /// Normalize each target patch to zero mean / unit variance before scoring.
    #[serde(default)]
    pub norm_pix_loss: bool,
    #[serde(default = "default_pretrain_epochs")]
    pub epochs: usize,
    #[serde(default = "default_pretrain_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_pretrain_lr")]
    pub learning_rate: f64,
    #[serde(default = "default_min_lr")]
    pub min_lr: f64,
    #[serde(default = "default_pretrain_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_pretrain_warmup")]
    pub warmup_epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Where the best encoder bundle is written.
    #[serde(default = "default_bundle_dir")]
    pub bundle_dir: String,
}

fn default_mask_ratio() -> f64 {
    defaults::MASK_RATIO
}
fn default_pretrain_epochs() -> usize {
    defaults::PRETRAIN_EPOCHS
}
fn default_pretrain_batch_size() -> usize {
    defaults::PRETRAIN_BATCH_SIZE
}
fn default_pretrain_lr() -> f64 {
    defaults::PRETRAIN_LR
}
fn default_min_lr() -> f64 {
    defaults::MIN_LR
}
fn default_pretrain_weight_decay() -> f64 {
    defaults::PRETRAIN_WEIGHT_DECAY
}
fn default_pretrain_warmup() -> usize {
    defaults::PRETRAIN_WARMUP_EPOCHS
}
fn default_seed() -> u64 {
    defaults::SEED
}
fn default_bundle_dir() -> String {
    defaults::BUNDLE_DIR.to_string()
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self {
            mask_ratio: default_mask_ratio(),
            norm_pix_loss: false,
            epochs: default_pretrain_epochs(),
            batch_size: default_pretrain_batch_size(),
            learning_rate: default_pretrain_lr(),
            min_lr: default_min_lr(),
            weight_decay: default_pretrain_weight_decay(),
            warmup_epochs: default_pretrain_warmup(),
            seed: default_seed(),
            bundle_dir: default_bundle_dir(),
        }
    }
}

impl PretrainConfig {
    pub const fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            min_lr: self.min_lr,
            weight_decay: self.weight_decay,
            warmup_epochs: self.warmup_epochs,
        }
    }
}

/// Supervised fine-tuning of the ViT classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetuneConfig {
    #[serde(default = "default_finetune_epochs")]
    pub epochs: usize,
    #[serde(default = "default_finetune_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_finetune_lr")]
    pub learning_rate: f64,
    #[serde(default = "default_min_lr")]
    pub min_lr: f64,
    #[serde(default = "default_finetune_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_finetune_warmup")]
    pub warmup_epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Start from the pretrained encoder bundle instead of random weights.
    #[serde(default = "default_true")]
    pub from_pretrained: bool,
}

fn default_finetune_epochs() -> usize {
    defaults::FINETUNE_EPOCHS
}
fn default_finetune_batch_size() -> usize {
    defaults::FINETUNE_BATCH_SIZE
}
fn default_finetune_lr() -> f64 {
    defaults::FINETUNE_LR
}
fn default_finetune_weight_decay() -> f64 {
    defaults::FINETUNE_WEIGHT_DECAY
}
fn default_finetune_warmup() -> usize {
    defaults::FINETUNE_WARMUP_EPOCHS
}
const fn default_true() -> bool {
    true
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            epochs: default_finetune_epochs(),
            batch_size: default_finetune_batch_size(),
            learning_rate: default_finetune_lr(),
            min_lr: default_min_lr(),
            weight_decay: default_finetune_weight_decay(),
            warmup_epochs: default_finetune_warmup(),
            seed: default_seed(),
            from_pretrained: true,
        }
    }
}

impl FinetuneConfig {
    pub const fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            min_lr: self.min_lr,
            weight_decay: self.weight_decay,
            warmup_epochs: self.warmup_epochs,
        }
    }
}

// ============================================================================
// Data Config
// ============================================================================

/// Input tensor sets produced by the upstream STFT pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Safetensors file with `images` `[N,C,H,W]` and `labels` `[N]`.
    #[serde(default)]
    pub train_path: Option<String>,
    #[serde(default)]
    pub val_path: Option<String>,
    /// Component id for each image channel, in channel order.
    #[serde(default = "default_components")]
    pub components: Vec<String>,
    /// Samples per synthetic set when no paths are configured.
    #[serde(default = "default_synthetic_samples")]
    pub synthetic_samples: usize,
}

fn default_components() -> Vec<String> {
    crate::branches::Component::ALL
        .iter()
        .map(|c| c.id().to_string())
        .collect()
}
const fn default_synthetic_samples() -> usize {
    64
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_path: None,
            val_path: None,
            components: default_components(),
            synthetic_samples: default_synthetic_samples(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = FaultVitConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.num_patches(), 196);
    }

    #[test]
    fn test_empty_toml_equals_defaults() {
        let config = FaultVitConfig::from_toml_str("").expect("empty config is valid");
        assert_eq!(config.model, ModelConfig::default());
        assert_eq!(config.pretrain, PretrainConfig::default());
    }

    #[test]
    fn test_non_divisible_patch_grid_rejected() {
        let mut config = FaultVitConfig::default();
        config.model.patch_size = 15;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("divisible by model.patch_size"), "{err}");
    }

    #[test]
    fn test_head_divisibility_checked_for_both_stacks() {
        let mut config = FaultVitConfig::default();
        config.model.embed_dim = 100;
        config.model.n_heads = 3;
        config.model.decoder_embed_dim = 30;
        config.model.decoder_n_heads = 4;
        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.starts_with("model.embed_dim")));
                assert!(errors.iter().any(|e| e.starts_with("model.decoder_embed_dim")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_mask_ratio_of_one_rejected() {
        let mut config = FaultVitConfig::default();
        config.pretrain.mask_ratio = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pos_embed_init_parses() {
        let config = FaultVitConfig::from_toml_str(
            r#"
[model]
pos_embed_init = "sincos"
"#,
        )
        .expect("valid");
        assert_eq!(config.model.pos_embed_init, PosEmbedInit::Sincos);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("faultvit.toml");
        let mut config = FaultVitConfig::default();
        config.pretrain.mask_ratio = 0.6;
        config.save_to_file(&path).expect("save");

        let loaded = FaultVitConfig::load_from_file(&path).expect("load");
        assert!((loaded.pretrain.mask_ratio - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_local_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let local = dir.path().join(LOCAL_CONFIG_FILE);
        std::fs::write(&local, "[model]\nimg_size = 224\npatch_size = 15\n").expect("write");

        let result = FaultVitConfig::load_from_candidates(None, &local);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_unparseable_env_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[model\nimg_size = ").expect("write");

        let result =
            FaultVitConfig::load_from_candidates(Some(&path), &dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Parse(_, _))));
    }

    #[test]
    fn test_missing_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let config = FaultVitConfig::load_from_candidates(
            Some(&dir.path().join("absent.toml")),
            &dir.path().join(LOCAL_CONFIG_FILE),
        )
        .expect("defaults");
        assert_eq!(config.model, ModelConfig::default());
    }

    #[test]
    fn test_local_file_used_when_env_unset() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let local = dir.path().join(LOCAL_CONFIG_FILE);
        std::fs::write(&local, "[model]\nnum_classes = 7\n").expect("write");

        let config = FaultVitConfig::load_from_candidates(None, &local).expect("load");
        assert_eq!(config.model.num_classes, 7);
    }

    #[test]
    fn test_sincos_requires_width_divisible_by_four() {
        let mut model = ModelConfig {
            pos_embed_init: PosEmbedInit::Sincos,
            embed_dim: 18,
            n_heads: 2,
            ..ModelConfig::default()
        };
        let errors = model.validation_errors();
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].starts_with("model.embed_dim (18)"));

        model.pos_embed_init = PosEmbedInit::Zeros;
        assert!(model.validation_errors().is_empty());
    }
}
