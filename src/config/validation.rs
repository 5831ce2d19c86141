//! Config validation: unknown-key detection with Levenshtein suggestions
//! and training range checks.
//!
//! Two-pass parse approach: first deserialize raw TOML into `toml::Value`,
//! walk the key tree, compare against known field names, and emit warnings
//! with "did you mean?" suggestions. Then proceed with normal serde
//! deserialization. Warnings never break existing configs.

use std::collections::HashSet;

use super::FaultVitConfig;

/// A non-fatal config warning (typo, suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Returns the complete set of valid dotted key paths for `FaultVitConfig`.
///
/// Maintained by hand to match the structs in `app_config.rs`.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [model]
        "model",
        "model.img_size",
        "model.patch_size",
        "model.in_channels",
        "model.embed_dim",
        "model.depth",
        "model.n_heads",
        "model.decoder_embed_dim",
        "model.decoder_depth",
        "model.decoder_n_heads",
        "model.mlp_ratio",
        "model.num_classes",
        "model.drop_rate",
        "model.layer_norm_eps",
        "model.pos_embed_init",
        // [pretrain]
        "pretrain",
        "pretrain.mask_ratio",
        "pretrain.norm_pix_loss",
        "pretrain.epochs",
        "pretrain.batch_size",
        "pretrain.learning_rate",
        "pretrain.min_lr",
        "pretrain.weight_decay",
        "pretrain.warmup_epochs",
        "pretrain.seed",
        "pretrain.bundle_dir",
        // [finetune]
        "finetune",
        "finetune.epochs",
        "finetune.batch_size",
        "finetune.learning_rate",
        "finetune.min_lr",
        "finetune.weight_decay",
        "finetune.warmup_epochs",
        "finetune.seed",
        "finetune.from_pretrained",
        // [data]
        "data",
        "data.train_path",
        "data.val_path",
        "data.components",
        "data.synthetic_samples",
    ];
    keys.iter().copied().collect()
}

/// Walk a TOML value tree and collect all dotted key paths.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|&k| (k, levenshtein(unknown, k)))
        .filter(|&(_, dist)| dist <= 3)
        .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(k, _)| k.to_string())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
///
/// This does NOT fail on unknown keys, it only warns.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new(); // parse errors are handled by serde later
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}

// ============================================================================
// Range Validation
// ============================================================================

/// Names of every floating-point field that holds NaN or infinity.
pub fn non_finite_fields(config: &FaultVitConfig) -> Vec<&'static str> {
    let fields = [
        ("model.mlp_ratio", config.model.mlp_ratio),
        ("model.drop_rate", config.model.drop_rate),
        ("model.layer_norm_eps", config.model.layer_norm_eps),
        ("pretrain.mask_ratio", config.pretrain.mask_ratio),
        ("pretrain.learning_rate", config.pretrain.learning_rate),
        ("pretrain.min_lr", config.pretrain.min_lr),
        ("pretrain.weight_decay", config.pretrain.weight_decay),
        ("finetune.learning_rate", config.finetune.learning_rate),
        ("finetune.min_lr", config.finetune.min_lr),
        ("finetune.weight_decay", config.finetune.weight_decay),
    ];
    fields
        .into_iter()
        .filter(|(_, v)| !v.is_finite())
        .map(|(name, _)| name)
        .collect()
}

/// Range checks that go beyond structural consistency.
///
/// Returns (errors, warnings): errors must prevent a run; warnings flag
/// values that are legal but unusual for masked pretraining.
pub fn validate_training_ranges(config: &FaultVitConfig) -> (Vec<String>, Vec<ValidationWarning>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let m = &config.model;
    if m.img_size >= m.patch_size && m.patch_size > 0 && m.img_size % m.patch_size == 0 {
        let n = m.num_patches();
        let keep = crate::vit::MaskPlan::len_keep(n, config.pretrain.mask_ratio).unwrap_or(n);
        if keep == 0 {
            errors.push(format!(
                "pretrain.mask_ratio ({}) leaves no visible patch out of {n}",
                config.pretrain.mask_ratio
            ));
        }
    }

    if config.pretrain.mask_ratio < 0.5 {
        warnings.push(ValidationWarning {
            field: "pretrain.mask_ratio".to_string(),
            message: format!(
                "pretrain.mask_ratio = {:.2} is low; reconstruction becomes interpolation below ~0.5",
                config.pretrain.mask_ratio
            ),
            suggestion: None,
        });
    }

    for (section, warmup, epochs) in [
        ("pretrain", config.pretrain.warmup_epochs, config.pretrain.epochs),
        ("finetune", config.finetune.warmup_epochs, config.finetune.epochs),
    ] {
        if warmup >= epochs && epochs > 0 {
            warnings.push(ValidationWarning {
                field: format!("{section}.warmup_epochs"),
                message: format!(
                    "{section}.warmup_epochs ({warmup}) >= epochs ({epochs}); the cosine phase never runs"
                ),
                suggestion: None,
            });
        }
    }

    (errors, warnings)
}
