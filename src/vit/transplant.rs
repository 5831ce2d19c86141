//! Encoder parameter bundles and key-based weight transplant.
//!
//! A bundle is a directory holding
//! - `encoder.safetensors`: deep copies of `cls_token`, `pos_embed` and every
//!   `blocks.*` tensor,
//! - `manifest.json`: format version, architecture, provenance and key list.
//!
//! Both files are written atomically (temp file, then rename), tensors
//! first, so a manifest only ever describes a complete tensor file.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ModelError, Result};
use crate::config::{defaults, ModelConfig};

/// Whether a parameter belongs to the transplantable encoder subset.
pub fn is_encoder_key(name: &str) -> bool {
    name == "cls_token" || name == "pos_embed" || name.starts_with("blocks.")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    /// Format version for forward compatibility.
    pub version: u32,
    /// Architecture the tensors were produced with.
    pub model: ModelConfig,
    pub created_at: DateTime<Utc>,
    /// Pretraining epoch (0-based) that produced the snapshot.
    pub epoch: usize,
    pub val_loss: f32,
    /// Sorted tensor names in `encoder.safetensors`.
    pub keys: Vec<String>,
}

/// In-memory snapshot of the encoder subset of a parameter map.
#[derive(Debug, Clone)]
pub struct EncoderBundle {
    manifest: BundleManifest,
    tensors: HashMap<String, Tensor>,
}

impl EncoderBundle {
    /// Deep-copy the encoder parameters of `varmap`.
    ///
    /// Later optimizer steps on `varmap` do not change the snapshot.
    pub fn from_varmap(
        varmap: &VarMap,
        model: &ModelConfig,
        epoch: usize,
        val_loss: f32,
    ) -> Result<Self> {
        let vars = varmap
            .data()
            .lock()
            .map_err(|_| ModelError::Config("parameter map lock poisoned".to_string()))?;
        let mut tensors = HashMap::new();
        for (name, var) in vars.iter().filter(|(name, _)| is_encoder_key(name)) {
            tensors.insert(name.clone(), var.as_tensor().copy()?.detach());
        }
        Ok(Self::from_tensors(tensors, model, epoch, val_loss))
    }

    pub fn from_tensors(
        tensors: HashMap<String, Tensor>,
        model: &ModelConfig,
        epoch: usize,
        val_loss: f32,
    ) -> Self {
        let mut keys: Vec<String> = tensors.keys().cloned().collect();
        keys.sort();
        Self {
            manifest: BundleManifest {
                version: defaults::BUNDLE_VERSION,
                model: model.clone(),
                created_at: Utc::now(),
                epoch,
                val_loss,
                keys,
            },
            tensors,
        }
    }

    pub const fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    pub const fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Write the bundle into directory `dir`, replacing any previous bundle.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        let tensor_path = dir.join(defaults::BUNDLE_TENSOR_FILE);
        let tmp_tensors = tensor_path.with_extension("safetensors.tmp");
        candle_core::safetensors::save(&self.tensors, &tmp_tensors)?;
        std::fs::rename(&tmp_tensors, &tensor_path)?;

        let manifest_path = dir.join(defaults::BUNDLE_MANIFEST_FILE);
        let tmp_manifest = manifest_path.with_extension("json.tmp");
        std::fs::write(&tmp_manifest, serde_json::to_vec_pretty(&self.manifest)?)?;
        std::fs::rename(&tmp_manifest, &manifest_path)?;

        debug!(dir = %dir.display(), tensors = self.tensors.len(), "Encoder bundle written");
        Ok(())
    }

    /// Read a bundle written by [`EncoderBundle::save`].
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        let bundle_err = |reason: String| ModelError::Bundle {
            path: dir.to_path_buf(),
            reason,
        };

        let manifest_path = dir.join(defaults::BUNDLE_MANIFEST_FILE);
        let manifest: BundleManifest = serde_json::from_slice(&std::fs::read(&manifest_path)?)?;
        if manifest.version != defaults::BUNDLE_VERSION {
            return Err(bundle_err(format!(
                "unsupported bundle version {} (expected {})",
                manifest.version,
                defaults::BUNDLE_VERSION
            )));
        }

        let tensors =
            candle_core::safetensors::load(dir.join(defaults::BUNDLE_TENSOR_FILE), device)?;
        if let Some(missing) = manifest.keys.iter().find(|k| !tensors.contains_key(*k)) {
            return Err(bundle_err(format!(
                "manifest lists '{missing}' but the tensor file lacks it"
            )));
        }
        Ok(Self { manifest, tensors })
    }
}

/// Outcome of a transplant, with sorted key lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransplantReport {
    /// Present in both and copied.
    pub copied: Vec<String>,
    /// In the bundle but not in the destination.
    pub skipped_extra: Vec<String>,
    /// Encoder keys of the destination the bundle did not provide.
    pub missing: Vec<String>,
}

/// Copy every bundle tensor whose name exists in `dest`.
///
/// Shapes of all overlapping keys are checked before anything is written,
/// so a mismatch leaves `dest` untouched. Non-overlapping keys on either
/// side are reported, not treated as errors.
pub fn transplant(bundle: &EncoderBundle, dest: &VarMap) -> Result<TransplantReport> {
    let vars = dest
        .data()
        .lock()
        .map_err(|_| ModelError::Config("parameter map lock poisoned".to_string()))?;

    let bundle_keys: BTreeSet<&String> = bundle.tensors.keys().collect();
    let mut report = TransplantReport::default();
    let mut updates = Vec::new();

    for key in &bundle_keys {
        let source = &bundle.tensors[*key];
        match vars.get(*key) {
            Some(var) if var.dims() != source.dims() => {
                return Err(ModelError::ShapeMismatch {
                    key: (*key).clone(),
                    bundle: source.dims().to_vec(),
                    model: var.dims().to_vec(),
                });
            }
            Some(var) => updates.push((*key, var, source)),
            None => report.skipped_extra.push((*key).clone()),
        }
    }

    for (key, var, source) in updates {
        var.set(&source.to_dtype(var.dtype())?.to_device(var.device())?)?;
        report.copied.push(key.clone());
    }

    let mut missing: Vec<String> = vars
        .keys()
        .filter(|k| is_encoder_key(k) && !bundle.tensors.contains_key(*k))
        .cloned()
        .collect();
    missing.sort();
    report.missing = missing;

    for key in &report.skipped_extra {
        debug!(key = %key, "Bundle tensor has no destination parameter, skipped");
    }
    if !report.skipped_extra.is_empty() {
        warn!(
            count = report.skipped_extra.len(),
            first = %report.skipped_extra[0],
            "Bundle tensors have no destination parameter, skipped"
        );
    }
    if !report.missing.is_empty() {
        warn!(
            count = report.missing.len(),
            first = %report.missing[0],
            "Encoder parameters not provided by bundle, keeping their initialization"
        );
    }
    Ok(report)
}

/// Load the bundle in `dir` and transplant it into `dest`.
pub fn load_pretrained(dest: &VarMap, dir: &Path, device: &Device) -> Result<TransplantReport> {
    let bundle = EncoderBundle::load(dir, device)?;
    let report = transplant(&bundle, dest)?;
    info!(
        dir = %dir.display(),
        epoch = bundle.manifest.epoch,
        val_loss = bundle.manifest.val_loss,
        copied = report.copied.len(),
        skipped = report.skipped_extra.len(),
        missing = report.missing.len(),
        "Transplanted pretrained encoder"
    );
    Ok(report)
}
