//! Masked-autoencoder pipeline tests
//!
//! Token bookkeeping at the reference 224px geometry, optimization on a
//! fixed batch and deterministic classifier inference.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::{rngs::StdRng, SeedableRng};

use faultvit::config::{FinetuneConfig, ModelConfig, PretrainConfig};
use faultvit::{
    FineTuner, MaskPlan, MaskedAutoencoder, Pretrainer, ScalerRegistry, SpectrogramSet,
    VitClassifier,
};

/// Reference 224px / 16px geometry with narrow layers to keep the test fast.
fn narrow_224() -> ModelConfig {
    ModelConfig {
        img_size: 224,
        patch_size: 16,
        in_channels: 4,
        embed_dim: 16,
        depth: 1,
        n_heads: 2,
        decoder_embed_dim: 8,
        decoder_depth: 1,
        decoder_n_heads: 2,
        mlp_ratio: 2.0,
        num_classes: 5,
        ..ModelConfig::default()
    }
}

fn tiny() -> ModelConfig {
    ModelConfig {
        img_size: 16,
        patch_size: 4,
        in_channels: 2,
        embed_dim: 16,
        depth: 2,
        n_heads: 2,
        decoder_embed_dim: 8,
        decoder_depth: 1,
        decoder_n_heads: 2,
        mlp_ratio: 2.0,
        num_classes: 3,
        ..ModelConfig::default()
    }
}

// ============================================================================
// Token bookkeeping
// ============================================================================

#[test]
fn reference_geometry_keeps_49_of_196_patches() {
    let cfg = narrow_224();
    assert_eq!(cfg.num_patches(), 196);
    assert_eq!(MaskPlan::len_keep(196, 0.75).unwrap(), 49);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let mae = MaskedAutoencoder::new(&cfg, false, vb).unwrap();

    let imgs = Tensor::randn(0f32, 1.0, (2, 4, 224, 224), &Device::Cpu).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let out = mae.forward(&imgs, 0.75, &mut rng, true).unwrap();

    assert_eq!(out.latent.dims(), &[2, 50, 16]);
    assert_eq!(out.pred.dims(), &[2, 196, 16 * 16 * 4]);
    assert_eq!(out.mask.dims(), &[2, 196]);
    assert_eq!(out.ids_restore.dims(), &[2, 196]);

    // exactly 147 masked patches per sample
    let masked = out.mask.sum(1).unwrap().to_vec1::<f32>().unwrap();
    assert_eq!(masked, vec![147.0, 147.0]);

    let loss = mae.loss(&imgs, &out).unwrap().to_scalar::<f32>().unwrap();
    assert!(loss.is_finite() && loss > 0.0);
}

#[test]
fn masks_differ_across_samples_and_calls() {
    let cfg = tiny();
    let mut rng = StdRng::seed_from_u64(3);
    let first = MaskPlan::generate(2, cfg.num_patches(), 0.75, &mut rng).unwrap();
    let second = MaskPlan::generate(2, cfg.num_patches(), 0.75, &mut rng).unwrap();

    assert_ne!(first.ids_keep(0), first.ids_keep(1));
    assert_ne!(first.ids_keep(0), second.ids_keep(0));
}

// ============================================================================
// Optimization
// ============================================================================

#[test]
fn loss_decreases_on_fixed_batch() {
    let cfg = tiny();
    let pretrain = PretrainConfig {
        epochs: 1,
        batch_size: 4,
        learning_rate: 5e-3,
        min_lr: 5e-3,
        weight_decay: 0.0,
        warmup_epochs: 0,
        ..PretrainConfig::default()
    };
    let set = SpectrogramSet::synthetic(4, &cfg.grid(), cfg.num_classes, 21, &Device::Cpu).unwrap();
    let imgs = set.images().clone();
    let mut rng = StdRng::seed_from_u64(5);
    let plan = MaskPlan::generate(4, cfg.num_patches(), 0.75, &mut rng).unwrap();

    let mut trainer = Pretrainer::new(&cfg, &pretrain, &Device::Cpu).unwrap();
    let losses: Vec<f32> = (0..40)
        .map(|_| trainer.train_step_with_plan(&imgs, &plan).unwrap())
        .collect();

    assert!(losses.iter().all(|l| l.is_finite()));
    let tail: f32 = losses[35..].iter().sum::<f32>() / 5.0;
    assert!(
        tail < losses[0],
        "loss did not decrease: first {} tail {}",
        losses[0],
        tail
    );
}

#[test]
fn end_to_end_pretrain_then_finetune() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = tiny();
    let train =
        SpectrogramSet::synthetic(9, &cfg.grid(), cfg.num_classes, 1, &Device::Cpu).unwrap();
    let val = SpectrogramSet::synthetic(3, &cfg.grid(), cfg.num_classes, 2, &Device::Cpu).unwrap();

    let mut scalers = ScalerRegistry::new();
    let train = scalers.normalize(&train).unwrap();
    let val = scalers.normalize(&val).unwrap();
    assert_eq!(scalers.len(), 2);

    let pretrain = PretrainConfig {
        epochs: 2,
        batch_size: 4,
        warmup_epochs: 1,
        ..PretrainConfig::default()
    };
    let mut pretrainer = Pretrainer::new(&cfg, &pretrain, &Device::Cpu).unwrap();
    let summary = pretrainer.fit(&train, &val, dir.path()).unwrap();
    assert_eq!(summary.history.len(), 2);
    assert!(summary.best_val_loss.is_some_and(f32::is_finite));

    let finetune = FinetuneConfig {
        epochs: 2,
        batch_size: 4,
        warmup_epochs: 0,
        ..FinetuneConfig::default()
    };
    let mut tuner = FineTuner::vit_from_bundle(&cfg, &finetune, dir.path(), &Device::Cpu).unwrap();
    let summary = tuner.fit(&train, &val).unwrap();
    assert_eq!(summary.history.len(), 2);
    let accuracy = summary.best_val_accuracy.unwrap();
    assert!((0.0..=1.0).contains(&accuracy));
}

// ============================================================================
// Classifier inference
// ============================================================================

#[test]
fn classifier_inference_is_deterministic() {
    let cfg = ModelConfig {
        drop_rate: 0.2,
        ..tiny()
    };
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let classifier = VitClassifier::new(&cfg, vb).unwrap();
    let imgs = Tensor::randn(0f32, 1.0, (3, 2, 16, 16), &Device::Cpu).unwrap();

    let a = classifier.forward(&imgs, false).unwrap().to_vec2::<f32>().unwrap();
    let b = classifier.forward(&imgs, false).unwrap().to_vec2::<f32>().unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 3);
    assert!(a.iter().all(|row| row.len() == 3));
}

#[test]
fn classifier_rejects_wrong_image_size() {
    let cfg = tiny();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let classifier = VitClassifier::new(&cfg, vb).unwrap();
    let imgs = Tensor::zeros((1, 2, 20, 20), DType::F32, &Device::Cpu).unwrap();
    assert!(classifier.forward(&imgs, false).is_err());
}
