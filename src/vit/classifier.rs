//! Supervised ViT classifier with the same trunk layout as the MAE encoder.

use candle_core::{IndexOp, Module, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};

use super::encoder::VitBackbone;
use super::Result;
use crate::config::ModelConfig;

/// Full-sequence ViT: every patch is visible, the classification token feeds `head`.
#[derive(Debug)]
pub struct VitClassifier {
    backbone: VitBackbone,
    pos_drop: Option<Dropout>,
    head: Linear,
    num_classes: usize,
}

impl VitClassifier {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let backbone = VitBackbone::new(cfg, vb.clone())?;
        let head = candle_nn::linear(cfg.embed_dim, cfg.num_classes, vb.pp("head"))?;
        #[allow(clippy::cast_possible_truncation)]
        let pos_drop = (cfg.drop_rate > 0.0).then(|| Dropout::new(cfg.drop_rate as f32));
        Ok(Self {
            backbone,
            pos_drop,
            head,
            num_classes: cfg.num_classes,
        })
    }

    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub const fn backbone(&self) -> &VitBackbone {
        &self.backbone
    }

    /// Normalized classification token: `[B, D]`.
    pub fn features(&self, imgs: &Tensor, train: bool) -> Result<Tensor> {
        let batch = self.backbone.grid().check_images(imgs)?;
        let patches = self.backbone.embed_patches(imgs)?;
        let cls = self.backbone.cls_tokens(batch)?;
        let mut x = Tensor::cat(&[&cls, &patches], 1)?;
        if let Some(drop) = &self.pos_drop {
            x = drop.forward(&x, train)?;
        }
        let x = self.backbone.encode(&x, train)?;
        Ok(x.i((.., 0))?)
    }

    /// Class logits `[B, num_classes]`.
    pub fn forward(&self, imgs: &Tensor, train: bool) -> Result<Tensor> {
        let features = self.features(imgs, train)?;
        Ok(self.head.forward(&features)?)
    }

    /// Per-block `[B, H, 1 + N, 1 + N]` attention weights of the latest pass.
    pub fn attention_maps(&self) -> Vec<Option<Tensor>> {
        self.backbone.attention_maps()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use crate::vit::test_support::tiny_config;

    #[test]
    fn test_logits_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = VitClassifier::new(&tiny_config(), vb).unwrap();
        let imgs = Tensor::randn(0f32, 1.0, (4, 2, 16, 16), &Device::Cpu).unwrap();
        assert_eq!(model.forward(&imgs, false).unwrap().dims(), &[4, 3]);
    }

    #[test]
    fn test_inference_is_deterministic() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = ModelConfig {
            drop_rate: 0.1,
            ..tiny_config()
        };
        let model = VitClassifier::new(&cfg, vb).unwrap();
        let imgs = Tensor::randn(0f32, 1.0, (2, 2, 16, 16), &Device::Cpu).unwrap();

        let a = model.forward(&imgs, false).unwrap().to_vec2::<f32>().unwrap();
        let b = model.forward(&imgs, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_image_size_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = VitClassifier::new(&tiny_config(), vb).unwrap();
        let imgs = Tensor::randn(0f32, 1.0, (1, 2, 20, 20), &Device::Cpu).unwrap();
        assert!(model.forward(&imgs, false).is_err());
    }

    #[test]
    fn test_attention_maps_cover_full_sequence() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = VitClassifier::new(&tiny_config(), vb).unwrap();
        let imgs = Tensor::randn(0f32, 1.0, (1, 2, 16, 16), &Device::Cpu).unwrap();
        model.forward(&imgs, false).unwrap();

        let maps = model.attention_maps();
        assert_eq!(maps.len(), 2);
        let first = maps[0].as_ref().unwrap();
        assert_eq!(first.dims(), &[1, 2, 17, 17]);
    }
}
