//! Per-component feature branches fused into one fault classifier.
//!
//! Each image channel comes from one drivetrain component. A
//! [`MultiBranchClassifier`] routes every channel to its own
//! [`FeatureExtractor`], concatenates the feature vectors in branch order
//! and classifies the result with a single linear head.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear, VarBuilder};

use crate::config::ModelConfig;
use crate::vit::{ModelError, Result, VitClassifier};

/// Drivetrain component that produced one spectrogram channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Gearbox,
    LeftAxlebox,
    RightAxlebox,
    Motor,
}

impl Component {
    /// Channel order of the default four-channel input.
    pub const ALL: [Self; 4] = [Self::Gearbox, Self::LeftAxlebox, Self::RightAxlebox, Self::Motor];

    pub const fn id(self) -> &'static str {
        match self {
            Self::Gearbox => "gearbox",
            Self::LeftAxlebox => "left_axlebox",
            Self::RightAxlebox => "right_axlebox",
            Self::Motor => "motor",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.id() == id)
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Maps a single-channel `[B, 1, H, W]` image to a `[B, output_dim]` feature vector.
pub trait FeatureExtractor {
    fn name(&self) -> &str;
    fn output_dim(&self) -> usize;
    fn extract(&self, xs: &Tensor, train: bool) -> Result<Tensor>;
}

/// Two 3x3 convolutions, max-pool in between, global average pool, projection.
#[derive(Debug)]
pub struct ConvBranch {
    name: String,
    conv1: Conv2d,
    conv2: Conv2d,
    proj: Linear,
    output_dim: usize,
}

impl ConvBranch {
    pub fn new(name: &str, channels: usize, output_dim: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            name: name.to_string(),
            conv1: candle_nn::conv2d(1, channels, 3, cfg, vb.pp("conv1"))?,
            conv2: candle_nn::conv2d(channels, channels, 3, cfg, vb.pp("conv2"))?,
            proj: candle_nn::linear(channels, output_dim, vb.pp("proj"))?,
            output_dim,
        })
    }
}

impl FeatureExtractor for ConvBranch {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn extract(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        let h = self.conv1.forward(xs)?.relu()?.max_pool2d(2)?;
        let h = self.conv2.forward(&h)?.relu()?;
        // [B, C, H, W] → [B, C]
        let pooled = h.flatten_from(2)?.mean(2)?;
        Ok(self.proj.forward(&pooled)?)
    }
}

/// Single-channel ViT whose classification token is the branch feature.
#[derive(Debug)]
pub struct VitBranch {
    name: String,
    vit: VitClassifier,
    output_dim: usize,
}

impl VitBranch {
    /// `cfg.in_channels` is ignored; a branch always sees one channel.
    pub fn new(name: &str, cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let cfg = ModelConfig {
            in_channels: 1,
            ..cfg.clone()
        };
        Ok(Self {
            name: name.to_string(),
            vit: VitClassifier::new(&cfg, vb)?,
            output_dim: cfg.embed_dim,
        })
    }
}

impl FeatureExtractor for VitBranch {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn extract(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.vit.features(xs, train)
    }
}

/// Ordered `(channel, extractor)` branches plus a fused linear head.
pub struct MultiBranchClassifier {
    branches: Vec<(usize, Box<dyn FeatureExtractor>)>,
    head: Linear,
    num_classes: usize,
}

impl std::fmt::Debug for MultiBranchClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiBranchClassifier")
            .field(
                "branches",
                &self
                    .branches
                    .iter()
                    .map(|(c, b)| (*c, b.name().to_string()))
                    .collect::<Vec<_>>(),
            )
            .field("num_classes", &self.num_classes)
            .finish_non_exhaustive()
    }
}

impl MultiBranchClassifier {
    pub fn new(
        branches: Vec<(usize, Box<dyn FeatureExtractor>)>,
        num_classes: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if branches.is_empty() {
            return Err(ModelError::Config(
                "multi-branch classifier needs at least one branch".to_string(),
            ));
        }
        let fused: usize = branches.iter().map(|(_, b)| b.output_dim()).sum();
        let head = candle_nn::linear(fused, num_classes, vb.pp("head"))?;
        Ok(Self {
            branches,
            head,
            num_classes,
        })
    }

    /// One conv branch per listed component, channel `i` for component `i`.
    pub fn conv_per_component(
        components: &[Component],
        channels: usize,
        feature_dim: usize,
        num_classes: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let branches = components
            .iter()
            .enumerate()
            .map(|(i, c)| {
                ConvBranch::new(c.id(), channels, feature_dim, vb.pp(c.id()))
                    .map(|b| (i, Box::new(b) as Box<dyn FeatureExtractor>))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(branches, num_classes, vb)
    }

    pub fn feature_dim(&self) -> usize {
        self.branches.iter().map(|(_, b)| b.output_dim()).sum()
    }

    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn branch_names(&self) -> Vec<&str> {
        self.branches.iter().map(|(_, b)| b.name()).collect()
    }

    /// Concatenated branch features, in branch order: `[B, feature_dim]`.
    pub fn features(&self, imgs: &Tensor, train: bool) -> Result<Tensor> {
        let (_, channels, _, _) = imgs.dims4()?;
        let mut features = Vec::with_capacity(self.branches.len());
        for (channel, branch) in &self.branches {
            if *channel >= channels {
                return Err(ModelError::Config(format!(
                    "branch '{}' reads channel {channel} but the input has {channels}",
                    branch.name()
                )));
            }
            features.push(branch.extract(&imgs.narrow(1, *channel, 1)?.contiguous()?, train)?);
        }
        Ok(Tensor::cat(&features, 1)?)
    }

    /// Class logits `[B, num_classes]`.
    pub fn forward(&self, imgs: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.head.forward(&self.features(imgs, train)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use crate::vit::test_support::tiny_config;

    #[test]
    fn test_component_ids_round_trip() {
        for c in Component::ALL {
            assert_eq!(Component::from_id(c.id()), Some(c));
        }
        assert_eq!(Component::from_id("tailshaft"), None);
    }

    #[test]
    fn test_empty_branch_list_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(
            MultiBranchClassifier::new(Vec::new(), 3, vb),
            Err(ModelError::Config(_))
        ));
    }

    #[test]
    fn test_conv_branches_fuse_in_order() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model =
            MultiBranchClassifier::conv_per_component(&Component::ALL, 4, 6, 5, vb).unwrap();
        assert_eq!(model.feature_dim(), 24);
        assert_eq!(
            model.branch_names(),
            vec!["gearbox", "left_axlebox", "right_axlebox", "motor"]
        );

        let imgs = Tensor::randn(0f32, 1.0, (2, 4, 16, 16), &Device::Cpu).unwrap();
        assert_eq!(model.features(&imgs, false).unwrap().dims(), &[2, 24]);
        assert_eq!(model.forward(&imgs, false).unwrap().dims(), &[2, 5]);
        assert!(varmap.data().lock().unwrap().contains_key("motor.conv1.weight"));
    }

    #[test]
    fn test_mixed_branches() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = tiny_config();
        let branches: Vec<(usize, Box<dyn FeatureExtractor>)> = vec![
            (0, Box::new(VitBranch::new("gearbox", &cfg, vb.pp("gearbox")).unwrap())),
            (1, Box::new(ConvBranch::new("motor", 4, 8, vb.pp("motor")).unwrap())),
        ];
        let model = MultiBranchClassifier::new(branches, 3, vb).unwrap();
        assert_eq!(model.feature_dim(), cfg.embed_dim + 8);

        let imgs = Tensor::randn(0f32, 1.0, (2, 2, 16, 16), &Device::Cpu).unwrap();
        assert_eq!(model.forward(&imgs, false).unwrap().dims(), &[2, 3]);
    }

    #[test]
    fn test_out_of_range_channel_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model =
            MultiBranchClassifier::conv_per_component(&Component::ALL, 2, 4, 3, vb).unwrap();
        let imgs = Tensor::randn(0f32, 1.0, (1, 2, 8, 8), &Device::Cpu).unwrap();
        assert!(model.forward(&imgs, false).is_err());
    }
}
