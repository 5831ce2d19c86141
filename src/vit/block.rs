//! Pre-norm Transformer block: `x + Attn(LN(x))`, then `x + MLP(LN(x))`.
//!
//! Layer norm and softmax are written with differentiable tensor ops only,
//! so every parameter in the stack receives gradients from `backward()`.

use std::sync::Mutex;

use candle_core::{Module, Tensor, D};
use candle_nn::{init::Init, Dropout, Linear, VarBuilder};

use super::{ModelError, Result};

/// Layer normalization over the last dimension with learned scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

/// Width and regularization of one Transformer block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockConfig {
    pub dim: usize,
    pub num_heads: usize,
    pub mlp_hidden: usize,
    pub drop_rate: f64,
    pub layer_norm_eps: f64,
}

fn dropout(rate: f64) -> Option<Dropout> {
    #[allow(clippy::cast_possible_truncation)]
    (rate > 0.0).then(|| Dropout::new(rate as f32))
}

fn apply_dropout(drop: Option<&Dropout>, xs: Tensor, train: bool) -> candle_core::Result<Tensor> {
    match drop {
        Some(d) => d.forward(&xs, train),
        None => Ok(xs),
    }
}

/// Multi-head self-attention with a fused query/key/value projection.
///
/// The softmax weights of the latest forward pass are kept (detached) for
/// visualization.
#[derive(Debug)]
pub struct MultiHeadAttention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    attn_drop: Option<Dropout>,
    proj_drop: Option<Dropout>,
    last_weights: Mutex<Option<Tensor>>,
}

impl MultiHeadAttention {
    pub fn new(dim: usize, num_heads: usize, drop_rate: f64, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || dim % num_heads != 0 {
            return Err(ModelError::Config(format!(
                "attention width {dim} is not divisible by {num_heads} heads"
            )));
        }
        let head_dim = dim / num_heads;
        #[allow(clippy::cast_precision_loss)]
        let scale = (head_dim as f64).powf(-0.5);
        Ok(Self {
            qkv: candle_nn::linear(dim, dim * 3, vb.pp("qkv"))?,
            proj: candle_nn::linear(dim, dim, vb.pp("proj"))?,
            num_heads,
            head_dim,
            scale,
            attn_drop: dropout(drop_rate),
            proj_drop: dropout(drop_rate),
            last_weights: Mutex::new(None),
        })
    }

    pub const fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// `[B, H, T, T]` softmax weights from the most recent forward pass.
    pub fn attention_weights(&self) -> Option<Tensor> {
        self.last_weights.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        // [B, T, 3D] → [3, B, H, T, hd]
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = (qkv.get(0)?.contiguous()? * self.scale)?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let attn = candle_nn::ops::softmax(&q.matmul(&k.t()?)?, D::Minus1)?;
        if let Ok(mut slot) = self.last_weights.lock() {
            *slot = Some(attn.detach());
        }
        let attn = apply_dropout(self.attn_drop.as_ref(), attn, train)?;

        let out = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, n, c))?;
        let out = self.proj.forward(&out)?;
        apply_dropout(self.proj_drop.as_ref(), out, train)
    }
}

/// Two-layer feed-forward network with GELU.
#[derive(Debug)]
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
    drop: Option<Dropout>,
}

impl Mlp {
    pub fn new(dim: usize, hidden: usize, drop_rate: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(dim, hidden, vb.pp("fc1"))?,
            fc2: candle_nn::linear(hidden, dim, vb.pp("fc2"))?,
            drop: dropout(drop_rate),
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let h = self.fc1.forward(xs)?.gelu_erf()?;
        let h = apply_dropout(self.drop.as_ref(), h, train)?;
        let out = self.fc2.forward(&h)?;
        apply_dropout(self.drop.as_ref(), out, train)
    }
}

/// One pre-norm encoder/decoder layer. Input and output are `[B, T, D]`.
#[derive(Debug)]
pub struct TransformerBlock {
    norm1: LayerNorm,
    attn: MultiHeadAttention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl TransformerBlock {
    pub fn new(cfg: &BlockConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: LayerNorm::new(cfg.dim, cfg.layer_norm_eps, vb.pp("norm1"))?,
            attn: MultiHeadAttention::new(cfg.dim, cfg.num_heads, cfg.drop_rate, vb.pp("attn"))?,
            norm2: LayerNorm::new(cfg.dim, cfg.layer_norm_eps, vb.pp("norm2"))?,
            mlp: Mlp::new(cfg.dim, cfg.mlp_hidden, cfg.drop_rate, vb.pp("mlp"))?,
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let h = self.attn.forward(&self.norm1.forward(xs)?, train)?;
        let xs = (xs + h)?;
        let h = self.mlp.forward(&self.norm2.forward(&xs)?, train)?;
        xs + h
    }

    pub fn attention_weights(&self) -> Option<Tensor> {
        self.attn.attention_weights()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn block_config() -> BlockConfig {
        BlockConfig {
            dim: 16,
            num_heads: 4,
            mlp_hidden: 32,
            drop_rate: 0.0,
            layer_norm_eps: 1e-6,
        }
    }

    #[test]
    fn test_layer_norm_normalizes_rows() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ln = LayerNorm::new(8, 1e-6, vb).unwrap();
        let xs = Tensor::randn(3f32, 2.0, (2, 5, 8), &Device::Cpu).unwrap();
        let ys = ln.forward(&xs).unwrap();

        let mean = ys.mean_keepdim(D::Minus1).unwrap().abs().unwrap().max_all().unwrap();
        assert!(mean.to_scalar::<f32>().unwrap() < 1e-4);
        let var = ys.sqr().unwrap().mean(D::Minus1).unwrap().flatten_all().unwrap();
        for v in var.to_vec1::<f32>().unwrap() {
            assert!((v - 1.0).abs() < 1e-3, "variance {v}");
        }
    }

    #[test]
    fn test_block_preserves_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = TransformerBlock::new(&block_config(), vb.pp("blocks.0")).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 7, 16), &Device::Cpu).unwrap();
        assert_eq!(block.forward(&xs, false).unwrap().dims(), &[2, 7, 16]);
    }

    #[test]
    fn test_attention_weights_rows_sum_to_one() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = TransformerBlock::new(&block_config(), vb).unwrap();
        assert!(block.attention_weights().is_none());

        let xs = Tensor::randn(0f32, 1.0, (1, 5, 16), &Device::Cpu).unwrap();
        block.forward(&xs, false).unwrap();
        let weights = block.attention_weights().unwrap();
        assert_eq!(weights.dims(), &[1, 4, 5, 5]);

        let sums = weights.sum(D::Minus1).unwrap().flatten_all().unwrap();
        for s in sums.to_vec1::<f32>().unwrap() {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_parameter_names() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        TransformerBlock::new(&block_config(), vb.pp("blocks").pp(0)).unwrap();
        let data = varmap.data().lock().unwrap();
        for key in [
            "blocks.0.norm1.weight",
            "blocks.0.attn.qkv.weight",
            "blocks.0.attn.proj.bias",
            "blocks.0.norm2.bias",
            "blocks.0.mlp.fc1.weight",
            "blocks.0.mlp.fc2.bias",
        ] {
            assert!(data.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = BlockConfig {
            num_heads: 3,
            ..block_config()
        };
        assert!(matches!(
            TransformerBlock::new(&cfg, vb),
            Err(ModelError::Config(_))
        ));
    }
}
