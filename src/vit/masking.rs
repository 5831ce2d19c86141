//! Per-sample random patch masking.
//!
//! A [`MaskPlan`] is drawn on the host from a seeded RNG: each sample gets
//! an independent uniform noise vector over its patches, the patches are
//! ranked by noise (stable ascending sort), and the first `len_keep` ranks
//! stay visible. `ids_restore` is the inverse permutation, used by the
//! decoder to put tokens back into grid order.

use candle_core::{Tensor, D};
use rand::Rng;

use super::{ModelError, Result};

/// Visible tokens plus the bookkeeping needed to undo the shuffle.
#[derive(Debug, Clone)]
pub struct MaskedTokens {
    /// `[B, len_keep, D]`, in shuffled (noise-rank) order.
    pub visible: Tensor,
    /// `[B, N]` f32, 0 = kept, 1 = removed, in original grid order.
    pub mask: Tensor,
    /// `[B, N]` u32, `ids_restore[b][i]` = rank of patch `i` in the shuffle.
    pub ids_restore: Tensor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskPlan {
    batch: usize,
    num_patches: usize,
    len_keep: usize,
    ids_shuffle: Vec<u32>,
    ids_restore: Vec<u32>,
}

impl MaskPlan {
    /// Number of visible patches: `floor(N * (1 - ratio))`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn len_keep(num_patches: usize, mask_ratio: f64) -> Result<usize> {
        if !(0.0..1.0).contains(&mask_ratio) {
            return Err(ModelError::MaskRatio(mask_ratio));
        }
        Ok(((num_patches as f64) * (1.0 - mask_ratio)).floor() as usize)
    }

    /// Draw an independent noise vector per sample from `rng`.
    pub fn generate<R: Rng + ?Sized>(
        batch: usize,
        num_patches: usize,
        mask_ratio: f64,
        rng: &mut R,
    ) -> Result<Self> {
        let noise: Vec<f32> = (0..batch * num_patches).map(|_| rng.gen::<f32>()).collect();
        Self::from_noise(batch, num_patches, mask_ratio, &noise)
    }

    /// Build a plan from explicit `[batch * num_patches]` noise.
    ///
    /// Ties are broken by patch index.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_noise(
        batch: usize,
        num_patches: usize,
        mask_ratio: f64,
        noise: &[f32],
    ) -> Result<Self> {
        if noise.len() != batch * num_patches {
            return Err(ModelError::Config(format!(
                "mask noise has {} values, expected {batch} x {num_patches}",
                noise.len()
            )));
        }
        let len_keep = Self::len_keep(num_patches, mask_ratio)?;

        let mut ids_shuffle = Vec::with_capacity(noise.len());
        let mut ids_restore = vec![0u32; noise.len()];
        for (b, row) in noise.chunks(num_patches.max(1)).take(batch).enumerate() {
            let mut order: Vec<usize> = (0..num_patches).collect();
            order.sort_by(|&i, &j| row[i].total_cmp(&row[j]));
            for (rank, &patch) in order.iter().enumerate() {
                ids_restore[b * num_patches + patch] = rank as u32;
            }
            ids_shuffle.extend(order.into_iter().map(|p| p as u32));
        }

        Ok(Self {
            batch,
            num_patches,
            len_keep,
            ids_shuffle,
            ids_restore,
        })
    }

    pub const fn batch(&self) -> usize {
        self.batch
    }

    pub const fn num_patches(&self) -> usize {
        self.num_patches
    }

    pub const fn kept(&self) -> usize {
        self.len_keep
    }

    /// Patch indices of sample `b` sorted by ascending noise.
    pub fn ids_shuffle(&self, b: usize) -> &[u32] {
        &self.ids_shuffle[b * self.num_patches..(b + 1) * self.num_patches]
    }

    pub fn ids_restore(&self, b: usize) -> &[u32] {
        &self.ids_restore[b * self.num_patches..(b + 1) * self.num_patches]
    }

    /// Indices of the visible patches of sample `b`, in shuffled order.
    pub fn ids_keep(&self, b: usize) -> &[u32] {
        &self.ids_shuffle(b)[..self.len_keep]
    }

    /// Binary mask of sample `b` in grid order (1 = removed).
    pub fn mask_row(&self, b: usize) -> Vec<f32> {
        self.ids_restore(b)
            .iter()
            .map(|&rank| if (rank as usize) < self.len_keep { 0.0 } else { 1.0 })
            .collect()
    }

    /// Keep the visible subset of `[B, N, D]` tokens.
    pub fn apply(&self, tokens: &Tensor) -> Result<MaskedTokens> {
        let (b, n, d) = tokens.dims3()?;
        if b != self.batch || n != self.num_patches {
            return Err(ModelError::Config(format!(
                "mask plan is for [{}, {}] tokens, got [{b}, {n}]",
                self.batch, self.num_patches
            )));
        }
        let device = tokens.device();

        let visible = if self.len_keep == 0 {
            Tensor::zeros((b, 0, d), tokens.dtype(), device)?
        } else {
            let keep: Vec<u32> = (0..b).flat_map(|i| self.ids_keep(i).iter().copied()).collect();
            let index = Tensor::from_vec(keep, (b, self.len_keep), device)?
                .unsqueeze(D::Minus1)?
                .broadcast_as((b, self.len_keep, d))?
                .contiguous()?;
            tokens.contiguous()?.gather(&index, 1)?
        };

        let mask: Vec<f32> = (0..b).flat_map(|i| self.mask_row(i)).collect();
        Ok(MaskedTokens {
            visible,
            mask: Tensor::from_vec(mask, (b, n), device)?,
            ids_restore: Tensor::from_vec(self.ids_restore.clone(), (b, n), device)?,
        })
    }
}

/// Put `[B, N, D]` tokens in shuffled order (visible first, then the
/// placeholders of removed patches) back into grid order.
pub fn unshuffle(shuffled: &Tensor, ids_restore: &Tensor) -> Result<Tensor> {
    let (b, n, d) = shuffled.dims3()?;
    if ids_restore.dims() != [b, n] {
        return Err(ModelError::Config(format!(
            "ids_restore {:?} does not match tokens [{b}, {n}, {d}]",
            ids_restore.dims()
        )));
    }
    let index = ids_restore
        .unsqueeze(D::Minus1)?
        .broadcast_as((b, n, d))?
        .contiguous()?;
    Ok(shuffled.contiguous()?.gather(&index, 1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_len_keep() {
        assert_eq!(MaskPlan::len_keep(196, 0.75).unwrap(), 49);
        assert_eq!(MaskPlan::len_keep(196, 0.0).unwrap(), 196);
        assert_eq!(MaskPlan::len_keep(10, 0.75).unwrap(), 2);
        assert!(matches!(
            MaskPlan::len_keep(196, 1.0),
            Err(ModelError::MaskRatio(_))
        ));
        assert!(MaskPlan::len_keep(196, -0.1).is_err());
    }

    #[test]
    fn test_restore_is_inverse_of_shuffle() {
        let mut rng = StdRng::seed_from_u64(7);
        let plan = MaskPlan::generate(3, 50, 0.6, &mut rng).unwrap();
        for b in 0..3 {
            let shuffle = plan.ids_shuffle(b);
            let restore = plan.ids_restore(b);
            for (rank, &patch) in shuffle.iter().enumerate() {
                assert_eq!(restore[patch as usize] as usize, rank);
            }
            let mut sorted = shuffle.to_vec();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..50).collect::<Vec<u32>>());
        }
    }

    #[test]
    fn test_exact_masked_count_per_sample() {
        let mut rng = StdRng::seed_from_u64(11);
        let plan = MaskPlan::generate(4, 196, 0.75, &mut rng).unwrap();
        for b in 0..4 {
            let masked: f32 = plan.mask_row(b).iter().sum();
            assert_eq!(masked, 147.0);
        }
    }

    #[test]
    fn test_samples_are_masked_independently() {
        let mut rng = StdRng::seed_from_u64(3);
        let plan = MaskPlan::generate(2, 64, 0.5, &mut rng).unwrap();
        assert_ne!(plan.ids_keep(0), plan.ids_keep(1));
    }

    #[test]
    fn test_ties_broken_by_index() {
        let plan = MaskPlan::from_noise(1, 4, 0.5, &[0.5, 0.5, 0.1, 0.5]).unwrap();
        assert_eq!(plan.ids_shuffle(0), &[2, 0, 1, 3]);
        assert_eq!(plan.mask_row(0), vec![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_apply_gathers_kept_tokens() {
        // token value encodes (batch, patch)
        let data: Vec<f32> = (0..2 * 6)
            .flat_map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let v = i as f32;
                [v, -v]
            })
            .collect();
        let tokens = Tensor::from_vec(data, (2, 6, 2), &Device::Cpu).unwrap();
        let noise = [
            0.9, 0.1, 0.8, 0.2, 0.7, 0.3, //
            0.1, 0.2, 0.3, 0.4, 0.5, 0.6,
        ];
        let plan = MaskPlan::from_noise(2, 6, 0.5, &noise).unwrap();
        let out = plan.apply(&tokens).unwrap();

        assert_eq!(out.visible.dims(), &[2, 3, 2]);
        let first = out.visible.i((0, .., 0)).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(first, vec![1.0, 3.0, 5.0]);
        let second = out.visible.i((1, .., 0)).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(second, vec![6.0, 7.0, 8.0]);

        let mask = out.mask.to_vec2::<f32>().unwrap();
        assert_eq!(mask[0], vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
        assert_eq!(mask[1], vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_apply_rejects_wrong_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let plan = MaskPlan::generate(1, 8, 0.5, &mut rng).unwrap();
        let tokens = Tensor::zeros((1, 9, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(plan.apply(&tokens).is_err());
    }

    #[test]
    fn test_unshuffle_restores_grid_order() {
        let mut rng = StdRng::seed_from_u64(19);
        let (batch, n) = (3, 16);
        let plan = MaskPlan::generate(batch, n, 0.75, &mut rng).unwrap();
        let tokens = Tensor::zeros((batch, n, 1), candle_core::DType::F32, &Device::Cpu).unwrap();
        let masked = plan.apply(&tokens).unwrap();

        // each slot holds the grid index of the patch it stands for:
        // kept patches in shuffled order, then the removed ones
        #[allow(clippy::cast_precision_loss)]
        let values: Vec<f32> = (0..batch)
            .flat_map(|b| plan.ids_shuffle(b).iter().map(|&p| p as f32).collect::<Vec<_>>())
            .collect();
        let shuffled = Tensor::from_vec(values, (batch, n, 1), &Device::Cpu).unwrap();

        let restored = unshuffle(&shuffled, &masked.ids_restore).unwrap();
        #[allow(clippy::cast_precision_loss)]
        let grid: Vec<f32> = (0..n).map(|i| i as f32).collect();
        for b in 0..batch {
            let row = restored.i((b, .., 0)).unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(row, grid, "sample {b}");
        }
    }

    #[test]
    fn test_unshuffle_rejects_mismatched_restore() {
        let shuffled = Tensor::zeros((1, 4, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let ids_restore = Tensor::zeros((1, 5), candle_core::DType::U32, &Device::Cpu).unwrap();
        assert!(unshuffle(&shuffled, &ids_restore).is_err());
    }
}
