//! Masked-patch reconstruction objective.

use candle_core::{DType, Tensor, D};

use super::patch::{patchify, PatchGrid};
use super::{ModelError, Result};
use crate::config::defaults;

/// Mean squared error over masked patches only.
///
/// `pred` is `[B, N, p*p*C]`, `mask` is `[B, N]` with 1 on removed patches.
/// With `norm_pix` each target patch is standardized by its own mean and
/// unbiased variance first. A mask with no removed patch yields a zero
/// scalar instead of dividing by zero.
pub fn reconstruction_loss(
    imgs: &Tensor,
    pred: &Tensor,
    mask: &Tensor,
    grid: &PatchGrid,
    norm_pix: bool,
) -> Result<Tensor> {
    let target = patchify(imgs, grid)?;
    if pred.dims() != target.dims() {
        return Err(ModelError::Config(format!(
            "prediction shape {:?} does not match target {:?}",
            pred.dims(),
            target.dims()
        )));
    }
    let target = if norm_pix {
        let mean = target.mean_keepdim(D::Minus1)?;
        let var = target.var_keepdim(D::Minus1)?;
        target
            .broadcast_sub(&mean)?
            .broadcast_div(&(var + defaults::NORM_PIX_EPS)?.sqrt()?)?
    } else {
        target
    };

    let per_patch = pred.sub(&target)?.sqr()?.mean(D::Minus1)?;
    let mask = mask.to_dtype(per_patch.dtype())?;
    let removed = mask.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
    if removed == 0.0 {
        return Ok(Tensor::zeros((), per_patch.dtype(), per_patch.device())?);
    }
    Ok((per_patch.mul(&mask)?.sum_all()? / removed)?)
}
