//! Fixed 2D sin-cos positional tables.
//!
//! Half of each vector encodes the patch column, the other half the patch
//! row; each half is a 1D table of `sin(pos * w_k)` followed by
//! `cos(pos * w_k)` with `w_k = 1 / 10000^(k / (D/4))`. The classification
//! slot (index 0) is all zeros.

use candle_core::Tensor;
use candle_nn::VarMap;

use super::{ModelError, Result};

fn sincos_1d(dim: usize, positions: &[f64]) -> Vec<Vec<f64>> {
    let half = dim / 2;
    #[allow(clippy::cast_precision_loss)]
    let omega: Vec<f64> = (0..half)
        .map(|k| 1.0 / 10_000f64.powf(k as f64 / half as f64))
        .collect();
    positions
        .iter()
        .map(|&pos| {
            let mut row: Vec<f64> = omega.iter().map(|w| (pos * w).sin()).collect();
            row.extend(omega.iter().map(|w| (pos * w).cos()));
            row
        })
        .collect()
}

/// `[(1 + side²) * dim]` table, row-major over the grid, classification slot first.
#[allow(clippy::cast_precision_loss)]
pub fn sincos_2d(dim: usize, grid_side: usize) -> Result<Vec<f32>> {
    if dim == 0 || dim % 4 != 0 {
        return Err(ModelError::Config(format!(
            "sin-cos position embedding needs a width divisible by 4, got {dim}"
        )));
    }
    let coords: Vec<f64> = (0..grid_side).map(|i| i as f64).collect();
    let axis = sincos_1d(dim / 2, &coords);

    let mut table = vec![0f32; dim];
    for row in 0..grid_side {
        for col in 0..grid_side {
            table.extend(axis[col].iter().map(|&v| v as f32));
            table.extend(axis[row].iter().map(|&v| v as f32));
        }
    }
    Ok(table)
}

/// Overwrite the `[1, 1 + N, D]` parameter `key` with the sin-cos table.
///
/// The parameter stays trainable; only its starting value changes.
pub fn install_sincos(varmap: &VarMap, key: &str, grid_side: usize) -> Result<()> {
    let vars = varmap.data().lock().map_err(|_| {
        ModelError::Config("parameter map lock poisoned".to_string())
    })?;
    let var = vars
        .get(key)
        .ok_or_else(|| ModelError::Config(format!("no parameter named '{key}'")))?;
    let (_, tokens, dim) = var.dims3()?;
    if tokens != grid_side * grid_side + 1 {
        return Err(ModelError::Config(format!(
            "'{key}' has {tokens} positions, expected {}",
            grid_side * grid_side + 1
        )));
    }
    let table = Tensor::from_vec(sincos_2d(dim, grid_side)?, (1, tokens, dim), var.device())?
        .to_dtype(var.dtype())?;
    var.set(&table)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_layout() {
        let table = sincos_2d(8, 3).unwrap();
        assert_eq!(table.len(), 10 * 8);
        assert!(table[..8].iter().all(|&v| v == 0.0));

        // patch (0, 0): sin(0) = 0 and cos(0) = 1 in both halves
        assert_eq!(&table[8..16], &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_rows_and_columns_differ() {
        let table = sincos_2d(8, 2).unwrap();
        let patch = |i: usize| &table[(1 + i) * 8..(2 + i) * 8];
        // (0,1) and (1,0) swap halves
        assert_eq!(&patch(1)[..4], &patch(2)[4..]);
        assert_eq!(&patch(1)[4..], &patch(2)[..4]);
        assert_ne!(patch(1), patch(2));
    }

    #[test]
    fn test_width_must_be_divisible_by_four() {
        assert!(sincos_2d(6, 2).is_err());
    }
}
