//! Patch geometry, patchify/unpatchify, and the patch embedding layer.
//!
//! Patches are always enumerated in [`PatchGrid::TRAVERSAL`] order. The
//! embedding layer is built on top of [`patchify`], so token `k` of the
//! embedded sequence and row `k` of the reconstruction target are the same
//! image region by construction.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::{ModelError, Result};

/// Order in which grid cells are enumerated into a token sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridTraversal {
    /// Height first, then width: `index = row * cols + col`.
    RowMajor,
}

impl GridTraversal {
    pub const fn index(self, row: usize, col: usize, cols: usize) -> usize {
        match self {
            Self::RowMajor => row * cols + col,
        }
    }

    pub const fn position(self, index: usize, cols: usize) -> (usize, usize) {
        match self {
            Self::RowMajor => (index / cols, index % cols),
        }
    }
}

/// Square image split into a square grid of square patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGrid {
    pub img_size: usize,
    pub patch_size: usize,
    pub in_channels: usize,
}

impl PatchGrid {
    /// The single traversal shared by patch embedding, masking and reconstruction.
    pub const TRAVERSAL: GridTraversal = GridTraversal::RowMajor;

    pub const fn new(img_size: usize, patch_size: usize, in_channels: usize) -> Self {
        Self {
            img_size,
            patch_size,
            in_channels,
        }
    }

    /// Patches along one side.
    pub const fn grid_side(&self) -> usize {
        if self.patch_size == 0 {
            0
        } else {
            self.img_size / self.patch_size
        }
    }

    pub const fn num_patches(&self) -> usize {
        self.grid_side() * self.grid_side()
    }

    /// Length of one flattened patch: `p * p * C`.
    pub const fn patch_dim(&self) -> usize {
        self.patch_size * self.patch_size * self.in_channels
    }

    pub const fn index_of(&self, row: usize, col: usize) -> usize {
        Self::TRAVERSAL.index(row, col, self.grid_side())
    }

    pub const fn position_of(&self, index: usize) -> (usize, usize) {
        Self::TRAVERSAL.position(index, self.grid_side())
    }

    /// Reject geometries that cannot be tiled exactly.
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.img_size == 0 || self.in_channels == 0 {
            return Err(ModelError::Config(format!(
                "patch grid needs non-zero sizes, got img_size={} patch_size={} in_channels={}",
                self.img_size, self.patch_size, self.in_channels
            )));
        }
        if self.img_size % self.patch_size != 0 {
            return Err(ModelError::Config(format!(
                "img_size {} is not a multiple of patch_size {}",
                self.img_size, self.patch_size
            )));
        }
        Ok(())
    }

    /// Check that `imgs` is `[B, C, H, W]` with this grid's channels and size.
    pub fn check_images(&self, imgs: &Tensor) -> Result<usize> {
        let dims = imgs.dims();
        match *dims {
            [b, c, h, w] if c == self.in_channels && h == self.img_size && w == self.img_size => {
                Ok(b)
            }
            _ => Err(ModelError::ImageShape {
                channels: self.in_channels,
                size: self.img_size,
                actual: dims.to_vec(),
            }),
        }
    }
}

/// `[B, C, H, W]` → `[B, N, p*p*C]`.
///
/// Each patch vector is flattened as (patch row, patch column, channel).
pub fn patchify(imgs: &Tensor, grid: &PatchGrid) -> Result<Tensor> {
    grid.validate()?;
    let b = grid.check_images(imgs)?;
    let (c, p, side) = (grid.in_channels, grid.patch_size, grid.grid_side());

    // [B, C, gh, p, gw, q] → [B, gh, gw, p, q, C]
    let x = imgs
        .reshape((b, c, side, p, side, p))?
        .permute((0, 2, 4, 3, 5, 1))?;
    Ok(x.reshape((b, side * side, grid.patch_dim()))?)
}

/// Exact inverse of [`patchify`]: `[B, N, p*p*C]` → `[B, C, H, W]`.
pub fn unpatchify(patches: &Tensor, grid: &PatchGrid) -> Result<Tensor> {
    grid.validate()?;
    let (b, n, d) = patches.dims3()?;
    if n != grid.num_patches() || d != grid.patch_dim() {
        return Err(ModelError::Config(format!(
            "expected patches [B, {}, {}], got [{b}, {n}, {d}]",
            grid.num_patches(),
            grid.patch_dim()
        )));
    }
    let (c, p, side) = (grid.in_channels, grid.patch_size, grid.grid_side());

    // [B, gh, gw, p, q, C] → [B, C, gh, p, gw, q]
    let x = patches
        .reshape((b, side, side, p, p, c))?
        .permute((0, 5, 1, 3, 2, 4))?;
    Ok(x.reshape((b, c, grid.img_size, grid.img_size))?)
}

/// Linear projection of every non-overlapping patch, weights shared across positions.
#[derive(Debug)]
pub struct PatchEmbedding {
    grid: PatchGrid,
    proj: Linear,
}

impl PatchEmbedding {
    pub fn new(grid: PatchGrid, embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        grid.validate()?;
        let proj = candle_nn::linear(grid.patch_dim(), embed_dim, vb.pp("proj"))?;
        Ok(Self { grid, proj })
    }

    pub const fn grid(&self) -> &PatchGrid {
        &self.grid
    }

    pub const fn num_patches(&self) -> usize {
        self.grid.num_patches()
    }

    /// `[B, C, H, W]` → `[B, N, embed_dim]`; fails on any other spatial size.
    pub fn forward(&self, imgs: &Tensor) -> Result<Tensor> {
        let patches = patchify(imgs, &self.grid)?;
        Ok(self.proj.forward(&patches)?)
    }
}
