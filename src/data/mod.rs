//! Spectrogram tensor sets and mini-batching.
//!
//! Sets are stored as safetensors files with an `images` tensor
//! `[N, C, H, W]` and, for labelled sets, a `labels` tensor `[N]`. They are
//! produced by the upstream vibration-to-STFT pipeline; this module only
//! validates, batches and shuffles them.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rand_distr::{Distribution, Normal};
use thiserror::Error;

use crate::vit::PatchGrid;

pub const IMAGES_KEY: &str = "images";
pub const LABELS_KEY: &str = "labels";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("expected images [N, {channels}, {size}, {size}], got {actual:?}")]
    ImageShape {
        channels: usize,
        size: usize,
        actual: Vec<usize>,
    },

    #[error("{labels} labels for {images} images")]
    LabelCount { images: usize, labels: usize },

    #[error("label {label} out of range for {num_classes} classes")]
    LabelRange { label: u32, num_classes: usize },

    #[error("{components} component names for {channels} channels")]
    ComponentCount { channels: usize, components: usize },

    #[error("set has no labels")]
    MissingLabels,

    #[error("no tensor '{key}' in {path}")]
    MissingTensor { key: &'static str, path: PathBuf },

    #[error("batch size must be > 0")]
    ZeroBatch,

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DataError>;

/// One mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, C, H, W]` f32.
    pub images: Tensor,
    /// `[B]` u32 class indices.
    pub labels: Option<Tensor>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validated image set, optionally labelled.
#[derive(Debug, Clone)]
pub struct SpectrogramSet {
    images: Tensor,
    labels: Option<Tensor>,
    components: Vec<String>,
}

impl SpectrogramSet {
    /// Check `images` against `grid` and every label against `num_classes`.
    pub fn new(
        images: Tensor,
        labels: Option<Tensor>,
        grid: &PatchGrid,
        num_classes: usize,
    ) -> Result<Self> {
        let n = match *images.dims() {
            [n, c, h, w] if c == grid.in_channels && h == grid.img_size && w == grid.img_size => n,
            _ => {
                return Err(DataError::ImageShape {
                    channels: grid.in_channels,
                    size: grid.img_size,
                    actual: images.dims().to_vec(),
                })
            }
        };
        let images = images.to_dtype(DType::F32)?;

        let labels = match labels {
            Some(labels) => {
                let labels = labels.to_dtype(DType::U32)?;
                let count = labels.elem_count();
                if labels.rank() != 1 || count != n {
                    return Err(DataError::LabelCount {
                        images: n,
                        labels: count,
                    });
                }
                if let Some(&label) = labels
                    .to_vec1::<u32>()?
                    .iter()
                    .find(|&&l| l as usize >= num_classes)
                {
                    return Err(DataError::LabelRange { label, num_classes });
                }
                Some(labels)
            }
            None => None,
        };

        let components = (0..grid.in_channels).map(|i| format!("channel_{i}")).collect();
        Ok(Self {
            images,
            labels,
            components,
        })
    }

    /// Name the channels, in channel order.
    pub fn with_components(mut self, components: Vec<String>) -> Result<Self> {
        if components.len() != self.num_channels() {
            return Err(DataError::ComponentCount {
                channels: self.num_channels(),
                components: components.len(),
            });
        }
        self.components = components;
        Ok(self)
    }

    /// Same labels and components, new images of identical shape.
    pub fn with_images(&self, images: Tensor) -> Result<Self> {
        if images.dims() != self.images.dims() {
            return Err(DataError::ImageShape {
                channels: self.num_channels(),
                size: self.images.dims().last().copied().unwrap_or(0),
                actual: images.dims().to_vec(),
            });
        }
        Ok(Self {
            images,
            labels: self.labels.clone(),
            components: self.components.clone(),
        })
    }

    /// Read `images` (and `labels` when present) from a safetensors file.
    pub fn load(
        path: &Path,
        grid: &PatchGrid,
        num_classes: usize,
        device: &Device,
    ) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let images = tensors.remove(IMAGES_KEY).ok_or_else(|| DataError::MissingTensor {
            key: IMAGES_KEY,
            path: path.to_path_buf(),
        })?;
        let labels = tensors.remove(LABELS_KEY);
        let set = Self::new(images, labels, grid, num_classes)?;
        tracing::info!(
            path = %path.display(),
            samples = set.len(),
            labelled = set.labels.is_some(),
            "Loaded spectrogram set"
        );
        Ok(set)
    }

    /// Write the set in the format [`SpectrogramSet::load`] reads.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tensors = std::collections::HashMap::new();
        tensors.insert(IMAGES_KEY.to_string(), self.images.clone());
        if let Some(labels) = &self.labels {
            tensors.insert(LABELS_KEY.to_string(), labels.clone());
        }
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_channels(&self) -> usize {
        self.images.dims()[1]
    }

    pub const fn images(&self) -> &Tensor {
        &self.images
    }

    pub const fn labels(&self) -> Option<&Tensor> {
        self.labels.as_ref()
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Split into batches of `batch_size`; the last batch may be shorter.
    ///
    /// With `rng` the sample order is shuffled first.
    pub fn batches(&self, batch_size: usize, rng: Option<&mut StdRng>) -> Result<Vec<Batch>> {
        if batch_size == 0 {
            return Err(DataError::ZeroBatch);
        }
        #[allow(clippy::cast_possible_truncation)]
        let mut order: Vec<u32> = (0..self.len() as u32).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }

        let device = self.images.device();
        order
            .chunks(batch_size)
            .map(|chunk| -> Result<Batch> {
                let idx = Tensor::from_slice(chunk, chunk.len(), device)?;
                Ok(Batch {
                    images: self.images.index_select(&idx, 0)?,
                    labels: self
                        .labels
                        .as_ref()
                        .map(|l| l.index_select(&idx, 0))
                        .transpose()?,
                })
            })
            .collect()
    }

    /// Labelled synthetic spectrograms for smoke runs and tests.
    ///
    /// Class `k` shows horizontal energy bands at harmonics of a
    /// class-specific base frequency row; each channel scales the bands by
    /// its own gain and adds Gaussian noise.
    #[allow(clippy::cast_precision_loss)]
    pub fn synthetic(
        samples: usize,
        grid: &PatchGrid,
        num_classes: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0f32, 0.1).map_err(|e| {
            DataError::Candle(candle_core::Error::Msg(format!("noise distribution: {e}")))
        })?;

        let (c, side) = (grid.in_channels, grid.img_size);
        let classes = num_classes.max(1);
        let sigma = (side as f32 / 32.0).max(0.5);
        let mut data = Vec::with_capacity(samples * c * side * side);
        let mut labels = Vec::with_capacity(samples);

        for i in 0..samples {
            let class = i % classes;
            #[allow(clippy::cast_possible_truncation)]
            labels.push(class as u32);
            let base = side as f32 * (class + 1) as f32 / (2 * (classes + 1)) as f32;
            for ch in 0..c {
                let gain = 1.0 + 0.25 * ch as f32;
                for row in 0..side {
                    let band: f32 = (1..=3)
                        .map(|k| {
                            let d = row as f32 - base * k as f32;
                            (-(d * d) / (2.0 * sigma * sigma)).exp() / k as f32
                        })
                        .sum();
                    for _ in 0..side {
                        data.push(gain * band + noise.sample(&mut rng));
                    }
                }
            }
        }

        let images = Tensor::from_vec(data, (samples, c, side, side), device)?;
        let labels = Tensor::from_vec(labels, samples, device)?;
        Self::new(images, Some(labels), grid, num_classes)
    }
}
