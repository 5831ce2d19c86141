//! Per-component standardization of spectrogram channels.
//!
//! Every component gets one [`StandardScaler`], fitted the first time the
//! component is seen (normally on the training set) and reused unchanged
//! for validation and test sets.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::defaults;
use crate::data::{DataError, SpectrogramSet};

/// Scalar mean/std standardization: `(x - mean) / std`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: f64,
    pub std: f64,
}

impl StandardScaler {
    /// Population mean and standard deviation over all elements of `values`.
    ///
    /// A constant input gets the std floor instead of zero.
    pub fn fit(values: &Tensor) -> candle_core::Result<Self> {
        let values = values.to_dtype(DType::F64)?.flatten_all()?;
        let mean = values.mean_all()?.to_scalar::<f64>()?;
        let var = (values - mean)?.sqr()?.mean_all()?.to_scalar::<f64>()?;
        Ok(Self {
            mean,
            std: var.sqrt().max(defaults::SCALER_MIN_STD),
        })
    }

    pub fn transform(&self, values: &Tensor) -> candle_core::Result<Tensor> {
        values.affine(1.0 / self.std, -self.mean / self.std)
    }

    pub fn inverse_transform(&self, values: &Tensor) -> candle_core::Result<Tensor> {
        values.affine(self.std, self.mean)
    }
}

/// One scaler per component id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScalerRegistry {
    scalers: HashMap<String, StandardScaler>,
}

impl ScalerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, component: &str) -> Option<&StandardScaler> {
        self.scalers.get(component)
    }

    /// Existing scaler for `component`, or one fitted on `values` and stored.
    pub fn get_or_fit(
        &mut self,
        component: &str,
        values: &Tensor,
    ) -> candle_core::Result<StandardScaler> {
        match self.scalers.entry(component.to_string()) {
            Entry::Occupied(e) => Ok(*e.get()),
            Entry::Vacant(e) => {
                let scaler = StandardScaler::fit(values)?;
                debug!(component, mean = scaler.mean, std = scaler.std, "Fitted scaler");
                Ok(*e.insert(scaler))
            }
        }
    }

    /// Standardize each channel of `set` with its component's scaler.
    pub fn normalize(&mut self, set: &SpectrogramSet) -> Result<SpectrogramSet, DataError> {
        let images = set.images();
        let mut channels = Vec::with_capacity(set.num_channels());
        for (c, component) in set.components().iter().enumerate() {
            let channel = images.narrow(1, c, 1)?;
            let scaler = self.get_or_fit(component, &channel)?;
            channels.push(scaler.transform(&channel)?);
        }
        set.with_images(Tensor::cat(&channels, 1)?)
    }

    pub fn len(&self) -> usize {
        self.scalers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scalers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vit::PatchGrid;
    use candle_core::Device;

    #[test]
    fn test_fit_and_transform() {
        let values = Tensor::new(&[1f32, 2.0, 3.0, 4.0], &Device::Cpu).unwrap();
        let scaler = StandardScaler::fit(&values).unwrap();
        assert!((scaler.mean - 2.5).abs() < 1e-12);
        assert!((scaler.std - 1.25f64.sqrt()).abs() < 1e-12);

        let out = scaler.transform(&values).unwrap();
        let back = scaler.inverse_transform(&out).unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in back.iter().zip([1f32, 2.0, 3.0, 4.0]) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_constant_input_uses_floor() {
        let values = Tensor::new(&[5f32, 5.0, 5.0], &Device::Cpu).unwrap();
        let scaler = StandardScaler::fit(&values).unwrap();
        assert_eq!(scaler.std, defaults::SCALER_MIN_STD);
        let out = scaler.transform(&values).unwrap().to_vec1::<f32>().unwrap();
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_scaler_fitted_once_per_component() {
        let mut registry = ScalerRegistry::new();
        let first = Tensor::new(&[0f32, 2.0], &Device::Cpu).unwrap();
        let second = Tensor::new(&[100f32, 300.0], &Device::Cpu).unwrap();

        let a = registry.get_or_fit("gearbox", &first).unwrap();
        let b = registry.get_or_fit("gearbox", &second).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);

        registry.get_or_fit("motor", &second).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_normalize_reuses_training_statistics() {
        let grid = PatchGrid::new(8, 4, 2);
        let train = SpectrogramSet::synthetic(6, &grid, 3, 1, &Device::Cpu)
            .unwrap()
            .with_components(vec!["gearbox".into(), "motor".into()])
            .unwrap();
        let mut registry = ScalerRegistry::new();
        let normed = registry.normalize(&train).unwrap();

        let mean = normed.images().mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(mean.abs() < 1e-4);
        let gearbox = *registry.get("gearbox").unwrap();

        let val = SpectrogramSet::synthetic(3, &grid, 3, 9, &Device::Cpu)
            .unwrap()
            .with_components(vec!["gearbox".into(), "motor".into()])
            .unwrap();
        registry.normalize(&val).unwrap();
        assert_eq!(registry.get("gearbox"), Some(&gearbox));
    }
}
