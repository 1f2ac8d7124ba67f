#![forbid(unsafe_code)]

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    #[must_use]
    pub fn preferred(use_cuda: bool) -> Self {
        if use_cuda { Self::Cuda } else { Self::Cpu }
    }
}

/// Shape and placement of a contiguous tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn scalar(device: Device) -> Self {
        Self {
            shape: Vec::new(),
            device,
        }
    }

    #[must_use]
    pub fn from_shape(shape: Vec<usize>, device: Device) -> Self {
        Self { shape, device }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        if self.shape.is_empty() {
            return 1;
        }
        self.shape.iter().copied().product()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenseTensorError {
    StorageLengthMismatch { expected: usize, actual: usize },
}

impl fmt::Display for DenseTensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorageLengthMismatch { expected, actual } => write!(
                f,
                "storage length mismatch: expected {expected} elements, got {actual}"
            ),
        }
    }
}

impl std::error::Error for DenseTensorError {}

/// Contiguous f64 tensor. Storage length always equals `meta.numel()`.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    meta: TensorMeta,
    storage: Vec<f64>,
}

impl DenseTensor {
    pub fn from_storage(meta: TensorMeta, storage: Vec<f64>) -> Result<Self, DenseTensorError> {
        if storage.len() != meta.numel() {
            return Err(DenseTensorError::StorageLengthMismatch {
                expected: meta.numel(),
                actual: storage.len(),
            });
        }
        Ok(Self { meta, storage })
    }

    pub fn from_vec(shape: Vec<usize>, values: Vec<f64>) -> Result<Self, DenseTensorError> {
        Self::from_storage(TensorMeta::from_shape(shape, Device::Cpu), values)
    }

    #[must_use]
    pub fn full(shape: Vec<usize>, value: f64, device: Device) -> Self {
        let meta = TensorMeta::from_shape(shape, device);
        let storage = vec![value; meta.numel()];
        Self { meta, storage }
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0, Device::Cpu)
    }

    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self {
            meta: TensorMeta::scalar(Device::Cpu),
            storage: vec![value],
        }
    }

    /// Same metadata, new contents.
    pub fn with_values(&self, values: Vec<f64>) -> Result<Self, DenseTensorError> {
        Self::from_storage(self.meta.clone(), values)
    }

    #[must_use]
    pub fn map(&self, op: impl Fn(f64) -> f64) -> Self {
        Self {
            meta: self.meta.clone(),
            storage: self.storage.iter().copied().map(op).collect(),
        }
    }

    #[must_use]
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            meta: TensorMeta::from_shape(self.meta.shape.clone(), device),
            storage: self.storage.clone(),
        }
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.meta.device()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.storage.len()
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.storage
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.storage
    }

    #[must_use]
    pub fn has_invalid(&self) -> bool {
        self.storage.iter().copied().any(is_invalid_value)
    }
}

/// NaN and both infinities are invalid; every finite value is valid.
#[must_use]
pub fn is_invalid_value(value: f64) -> bool {
    !value.is_finite()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{DenseTensor, DenseTensorError, Device, TensorMeta, is_invalid_value};

    #[test]
    fn scalar_meta_has_one_element() {
        let meta = TensorMeta::scalar(Device::Cpu);
        assert!(meta.shape().is_empty());
        assert_eq!(meta.numel(), 1);
    }

    #[test]
    fn shape_determines_numel() {
        let meta = TensorMeta::from_shape(vec![2, 3, 4], Device::Cpu);
        assert_eq!(meta.numel(), 24);
        assert_eq!(meta.device(), Device::Cpu);
    }

    #[test]
    fn dense_tensor_rejects_short_storage() {
        let err = DenseTensor::from_vec(vec![2, 2], vec![1.0, 2.0, 3.0])
            .expect_err("three values cannot fill a 2x2 tensor");
        assert_eq!(
            err,
            DenseTensorError::StorageLengthMismatch {
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn with_values_keeps_meta_and_checks_length() {
        let tensor = DenseTensor::full(vec![3], 1.0, Device::Cuda);
        let replaced = tensor
            .with_values(vec![4.0, 5.0, 6.0])
            .expect("same length should succeed");
        assert_eq!(replaced.meta(), tensor.meta());
        assert_eq!(replaced.values(), &[4.0, 5.0, 6.0]);
        assert!(tensor.with_values(vec![1.0]).is_err());
    }

    #[test]
    fn invalid_values_are_nan_and_infinities() {
        assert!(is_invalid_value(f64::NAN));
        assert!(is_invalid_value(f64::INFINITY));
        assert!(is_invalid_value(f64::NEG_INFINITY));
        assert!(!is_invalid_value(f64::MAX));
        assert!(!is_invalid_value(-0.0));

        let tensor = DenseTensor::from_vec(vec![4], vec![1.0, f64::NAN, 2.0, f64::INFINITY])
            .expect("tensor should build");
        assert!(tensor.has_invalid());
        assert!(!DenseTensor::zeros(vec![2, 2]).has_invalid());
    }

    #[test]
    fn map_preserves_shape_and_device() {
        let tensor = DenseTensor::full(vec![2, 3], 2.0, Device::Cuda);
        let squared = tensor.map(|value| value * value);
        assert_eq!(squared.shape(), &[2, 3]);
        assert_eq!(squared.device(), Device::Cuda);
        assert!(squared.values().iter().all(|value| *value == 4.0));
    }

    #[test]
    fn to_device_keeps_values() {
        let tensor = DenseTensor::from_vec(vec![2], vec![1.5, -0.5]).expect("tensor should build");
        let moved = tensor.to_device(Device::Cuda);
        assert_eq!(moved.device(), Device::Cuda);
        assert_eq!(moved.values(), tensor.values());
        assert_ne!(moved.meta(), tensor.meta());
    }

    #[test]
    fn preferred_device_follows_flag() {
        assert_eq!(Device::preferred(true), Device::Cuda);
        assert_eq!(Device::preferred(false), Device::Cpu);
    }

    proptest! {
        #[test]
        fn prop_full_tensor_numel_matches_shape(shape in prop::collection::vec(1usize..=6, 0..=4)) {
            let tensor = DenseTensor::full(shape.clone(), 0.25, Device::Cpu);
            let expected: usize = shape.iter().copied().product();
            prop_assert_eq!(tensor.numel(), expected);
            prop_assert_eq!(tensor.meta().numel(), expected);
            prop_assert!(!tensor.has_invalid());
        }
    }
}
