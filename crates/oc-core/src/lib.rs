#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// Execution target for tensors and kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Place {
    Cpu,
    Accelerator(usize),
}

impl Place {
    #[must_use]
    pub const fn is_accelerator(self) -> bool {
        matches!(self, Self::Accelerator(_))
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Accelerator(index) => write!(f, "accelerator:{index}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    place: Place,
}

impl TensorMeta {
    #[must_use]
    pub fn scalar(place: Place) -> Self {
        Self {
            shape: Vec::new(),
            place,
        }
    }

    pub fn from_shape(shape: Vec<usize>, place: Place) -> Result<Self, TensorError> {
        validate_shape(&shape)?;
        Ok(Self { shape, place })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn place(&self) -> Place {
        self.place
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
pub enum TensorError {
    ZeroDimension {
        shape: Vec<usize>,
        dim: usize,
    },
    DataLengthMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    IndexOutOfBounds {
        index: usize,
        numel: usize,
    },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroDimension { shape, dim } => {
                write!(f, "shape {shape:?} has a zero-sized dimension at dim={dim}")
            }
            Self::DataLengthMismatch {
                shape,
                expected,
                actual,
            } => write!(
                f,
                "data length mismatch for shape {shape:?}: expected={expected}, actual={actual}"
            ),
            Self::IndexOutOfBounds { index, numel } => {
                write!(f, "flat index {index} out of bounds for numel={numel}")
            }
        }
    }
}

impl std::error::Error for TensorError {}

/// Dense row-major f32 tensor owned by a scope variable.
///
/// A freshly created tensor is uninitialized: it has no storage until a shape
/// is set or data is bound.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    meta: TensorMeta,
    storage: Vec<f32>,
    initialized: bool,
}

impl Default for DenseTensor {
    fn default() -> Self {
        Self::uninitialized(Place::Cpu)
    }
}

impl DenseTensor {
    #[must_use]
    pub fn uninitialized(place: Place) -> Self {
        Self {
            meta: TensorMeta::scalar(place),
            storage: Vec::new(),
            initialized: false,
        }
    }

    pub fn from_values(values: Vec<f32>, shape: Vec<usize>, place: Place) -> Result<Self, TensorError> {
        let mut tensor = Self::uninitialized(place);
        tensor.assign(values, shape, place)?;
        Ok(tensor)
    }

    pub fn filled(value: f32, shape: Vec<usize>, place: Place) -> Result<Self, TensorError> {
        let meta = TensorMeta::from_shape(shape.clone(), place)?;
        Self::from_values(vec![value; meta.numel()], shape, place)
    }

    /// Resizes storage to `shape`, keeping the existing prefix of values and
    /// zero-filling any new elements.
    pub fn set_shape(&mut self, shape: &[usize]) -> Result<(), TensorError> {
        let meta = TensorMeta::from_shape(shape.to_vec(), self.meta.place())?;
        self.storage.resize(meta.numel(), 0.0);
        self.meta = meta;
        self.initialized = true;
        Ok(())
    }

    /// Copies `values` into the tensor, reshaping it to `shape` and moving it
    /// to `place`.
    pub fn set_from_array(
        &mut self,
        values: &[f32],
        shape: &[usize],
        place: Place,
    ) -> Result<(), TensorError> {
        self.assign(values.to_vec(), shape.to_vec(), place)
    }

    pub fn assign(
        &mut self,
        values: Vec<f32>,
        shape: Vec<usize>,
        place: Place,
    ) -> Result<(), TensorError> {
        let meta = TensorMeta::from_shape(shape, place)?;
        if values.len() != meta.numel() {
            return Err(TensorError::DataLengthMismatch {
                shape: meta.shape().to_vec(),
                expected: meta.numel(),
                actual: values.len(),
            });
        }
        self.meta = meta;
        self.storage = values;
        self.initialized = true;
        Ok(())
    }

    pub fn element(&self, index: usize) -> Result<f32, TensorError> {
        self.storage
            .get(index)
            .copied()
            .ok_or(TensorError::IndexOutOfBounds {
                index,
                numel: self.storage.len(),
            })
    }

    pub fn set_element(&mut self, index: usize, value: f32) -> Result<(), TensorError> {
        let numel = self.storage.len();
        let slot = self
            .storage
            .get_mut(index)
            .ok_or(TensorError::IndexOutOfBounds { index, numel })?;
        *slot = value;
        Ok(())
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
    pub fn place(&self) -> Place {
        self.meta.place()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.storage.len()
    }

    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.storage
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Sum of all elements, accumulated in f64.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.storage.iter().map(|value| f64::from(*value)).sum()
    }
}

pub fn validate_shape(shape: &[usize]) -> Result<(), TensorError> {
    match shape.iter().position(|size| *size == 0) {
        Some(dim) => Err(TensorError::ZeroDimension {
            shape: shape.to_vec(),
            dim,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{DenseTensor, Place, TensorError, TensorMeta};

    #[test]
    fn scalar_meta_has_one_element() {
        let meta = TensorMeta::scalar(Place::Cpu);
        assert!(meta.shape().is_empty());
        assert_eq!(meta.numel(), 1);
    }

    #[test]
    fn shape_numel_is_product_of_dims() {
        let meta = TensorMeta::from_shape(vec![2, 3, 4], Place::Cpu).expect("shape should validate");
        assert_eq!(meta.numel(), 24);
    }

    #[test]
    fn zero_sized_dimension_is_rejected() {
        let err = TensorMeta::from_shape(vec![2, 0], Place::Cpu).expect_err("zero dim must fail");
        assert!(matches!(err, TensorError::ZeroDimension { dim: 1, .. }));
    }

    #[test]
    fn fresh_tensor_is_uninitialized_and_empty() {
        let tensor = DenseTensor::uninitialized(Place::Cpu);
        assert!(!tensor.is_initialized());
        assert_eq!(tensor.numel(), 0);
        assert!(matches!(
            tensor.element(0),
            Err(TensorError::IndexOutOfBounds { index: 0, numel: 0 })
        ));
    }

    #[test]
    fn set_from_array_validates_length() {
        let mut tensor = DenseTensor::uninitialized(Place::Cpu);
        let err = tensor
            .set_from_array(&[1.0, 2.0, 3.0], &[2, 2], Place::Cpu)
            .expect_err("length mismatch must fail");
        assert!(matches!(
            err,
            TensorError::DataLengthMismatch {
                expected: 4,
                actual: 3,
                ..
            }
        ));
        assert!(!tensor.is_initialized());
    }

    #[test]
    fn set_from_array_moves_tensor_to_place() {
        let mut tensor = DenseTensor::uninitialized(Place::Cpu);
        tensor
            .set_from_array(&[1.0, 2.0], &[2], Place::Accelerator(0))
            .expect("bind should succeed");
        assert_eq!(tensor.place(), Place::Accelerator(0));
        assert_eq!(tensor.shape(), &[2]);
        assert_eq!(tensor.values(), &[1.0, 2.0]);
    }

    #[test]
    fn set_element_rejects_out_of_bounds_index() {
        let mut tensor =
            DenseTensor::from_values(vec![1.0, 2.0], vec![2], Place::Cpu).expect("tensor");
        tensor.set_element(1, 7.0).expect("in-bounds set");
        assert_eq!(tensor.values(), &[1.0, 7.0]);
        assert!(matches!(
            tensor.set_element(2, 0.0),
            Err(TensorError::IndexOutOfBounds { index: 2, numel: 2 })
        ));
    }

    #[test]
    fn set_shape_zero_fills_new_elements() {
        let mut tensor = DenseTensor::from_values(vec![3.0], vec![1], Place::Cpu).expect("tensor");
        tensor.set_shape(&[3]).expect("resize should succeed");
        assert_eq!(tensor.values(), &[3.0, 0.0, 0.0]);
    }

    #[test]
    fn filled_tensor_sums_in_f64() {
        let tensor = DenseTensor::filled(0.5, vec![2, 2], Place::Cpu).expect("tensor");
        assert_eq!(tensor.sum(), 2.0);
    }

    proptest! {
        #[test]
        fn prop_numel_matches_shape_product(shape in prop::collection::vec(1usize..=6, 1..=4)) {
            let meta = TensorMeta::from_shape(shape.clone(), Place::Cpu).expect("positive dims validate");
            let expected: usize = shape.iter().copied().product();
            prop_assert_eq!(meta.numel(), expected);
            let tensor = DenseTensor::filled(1.0, shape, Place::Cpu).expect("tensor");
            prop_assert_eq!(tensor.numel(), expected);
        }

        #[test]
        fn prop_set_then_get_element_is_exact(
            values in prop::collection::vec(-1_000.0f32..1_000.0f32, 1..=16),
            replacement in -1_000.0f32..1_000.0f32,
            pick in 0usize..16,
        ) {
            let len = values.len();
            let mut tensor = DenseTensor::from_values(values, vec![len], Place::Cpu).expect("tensor");
            let index = pick % len;
            tensor.set_element(index, replacement).expect("in-bounds set");
            prop_assert_eq!(tensor.element(index).expect("in-bounds get"), replacement);
        }
    }
}
