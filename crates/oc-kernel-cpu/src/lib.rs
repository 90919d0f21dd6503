#![forbid(unsafe_code)]

use std::fmt;

use oc_core::{DenseTensor, Place};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    ShapeMismatch {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    PlaceMismatch {
        lhs: Place,
        rhs: Place,
    },
    EmptyInputList,
    InvalidAttribute {
        name: &'static str,
        reason: String,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::PlaceMismatch { lhs, rhs } => {
                write!(f, "place mismatch: lhs={lhs}, rhs={rhs}")
            }
            Self::EmptyInputList => write!(f, "kernel requires at least one input tensor"),
            Self::InvalidAttribute { name, reason } => {
                write!(f, "invalid attribute '{name}': {reason}")
            }
        }
    }
}

impl std::error::Error for KernelError {}

fn ensure_elementwise_compatible(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<(), KernelError> {
    if lhs.place() != rhs.place() {
        return Err(KernelError::PlaceMismatch {
            lhs: lhs.place(),
            rhs: rhs.place(),
        });
    }
    if lhs.shape() != rhs.shape() || lhs.numel() != rhs.numel() {
        return Err(KernelError::ShapeMismatch {
            lhs: lhs.shape().to_vec(),
            rhs: rhs.shape().to_vec(),
        });
    }
    Ok(())
}

fn zip_map(
    lhs: &DenseTensor,
    rhs: &DenseTensor,
    f: impl Fn(f32, f32) -> f32,
) -> Result<Vec<f32>, KernelError> {
    ensure_elementwise_compatible(lhs, rhs)?;
    Ok(lhs
        .values()
        .iter()
        .zip(rhs.values().iter())
        .map(|(a, b)| f(*a, *b))
        .collect())
}

#[must_use]
pub fn scale(x: &DenseTensor, factor: f32) -> Vec<f32> {
    x.values().iter().map(|value| value * factor).collect()
}

#[must_use]
pub fn square(x: &DenseTensor) -> Vec<f32> {
    x.values().iter().map(|value| value * value).collect()
}

/// `dX = 2 * x * dOut`
pub fn square_grad(x: &DenseTensor, out_grad: &DenseTensor) -> Result<Vec<f32>, KernelError> {
    zip_map(x, out_grad, |x, dout| 2.0 * x * dout)
}

pub fn mul(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<Vec<f32>, KernelError> {
    zip_map(lhs, rhs, |a, b| a * b)
}

pub fn sum(inputs: &[&DenseTensor]) -> Result<Vec<f32>, KernelError> {
    let (first, rest) = inputs.split_first().ok_or(KernelError::EmptyInputList)?;
    let mut acc = first.values().to_vec();
    for tensor in rest {
        ensure_elementwise_compatible(first, tensor)?;
        for (slot, value) in acc.iter_mut().zip(tensor.values().iter()) {
            *slot += value;
        }
    }
    Ok(acc)
}

#[must_use]
pub fn sigmoid(x: &DenseTensor) -> Vec<f32> {
    x.values()
        .iter()
        .map(|value| 1.0 / (1.0 + (-value).exp()))
        .collect()
}

/// `dX = dOut * out * (1 - out)`
pub fn sigmoid_grad(out: &DenseTensor, out_grad: &DenseTensor) -> Result<Vec<f32>, KernelError> {
    zip_map(out, out_grad, |y, dout| dout * y * (1.0 - y))
}

#[must_use]
pub fn increment(x: &DenseTensor, step: f32) -> Vec<f32> {
    x.values().iter().map(|value| value + step).collect()
}

#[must_use]
pub fn zeros_like(x: &DenseTensor) -> Vec<f32> {
    vec![0.0; x.numel()]
}

/// Draws `numel` samples from N(mean, std) with a seeded generator.
pub fn gaussian_random(numel: usize, mean: f32, std: f32, seed: u64) -> Result<Vec<f32>, KernelError> {
    if !std.is_finite() {
        return Err(KernelError::InvalidAttribute {
            name: "std",
            reason: format!("must be finite, got {std}"),
        });
    }
    let normal = Normal::new(mean, std).map_err(|error| KernelError::InvalidAttribute {
        name: "std",
        reason: format!("invalid normal distribution: {error}"),
    })?;
    let rng = StdRng::seed_from_u64(seed);
    Ok(normal.sample_iter(rng).take(numel).collect())
}
