#![forbid(unsafe_code)]

use std::fmt;

use oc_core::{DenseTensor, Place};

/// Number of simulated accelerator devices exposed when the `accelerator`
/// feature is enabled.
pub const ACCELERATOR_DEVICE_COUNT: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    Mismatch { expected: Place, actual: Place },
    AcceleratorUnavailable { place: Place },
    UnknownDevice { index: usize, available: usize },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { expected, actual } => {
                write!(f, "place mismatch: expected {expected}, got {actual}")
            }
            Self::AcceleratorUnavailable { place } => {
                write!(f, "{place} requested but accelerator support is not compiled in")
            }
            Self::UnknownDevice { index, available } => {
                write!(
                    f,
                    "accelerator index {index} out of range (available={available})"
                )
            }
        }
    }
}

impl std::error::Error for DeviceError {}

#[must_use]
pub const fn is_compiled_with_accelerator() -> bool {
    cfg!(feature = "accelerator")
}

/// Handle for executing kernels at one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceContext {
    place: Place,
}

impl DeviceContext {
    pub fn create(place: Place) -> Result<Self, DeviceError> {
        if let Place::Accelerator(index) = place {
            if !is_compiled_with_accelerator() {
                return Err(DeviceError::AcceleratorUnavailable { place });
            }
            if index >= ACCELERATOR_DEVICE_COUNT {
                return Err(DeviceError::UnknownDevice {
                    index,
                    available: ACCELERATOR_DEVICE_COUNT,
                });
            }
        }
        Ok(Self { place })
    }

    #[must_use]
    pub fn cpu() -> Self {
        Self { place: Place::Cpu }
    }

    #[must_use]
    pub fn place(&self) -> Place {
        self.place
    }

    #[must_use]
    pub fn guard(&self) -> DeviceGuard {
        DeviceGuard::new(self.place)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGuard {
    place: Place,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(place: Place) -> Self {
        Self { place }
    }

    #[must_use]
    pub fn place(&self) -> Place {
        self.place
    }

    pub fn ensure_tensor_place(&self, tensor: &DenseTensor) -> Result<(), DeviceError> {
        let actual = tensor.place();
        if actual != self.place {
            return Err(DeviceError::Mismatch {
                expected: self.place,
                actual,
            });
        }
        Ok(())
    }
}
