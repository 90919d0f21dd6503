use std::fmt;

use oc_autograd::AutogradError;
use oc_core::TensorError;
use oc_device::DeviceError;
use oc_registry::{OpError, RegistryError, SlotKind};
use oc_runtime::ScopeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToleranceKind {
    Output,
    Gradient,
}

impl fmt::Display for ToleranceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Output => write!(f, "output"),
            Self::Gradient => write!(f, "gradient"),
        }
    }
}

/// Details of a failed element-wise comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct ToleranceViolation {
    pub kind: ToleranceKind,
    pub op_type: String,
    pub var: String,
    pub index: usize,
    pub actual: f64,
    pub expected: f64,
    pub deviation: f64,
    pub limit: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HarnessError {
    UnknownOperatorType {
        op_type: String,
    },
    MissingRequiredSlot {
        op_type: String,
        kind: SlotKind,
        slot: String,
    },
    ShapeMismatch {
        op_type: String,
        var: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    NoBackwardDefined {
        op_type: String,
    },
    ToleranceExceeded(Box<ToleranceViolation>),
    Registry(RegistryError),
    Scope(ScopeError),
    Tensor(TensorError),
    Device(DeviceError),
    Operator(OpError),
}

impl HarnessError {
    /// Stable snake_case label used by fixtures and case logs.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::UnknownOperatorType { .. } => "unknown_operator_type",
            Self::MissingRequiredSlot { .. } => "missing_required_slot",
            Self::ShapeMismatch { .. } => "shape_mismatch",
            Self::NoBackwardDefined { .. } => "no_backward_defined",
            Self::ToleranceExceeded(_) => "tolerance_exceeded",
            Self::Registry(_) => "registry",
            Self::Scope(_) => "scope",
            Self::Tensor(_) => "tensor",
            Self::Device(_) => "device",
            Self::Operator(_) => "operator",
        }
    }

    #[must_use]
    pub fn violation(&self) -> Option<&ToleranceViolation> {
        match self {
            Self::ToleranceExceeded(violation) => Some(&**violation),
            _ => None,
        }
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOperatorType { op_type } => {
                write!(f, "unknown operator type '{op_type}'")
            }
            Self::MissingRequiredSlot {
                op_type,
                kind,
                slot,
            } => write!(
                f,
                "operator '{op_type}' is missing required {kind} slot '{slot}'"
            ),
            Self::ShapeMismatch {
                op_type,
                var,
                expected,
                actual,
            } => write!(
                f,
                "operator '{op_type}' variable '{var}' shape mismatch: expected={expected:?} actual={actual:?}"
            ),
            Self::NoBackwardDefined { op_type } => {
                write!(f, "operator '{op_type}' has no registered backward rule")
            }
            Self::ToleranceExceeded(violation) => write!(
                f,
                "{} check failed for operator '{}' variable '{}' at index {}: actual={} expected={} deviation={:e} limit={:e}",
                violation.kind,
                violation.op_type,
                violation.var,
                violation.index,
                violation.actual,
                violation.expected,
                violation.deviation,
                violation.limit
            ),
            Self::Registry(error) => write!(f, "registry failure: {error}"),
            Self::Scope(error) => write!(f, "scope failure: {error}"),
            Self::Tensor(error) => write!(f, "tensor failure: {error}"),
            Self::Device(error) => write!(f, "device failure: {error}"),
            Self::Operator(error) => write!(f, "operator failure: {error}"),
        }
    }
}

impl std::error::Error for HarnessError {}

impl From<RegistryError> for HarnessError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::UnknownOperatorType { op_type } => Self::UnknownOperatorType { op_type },
            RegistryError::MissingRequiredSlot {
                op_type,
                kind,
                slot,
            } => Self::MissingRequiredSlot {
                op_type,
                kind,
                slot,
            },
            other => Self::Registry(other),
        }
    }
}

impl From<AutogradError> for HarnessError {
    fn from(value: AutogradError) -> Self {
        match value {
            AutogradError::NoBackwardDefined { op_type } => Self::NoBackwardDefined { op_type },
            AutogradError::Registry(error) => error.into(),
        }
    }
}

impl From<ScopeError> for HarnessError {
    fn from(value: ScopeError) -> Self {
        Self::Scope(value)
    }
}

impl From<TensorError> for HarnessError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

impl From<DeviceError> for HarnessError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<OpError> for HarnessError {
    fn from(value: OpError) -> Self {
        match value {
            OpError::Scope(error) => Self::Scope(error),
            OpError::Tensor(error) => Self::Tensor(error),
            OpError::Device(error) => Self::Device(error),
            other => Self::Operator(other),
        }
    }
}
