#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use oc_registry::{
    EMPTY_VAR_NAME, GRAD_SUFFIX, Operator, OperatorRegistry, OperatorSpec, RegistryError,
    SlotBinding,
};

#[must_use]
pub fn grad_var_name(name: &str) -> String {
    format!("{name}{GRAD_SUFFIX}")
}

/// Strips the gradient suffix. Names without it are returned unchanged.
#[must_use]
pub fn remove_grad_var_name(name: &str) -> &str {
    name.strip_suffix(GRAD_SUFFIX).unwrap_or(name)
}

#[must_use]
pub fn is_grad_var_name(name: &str) -> bool {
    name.ends_with(GRAD_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutogradError {
    NoBackwardDefined { op_type: String },
    Registry(RegistryError),
}

impl fmt::Display for AutogradError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBackwardDefined { op_type } => {
                write!(f, "operator '{op_type}' has no gradient rule")
            }
            Self::Registry(error) => write!(f, "gradient op construction failed: {error}"),
        }
    }
}

impl std::error::Error for AutogradError {}

impl From<RegistryError> for AutogradError {
    fn from(value: RegistryError) -> Self {
        Self::Registry(value)
    }
}

/// Forward variable paired with the gradient variable the backward op writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradPair {
    pub forward: String,
    pub grad: String,
}

/// Derived gradient operator plus the variable names it touches.
#[derive(Debug, Clone)]
pub struct BackwardPlan {
    pub op: Operator,
    /// Gradients of forward outputs, read by `op`. Callers seed these.
    pub output_grads: Vec<GradPair>,
    /// Gradients of forward inputs, written by `op`.
    pub input_grads: Vec<GradPair>,
}

impl BackwardPlan {
    #[must_use]
    pub fn input_grad(&self, forward: &str) -> Option<&str> {
        self.input_grads
            .iter()
            .find(|pair| pair.forward == forward)
            .map(|pair| pair.grad.as_str())
    }
}

/// Derives the gradient operator of `forward`.
///
/// The gradient op sees every forward input and output under its original
/// slot, plus `S@GRAD` for every forward output slot `S`. It writes `S@GRAD`
/// for every forward input slot, leaving out variables named in
/// `no_grad_set`. Excluded entries of repeated slots keep their position as
/// empty placeholders. Attributes the gradient op declares are copied over.
pub fn backward(
    registry: &OperatorRegistry,
    forward: &Operator,
    no_grad_set: &BTreeSet<String>,
) -> Result<BackwardPlan, AutogradError> {
    let schema = registry.schema(forward.op_type())?;
    let grad_op_type = schema
        .grad_op_type()
        .ok_or_else(|| AutogradError::NoBackwardDefined {
            op_type: forward.op_type().to_string(),
        })?;
    let grad_schema = registry.schema(grad_op_type)?;

    let mut spec = OperatorSpec::new(grad_op_type);
    for (slot, binding) in forward.inputs() {
        spec = spec.input(slot.clone(), binding.clone());
    }

    let mut output_grads = Vec::new();
    for (slot, binding) in forward.outputs() {
        spec = spec
            .input(slot.clone(), binding.clone())
            .input(grad_var_name(slot), binding.map_names(grad_var_name));
        output_grads.extend(binding.bound_names().map(|name| GradPair {
            forward: name.to_string(),
            grad: grad_var_name(name),
        }));
    }

    let mut input_grads = Vec::new();
    for (slot, binding) in forward.inputs() {
        let Some(grads) = exclude_no_grad(binding, no_grad_set) else {
            continue;
        };
        input_grads.extend(
            binding
                .names()
                .iter()
                .zip(grads.names())
                .filter(|(_, grad)| *grad != EMPTY_VAR_NAME)
                .map(|(name, grad)| GradPair {
                    forward: name.clone(),
                    grad: grad.clone(),
                }),
        );
        spec = spec.output(grad_var_name(slot), grads);
    }

    for (name, value) in forward.attrs() {
        if grad_schema.attrs().iter().any(|decl| &decl.name == name) {
            spec = spec.attr(name.clone(), value.clone());
        }
    }

    let op = registry.instantiate(spec)?;
    Ok(BackwardPlan {
        op,
        output_grads,
        input_grads,
    })
}

/// Gradient binding for one forward input slot, or `None` when every
/// variable of the slot is excluded.
fn exclude_no_grad(binding: &SlotBinding, no_grad_set: &BTreeSet<String>) -> Option<SlotBinding> {
    let grads = binding.map_names(|name| {
        if no_grad_set.contains(name) {
            EMPTY_VAR_NAME.to_string()
        } else {
            grad_var_name(name)
        }
    });
    let any_bound = grads.bound_names().next().is_some();
    any_bound.then_some(grads)
}
