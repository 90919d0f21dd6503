use std::collections::{BTreeMap, BTreeSet};

use oc_autograd::{BackwardPlan, backward};
use oc_core::{DenseTensor, Place};
use oc_device::DeviceContext;
use oc_registry::{AttrValue, Operator, OperatorRegistry, OperatorSpec, SlotBinding};
use oc_runtime::{EvidenceKind, RuntimeContext, Scope};
use serde::{Deserialize, Serialize};

use crate::HarnessError;

/// Host-side array bound into a scope variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorData {
    #[must_use]
    pub fn new(values: Vec<f32>, shape: Vec<usize>) -> Self {
        Self { shape, values }
    }

    /// One-dimensional data shaped `[values.len()]`.
    #[must_use]
    pub fn vector(values: Vec<f32>) -> Self {
        let shape = vec![values.len()];
        Self { shape, values }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    #[serde(flatten)]
    pub data: TensorData,
}

/// Data supplied for one slot: a single tensor bound under the slot's own
/// name, or an ordered list of named tensors for a repeated slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotData {
    Single(TensorData),
    Repeated(Vec<NamedTensor>),
}

impl SlotData {
    #[must_use]
    pub fn binding(&self, slot: &str) -> SlotBinding {
        match self {
            Self::Single(_) => SlotBinding::single(slot),
            Self::Repeated(tensors) => {
                SlotBinding::repeated(tensors.iter().map(|tensor| tensor.name.as_str()))
            }
        }
    }

    /// Pairs each bound variable name with its data.
    pub fn bound<'a>(
        &'a self,
        binding: &'a SlotBinding,
    ) -> impl Iterator<Item = (&'a str, &'a TensorData)> + 'a {
        let data: Vec<&TensorData> = match self {
            Self::Single(data) => vec![data],
            Self::Repeated(tensors) => tensors.iter().map(|tensor| &tensor.data).collect(),
        };
        binding.names().iter().map(String::as_str).zip(data)
    }
}

pub type SlotDataMap = BTreeMap<String, SlotData>;

/// Declarative description of one operator under test.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpCase {
    pub op_type: String,
    pub inputs: SlotDataMap,
    pub outputs: SlotDataMap,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl OpCase {
    #[must_use]
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn input(mut self, slot: impl Into<String>, data: SlotData) -> Self {
        self.inputs.insert(slot.into(), data);
        self
    }

    #[must_use]
    pub fn output(mut self, slot: impl Into<String>, data: SlotData) -> Self {
        self.outputs.insert(slot.into(), data);
        self
    }

    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }
}

/// Builds, binds, and runs operators against an explicitly supplied scope
/// and device context. Every step is recorded in the driver's ledger.
#[derive(Debug, Clone)]
pub struct OperatorDriver<'r> {
    registry: &'r OperatorRegistry,
    runtime: RuntimeContext,
}

impl<'r> OperatorDriver<'r> {
    #[must_use]
    pub fn new(registry: &'r OperatorRegistry, label: impl Into<String>) -> Self {
        Self {
            registry,
            runtime: RuntimeContext::new(label),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &'r OperatorRegistry {
        self.registry
    }

    #[must_use]
    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut RuntimeContext {
        &mut self.runtime
    }

    /// Instantiates `case.op_type` with one scope variable per bound name.
    /// Singular slots bind a variable named after the slot, repeated slots
    /// bind the caller's names in order.
    pub fn build(&mut self, scope: &mut Scope, case: &OpCase) -> Result<Operator, HarnessError> {
        let mut spec = OperatorSpec::new(case.op_type.as_str());
        for (slot, data) in &case.inputs {
            spec = spec.input(slot.as_str(), data.binding(slot));
        }
        for (slot, data) in &case.outputs {
            spec = spec.output(slot.as_str(), data.binding(slot));
        }
        for (name, value) in &case.attrs {
            spec = spec.attr(name.as_str(), value.clone());
        }
        let op = self.registry.instantiate(spec)?;

        for name in op.input_vars().into_iter().chain(op.output_vars()) {
            scope.new_var(name);
        }
        self.runtime.record(
            EvidenceKind::Policy,
            format!(
                "built '{}' inputs={:?} outputs={:?}",
                op.op_type(),
                op.input_vars(),
                op.output_vars()
            ),
        );
        Ok(op)
    }

    /// Copies input data into the scope at `place`. A variable already
    /// holding data keeps its shape: rebinding it to a different shape fails.
    pub fn bind_tensor_data(
        &mut self,
        scope: &mut Scope,
        op: &Operator,
        data: &SlotDataMap,
        place: Place,
    ) -> Result<(), HarnessError> {
        for (slot, slot_data) in data {
            let Some(binding) = op.input(slot) else {
                continue;
            };
            for (name, tensor_data) in slot_data.bound(binding) {
                let tensor = scope.new_var(name).tensor_mut();
                if tensor.is_initialized() && tensor.shape() != tensor_data.shape.as_slice() {
                    return Err(HarnessError::ShapeMismatch {
                        op_type: op.op_type().to_string(),
                        var: name.to_string(),
                        expected: tensor.shape().to_vec(),
                        actual: tensor_data.shape.clone(),
                    });
                }
                tensor.set_shape(&tensor_data.shape)?;
                tensor.set_from_array(&tensor_data.values, &tensor_data.shape, place)?;
            }
        }
        Ok(())
    }

    /// Fills every output gradient the backward plan reads with ones, shaped
    /// like the forward output it belongs to.
    pub fn seed_output_gradients(
        &mut self,
        scope: &mut Scope,
        plan: &BackwardPlan,
        place: Place,
    ) -> Result<Vec<String>, HarnessError> {
        let mut seeded = Vec::with_capacity(plan.output_grads.len());
        for pair in &plan.output_grads {
            let shape = scope.tensor(&pair.forward)?.shape().to_vec();
            *scope.new_var(&pair.grad).tensor_mut() = DenseTensor::filled(1.0, shape, place)?;
            seeded.push(pair.grad.clone());
        }
        Ok(seeded)
    }

    /// Derives the backward operator of `op` and allocates every variable it
    /// reads or writes.
    pub fn derive_backward(
        &mut self,
        scope: &mut Scope,
        op: &Operator,
        no_grad_set: &BTreeSet<String>,
    ) -> Result<BackwardPlan, HarnessError> {
        let plan = backward(self.registry, op, no_grad_set)?;
        for name in plan.op.input_vars().into_iter().chain(plan.op.output_vars()) {
            scope.new_var(name);
        }
        self.runtime.record(
            EvidenceKind::Policy,
            format!(
                "derived '{}' from '{}' no_grad={:?}",
                plan.op.op_type(),
                op.op_type(),
                no_grad_set
            ),
        );
        Ok(plan)
    }

    pub fn run_forward(
        &mut self,
        scope: &mut Scope,
        op: &Operator,
        device: &DeviceContext,
    ) -> Result<(), HarnessError> {
        op.run(scope, device)?;
        self.runtime.record(
            EvidenceKind::Forward,
            format!("ran '{}' on {}", op.op_type(), device.place()),
        );
        Ok(())
    }

    pub fn run_backward(
        &mut self,
        scope: &mut Scope,
        plan: &BackwardPlan,
        device: &DeviceContext,
    ) -> Result<(), HarnessError> {
        plan.op.infer_shape(scope)?;
        plan.op.run(scope, device)?;
        self.runtime.record(
            EvidenceKind::Backward,
            format!(
                "ran '{}' on {} grads={:?}",
                plan.op.op_type(),
                device.place(),
                plan.input_grads
                    .iter()
                    .map(|pair| pair.grad.as_str())
                    .collect::<Vec<_>>()
            ),
        );
        Ok(())
    }
}
