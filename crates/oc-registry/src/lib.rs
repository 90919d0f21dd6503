#![forbid(unsafe_code)]

mod builtin;

use std::collections::BTreeMap;
use std::fmt;

use oc_core::{DenseTensor, Place, TensorError};
use oc_device::{DeviceContext, DeviceError, DeviceGuard};
use oc_kernel_cpu::KernelError;
use oc_runtime::{Scope, ScopeError};
use serde::{Deserialize, Serialize};

/// Suffix appended to a variable name to name its gradient.
pub const GRAD_SUFFIX: &str = "@GRAD";

/// Placeholder bound in a repeated slot position that has no variable.
pub const EMPTY_VAR_NAME: &str = "@EMPTY@";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotArity {
    Single,
    Repeated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Input,
    Output,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDecl {
    pub name: String,
    pub arity: SlotArity,
    pub dispensable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Str(String),
}

impl AttrValue {
    #[must_use]
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Int(value) => Some(*value as f32),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Self::Ints(values) => Some(values),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttrDecl {
    pub name: String,
    pub default: Option<AttrValue>,
}

/// Concrete variable names bound to one declared slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotBinding {
    Single(String),
    Repeated(Vec<String>),
}

impl SlotBinding {
    #[must_use]
    pub fn single(name: impl Into<String>) -> Self {
        Self::Single(name.into())
    }

    #[must_use]
    pub fn repeated<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Repeated(names.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        match self {
            Self::Single(name) => std::slice::from_ref(name),
            Self::Repeated(names) => names,
        }
    }

    /// Bound names with empty placeholders filtered out.
    pub fn bound_names(&self) -> impl Iterator<Item = &str> {
        self.names()
            .iter()
            .map(String::as_str)
            .filter(|name| *name != EMPTY_VAR_NAME)
    }

    #[must_use]
    pub fn single_name(&self) -> Option<&str> {
        match self {
            Self::Single(name) => Some(name),
            Self::Repeated(_) => None,
        }
    }

    #[must_use]
    pub fn arity(&self) -> SlotArity {
        match self {
            Self::Single(_) => SlotArity::Single,
            Self::Repeated(_) => SlotArity::Repeated,
        }
    }

    /// Applies `f` to every bound name, keeping placeholders in place.
    #[must_use]
    pub fn map_names(&self, f: impl Fn(&str) -> String) -> Self {
        let map = |name: &String| {
            if name == EMPTY_VAR_NAME {
                name.clone()
            } else {
                f(name)
            }
        };
        match self {
            Self::Single(name) => Self::Single(map(name)),
            Self::Repeated(names) => Self::Repeated(names.iter().map(map).collect()),
        }
    }
}

pub type KernelFn = fn(&mut KernelContext<'_>) -> Result<(), OpError>;

#[derive(Debug, Clone, Copy)]
pub struct OpKernel {
    pub infer_shape: KernelFn,
    pub compute: KernelFn,
}

/// Declared schema of one operator type.
#[derive(Debug, Clone)]
pub struct OpSchema {
    op_type: String,
    inputs: Vec<SlotDecl>,
    outputs: Vec<SlotDecl>,
    attrs: Vec<AttrDecl>,
    supports_accelerator: bool,
    grad_op_type: Option<String>,
    kernel: OpKernel,
}

impl OpSchema {
    #[must_use]
    pub fn new(op_type: impl Into<String>, kernel: OpKernel) -> Self {
        Self {
            op_type: op_type.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: Vec::new(),
            supports_accelerator: false,
            grad_op_type: None,
            kernel,
        }
    }

    #[must_use]
    pub fn input(self, name: &str) -> Self {
        self.slot(SlotKind::Input, name, SlotArity::Single, false)
    }

    #[must_use]
    pub fn repeated_input(self, name: &str) -> Self {
        self.slot(SlotKind::Input, name, SlotArity::Repeated, false)
    }

    #[must_use]
    pub fn output(self, name: &str) -> Self {
        self.slot(SlotKind::Output, name, SlotArity::Single, false)
    }

    #[must_use]
    pub fn slot(mut self, kind: SlotKind, name: &str, arity: SlotArity, dispensable: bool) -> Self {
        let decl = SlotDecl {
            name: name.to_string(),
            arity,
            dispensable,
        };
        match kind {
            SlotKind::Input => self.inputs.push(decl),
            SlotKind::Output => self.outputs.push(decl),
        }
        self
    }

    #[must_use]
    pub fn attr(mut self, name: &str, default: Option<AttrValue>) -> Self {
        self.attrs.push(AttrDecl {
            name: name.to_string(),
            default,
        });
        self
    }

    #[must_use]
    pub fn accelerator(mut self, supported: bool) -> Self {
        self.supports_accelerator = supported;
        self
    }

    #[must_use]
    pub fn grad(mut self, grad_op_type: &str) -> Self {
        self.grad_op_type = Some(grad_op_type.to_string());
        self
    }

    #[must_use]
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    #[must_use]
    pub fn inputs(&self) -> &[SlotDecl] {
        &self.inputs
    }

    #[must_use]
    pub fn outputs(&self) -> &[SlotDecl] {
        &self.outputs
    }

    #[must_use]
    pub fn attrs(&self) -> &[AttrDecl] {
        &self.attrs
    }

    #[must_use]
    pub fn supports_accelerator(&self) -> bool {
        self.supports_accelerator
    }

    #[must_use]
    pub fn grad_op_type(&self) -> Option<&str> {
        self.grad_op_type.as_deref()
    }

    fn declares_attr(&self, name: &str) -> bool {
        self.attrs.iter().any(|decl| decl.name == name)
    }
}

/// Typed description of an operator to instantiate: op type plus slot
/// bindings and attribute values, validated against the registered schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperatorSpec {
    op_type: String,
    inputs: BTreeMap<String, SlotBinding>,
    outputs: BTreeMap<String, SlotBinding>,
    attrs: BTreeMap<String, AttrValue>,
}

impl OperatorSpec {
    #[must_use]
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn input(mut self, slot: impl Into<String>, binding: SlotBinding) -> Self {
        self.inputs.insert(slot.into(), binding);
        self
    }

    #[must_use]
    pub fn output(mut self, slot: impl Into<String>, binding: SlotBinding) -> Self {
        self.outputs.insert(slot.into(), binding);
        self
    }

    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn op_type(&self) -> &str {
        &self.op_type
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    UnknownOperatorType {
        op_type: String,
    },
    DuplicateOperator {
        op_type: String,
    },
    MissingRequiredSlot {
        op_type: String,
        kind: SlotKind,
        slot: String,
    },
    UnknownSlot {
        op_type: String,
        kind: SlotKind,
        slot: String,
    },
    ArityMismatch {
        op_type: String,
        slot: String,
        expected: SlotArity,
    },
    EmptyRepeatedSlot {
        op_type: String,
        slot: String,
    },
    MissingAttribute {
        op_type: String,
        name: String,
    },
    UnknownAttribute {
        op_type: String,
        name: String,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOperatorType { op_type } => {
                write!(f, "unknown operator type '{op_type}'")
            }
            Self::DuplicateOperator { op_type } => {
                write!(f, "operator type '{op_type}' is already registered")
            }
            Self::MissingRequiredSlot {
                op_type,
                kind,
                slot,
            } => write!(f, "operator '{op_type}' is missing required {kind} slot '{slot}'"),
            Self::UnknownSlot {
                op_type,
                kind,
                slot,
            } => write!(f, "operator '{op_type}' declares no {kind} slot '{slot}'"),
            Self::ArityMismatch {
                op_type,
                slot,
                expected,
            } => write!(
                f,
                "operator '{op_type}' slot '{slot}' expects a {expected:?} binding"
            ),
            Self::EmptyRepeatedSlot { op_type, slot } => {
                write!(f, "operator '{op_type}' repeated slot '{slot}' has no names")
            }
            Self::MissingAttribute { op_type, name } => {
                write!(f, "operator '{op_type}' is missing attribute '{name}'")
            }
            Self::UnknownAttribute { op_type, name } => {
                write!(f, "operator '{op_type}' declares no attribute '{name}'")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Clone, PartialEq)]
pub enum OpError {
    Scope(ScopeError),
    Device(DeviceError),
    Tensor(TensorError),
    Kernel(KernelError),
    SlotNotBound {
        op_type: String,
        slot: String,
    },
    ExpectedSingleBinding {
        op_type: String,
        slot: String,
    },
    UninitializedInput {
        op_type: String,
        var: String,
    },
    MissingAttribute {
        op_type: String,
        name: String,
    },
    AttributeType {
        op_type: String,
        name: String,
        expected: &'static str,
    },
    UnsupportedPlace {
        op_type: String,
        place: Place,
    },
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scope(error) => write!(f, "scope failure: {error}"),
            Self::Device(error) => write!(f, "device failure: {error}"),
            Self::Tensor(error) => write!(f, "tensor failure: {error}"),
            Self::Kernel(error) => write!(f, "kernel failure: {error}"),
            Self::SlotNotBound { op_type, slot } => {
                write!(f, "operator '{op_type}' has no binding for slot '{slot}'")
            }
            Self::ExpectedSingleBinding { op_type, slot } => {
                write!(f, "operator '{op_type}' slot '{slot}' is not a single binding")
            }
            Self::UninitializedInput { op_type, var } => {
                write!(f, "operator '{op_type}' reads uninitialized variable '{var}'")
            }
            Self::MissingAttribute { op_type, name } => {
                write!(f, "operator '{op_type}' has no attribute '{name}'")
            }
            Self::AttributeType {
                op_type,
                name,
                expected,
            } => write!(
                f,
                "operator '{op_type}' attribute '{name}' is not a {expected}"
            ),
            Self::UnsupportedPlace { op_type, place } => {
                write!(f, "operator '{op_type}' has no kernel for {place}")
            }
        }
    }
}

impl std::error::Error for OpError {}

impl From<ScopeError> for OpError {
    fn from(value: ScopeError) -> Self {
        Self::Scope(value)
    }
}

impl From<DeviceError> for OpError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<TensorError> for OpError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

impl From<KernelError> for OpError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

/// A runnable operator bound to concrete scope variable names.
#[derive(Debug, Clone)]
pub struct Operator {
    op_type: String,
    inputs: BTreeMap<String, SlotBinding>,
    outputs: BTreeMap<String, SlotBinding>,
    attrs: BTreeMap<String, AttrValue>,
    supports_accelerator: bool,
    kernel: OpKernel,
}

impl Operator {
    #[must_use]
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    #[must_use]
    pub fn input(&self, slot: &str) -> Option<&SlotBinding> {
        self.inputs.get(slot)
    }

    #[must_use]
    pub fn output(&self, slot: &str) -> Option<&SlotBinding> {
        self.outputs.get(slot)
    }

    #[must_use]
    pub fn inputs(&self) -> &BTreeMap<String, SlotBinding> {
        &self.inputs
    }

    #[must_use]
    pub fn outputs(&self) -> &BTreeMap<String, SlotBinding> {
        &self.outputs
    }

    #[must_use]
    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }

    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// Every variable name bound to any input slot, placeholders excluded.
    #[must_use]
    pub fn input_vars(&self) -> Vec<&str> {
        self.inputs.values().flat_map(SlotBinding::bound_names).collect()
    }

    /// Every variable name bound to any output slot, placeholders excluded.
    #[must_use]
    pub fn output_vars(&self) -> Vec<&str> {
        self.outputs.values().flat_map(SlotBinding::bound_names).collect()
    }

    #[must_use]
    pub fn supports_accelerator(&self) -> bool {
        self.supports_accelerator
    }

    pub fn infer_shape(&self, scope: &mut Scope) -> Result<(), OpError> {
        let mut ctx = KernelContext {
            op: self,
            scope,
            place: Place::Cpu,
            guard: None,
        };
        (self.kernel.infer_shape)(&mut ctx)
    }

    pub fn run(&self, scope: &mut Scope, device: &DeviceContext) -> Result<(), OpError> {
        let place = device.place();
        if place.is_accelerator() && !self.supports_accelerator {
            return Err(OpError::UnsupportedPlace {
                op_type: self.op_type.clone(),
                place,
            });
        }
        let mut ctx = KernelContext {
            op: self,
            scope,
            place,
            guard: Some(device.guard()),
        };
        (self.kernel.compute)(&mut ctx)
    }
}

/// View handed to kernels: the operator's bindings plus mutable access to the
/// scope. Reads are checked against the device guard while running.
pub struct KernelContext<'a> {
    op: &'a Operator,
    scope: &'a mut Scope,
    place: Place,
    guard: Option<DeviceGuard>,
}

impl<'a> KernelContext<'a> {
    #[must_use]
    pub fn operator(&self) -> &'a Operator {
        self.op
    }

    #[must_use]
    pub fn op_type(&self) -> &str {
        &self.op.op_type
    }

    #[must_use]
    pub fn place(&self) -> Place {
        self.place
    }

    #[must_use]
    pub fn has_output(&self, slot: &str) -> bool {
        self.op
            .output(slot)
            .is_some_and(|binding| binding.bound_names().next().is_some())
    }

    pub fn input(&self, slot: &str) -> Result<&DenseTensor, OpError> {
        let name = self.single_name(self.op.input(slot), slot)?;
        self.read(name)
    }

    pub fn inputs(&self, slot: &str) -> Result<Vec<&DenseTensor>, OpError> {
        let binding = self.op.input(slot).ok_or_else(|| self.not_bound(slot))?;
        binding.bound_names().map(|name| self.read(name)).collect()
    }

    pub fn output_names(&self, slot: &str) -> Result<&'a [String], OpError> {
        let op = self.op;
        op.output(slot)
            .map(SlotBinding::names)
            .ok_or_else(|| self.not_bound(slot))
    }

    pub fn write_output(&mut self, slot: &str, values: Vec<f32>, shape: &[usize]) -> Result<(), OpError> {
        let op = self.op;
        let name = self.single_name(op.output(slot), slot)?;
        self.write_var(name, values, shape)
    }

    /// Writes into the variable called `name`. Placeholders are skipped.
    pub fn write_var(&mut self, name: &str, values: Vec<f32>, shape: &[usize]) -> Result<(), OpError> {
        if name == EMPTY_VAR_NAME {
            return Ok(());
        }
        let place = self.place;
        self.scope
            .new_var(name)
            .tensor_mut()
            .assign(values, shape.to_vec(), place)?;
        Ok(())
    }

    /// Overwrites an input variable in place, keeping its shape and place.
    pub fn overwrite_input(&mut self, slot: &str, values: Vec<f32>) -> Result<(), OpError> {
        let op = self.op;
        let name = self.single_name(op.input(slot), slot)?;
        let tensor = self.scope.tensor_mut(name)?;
        let shape = tensor.shape().to_vec();
        let place = tensor.place();
        tensor.assign(values, shape, place)?;
        Ok(())
    }

    pub fn input_shape(&self, slot: &str) -> Result<Vec<usize>, OpError> {
        let name = self.single_name(self.op.input(slot), slot)?;
        Ok(self.scope.tensor(name)?.shape().to_vec())
    }

    pub fn var_shape(&self, name: &str) -> Result<Vec<usize>, OpError> {
        Ok(self.scope.tensor(name)?.shape().to_vec())
    }

    /// Shapes every variable bound to output `slot`.
    pub fn shape_output(&mut self, slot: &str, shape: &[usize]) -> Result<(), OpError> {
        let op = self.op;
        let binding = op.output(slot).ok_or_else(|| self.not_bound(slot))?;
        for name in binding.bound_names() {
            self.shape_var(name, shape)?;
        }
        Ok(())
    }

    pub fn shape_var(&mut self, name: &str, shape: &[usize]) -> Result<(), OpError> {
        let tensor = self.scope.new_var(name).tensor_mut();
        if tensor.shape() != shape || !tensor.is_initialized() {
            tensor.set_shape(shape)?;
        }
        Ok(())
    }

    pub fn attr_f32(&self, name: &str) -> Result<f32, OpError> {
        self.attr(name)?
            .as_f32()
            .ok_or_else(|| self.attr_type(name, "float"))
    }

    pub fn attr_i64(&self, name: &str) -> Result<i64, OpError> {
        self.attr(name)?
            .as_i64()
            .ok_or_else(|| self.attr_type(name, "int"))
    }

    pub fn attr_ints(&self, name: &str) -> Result<&'a [i64], OpError> {
        let op = self.op;
        op.attr(name)
            .ok_or_else(|| OpError::MissingAttribute {
                op_type: op.op_type.clone(),
                name: name.to_string(),
            })?
            .as_ints()
            .ok_or_else(|| self.attr_type(name, "int list"))
    }

    fn attr(&self, name: &str) -> Result<&'a AttrValue, OpError> {
        let op = self.op;
        op.attr(name).ok_or_else(|| OpError::MissingAttribute {
            op_type: op.op_type.clone(),
            name: name.to_string(),
        })
    }

    fn read(&self, name: &str) -> Result<&DenseTensor, OpError> {
        let tensor = self.scope.tensor(name)?;
        if !tensor.is_initialized() {
            return Err(OpError::UninitializedInput {
                op_type: self.op.op_type.clone(),
                var: name.to_string(),
            });
        }
        if let Some(guard) = self.guard {
            guard.ensure_tensor_place(tensor)?;
        }
        Ok(tensor)
    }

    fn single_name<'b>(&self, binding: Option<&'b SlotBinding>, slot: &str) -> Result<&'b str, OpError> {
        binding
            .ok_or_else(|| self.not_bound(slot))?
            .single_name()
            .ok_or_else(|| OpError::ExpectedSingleBinding {
                op_type: self.op.op_type.clone(),
                slot: slot.to_string(),
            })
    }

    fn not_bound(&self, slot: &str) -> OpError {
        OpError::SlotNotBound {
            op_type: self.op.op_type.clone(),
            slot: slot.to_string(),
        }
    }

    fn attr_type(&self, name: &str, expected: &'static str) -> OpError {
        OpError::AttributeType {
            op_type: self.op.op_type.clone(),
            name: name.to_string(),
            expected,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    schemas: BTreeMap<String, OpSchema>,
}

impl OperatorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the reference operator set.
    #[must_use]
    pub fn with_builtin_ops() -> Self {
        let mut registry = Self::new();
        for schema in builtin::schemas() {
            registry.schemas.insert(schema.op_type.clone(), schema);
        }
        registry
    }

    pub fn register(&mut self, schema: OpSchema) -> Result<(), RegistryError> {
        if self.schemas.contains_key(&schema.op_type) {
            return Err(RegistryError::DuplicateOperator {
                op_type: schema.op_type,
            });
        }
        self.schemas.insert(schema.op_type.clone(), schema);
        Ok(())
    }

    pub fn schema(&self, op_type: &str) -> Result<&OpSchema, RegistryError> {
        self.schemas
            .get(op_type)
            .ok_or_else(|| RegistryError::UnknownOperatorType {
                op_type: op_type.to_string(),
            })
    }

    #[must_use]
    pub fn contains(&self, op_type: &str) -> bool {
        self.schemas.contains_key(op_type)
    }

    pub fn op_types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn input_slots(&self, op_type: &str) -> Result<&[SlotDecl], RegistryError> {
        Ok(self.schema(op_type)?.inputs())
    }

    pub fn output_slots(&self, op_type: &str) -> Result<&[SlotDecl], RegistryError> {
        Ok(self.schema(op_type)?.outputs())
    }

    pub fn attr_names(&self, op_type: &str) -> Result<Vec<&str>, RegistryError> {
        Ok(self
            .schema(op_type)?
            .attrs()
            .iter()
            .map(|decl| decl.name.as_str())
            .collect())
    }

    pub fn supports_accelerator(&self, op_type: &str) -> Result<bool, RegistryError> {
        Ok(self.schema(op_type)?.supports_accelerator())
    }

    pub fn has_gradient(&self, op_type: &str) -> Result<bool, RegistryError> {
        Ok(self.schema(op_type)?.grad_op_type().is_some())
    }

    /// Validates `spec` against the registered schema and builds the
    /// operator. Attributes left out of `spec` take their declared default.
    pub fn instantiate(&self, spec: OperatorSpec) -> Result<Operator, RegistryError> {
        let schema = self.schema(&spec.op_type)?;
        validate_slots(schema, SlotKind::Input, schema.inputs(), &spec.inputs)?;
        validate_slots(schema, SlotKind::Output, schema.outputs(), &spec.outputs)?;

        if let Some(name) = spec.attrs.keys().find(|name| !schema.declares_attr(name)) {
            return Err(RegistryError::UnknownAttribute {
                op_type: schema.op_type.clone(),
                name: name.clone(),
            });
        }
        let mut attrs = spec.attrs;
        for decl in schema.attrs() {
            if attrs.contains_key(&decl.name) {
                continue;
            }
            let default = decl
                .default
                .clone()
                .ok_or_else(|| RegistryError::MissingAttribute {
                    op_type: schema.op_type.clone(),
                    name: decl.name.clone(),
                })?;
            attrs.insert(decl.name.clone(), default);
        }

        Ok(Operator {
            op_type: spec.op_type,
            inputs: spec.inputs,
            outputs: spec.outputs,
            attrs,
            supports_accelerator: schema.supports_accelerator,
            kernel: schema.kernel,
        })
    }
}

fn validate_slots(
    schema: &OpSchema,
    kind: SlotKind,
    decls: &[SlotDecl],
    bindings: &BTreeMap<String, SlotBinding>,
) -> Result<(), RegistryError> {
    if let Some(slot) = bindings
        .keys()
        .find(|slot| !decls.iter().any(|decl| &decl.name == *slot))
    {
        return Err(RegistryError::UnknownSlot {
            op_type: schema.op_type.clone(),
            kind,
            slot: slot.clone(),
        });
    }

    for decl in decls {
        let Some(binding) = bindings.get(&decl.name) else {
            if decl.dispensable {
                continue;
            }
            return Err(RegistryError::MissingRequiredSlot {
                op_type: schema.op_type.clone(),
                kind,
                slot: decl.name.clone(),
            });
        };
        if binding.arity() != decl.arity {
            return Err(RegistryError::ArityMismatch {
                op_type: schema.op_type.clone(),
                slot: decl.name.clone(),
                expected: decl.arity,
            });
        }
        if binding.names().is_empty() {
            return Err(RegistryError::EmptyRepeatedSlot {
                op_type: schema.op_type.clone(),
                slot: decl.name.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use oc_core::Place;
    use oc_device::DeviceContext;
    use oc_runtime::Scope;

    use super::{
        AttrValue, EMPTY_VAR_NAME, OpError, OperatorRegistry, OperatorSpec, RegistryError,
        SlotArity, SlotBinding, SlotKind,
    };

    fn bind(scope: &mut Scope, name: &str, values: &[f32]) {
        scope
            .new_var(name)
            .tensor_mut()
            .set_from_array(values, &[values.len()], Place::Cpu)
            .expect("bind should succeed");
    }

    fn scale_spec() -> OperatorSpec {
        OperatorSpec::new("scale")
            .input("X", SlotBinding::single("X"))
            .output("Out", SlotBinding::single("Out"))
    }

    #[test]
    fn builtin_registry_exposes_schemas() {
        let registry = OperatorRegistry::with_builtin_ops();
        for op_type in [
            "scale",
            "square",
            "mul",
            "sum",
            "sigmoid",
            "increment",
            "fill_zeros_like",
            "gaussian_random",
        ] {
            assert!(registry.contains(op_type), "missing builtin op '{op_type}'");
        }
        let sum_inputs = registry.input_slots("sum").expect("sum schema");
        assert_eq!(sum_inputs[0].arity, SlotArity::Repeated);
        assert_eq!(registry.attr_names("scale").expect("scale schema"), vec!["factor"]);
        assert!(registry.has_gradient("scale").expect("scale schema"));
        assert!(!registry.has_gradient("fill_zeros_like").expect("schema"));
        assert!(!registry.supports_accelerator("sum").expect("sum schema"));
        assert!(registry.op_types().any(|op_type| op_type == "sum_grad"));
    }

    #[test]
    fn unknown_operator_type_fails() {
        let registry = OperatorRegistry::with_builtin_ops();
        let err = registry
            .instantiate(OperatorSpec::new("conv9d"))
            .expect_err("unknown op must fail");
        assert_eq!(
            err,
            RegistryError::UnknownOperatorType {
                op_type: "conv9d".to_string()
            }
        );
    }

    #[test]
    fn missing_required_slot_fails_before_construction() {
        let registry = OperatorRegistry::with_builtin_ops();
        let spec = OperatorSpec::new("mul")
            .input("X", SlotBinding::single("X"))
            .output("Out", SlotBinding::single("Out"));
        let err = registry.instantiate(spec).expect_err("missing Y must fail");
        assert_eq!(
            err,
            RegistryError::MissingRequiredSlot {
                op_type: "mul".to_string(),
                kind: SlotKind::Input,
                slot: "Y".to_string()
            }
        );
    }

    #[test]
    fn arity_and_unknown_slot_are_validated() {
        let registry = OperatorRegistry::with_builtin_ops();
        let spec = OperatorSpec::new("sum")
            .input("X", SlotBinding::single("X"))
            .output("Out", SlotBinding::single("Out"));
        assert!(matches!(
            registry.instantiate(spec),
            Err(RegistryError::ArityMismatch { .. })
        ));

        let spec = scale_spec().input("Bias", SlotBinding::single("B"));
        assert!(matches!(
            registry.instantiate(spec),
            Err(RegistryError::UnknownSlot { .. })
        ));
    }

    #[test]
    fn attributes_take_defaults_and_reject_unknown_names() {
        let registry = OperatorRegistry::with_builtin_ops();
        let op = registry.instantiate(scale_spec()).expect("scale instantiates");
        assert_eq!(op.attr("factor"), Some(&AttrValue::Float(1.0)));

        let err = registry
            .instantiate(scale_spec().attr("bias", AttrValue::Float(1.0)))
            .expect_err("unknown attr must fail");
        assert!(matches!(err, RegistryError::UnknownAttribute { .. }));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = OperatorRegistry::with_builtin_ops();
        let schema = registry.schema("scale").expect("scale schema").clone();
        let err = registry.register(schema).expect_err("duplicate must fail");
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn scale_runs_and_infers_shape() {
        let registry = OperatorRegistry::with_builtin_ops();
        let op = registry
            .instantiate(scale_spec().attr("factor", AttrValue::Float(2.0)))
            .expect("scale instantiates");
        let mut scope = Scope::new();
        bind(&mut scope, "X", &[1.0, 2.0, 3.0]);

        op.infer_shape(&mut scope).expect("infer shape");
        assert_eq!(scope.tensor("Out").expect("Out exists").shape(), &[3]);

        op.run(&mut scope, &DeviceContext::cpu()).expect("run");
        assert_eq!(
            scope.tensor("Out").expect("Out exists").values(),
            &[2.0, 4.0, 6.0]
        );
    }

    #[test]
    fn run_rejects_uninitialized_input() {
        let registry = OperatorRegistry::with_builtin_ops();
        let op = registry.instantiate(scale_spec()).expect("scale instantiates");
        let mut scope = Scope::new();
        scope.new_var("X");
        let err = op
            .run(&mut scope, &DeviceContext::cpu())
            .expect_err("uninitialized input must fail");
        assert!(matches!(err, OpError::UninitializedInput { .. }));
    }

    #[test]
    fn sum_over_repeated_slot() {
        let registry = OperatorRegistry::with_builtin_ops();
        let op = registry
            .instantiate(
                OperatorSpec::new("sum")
                    .input("X", SlotBinding::repeated(["a", "b"]))
                    .output("Out", SlotBinding::single("Out")),
            )
            .expect("sum instantiates");
        let mut scope = Scope::new();
        bind(&mut scope, "a", &[1.0, 2.0]);
        bind(&mut scope, "b", &[3.0, 4.0]);
        op.run(&mut scope, &DeviceContext::cpu()).expect("run");
        assert_eq!(scope.tensor("Out").expect("Out").values(), &[4.0, 6.0]);
        assert_eq!(op.input_vars(), vec!["a", "b"]);
        assert_eq!(op.output_vars(), vec!["Out"]);
    }

    #[test]
    fn increment_overwrites_its_input() {
        let registry = OperatorRegistry::with_builtin_ops();
        let op = registry
            .instantiate(
                OperatorSpec::new("increment")
                    .input("X", SlotBinding::single("X"))
                    .output("Out", SlotBinding::single("Out"))
                    .attr("step", AttrValue::Float(0.5)),
            )
            .expect("increment instantiates");
        let mut scope = Scope::new();
        bind(&mut scope, "X", &[1.0]);
        op.run(&mut scope, &DeviceContext::cpu()).expect("run");
        assert_eq!(scope.tensor("Out").expect("Out").values(), &[1.5]);
        assert_eq!(scope.tensor("X").expect("X").values(), &[1.5]);
    }

    #[test]
    fn gaussian_random_shapes_from_attribute() {
        let registry = OperatorRegistry::with_builtin_ops();
        let op = registry
            .instantiate(
                OperatorSpec::new("gaussian_random")
                    .output("Out", SlotBinding::single("Out"))
                    .attr("shape", AttrValue::Ints(vec![2, 3]))
                    .attr("mean", AttrValue::Float(1.0))
                    .attr("std", AttrValue::Float(0.0)),
            )
            .expect("gaussian_random instantiates");
        let mut scope = Scope::new();
        op.infer_shape(&mut scope).expect("infer shape");
        op.run(&mut scope, &DeviceContext::cpu()).expect("run");
        let out = scope.tensor("Out").expect("Out");
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.values(), &[1.0; 6]);
    }

    #[test]
    fn gaussian_random_rejects_non_positive_shape() {
        let registry = OperatorRegistry::with_builtin_ops();
        let op = registry
            .instantiate(
                OperatorSpec::new("gaussian_random")
                    .output("Out", SlotBinding::single("Out"))
                    .attr("shape", AttrValue::Ints(vec![2, -1])),
            )
            .expect("gaussian_random instantiates");
        let mut scope = Scope::new();
        let err = op.infer_shape(&mut scope).expect_err("negative dim must fail");
        assert!(err.to_string().contains("'shape'"));
    }

    #[test]
    fn accelerator_run_requires_op_support() {
        let registry = OperatorRegistry::with_builtin_ops();
        let Ok(device) = DeviceContext::create(Place::Accelerator(0)) else {
            return;
        };
        let op = registry
            .instantiate(
                OperatorSpec::new("sum")
                    .input("X", SlotBinding::repeated(["a"]))
                    .output("Out", SlotBinding::single("Out")),
            )
            .expect("sum instantiates");
        let mut scope = Scope::new();
        let err = op.run(&mut scope, &device).expect_err("sum has no accelerator kernel");
        assert!(matches!(err, OpError::UnsupportedPlace { .. }));
    }

    #[test]
    fn slot_binding_mapping_keeps_placeholders() {
        let binding = SlotBinding::repeated(["a", EMPTY_VAR_NAME, "c"]);
        let mapped = binding.map_names(|name| format!("{name}@GRAD"));
        assert_eq!(
            mapped.names(),
            &["a@GRAD".to_string(), EMPTY_VAR_NAME.to_string(), "c@GRAD".to_string()]
        );
        assert_eq!(mapped.bound_names().count(), 2);
    }

    #[test]
    fn attr_values_deserialize_untagged() {
        let attrs: Vec<AttrValue> =
            serde_json::from_str(r#"[2.5, 3, true, [1, 2], "mode"]"#).expect("attrs parse");
        assert_eq!(attrs[0], AttrValue::Float(2.5));
        assert_eq!(attrs[1], AttrValue::Int(3));
        assert_eq!(attrs[1].as_f32(), Some(3.0));
        assert_eq!(attrs[2], AttrValue::Bool(true));
        assert_eq!(attrs[3].as_ints(), Some(&[1, 2][..]));
        assert_eq!(attrs[4], AttrValue::Str("mode".to_string()));
    }
}
