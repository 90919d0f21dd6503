use std::collections::BTreeSet;

use oc_autograd::grad_var_name;
use oc_core::DenseTensor;
use oc_device::DeviceContext;
use oc_registry::Operator;
use oc_runtime::{EvidenceKind, Scope};

use crate::HarnessError;
use crate::driver::{OpCase, OperatorDriver, SlotDataMap};

/// Gradient values with the shape of the variable they differentiate.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradient {
    pub var: String,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl Gradient {
    #[must_use]
    pub fn from_tensor(var: &str, tensor: &DenseTensor) -> Self {
        Self {
            var: var.to_string(),
            shape: tensor.shape().to_vec(),
            values: tensor.values().iter().copied().map(f64::from).collect(),
        }
    }
}

/// The input variable being perturbed and the output variable whose element
/// sum is differenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTarget<'a> {
    pub input: &'a str,
    pub output: &'a str,
}

/// Central finite-difference estimator of `d sum(output) / d input`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientEstimator {
    delta: f64,
    in_place: bool,
}

impl Default for GradientEstimator {
    fn default() -> Self {
        Self::new(0.005)
    }
}

impl GradientEstimator {
    #[must_use]
    pub fn new(delta: f64) -> Self {
        Self {
            delta,
            in_place: false,
        }
    }

    /// Rebinds every input before each probe, for operators that overwrite
    /// their inputs while running.
    #[must_use]
    pub fn in_place(mut self, in_place: bool) -> Self {
        self.in_place = in_place;
        self
    }

    /// Builds `case` in a fresh scope at the device's place and estimates
    /// the gradient there.
    pub fn estimate(
        &self,
        driver: &mut OperatorDriver<'_>,
        case: &OpCase,
        device: &DeviceContext,
        target: ProbeTarget<'_>,
    ) -> Result<Gradient, HarnessError> {
        let mut scope = Scope::new();
        let op = driver.build(&mut scope, case)?;
        driver.bind_tensor_data(&mut scope, &op, &case.inputs, device.place())?;
        op.infer_shape(&mut scope)?;
        self.estimate_in(driver, &mut scope, &op, &case.inputs, device, target)
    }

    /// Estimates the gradient against an already bound scope. Each probed
    /// element is restored to its original value whether or not the probe
    /// succeeded.
    pub fn estimate_in(
        &self,
        driver: &mut OperatorDriver<'_>,
        scope: &mut Scope,
        op: &Operator,
        inputs: &SlotDataMap,
        device: &DeviceContext,
        target: ProbeTarget<'_>,
    ) -> Result<Gradient, HarnessError> {
        let place = device.place();
        let (shape, numel) = {
            let tensor = scope.tensor(target.input)?;
            (tensor.shape().to_vec(), tensor.numel())
        };

        let mut values = Vec::with_capacity(numel);
        for index in 0..numel {
            if self.in_place {
                driver.bind_tensor_data(scope, op, inputs, place)?;
            }
            let origin = scope.tensor(target.input)?.element(index)?;
            let x_pos = (f64::from(origin) + self.delta) as f32;
            let x_neg = (f64::from(origin) - self.delta) as f32;

            let mut probe = || -> Result<(f64, f64), HarnessError> {
                let y_pos = perturbed_sum(scope, op, device, target, index, x_pos)?;
                if self.in_place {
                    driver.bind_tensor_data(scope, op, inputs, place)?;
                }
                let y_neg = perturbed_sum(scope, op, device, target, index, x_neg)?;
                Ok((y_pos, y_neg))
            };
            let probed = probe();
            scope.tensor_mut(target.input)?.set_element(index, origin)?;
            let (y_pos, y_neg) = probed?;
            values.push((y_pos - y_neg) / (2.0 * self.delta));
        }
        if self.in_place {
            driver.bind_tensor_data(scope, op, inputs, place)?;
        }

        driver.runtime_mut().record(
            EvidenceKind::Probe,
            format!(
                "estimated d sum({})/d {} for '{}' on {place}: probes={} delta={} in_place={}",
                target.output,
                target.input,
                op.op_type(),
                2 * numel,
                self.delta,
                self.in_place
            ),
        );
        Ok(Gradient {
            var: target.input.to_string(),
            shape,
            values,
        })
    }
}

fn perturbed_sum(
    scope: &mut Scope,
    op: &Operator,
    device: &DeviceContext,
    target: ProbeTarget<'_>,
    index: usize,
    value: f32,
) -> Result<f64, HarnessError> {
    scope.tensor_mut(target.input)?.set_element(index, value)?;
    op.run(scope, device)?;
    Ok(scope.tensor(target.output)?.sum())
}

/// Runs `case` forward and its backward operator with ones seeded into every
/// output gradient, then reads `<input>@GRAD` for each checked input.
pub fn analytic_gradients(
    driver: &mut OperatorDriver<'_>,
    case: &OpCase,
    device: &DeviceContext,
    inputs_to_check: &[&str],
    no_grad_set: &BTreeSet<String>,
) -> Result<Vec<Gradient>, HarnessError> {
    let place = device.place();
    let mut scope = Scope::new();
    let op = driver.build(&mut scope, case)?;
    driver.bind_tensor_data(&mut scope, &op, &case.inputs, place)?;
    op.infer_shape(&mut scope)?;
    driver.run_forward(&mut scope, &op, device)?;

    let plan = driver.derive_backward(&mut scope, &op, no_grad_set)?;
    driver.seed_output_gradients(&mut scope, &plan, place)?;
    driver.run_backward(&mut scope, &plan, device)?;

    inputs_to_check
        .iter()
        .map(|name| -> Result<Gradient, HarnessError> {
            let grad_name = plan
                .input_grad(name)
                .map_or_else(|| grad_var_name(name), str::to_string);
            Ok(Gradient::from_tensor(name, scope.tensor(&grad_name)?))
        })
        .collect()
}
