#![forbid(unsafe_code)]

pub mod compare;
pub mod driver;
mod error;
pub mod gradient;
mod logging;
mod suite;

use std::collections::BTreeSet;
use std::path::PathBuf;

use oc_core::Place;
use oc_device::{DeviceContext, is_compiled_with_accelerator};
use oc_registry::OperatorRegistry;
use oc_runtime::{EvidenceKind, RuntimeContext, Scope};

pub use compare::{ComparisonSummary, OutputTolerance, RELATIVE_ERROR_FLOOR};
pub use driver::{NamedTensor, OpCase, OperatorDriver, SlotData, SlotDataMap, TensorData};
pub use error::{HarnessError, ToleranceKind, ToleranceViolation};
pub use gradient::{Gradient, GradientEstimator, ProbeTarget};
pub use logging::StructuredCaseLog;
pub use suite::{
    EmitSummary, HarnessReport, OP_CASES_FIXTURE, OpCaseReport, emit_op_case_logs,
    run_op_conformance, run_op_conformance_at,
};

use crate::compare::{compare_gradient, compare_output};
use crate::gradient::analytic_gradients;

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub atol: f64,
    pub rtol: f64,
    pub max_relative_error: f64,
    pub delta: f64,
    pub include_accelerator: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            atol: 1e-5,
            rtol: 1e-5,
            max_relative_error: 0.005,
            delta: 0.005,
            include_accelerator: true,
        }
    }

    #[must_use]
    pub fn output_tolerance(&self) -> OutputTolerance {
        OutputTolerance::new(self.atol, self.rtol)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

/// Per-call overrides for a gradient check. Unset values fall back to the
/// harness configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradCheckOptions {
    pub no_grad: BTreeSet<String>,
    pub in_place: bool,
    pub max_relative_error: Option<f64>,
    pub delta: Option<f64>,
}

impl GradCheckOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn no_grad<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.no_grad.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn in_place(mut self, in_place: bool) -> Self {
        self.in_place = in_place;
        self
    }

    #[must_use]
    pub fn max_relative_error(mut self, limit: f64) -> Self {
        self.max_relative_error = Some(limit);
        self
    }

    #[must_use]
    pub fn delta(mut self, delta: f64) -> Self {
        self.delta = Some(delta);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputCheck {
    Passed {
        place: Place,
        compared: Vec<(String, ComparisonSummary)>,
    },
    Skipped {
        place: Place,
        reason: String,
    },
}

impl OutputCheck {
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradientVerdict {
    pub var: String,
    pub place: Place,
    pub max_relative_error: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradCheckReport {
    pub places: Vec<Place>,
    pub numeric: Vec<Gradient>,
    pub verdicts: Vec<GradientVerdict>,
}

/// Test fixture for one operator case.
///
/// `try_check_output` and `try_check_grad` return the failure as a
/// [`HarnessError`]; `check_output` and `check_grad` panic with its message,
/// which is how a failing assertion surfaces inside `#[test]` functions.
#[derive(Debug, Clone)]
pub struct OpTest<'r> {
    driver: OperatorDriver<'r>,
    case: OpCase,
    config: HarnessConfig,
    tolerance: OutputTolerance,
}

impl<'r> OpTest<'r> {
    #[must_use]
    pub fn new(registry: &'r OperatorRegistry, case: OpCase) -> Self {
        let config = HarnessConfig::default_paths();
        let label = format!("op_test:{}", case.op_type);
        Self {
            driver: OperatorDriver::new(registry, label),
            tolerance: config.output_tolerance(),
            case,
            config,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: &HarnessConfig) -> Self {
        self.tolerance = config.output_tolerance();
        self.config = config.clone();
        self
    }

    #[must_use]
    pub fn with_output_tolerance(mut self, tolerance: OutputTolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    #[must_use]
    pub fn case(&self) -> &OpCase {
        &self.case
    }

    #[must_use]
    pub fn runtime(&self) -> &RuntimeContext {
        self.driver.runtime()
    }

    /// Places an output check is attempted on.
    #[must_use]
    pub fn output_places(&self) -> Vec<Place> {
        let mut places = vec![Place::Cpu];
        if self.config.include_accelerator && is_compiled_with_accelerator() {
            places.push(Place::Accelerator(0));
        }
        places
    }

    /// Places the analytic gradient is computed and compared on: CPU, plus
    /// the first accelerator when compiled in and both the operator and its
    /// gradient rule have accelerator kernels.
    pub fn grad_places(&self) -> Result<Vec<Place>, HarnessError> {
        let registry = self.driver.registry();
        let schema = registry.schema(&self.case.op_type)?;
        let mut places = vec![Place::Cpu];
        if !self.config.include_accelerator || !is_compiled_with_accelerator() {
            return Ok(places);
        }
        let grad_supported = match schema.grad_op_type() {
            Some(grad_op_type) => registry.supports_accelerator(grad_op_type)?,
            None => false,
        };
        if schema.supports_accelerator() && grad_supported {
            places.push(Place::Accelerator(0));
        }
        Ok(places)
    }

    pub fn try_check_output(&mut self, place: Place) -> Result<OutputCheck, HarnessError> {
        let schema = self.driver.registry().schema(&self.case.op_type)?;
        if place.is_accelerator() {
            let reason = if !is_compiled_with_accelerator() {
                Some("accelerator support is not compiled in")
            } else if !schema.supports_accelerator() {
                Some("operator has no accelerator kernel")
            } else {
                None
            };
            if let Some(reason) = reason {
                self.driver.runtime_mut().record(
                    EvidenceKind::Comparison,
                    format!("output check of '{}' on {place} skipped: {reason}", self.case.op_type),
                );
                return Ok(OutputCheck::Skipped {
                    place,
                    reason: reason.to_string(),
                });
            }
        }

        let device = DeviceContext::create(place)?;
        let mut scope = Scope::new();
        let op = self.driver.build(&mut scope, &self.case)?;
        self.driver
            .bind_tensor_data(&mut scope, &op, &self.case.inputs, place)?;
        op.infer_shape(&mut scope)?;
        self.driver.run_forward(&mut scope, &op, &device)?;

        let mut compared = Vec::new();
        for (slot, expected) in &self.case.outputs {
            let Some(binding) = op.output(slot) else {
                continue;
            };
            for (name, data) in expected.bound(binding) {
                let actual = scope.tensor(name)?;
                let result = compare_output(op.op_type(), name, actual, data, self.tolerance);
                let verdict = match &result {
                    Ok(summary) => format!("max_deviation={:e}", summary.max_deviation),
                    Err(error) => format!("failed: {error}"),
                };
                self.driver.runtime_mut().record(
                    EvidenceKind::Comparison,
                    format!("output '{name}' of '{}' on {place}: {verdict}", op.op_type()),
                );
                compared.push((name.to_string(), result?));
            }
        }
        Ok(OutputCheck::Passed { place, compared })
    }

    pub fn check_output(&mut self, place: Place) -> OutputCheck {
        self.try_check_output(place)
            .unwrap_or_else(|error| panic!("{error}"))
    }

    /// Compares the numeric gradient of `sum(output_name)` with respect to
    /// each of `inputs_to_check` against the backward operator's result.
    /// An operator without a gradient rule fails before any probing.
    pub fn try_check_grad(
        &mut self,
        inputs_to_check: &[&str],
        output_name: &str,
        options: &GradCheckOptions,
    ) -> Result<GradCheckReport, HarnessError> {
        let op_type = self.case.op_type.clone();
        if !self.driver.registry().has_gradient(&op_type)? {
            return Err(HarnessError::NoBackwardDefined { op_type });
        }
        let delta = options.delta.unwrap_or(self.config.delta);
        let max_relative_error = options
            .max_relative_error
            .unwrap_or(self.config.max_relative_error);
        let estimator = GradientEstimator::new(delta).in_place(options.in_place);

        let cpu = DeviceContext::cpu();
        let mut numeric = Vec::with_capacity(inputs_to_check.len());
        for &input in inputs_to_check {
            let target = ProbeTarget {
                input,
                output: output_name,
            };
            numeric.push(estimator.estimate(&mut self.driver, &self.case, &cpu, target)?);
        }

        let places = self.grad_places()?;
        let mut verdicts = Vec::new();
        for place in places.iter().copied() {
            let device = DeviceContext::create(place)?;
            let analytic = analytic_gradients(
                &mut self.driver,
                &self.case,
                &device,
                inputs_to_check,
                &options.no_grad,
            )?;
            for (numeric, analytic) in numeric.iter().zip(&analytic) {
                let result = compare_gradient(&op_type, numeric, analytic, max_relative_error);
                let verdict = match &result {
                    Ok(summary) => format!("max_relative_error={:e}", summary.max_deviation),
                    Err(error) => format!("failed: {error}"),
                };
                self.driver.runtime_mut().record(
                    EvidenceKind::Comparison,
                    format!(
                        "gradient of '{}' wrt '{}' for '{op_type}' on {place}: {verdict}",
                        output_name, numeric.var
                    ),
                );
                let summary = result?;
                verdicts.push(GradientVerdict {
                    var: numeric.var.clone(),
                    place,
                    max_relative_error: summary.max_deviation,
                });
            }
        }

        Ok(GradCheckReport {
            places,
            numeric,
            verdicts,
        })
    }

    pub fn check_grad(
        &mut self,
        inputs_to_check: &[&str],
        output_name: &str,
        options: &GradCheckOptions,
    ) -> GradCheckReport {
        self.try_check_grad(inputs_to_check, output_name, options)
            .unwrap_or_else(|error| panic!("{error}"))
    }
}
