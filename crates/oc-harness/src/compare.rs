use oc_core::DenseTensor;

use crate::HarnessError;
use crate::driver::TensorData;
use crate::error::{ToleranceKind, ToleranceViolation};
use crate::gradient::Gradient;

/// Denominator floor for gradient relative error.
pub const RELATIVE_ERROR_FLOOR: f64 = 1e-3;

/// Element `i` passes when `|actual - expected| <= atol + rtol * |expected|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputTolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl OutputTolerance {
    #[must_use]
    pub fn new(atol: f64, rtol: f64) -> Self {
        Self { atol, rtol }
    }

    #[must_use]
    pub fn with_atol(self, atol: f64) -> Self {
        Self { atol, ..self }
    }

    #[must_use]
    pub fn limit_for(&self, expected: f64) -> f64 {
        self.atol + self.rtol * expected.abs()
    }
}

impl Default for OutputTolerance {
    fn default() -> Self {
        Self {
            atol: 1e-5,
            rtol: 1e-5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComparisonSummary {
    pub elements: usize,
    pub max_deviation: f64,
}

/// Worst offending element: the largest deviation among failing elements,
/// first index on ties.
struct Worst {
    index: usize,
    deviation: f64,
    limit: f64,
}

fn exceeds(deviation: f64, limit: f64) -> bool {
    deviation.is_nan() || deviation > limit
}

pub fn compare_output(
    op_type: &str,
    var: &str,
    actual: &DenseTensor,
    expected: &TensorData,
    tolerance: OutputTolerance,
) -> Result<ComparisonSummary, HarnessError> {
    if actual.shape() != expected.shape.as_slice() || actual.numel() != expected.values.len() {
        return Err(HarnessError::ShapeMismatch {
            op_type: op_type.to_string(),
            var: var.to_string(),
            expected: expected.shape.clone(),
            actual: actual.shape().to_vec(),
        });
    }

    let mut max_deviation = 0.0_f64;
    let mut worst: Option<Worst> = None;
    for (index, (a, e)) in actual.values().iter().zip(&expected.values).enumerate() {
        let (a, e) = (f64::from(*a), f64::from(*e));
        let deviation = (a - e).abs();
        let limit = tolerance.limit_for(e);
        if deviation > max_deviation {
            max_deviation = deviation;
        }
        if exceeds(deviation, limit) && worst.as_ref().is_none_or(|w| deviation > w.deviation) {
            worst = Some(Worst {
                index,
                deviation,
                limit,
            });
        }
    }

    if let Some(worst) = worst {
        return Err(HarnessError::ToleranceExceeded(Box::new(ToleranceViolation {
            kind: ToleranceKind::Output,
            op_type: op_type.to_string(),
            var: var.to_string(),
            index: worst.index,
            actual: f64::from(actual.values()[worst.index]),
            expected: f64::from(expected.values[worst.index]),
            deviation: worst.deviation,
            limit: worst.limit,
        })));
    }
    Ok(ComparisonSummary {
        elements: expected.values.len(),
        max_deviation,
    })
}

/// `|numeric - analytic| / max(|numeric|, RELATIVE_ERROR_FLOOR)`.
#[must_use]
pub fn relative_error(numeric: f64, analytic: f64) -> f64 {
    (numeric - analytic).abs() / numeric.abs().max(RELATIVE_ERROR_FLOOR)
}

/// Fails when the maximum relative error exceeds `max_relative_error`,
/// reporting the first index that attains the maximum.
pub fn compare_gradient(
    op_type: &str,
    numeric: &Gradient,
    analytic: &Gradient,
    max_relative_error: f64,
) -> Result<ComparisonSummary, HarnessError> {
    if numeric.shape != analytic.shape || numeric.values.len() != analytic.values.len() {
        return Err(HarnessError::ShapeMismatch {
            op_type: op_type.to_string(),
            var: analytic.var.clone(),
            expected: numeric.shape.clone(),
            actual: analytic.shape.clone(),
        });
    }

    let mut max_index = 0;
    let mut max_error = 0.0_f64;
    for (index, (n, a)) in numeric.values.iter().zip(&analytic.values).enumerate() {
        let error = relative_error(*n, *a);
        let error = if error.is_nan() { f64::INFINITY } else { error };
        if error > max_error {
            max_error = error;
            max_index = index;
        }
    }

    if exceeds(max_error, max_relative_error) {
        return Err(HarnessError::ToleranceExceeded(Box::new(ToleranceViolation {
            kind: ToleranceKind::Gradient,
            op_type: op_type.to_string(),
            var: numeric.var.clone(),
            index: max_index,
            actual: analytic.values[max_index],
            expected: numeric.values[max_index],
            deviation: max_error,
            limit: max_relative_error,
        })));
    }
    Ok(ComparisonSummary {
        elements: numeric.values.len(),
        max_deviation: max_error,
    })
}

#[cfg(test)]
mod tests {
    use oc_core::{DenseTensor, Place};

    use super::{OutputTolerance, compare_gradient, compare_output, relative_error};
    use crate::driver::TensorData;
    use crate::gradient::Gradient;

    fn tensor(values: &[f32]) -> DenseTensor {
        DenseTensor::from_values(values.to_vec(), vec![values.len()], Place::Cpu)
            .expect("tensor should build")
    }

    fn gradient(values: &[f64]) -> Gradient {
        Gradient {
            var: "X".to_string(),
            shape: vec![values.len()],
            values: values.to_vec(),
        }
    }

    #[test]
    fn output_boundary_follows_allclose() {
        let expected = TensorData::vector(vec![1.0]);
        let summary = compare_output(
            "scale",
            "Out",
            &tensor(&[1.00001]),
            &expected,
            OutputTolerance::default(),
        )
        .expect("1.00001 is within the default tolerance");
        assert_eq!(summary.elements, 1);

        let err = compare_output(
            "scale",
            "Out",
            &tensor(&[1.0002]),
            &expected,
            OutputTolerance::default(),
        )
        .expect_err("1.0002 exceeds the default tolerance");
        let violation = err.violation().expect("tolerance violation");
        assert_eq!(violation.index, 0);
        assert!(violation.deviation > violation.limit);
    }

    #[test]
    fn output_reports_worst_failing_index() {
        let expected = TensorData::vector(vec![0.0, 0.0, 0.0, 0.0]);
        let err = compare_output(
            "scale",
            "Out",
            &tensor(&[0.0, 0.5, 2.0, 2.0]),
            &expected,
            OutputTolerance::default().with_atol(0.1),
        )
        .expect_err("must fail");
        let violation = err.violation().expect("tolerance violation");
        assert_eq!(violation.index, 2);
        assert!((violation.deviation - 2.0).abs() < 1e-12);
        assert!((violation.limit - 0.1).abs() < 1e-12);
    }

    #[test]
    fn output_shape_mismatch_is_an_error() {
        let err = compare_output(
            "scale",
            "Out",
            &tensor(&[1.0, 2.0]),
            &TensorData::vector(vec![1.0, 2.0, 3.0]),
            OutputTolerance::default(),
        )
        .expect_err("shape mismatch");
        assert_eq!(err.kind_label(), "shape_mismatch");
    }

    #[test]
    fn nan_output_never_passes() {
        let err = compare_output(
            "scale",
            "Out",
            &tensor(&[f32::NAN]),
            &TensorData::vector(vec![1.0]),
            OutputTolerance::default(),
        )
        .expect_err("nan must fail");
        assert_eq!(err.kind_label(), "tolerance_exceeded");
    }

    #[test]
    fn relative_error_floors_small_denominators() {
        assert!((relative_error(2.0, 2.01) - 0.005).abs() < 1e-12);
        assert!((relative_error(0.0, 1e-4) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn gradient_reports_first_maximum() {
        let numeric = gradient(&[2.0, 2.0, 2.0]);
        compare_gradient("scale", &numeric, &gradient(&[2.0, 2.005, 1.995]), 0.005)
            .expect("small relative errors pass");

        let err = compare_gradient("scale", &numeric, &gradient(&[2.0, 2.5, 1.5]), 0.005)
            .expect_err("must fail");
        let violation = err.violation().expect("tolerance violation");
        assert_eq!(violation.index, 1);
        assert!((violation.deviation - 0.25).abs() < 1e-12);
        assert_eq!(violation.limit, 0.005);
        assert_eq!(violation.actual, 2.5);
        assert_eq!(violation.expected, 2.0);
    }

    #[test]
    fn gradient_shape_mismatch_is_an_error() {
        let err = compare_gradient("scale", &gradient(&[1.0]), &gradient(&[1.0, 2.0]), 0.005)
            .expect_err("shape mismatch");
        assert_eq!(err.kind_label(), "shape_mismatch");
    }
}
