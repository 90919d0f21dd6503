use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use oc_core::Place;
use oc_registry::{AttrValue, OperatorRegistry};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::driver::{OpCase, SlotDataMap};
use crate::logging::{StructuredCaseLog, runtime_evidence_field};
use crate::{GradCheckOptions, HarnessConfig, HarnessError, OpTest, OutputCheck, OutputTolerance};

pub const OP_CASES_FIXTURE: &str = "op_cases.json";

const SUITE_ID: &str = "op_gradcheck";
const MAX_FIXTURE_BYTES: u64 = 1_048_576;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub cases_total: usize,
    pub cases_passed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpCaseReport {
    pub name: String,
    pub op_type: String,
    pub output_checks: usize,
    pub skipped_output_checks: usize,
    pub grad_checks: usize,
    pub expected_error: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    pub forensic_log: StructuredCaseLog,
}

impl OpCaseReport {
    /// A case passes when it raised exactly the error it expects, or no
    /// error when it expects none.
    #[must_use]
    pub fn passed(&self) -> bool {
        expectation_met(self.expected_error.as_deref(), self.error_kind)
    }
}

fn expectation_met(expected: Option<&str>, actual: Option<&str>) -> bool {
    match (expected, actual) {
        (Some(expected), Some(actual)) => expected == actual,
        (None, None) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitSummary {
    pub output_path: PathBuf,
    pub log_entries: usize,
    pub failed_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct OpFixtureFile {
    cases: Vec<OpFixtureCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpFixtureCase {
    name: String,
    op_type: String,
    #[serde(default)]
    inputs: SlotDataMap,
    #[serde(default)]
    outputs: SlotDataMap,
    #[serde(default)]
    attrs: BTreeMap<String, AttrValue>,
    atol: Option<f64>,
    #[serde(default)]
    grad_checks: Vec<GradCheckCase>,
    expect_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GradCheckCase {
    inputs: Vec<String>,
    output: String,
    #[serde(default)]
    no_grad: Vec<String>,
    #[serde(default)]
    in_place: bool,
    max_relative_error: Option<f64>,
    delta: Option<f64>,
}

#[derive(Debug, Default)]
struct CaseTally {
    output_checks: usize,
    skipped_output_checks: usize,
    grad_checks: usize,
    places: BTreeSet<Place>,
}

pub fn run_op_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<OpCaseReport>), String> {
    let fixture_path = config.fixture_root.join(OP_CASES_FIXTURE);
    run_op_conformance_at(config, &fixture_path)
}

pub fn run_op_conformance_at(
    config: &HarnessConfig,
    fixture_path: &Path,
) -> Result<(HarnessReport, Vec<OpCaseReport>), String> {
    let fixture: OpFixtureFile = load_fixture(fixture_path)?;
    Ok(run_op_conformance_with_fixture(config, &fixture, fixture_path))
}

fn run_op_conformance_with_fixture(
    config: &HarnessConfig,
    fixture: &OpFixtureFile,
    fixture_path: &Path,
) -> (HarnessReport, Vec<OpCaseReport>) {
    let registry = OperatorRegistry::with_builtin_ops();
    let case_reports: Vec<OpCaseReport> = fixture
        .cases
        .iter()
        .map(|case| run_op_case(&registry, config, case, fixture_path))
        .collect();

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(OpCaseReport::passed));
    let report = HarnessReport {
        suite: SUITE_ID,
        fixture_count: 1,
        cases_total,
        cases_passed,
    };
    (report, case_reports)
}

fn run_op_case(
    registry: &OperatorRegistry,
    config: &HarnessConfig,
    case: &OpFixtureCase,
    fixture_path: &Path,
) -> OpCaseReport {
    let op_case = OpCase {
        op_type: case.op_type.clone(),
        inputs: case.inputs.clone(),
        outputs: case.outputs.clone(),
        attrs: case.attrs.clone(),
    };
    let mut test = OpTest::new(registry, op_case).with_config(config);
    if let Some(atol) = case.atol {
        test = test.with_output_tolerance(OutputTolerance::new(atol, config.rtol));
    }

    let mut tally = CaseTally::default();
    let result = execute_case(&mut test, case, &mut tally);
    let error_kind = result.as_ref().err().map(HarnessError::kind_label);
    let error = result.err().map(|error| error.to_string());

    let expected_error = case.expect_error.clone();
    let passed = expectation_met(expected_error.as_deref(), error_kind);
    let reason_code = match (expected_error.as_deref(), error_kind) {
        (None, None) => "checks_ok".to_string(),
        (Some(_), Some(actual)) if passed => format!("expected_error_raised:{actual}"),
        (Some(_), None) => "expected_error_missing".to_string(),
        (_, Some(actual)) => actual.to_string(),
    };

    let mut extra_fields: BTreeMap<String, Value> = BTreeMap::new();
    extra_fields.insert("op_type".to_string(), json!(case.op_type));
    extra_fields.insert("output_checks".to_string(), json!(tally.output_checks));
    extra_fields.insert(
        "skipped_output_checks".to_string(),
        json!(tally.skipped_output_checks),
    );
    extra_fields.insert("grad_checks".to_string(), json!(tally.grad_checks));
    extra_fields.insert("expected_error".to_string(), json!(expected_error));
    extra_fields.insert("error".to_string(), json!(error));
    extra_fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_field(test.runtime().ledger().entries()),
    );

    let places: Vec<Place> = tally.places.iter().copied().collect();
    let forensic_log = StructuredCaseLog::new(
        SUITE_ID,
        OP_CASES_FIXTURE,
        case.name.as_str(),
        &places,
        vec![fixture_path.display().to_string()],
        format!(
            "cargo run -p oc-harness --bin run_op_conformance -- --fixture {} # case={}",
            fixture_path.display(),
            case.name
        ),
        if passed { "pass" } else { "fail" },
        &reason_code,
    )
    .with_extra_fields(extra_fields);

    OpCaseReport {
        name: case.name.clone(),
        op_type: case.op_type.clone(),
        output_checks: tally.output_checks,
        skipped_output_checks: tally.skipped_output_checks,
        grad_checks: tally.grad_checks,
        expected_error,
        error,
        error_kind,
        forensic_log,
    }
}

/// Output checks first, then each gradient check in fixture order. Stops at
/// the first failure.
fn execute_case(
    test: &mut OpTest<'_>,
    case: &OpFixtureCase,
    tally: &mut CaseTally,
) -> Result<(), HarnessError> {
    if !case.outputs.is_empty() {
        for place in test.output_places() {
            match test.try_check_output(place)? {
                OutputCheck::Passed { place, .. } => {
                    tally.output_checks += 1;
                    tally.places.insert(place);
                }
                OutputCheck::Skipped { .. } => tally.skipped_output_checks += 1,
            }
        }
    }

    for grad_check in &case.grad_checks {
        let mut options = GradCheckOptions::new()
            .no_grad(grad_check.no_grad.iter().cloned())
            .in_place(grad_check.in_place);
        if let Some(limit) = grad_check.max_relative_error {
            options = options.max_relative_error(limit);
        }
        if let Some(delta) = grad_check.delta {
            options = options.delta(delta);
        }
        let inputs: Vec<&str> = grad_check.inputs.iter().map(String::as_str).collect();
        let report = test.try_check_grad(&inputs, &grad_check.output, &options)?;
        tally.grad_checks += 1;
        tally.places.extend(report.places);
    }
    Ok(())
}

/// Runs the suite at `fixture_path` and writes one JSON line per case to
/// `output_path`.
pub fn emit_op_case_logs(
    config: &HarnessConfig,
    fixture_path: &Path,
    output_path: &Path,
) -> Result<EmitSummary, String> {
    let (_, cases) = run_op_conformance_at(config, fixture_path)?;

    if let Some(parent) = output_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|error| {
            format!("failed creating log directory {}: {error}", parent.display())
        })?;
    }
    let mut file = fs::File::create(output_path)
        .map_err(|error| format!("failed creating {}: {error}", output_path.display()))?;
    for case in &cases {
        let line = case.forensic_log.to_json_line()?;
        writeln!(file, "{line}")
            .map_err(|error| format!("failed writing {}: {error}", output_path.display()))?;
    }

    Ok(EmitSummary {
        output_path: output_path.to_path_buf(),
        log_entries: cases.len(),
        failed_entries: cases.iter().filter(|case| !case.passed()).count(),
    })
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{
        OpFixtureFile, expectation_met, run_op_conformance_with_fixture, summarize_passes,
    };
    use crate::HarnessConfig;
    use crate::driver::SlotData;

    fn parse(raw: &str) -> OpFixtureFile {
        serde_json::from_str(raw).expect("fixture parses")
    }

    #[test]
    fn fixture_parses_single_and_repeated_slots() {
        let fixture = parse(
            r#"{"cases": [{
                "name": "sum_pair",
                "op_type": "sum",
                "inputs": {"X": [
                    {"name": "x0", "shape": [2], "values": [1.0, 2.0]},
                    {"name": "x1", "shape": [2], "values": [3.0, 4.0]}
                ]},
                "outputs": {"Out": {"shape": [2], "values": [4.0, 6.0]}},
                "grad_checks": [{"inputs": ["x0", "x1"], "output": "Out"}]
            }]}"#,
        );
        let case = &fixture.cases[0];
        assert!(matches!(case.inputs["X"], SlotData::Repeated(ref list) if list.len() == 2));
        assert!(matches!(case.outputs["Out"], SlotData::Single(_)));
        assert!(!case.grad_checks[0].in_place);
    }

    #[test]
    fn expected_error_cases_pass_only_on_matching_kind() {
        let fixture = parse(
            r#"{"cases": [
                {
                    "name": "zeros_have_no_gradient",
                    "op_type": "fill_zeros_like",
                    "inputs": {"Src": {"shape": [2], "values": [1.0, 2.0]}},
                    "outputs": {"Dst": {"shape": [2], "values": [0.0, 0.0]}},
                    "grad_checks": [{"inputs": ["Src"], "output": "Dst"}],
                    "expect_error": "no_backward_defined"
                },
                {
                    "name": "wrong_expectation",
                    "op_type": "scale",
                    "inputs": {"X": {"shape": [1], "values": [1.0]}},
                    "outputs": {"Out": {"shape": [1], "values": [1.0]}},
                    "expect_error": "shape_mismatch"
                }
            ]}"#,
        );
        let config = HarnessConfig::default();
        let (report, cases) =
            run_op_conformance_with_fixture(&config, &fixture, Path::new("inline.json"));
        assert_eq!(report.cases_total, 2);
        assert_eq!(report.cases_passed, 1);
        assert!(cases[0].passed());
        assert_eq!(cases[0].forensic_log.reason_code, "expected_error_raised:no_backward_defined");
        assert!(!cases[1].passed());
        assert_eq!(cases[1].forensic_log.reason_code, "expected_error_missing");
        assert_eq!(cases[1].forensic_log.outcome, "fail");
        for case in &cases {
            assert_eq!(case.passed(), case.forensic_log.outcome == "pass");
        }
    }

    #[test]
    fn expectation_requires_matching_error_kind() {
        assert!(expectation_met(None, None));
        assert!(expectation_met(Some("shape_mismatch"), Some("shape_mismatch")));
        assert!(!expectation_met(Some("shape_mismatch"), Some("tolerance_exceeded")));
        assert!(!expectation_met(Some("shape_mismatch"), None));
        assert!(!expectation_met(None, Some("shape_mismatch")));
    }

    #[test]
    fn summarize_passes_counts() {
        assert_eq!(summarize_passes([true, false, true].into_iter()), (3, 2));
        assert_eq!(summarize_passes(std::iter::empty()), (0, 0));
    }
}
