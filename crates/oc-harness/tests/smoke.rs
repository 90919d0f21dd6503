use std::path::Path;

use oc_core::Place;
use oc_harness::{
    GradCheckOptions, HarnessConfig, HarnessError, OP_CASES_FIXTURE, OpCase, OpTest, OutputCheck,
    SlotData, TensorData, ToleranceKind, emit_op_case_logs, run_op_conformance,
};
use oc_registry::{AttrValue, OperatorRegistry};
use serde_json::Value;

fn scale_case(expected: Vec<f32>) -> OpCase {
    OpCase::new("scale")
        .input("X", SlotData::Single(TensorData::vector(vec![1.0, 2.0, 3.0])))
        .output("Out", SlotData::Single(TensorData::vector(expected)))
        .attr("factor", AttrValue::Float(2.0))
}

fn unit_scale_case(expected: f32) -> OpCase {
    OpCase::new("scale")
        .input("X", SlotData::Single(TensorData::vector(vec![1.0])))
        .output("Out", SlotData::Single(TensorData::vector(vec![expected])))
}

#[test]
fn op_fixture_suite_is_green() {
    let cfg = HarnessConfig::default_paths();
    assert!(Path::new(&cfg.fixture_root.join(OP_CASES_FIXTURE)).exists());

    let (report, cases) = run_op_conformance(&cfg).expect("op conformance should run");
    assert_eq!(report.suite, "op_gradcheck");
    assert_eq!(report.cases_total, cases.len());
    let failed: Vec<_> = cases
        .iter()
        .filter(|case| !case.passed())
        .map(|case| (case.name.as_str(), case.error.clone()))
        .collect();
    assert!(failed.is_empty(), "failing cases: {failed:?}");
    assert_eq!(report.cases_total, report.cases_passed);
}

#[test]
fn scale_scenario_passes_output_and_gradient_checks() {
    let registry = OperatorRegistry::with_builtin_ops();
    let mut test = OpTest::new(&registry, scale_case(vec![2.0, 4.0, 6.0]));

    let check = test.check_output(Place::Cpu);
    assert!(matches!(check, OutputCheck::Passed { place: Place::Cpu, .. }));

    let report = test.check_grad(&["X"], "Out", &GradCheckOptions::new());
    assert_eq!(report.numeric.len(), 1);
    for value in &report.numeric[0].values {
        assert!((value - 2.0).abs() < 1e-2, "numeric gradient {value}");
    }
    assert!(report.verdicts.iter().all(|verdict| verdict.max_relative_error <= 0.005));
}

#[test]
fn output_tolerance_boundary() {
    let registry = OperatorRegistry::with_builtin_ops();

    let mut close = OpTest::new(&registry, unit_scale_case(1.00001));
    close.check_output(Place::Cpu);

    let mut far = OpTest::new(&registry, unit_scale_case(1.0002));
    let error = far
        .try_check_output(Place::Cpu)
        .expect_err("deviation of 2e-4 exceeds atol + rtol");
    let violation = error.violation().expect("tolerance violation carries details");
    assert_eq!(violation.kind, ToleranceKind::Output);
    assert_eq!(violation.index, 0);
    assert_eq!(violation.var, "Out");
}

#[test]
fn operator_without_gradient_rule_is_rejected_before_probing() {
    let registry = OperatorRegistry::with_builtin_ops();
    let case = OpCase::new("fill_zeros_like")
        .input("Src", SlotData::Single(TensorData::vector(vec![1.0, 2.0])))
        .output("Dst", SlotData::Single(TensorData::vector(vec![0.0, 0.0])));
    let mut test = OpTest::new(&registry, case);

    let error = test
        .try_check_grad(&["Src"], "Dst", &GradCheckOptions::new())
        .expect_err("fill_zeros_like has no backward");
    assert!(matches!(error, HarnessError::NoBackwardDefined { ref op_type } if op_type == "fill_zeros_like"));
    assert_eq!(error.kind_label(), "no_backward_defined");
}

#[test]
fn check_output_is_repeatable() {
    let registry = OperatorRegistry::with_builtin_ops();
    let mut test = OpTest::new(&registry, scale_case(vec![2.0, 4.0, 6.0]));
    let first = test.check_output(Place::Cpu);
    let second = test.check_output(Place::Cpu);
    assert_eq!(first, second);
}

#[test]
fn in_place_gradient_check_survives_input_overwrite() {
    let registry = OperatorRegistry::with_builtin_ops();
    let case = OpCase::new("increment")
        .input("X", SlotData::Single(TensorData::vector(vec![1.0, -4.0])))
        .output("Out", SlotData::Single(TensorData::vector(vec![2.0, -3.0])));
    let mut test = OpTest::new(&registry, case);
    test.check_output(Place::Cpu);
    let report = test.check_grad(&["X"], "Out", &GradCheckOptions::new().in_place(true));
    for value in &report.numeric[0].values {
        assert!((value - 1.0).abs() < 1e-2, "numeric gradient {value}");
    }
}

#[test]
fn emitted_case_logs_have_one_line_per_case() {
    let cfg = HarnessConfig::default_paths();
    let fixture_path = cfg.fixture_root.join(OP_CASES_FIXTURE);
    let output_path = std::env::temp_dir()
        .join(format!("oc-harness-smoke-{}", std::process::id()))
        .join("op_cases.jsonl");

    let summary =
        emit_op_case_logs(&cfg, &fixture_path, &output_path).expect("case logs should emit");
    assert_eq!(summary.failed_entries, 0);

    let raw = std::fs::read_to_string(&output_path).expect("log file readable");
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), summary.log_entries);
    for line in lines {
        let value: Value = serde_json::from_str(line).expect("line is json");
        assert_eq!(value["suite_id"], "op_gradcheck");
        assert_eq!(value["outcome"], "pass");
        assert!(
            value["replay_command"]
                .as_str()
                .is_some_and(|command| command.contains("run_op_conformance"))
        );
    }

    if let Some(dir) = output_path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}
