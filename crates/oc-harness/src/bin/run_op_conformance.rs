#![forbid(unsafe_code)]

use std::path::PathBuf;

use oc_harness::{HarnessConfig, OP_CASES_FIXTURE, emit_op_case_logs, run_op_conformance_at};
use serde_json::json;

fn main() -> Result<(), String> {
    let mut fixture: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut cpu_only = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fixture" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--fixture requires a file path".to_string())?;
                fixture = Some(PathBuf::from(value));
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--cpu-only" => {
                cpu_only = true;
            }
            other => {
                return Err(format!(
                    "unknown arg '{other}'. usage: run_op_conformance [--fixture path] [--output path] [--cpu-only]"
                ));
            }
        }
    }

    let config = HarnessConfig {
        include_accelerator: !cpu_only,
        ..HarnessConfig::default_paths()
    };
    let fixture_path = fixture.unwrap_or_else(|| config.fixture_root.join(OP_CASES_FIXTURE));

    let summary = if let Some(output_path) = output {
        let emitted = emit_op_case_logs(&config, &fixture_path, &output_path)?;
        json!({
            "status": if emitted.failed_entries == 0 { "ok" } else { "failed" },
            "fixture": fixture_path.display().to_string(),
            "output_path": emitted.output_path.display().to_string(),
            "log_entries": emitted.log_entries,
            "failed_entries": emitted.failed_entries,
        })
    } else {
        let (report, cases) = run_op_conformance_at(&config, &fixture_path)?;
        let failed: Vec<_> = cases
            .iter()
            .filter(|case| !case.passed())
            .map(|case| {
                json!({
                    "name": case.name,
                    "op_type": case.op_type,
                    "expected_error": case.expected_error,
                    "error": case.error,
                })
            })
            .collect();
        json!({
            "status": if report.cases_passed == report.cases_total { "ok" } else { "failed" },
            "suite": report.suite,
            "fixture": fixture_path.display().to_string(),
            "cases_total": report.cases_total,
            "cases_passed": report.cases_passed,
            "failed_cases": failed,
        })
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&summary)
            .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    if summary["status"] == "ok" {
        Ok(())
    } else {
        Err("op conformance suite has failing cases".to_string())
    }
}
