use std::collections::BTreeMap;

use oc_core::Place;
use oc_runtime::{EvidenceEntry, EvidenceKind, now_unix_ms};
use serde::Serialize;
use serde_json::{Value, json};

/// One JSON-lines record per executed fixture case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub ts_unix_ms: u128,
    pub suite_id: String,
    pub test_id: String,
    pub scenario_id: String,
    pub place: String,
    pub outcome: String,
    pub reason_code: String,
    pub replay_command: String,
    pub artifact_refs: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &str,
        test_id: &str,
        scenario_id: &str,
        places: &[Place],
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        Self {
            ts_unix_ms: now_unix_ms(),
            suite_id: suite_id.to_string(),
            test_id: test_id.to_string(),
            scenario_id: scenario_id.to_string(),
            place: place_label(places),
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
            replay_command,
            artifact_refs,
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(extra_fields);
        self
    }

    pub fn to_json_line(&self) -> Result<String, String> {
        serde_json::to_string(self)
            .map_err(|error| format!("failed serializing case log {}: {error}", self.scenario_id))
    }
}

fn place_label(places: &[Place]) -> String {
    if places.is_empty() {
        return "none".to_string();
    }
    places
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn evidence_kind_label(kind: EvidenceKind) -> &'static str {
    match kind {
        EvidenceKind::Policy => "policy",
        EvidenceKind::Forward => "forward",
        EvidenceKind::Backward => "backward",
        EvidenceKind::Probe => "probe",
        EvidenceKind::Comparison => "comparison",
    }
}

pub(crate) fn runtime_evidence_field(entries: &[EvidenceEntry]) -> Value {
    let mut kind_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in entries {
        *kind_counts.entry(evidence_kind_label(entry.kind)).or_insert(0) += 1;
    }

    json!({
        "total_entries": entries.len(),
        "kind_counts": kind_counts,
        "entries": entries
            .iter()
            .map(|entry| {
                json!({
                    "ts_unix_ms": entry.ts_unix_ms,
                    "kind": evidence_kind_label(entry.kind),
                    "summary": entry.summary,
                })
            })
            .collect::<Vec<_>>(),
    })
}
