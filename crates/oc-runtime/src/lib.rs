#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use oc_core::{DenseTensor, Place};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Policy,
    Forward,
    Backward,
    Probe,
    Comparison,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn count(&self, kind: EvidenceKind) -> usize {
        self.entries.iter().filter(|entry| entry.kind == kind).count()
    }
}

/// Per-test-case evidence sink. Passed explicitly to every driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    label: String,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!("runtime context initialized for {label}"),
        );
        Self { label, ledger }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.ledger.record(kind, summary);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    NotFound { name: String },
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { name } => write!(f, "variable '{name}' not found in scope"),
        }
    }
}

impl std::error::Error for ScopeError {}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    name: String,
    tensor: DenseTensor,
}

impl Variable {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn tensor(&self) -> &DenseTensor {
        &self.tensor
    }

    pub fn tensor_mut(&mut self) -> &mut DenseTensor {
        &mut self.tensor
    }
}

/// Name → variable namespace owned by a single test case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    vars: BTreeMap<String, Variable>,
}

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the variable called `name`, creating an uninitialized one if
    /// it does not exist yet.
    pub fn new_var(&mut self, name: &str) -> &mut Variable {
        self.vars
            .entry(name.to_string())
            .or_insert_with(|| Variable {
                name: name.to_string(),
                tensor: DenseTensor::uninitialized(Place::Cpu),
            })
    }

    pub fn find_var(&self, name: &str) -> Result<&Variable, ScopeError> {
        self.vars.get(name).ok_or_else(|| ScopeError::NotFound {
            name: name.to_string(),
        })
    }

    pub fn find_var_mut(&mut self, name: &str) -> Result<&mut Variable, ScopeError> {
        self.vars.get_mut(name).ok_or_else(|| ScopeError::NotFound {
            name: name.to_string(),
        })
    }

    pub fn tensor(&self, name: &str) -> Result<&DenseTensor, ScopeError> {
        self.find_var(name).map(Variable::tensor)
    }

    pub fn tensor_mut(&mut self, name: &str) -> Result<&mut DenseTensor, ScopeError> {
        self.find_var_mut(name).map(Variable::tensor_mut)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn var_names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[must_use]
pub fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use oc_core::Place;

    use super::{EvidenceKind, RuntimeContext, Scope, ScopeError};

    #[test]
    fn ledger_records_policy_and_custom_events() {
        let mut ctx = RuntimeContext::new("scale");
        ctx.record(EvidenceKind::Forward, "op=scale place=cpu");

        assert_eq!(ctx.ledger().len(), 2);
        assert_eq!(ctx.ledger().entries()[1].kind, EvidenceKind::Forward);
        assert_eq!(ctx.ledger().count(EvidenceKind::Policy), 1);
        assert_eq!(ctx.label(), "scale");
    }

    #[test]
    fn new_var_is_idempotent() {
        let mut scope = Scope::new();
        scope
            .new_var("X")
            .tensor_mut()
            .set_from_array(&[1.0, 2.0], &[2], Place::Cpu)
            .expect("bind should succeed");

        let again = scope.new_var("X");
        assert_eq!(again.name(), "X");
        assert_eq!(again.tensor().values(), &[1.0, 2.0]);
        assert_eq!(scope.len(), 1);
    }

    #[test]
    fn find_var_reports_missing_name() {
        let scope = Scope::new();
        let err = scope.find_var("Out").expect_err("missing var must fail");
        assert_eq!(
            err,
            ScopeError::NotFound {
                name: "Out".to_string()
            }
        );
        assert!(err.to_string().contains("'Out'"));
    }

    #[test]
    fn tensor_mut_writes_through_to_scope() {
        let mut scope = Scope::new();
        scope.new_var("X");
        scope
            .tensor_mut("X")
            .expect("X exists")
            .set_from_array(&[4.0], &[1], Place::Cpu)
            .expect("bind should succeed");
        assert_eq!(scope.tensor("X").expect("X exists").values(), &[4.0]);
        assert!(scope.contains("X"));
        assert_eq!(scope.var_names().collect::<Vec<_>>(), vec!["X"]);
    }
}
