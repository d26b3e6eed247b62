//! Pre-publish validation of leaf records.
//!
//! Two rule families: semantic-id presence for configured element kinds, and
//! per-semantic-id value constraints (`min`/`max`/`unit`/`pattern`). Numeric
//! comparisons apply only to numeric values, pattern matches only to textual
//! values. The outcome per record is Pass, Warn or Reject; `reject_invalid`
//! decides whether Reject drops the record or passes it with a warning.

use aas_uplink_core::LeafRecord;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;

/// Validation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ValidationRules {
    /// Enforcement level: 0 disables validation, 1 warns, 2 adds constraint
    /// checks at full strictness
    pub level: u8,
    /// Require a semantic id on the kinds named in `required_for_types`
    pub enforce_semantic_ids: bool,
    /// Element kinds that must carry a semantic id
    pub required_for_types: Vec<String>,
    /// Drop rejected records instead of passing them with a warning
    pub reject_invalid: bool,
    /// Per-semantic-id value constraints
    pub constraints: HashMap<String, ValueConstraint>,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            level: 0,
            enforce_semantic_ids: false,
            required_for_types: vec!["Property".to_string(), "Range".to_string()],
            reject_invalid: false,
            constraints: HashMap::new(),
        }
    }
}

/// Constraint set for one semantic id.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ValueConstraint {
    /// Inclusive lower bound for numeric values
    pub min: Option<f64>,
    /// Inclusive upper bound for numeric values
    pub max: Option<f64>,
    /// Required unit
    pub unit: Option<String>,
    /// Regex the textual value must match
    pub pattern: Option<String>,
}

/// One rule violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Stable violation category for counters and logs
    pub kind: &'static str,
    /// Human-readable description
    pub message: String,
}

/// Outcome of validating a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// No violations
    Pass,
    /// Violations found; record flows on
    Warn(Vec<Violation>),
    /// Violations found; record is dropped (`reject_invalid`)
    Reject(Vec<Violation>),
}

impl ValidationOutcome {
    /// True when the record should be dropped.
    #[must_use]
    pub fn is_reject(&self) -> bool {
        matches!(self, ValidationOutcome::Reject(_))
    }
}

/// Validator over a compiled rule set.
pub struct Validator {
    rules: ValidationRules,
    patterns: HashMap<String, Regex>,
}

impl Validator {
    /// Compile the rule set. Invalid regexes are logged and skipped.
    #[must_use]
    pub fn new(rules: ValidationRules) -> Self {
        let mut patterns = HashMap::new();
        for (semantic_id, constraint) in &rules.constraints {
            let Some(pattern) = &constraint.pattern else { continue };
            match Regex::new(pattern) {
                Ok(compiled) => {
                    patterns.insert(semantic_id.clone(), compiled);
                }
                Err(e) => {
                    tracing::warn!(semantic_id, error = %e, "Invalid constraint pattern, skipping");
                }
            }
        }
        Self { rules, patterns }
    }

    /// True when validation is enabled at all.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.rules.level >= 1
    }

    /// Validate one record.
    #[must_use]
    pub fn validate(&self, record: &LeafRecord) -> ValidationOutcome {
        if self.rules.level == 0 {
            return ValidationOutcome::Pass;
        }

        let mut violations = Vec::new();
        self.check_semantic_presence(record, &mut violations);
        if record.semantic_id.is_some() {
            self.check_constraints(record, &mut violations);
        }

        if violations.is_empty() {
            ValidationOutcome::Pass
        } else if self.rules.reject_invalid {
            ValidationOutcome::Reject(violations)
        } else {
            ValidationOutcome::Warn(violations)
        }
    }

    fn check_semantic_presence(&self, record: &LeafRecord, violations: &mut Vec<Violation>) {
        if !self.rules.enforce_semantic_ids || record.semantic_id.is_some() {
            return;
        }
        if self
            .rules
            .required_for_types
            .iter()
            .any(|t| t == record.kind.as_str())
        {
            violations.push(Violation {
                kind: "missing_semantic_id",
                message: format!("{} element requires a semantic id", record.kind),
            });
        }
    }

    fn check_constraints(&self, record: &LeafRecord, violations: &mut Vec<Violation>) {
        let Some(semantic_id) = record.semantic_id.as_deref() else { return };
        let Some(constraint) = self.rules.constraints.get(semantic_id) else { return };

        if let Some(value) = record.value.as_f64() {
            if let Some(min) = constraint.min {
                if value < min {
                    violations.push(Violation {
                        kind: "value_out_of_range",
                        message: format!("value {value} is below minimum {min}"),
                    });
                }
            }
            if let Some(max) = constraint.max {
                if value > max {
                    violations.push(Violation {
                        kind: "value_out_of_range",
                        message: format!("value {value} exceeds maximum {max}"),
                    });
                }
            }
        }

        if let Some(required_unit) = &constraint.unit {
            if record.unit.as_deref() != Some(required_unit.as_str()) {
                violations.push(Violation {
                    kind: "unit_mismatch",
                    message: format!(
                        "unit {:?} does not match required '{required_unit}'",
                        record.unit
                    ),
                });
            }
        }

        if let (Some(pattern), Some(text)) =
            (self.patterns.get(semantic_id), record.value.as_text())
        {
            if !pattern.is_match(text) {
                violations.push(Violation {
                    kind: "pattern_mismatch",
                    message: format!("value '{text}' does not match constraint pattern"),
                });
            }
        }
    }
}
