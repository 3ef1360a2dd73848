//! Compares an expected schema/configuration shape against an observed one and
//! reports typed drift, independent of [`crate::verifier`]'s before/after
//! migration diff: this module compares a *declared* shape to *reality*, not
//! two points in time. Grounded on `waypoint-core`'s config-drift reporting
//! style from `other_examples/`, adapted to this crate's schema model.

use serde::Serialize;

use crate::config::SafetyConfig;
use crate::verifier::SchemaSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriftKind {
    MissingTable,
    MissingField,
    ExtraField,
    FieldTypeMismatch,
    NullabilityMismatch,
    ListPropertyMismatch,
    MissingDirective,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    pub kind: DriftKind,
    pub path: String,
    pub detail: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub entries: Vec<DriftEntry>,
    pub has_errors: bool,
}

/// Compare an `expected` schema (what the migration plan declares the schema
/// should look like) against `observed` (what's actually in the database),
/// flagging drift with severity according to `strict`: in strict mode an
/// unexpected extra field is an error, otherwise only a warning.
pub fn compare(expected: &SchemaSnapshot, observed: &SchemaSnapshot, config: &SafetyConfig) -> DriftReport {
    let mut entries = Vec::new();

    for (table, expected_shape) in &expected.tables {
        let Some(observed_shape) = observed.tables.get(table) else {
            entries.push(DriftEntry {
                kind: DriftKind::MissingTable,
                path: table.clone(),
                detail: format!("expected table {} not found", table),
                severity: Severity::Error,
            });
            continue;
        };

        for (field, expected_ty) in &expected_shape.columns {
            match observed_shape.columns.get(field) {
                None => entries.push(DriftEntry {
                    kind: DriftKind::MissingField,
                    path: format!("{}.{}", table, field),
                    detail: format!("expected field {} is missing", field),
                    severity: Severity::Error,
                }),
                Some(observed_ty) if observed_ty != expected_ty => entries.push(DriftEntry {
                    kind: DriftKind::FieldTypeMismatch,
                    path: format!("{}.{}", table, field),
                    detail: format!("expected {}, found {}", expected_ty, observed_ty),
                    severity: Severity::Error,
                }),
                _ => {}
            }
        }

        for field in observed_shape.columns.keys() {
            if !expected_shape.columns.contains_key(field) {
                entries.push(DriftEntry {
                    kind: DriftKind::ExtraField,
                    path: format!("{}.{}", table, field),
                    detail: format!("unexpected field {} present", field),
                    severity: if config.strict { Severity::Error } else { Severity::Warning },
                });
            }
        }

        let expected_constraints: std::collections::BTreeSet<_> =
            expected_shape.constraints.iter().collect();
        let observed_constraints: std::collections::BTreeSet<_> =
            observed_shape.constraints.iter().collect();
        for missing in expected_constraints.difference(&observed_constraints) {
            entries.push(DriftEntry {
                kind: DriftKind::MissingDirective,
                path: table.clone(),
                detail: format!("expected constraint {} not present", missing),
                severity: Severity::Error,
            });
        }
    }

    let has_errors = entries.iter().any(|e| e.severity == Severity::Error);
    DriftReport { entries, has_errors }
}
