//! Post-run verification: schema checksums, schema diffing, data-integrity spot
//! checks, rollback-trigger validation, and a performance-baseline comparison.
//! Checksum canonicalization follows the same "stable, whitespace-insensitive
//! projection of catalog state" idea the teacher's doc-snapshot rendering uses
//! for comparing two runs of the same migration, generalized from a rendered
//! document into a `sha2` digest over a canonical schema serialization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::config::VerifierConfig;
use crate::connection::Connection;
use crate::error::{ErrorKind, Result};
use crate::event_bus::EventPublisher;

/// A canonicalized snapshot of one table's shape: column name/type pairs and
/// constraint names, sorted so that two logically identical schemas always
/// serialize identically regardless of catalog scan order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableShape>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TableShape {
    pub columns: BTreeMap<String, String>,
    pub constraints: Vec<String>,
}

impl SchemaSnapshot {
    /// Deterministic sha256 over the canonical JSON serialization. `BTreeMap`
    /// iteration order and `Vec<String>` sorting upstream make this pure: the
    /// same logical schema always hashes the same regardless of catalog scan
    /// order.
    pub fn checksum(&self) -> String {
        let mut canonical = self.clone();
        for shape in canonical.tables.values_mut() {
            shape.constraints.sort();
        }
        let bytes = serde_json::to_vec(&canonical).expect("schema snapshot always serializes");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiffKind {
    TableAdded,
    TableRemoved,
    ColumnAdded,
    ColumnRemoved,
    ColumnTypeChanged,
    ConstraintAdded,
    ConstraintRemoved,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaDiffEntry {
    pub kind: DiffKind,
    pub table: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerificationStatus {
    Passed,
    Improved,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceComparison {
    pub baseline_ms: f64,
    pub observed_ms: f64,
    pub delta_ratio: f64,
    pub status: VerificationStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub checksum_before: String,
    pub checksum_after: String,
    pub checksum_matches_expected: Option<bool>,
    pub schema_diff: Vec<SchemaDiffEntry>,
    pub data_integrity_issues: Vec<String>,
    pub rollback_trigger_valid: Option<bool>,
    pub performance: Option<PerformanceComparison>,
    pub overall: VerificationStatus,
}

/// A schema-diff entry that represents a destructive, non-additive change —
/// the cases a strict-mode caller should treat as a schema comparison failure
/// rather than a mere informational diff.
fn is_destructive(kind: DiffKind) -> bool {
    matches!(kind, DiffKind::TableRemoved | DiffKind::ColumnRemoved)
}

/// Diff two schema snapshots into a list of typed, table-scoped differences.
pub fn diff_schemas(before: &SchemaSnapshot, after: &SchemaSnapshot) -> Vec<SchemaDiffEntry> {
    let mut entries = Vec::new();

    for (table, _) in &before.tables {
        if !after.tables.contains_key(table) {
            entries.push(SchemaDiffEntry {
                kind: DiffKind::TableRemoved,
                table: table.clone(),
                detail: format!("table {} no longer present", table),
            });
        }
    }
    for (table, after_shape) in &after.tables {
        let Some(before_shape) = before.tables.get(table) else {
            entries.push(SchemaDiffEntry {
                kind: DiffKind::TableAdded,
                table: table.clone(),
                detail: format!("table {} is new", table),
            });
            continue;
        };

        for (col, ty) in &after_shape.columns {
            match before_shape.columns.get(col) {
                None => entries.push(SchemaDiffEntry {
                    kind: DiffKind::ColumnAdded,
                    table: table.clone(),
                    detail: format!("{}.{} ({})", table, col, ty),
                }),
                Some(before_ty) if before_ty != ty => entries.push(SchemaDiffEntry {
                    kind: DiffKind::ColumnTypeChanged,
                    table: table.clone(),
                    detail: format!("{}.{}: {} -> {}", table, col, before_ty, ty),
                }),
                _ => {}
            }
        }
        for col in before_shape.columns.keys() {
            if !after_shape.columns.contains_key(col) {
                entries.push(SchemaDiffEntry {
                    kind: DiffKind::ColumnRemoved,
                    table: table.clone(),
                    detail: format!("{}.{}", table, col),
                });
            }
        }

        let before_constraints: std::collections::BTreeSet<_> = before_shape.constraints.iter().collect();
        let after_constraints: std::collections::BTreeSet<_> = after_shape.constraints.iter().collect();
        for added in after_constraints.difference(&before_constraints) {
            entries.push(SchemaDiffEntry {
                kind: DiffKind::ConstraintAdded,
                table: table.clone(),
                detail: (*added).clone(),
            });
        }
        for removed in before_constraints.difference(&after_constraints) {
            entries.push(SchemaDiffEntry {
                kind: DiffKind::ConstraintRemoved,
                table: table.clone(),
                detail: (*removed).clone(),
            });
        }
    }

    entries
}

/// Drives post-migration verification over one [`Connection`] used to run
/// spot-check queries and rollback-trigger probes.
pub struct MigrationVerifier<C: Connection, P: EventPublisher> {
    connection: C,
    publisher: P,
    config: VerifierConfig,
}

impl<C: Connection, P: EventPublisher> MigrationVerifier<C, P> {
    pub fn new(connection: C, publisher: P, config: VerifierConfig) -> Self {
        MigrationVerifier {
            connection,
            publisher,
            config,
        }
    }

    /// Run one data-integrity spot check: a row-count query expected to return
    /// a specific value. Returns a human-readable issue string on mismatch.
    pub async fn spot_check_row_count(&self, table: &str, expected: i64) -> Result<Option<String>> {
        let rows = self
            .connection
            .query(&format!("SELECT count(*) AS n FROM {}", table))
            .await?;
        let actual = rows.first().and_then(|r| r.get_i64("n")).unwrap_or(-1);
        if actual != expected {
            return Ok(Some(format!(
                "{}: expected {} rows, found {}",
                table, expected, actual
            )));
        }
        Ok(None)
    }

    /// Confirm a named trigger used to support online rollback still exists and
    /// is enabled, via `pg_trigger.tgenabled`.
    pub async fn validate_rollback_trigger(&self, trigger_name: &str) -> Result<bool> {
        let rows = self
            .connection
            .query(&format!(
                "SELECT tgenabled FROM pg_trigger WHERE tgname = '{}'",
                trigger_name
            ))
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get_str("tgenabled"))
            .map(|s| s != "D")
            .unwrap_or(false))
    }

    fn compare_performance(&self, baseline_ms: f64, observed_ms: f64) -> PerformanceComparison {
        let delta_ratio = if baseline_ms > 0.0 {
            (observed_ms - baseline_ms) / baseline_ms
        } else {
            0.0
        };
        let threshold = self.config.performance_regression_threshold;
        let status = if delta_ratio > threshold {
            VerificationStatus::Degraded
        } else if delta_ratio < -threshold {
            VerificationStatus::Improved
        } else {
            VerificationStatus::Passed
        };
        PerformanceComparison {
            baseline_ms,
            observed_ms,
            delta_ratio,
            status,
        }
    }

    #[instrument(skip(self, before, after, integrity_checks))]
    pub async fn verify(
        &self,
        before: &SchemaSnapshot,
        after: &SchemaSnapshot,
        integrity_checks: &[(String, i64)],
        rollback_trigger: Option<&str>,
        performance_baseline_ms: Option<(f64, f64)>,
        expected_checksum: Option<&str>,
    ) -> Result<VerificationResult> {
        let checksum_before = before.checksum();
        let checksum_after = after.checksum();
        // Compare to expected if provided; missing expected means this check
        // is skipped rather than treated as a mismatch.
        let checksum_matches_expected = expected_checksum.map(|expected| expected == checksum_after);
        let schema_diff = diff_schemas(before, after);
        let destructive_diff = schema_diff.iter().find(|d| is_destructive(d.kind));

        let mut data_integrity_issues = Vec::new();
        for (table, expected) in integrity_checks {
            if let Some(issue) = self.spot_check_row_count(table, *expected).await? {
                data_integrity_issues.push(issue);
            }
        }

        let rollback_trigger_valid = match rollback_trigger {
            Some(name) => Some(self.validate_rollback_trigger(name).await?),
            None => None,
        };

        let performance = performance_baseline_ms.map(|(baseline, observed)| {
            self.compare_performance(baseline, observed)
        });

        let overall = if checksum_matches_expected == Some(false)
            || destructive_diff.is_some()
            || !data_integrity_issues.is_empty()
            || rollback_trigger_valid == Some(false)
        {
            VerificationStatus::Failed
        } else if matches!(
            performance.as_ref().map(|p| p.status),
            Some(VerificationStatus::Degraded)
        ) {
            VerificationStatus::Degraded
        } else if matches!(
            performance.as_ref().map(|p| p.status),
            Some(VerificationStatus::Improved)
        ) {
            VerificationStatus::Improved
        } else {
            VerificationStatus::Passed
        };

        self.publisher.emit(
            "VerificationCompleted",
            json!({"overall": format!("{:?}", overall), "diff_count": schema_diff.len()}),
        );

        if self.config.strict && overall == VerificationStatus::Failed {
            if checksum_matches_expected == Some(false) {
                return Err(ErrorKind::ChecksumMismatch {
                    expected: expected_checksum.unwrap_or_default().to_string(),
                    actual: checksum_after,
                }
                .into());
            }
            if let Some(entry) = destructive_diff {
                return Err(ErrorKind::SchemaComparisonError(entry.detail.clone()).into());
            }
            return Err(ErrorKind::DataIntegrityError(data_integrity_issues.join("; ")).into());
        }

        Ok(VerificationResult {
            checksum_before,
            checksum_after,
            checksum_matches_expected,
            schema_diff,
            data_integrity_issues,
            rollback_trigger_valid,
            performance,
            overall,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Row, ScriptedConnection, ScriptedResponse};
    use crate::event_bus::EventBus;
    use std::collections::HashMap;

    fn snapshot_with(table: &str, columns: &[(&str, &str)]) -> SchemaSnapshot {
        let mut snap = SchemaSnapshot::default();
        snap.tables.insert(
            table.to_string(),
            TableShape {
                columns: columns.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                constraints: vec![],
            },
        );
        snap
    }

    #[test]
    fn test_identical_snapshots_produce_identical_checksums() {
        let a = snapshot_with("users", &[("id", "int4"), ("email", "text")]);
        let b = snapshot_with("users", &[("id", "int4"), ("email", "text")]);
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_checksum_is_sensitive_to_column_type_change() {
        let a = snapshot_with("users", &[("id", "int4")]);
        let b = snapshot_with("users", &[("id", "int8")]);
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_diff_detects_added_column() {
        let before = snapshot_with("users", &[("id", "int4")]);
        let after = snapshot_with("users", &[("id", "int4"), ("email", "text")]);
        let diff = diff_schemas(&before, &after);
        assert!(diff.iter().any(|d| d.kind == DiffKind::ColumnAdded));
    }

    #[test]
    fn test_diff_detects_removed_table() {
        let before = snapshot_with("users", &[("id", "int4")]);
        let after = SchemaSnapshot::default();
        let diff = diff_schemas(&before, &after);
        assert!(diff.iter().any(|d| d.kind == DiffKind::TableRemoved));
    }

    #[tokio::test]
    async fn test_row_count_mismatch_is_reported_as_integrity_issue() {
        let mut cols = HashMap::new();
        cols.insert("n".to_string(), serde_json::Value::from(5));
        let conn = ScriptedConnection::new(1, vec![ScriptedResponse::Query(vec![Row::new(cols)])]);
        let bus = EventBus::new(16);
        let verifier = MigrationVerifier::new(conn, bus.publisher("run"), VerifierConfig::default());
        let issue = verifier.spot_check_row_count("users", 10).await.unwrap();
        assert!(issue.unwrap().contains("expected 10"));
    }

    #[tokio::test]
    async fn test_verify_reports_degraded_performance() {
        let conn = ScriptedConnection::new(1, vec![]);
        let bus = EventBus::new(16);
        let verifier = MigrationVerifier::new(conn, bus.publisher("run"), VerifierConfig::default());
        let before = snapshot_with("users", &[("id", "int4")]);
        let after = snapshot_with("users", &[("id", "int4")]);
        let result = verifier
            .verify(&before, &after, &[], None, Some((100.0, 200.0)), None)
            .await
            .unwrap();
        assert_eq!(result.overall, VerificationStatus::Degraded);
    }

    #[tokio::test]
    async fn test_strict_mode_escalates_failed_verification_to_error() {
        let mut cols = HashMap::new();
        cols.insert("n".to_string(), serde_json::Value::from(0));
        let conn = ScriptedConnection::new(1, vec![ScriptedResponse::Query(vec![Row::new(cols)])]);
        let bus = EventBus::new(16);
        let mut config = VerifierConfig::default();
        config.strict = true;
        let verifier = MigrationVerifier::new(conn, bus.publisher("run"), config);
        let before = SchemaSnapshot::default();
        let after = SchemaSnapshot::default();
        let result = verifier
            .verify(&before, &after, &[("users".to_string(), 5)], None, None, None)
            .await;
        assert!(matches!(
            result.unwrap_err().kind(),
            ErrorKind::DataIntegrityError(_)
        ));
    }

    #[tokio::test]
    async fn test_strict_mode_raises_checksum_mismatch() {
        let conn = ScriptedConnection::new(1, vec![]);
        let bus = EventBus::new(16);
        let mut config = VerifierConfig::default();
        config.strict = true;
        let verifier = MigrationVerifier::new(conn, bus.publisher("run"), config);
        let before = snapshot_with("users", &[("id", "int4")]);
        let after = snapshot_with("users", &[("id", "int4")]);
        let result = verifier
            .verify(&before, &after, &[], None, None, Some("not-the-real-checksum"))
            .await;
        assert!(matches!(
            result.unwrap_err().kind(),
            ErrorKind::ChecksumMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_matching_expected_checksum_passes() {
        let conn = ScriptedConnection::new(1, vec![]);
        let bus = EventBus::new(16);
        let verifier = MigrationVerifier::new(conn, bus.publisher("run"), VerifierConfig::default());
        let before = snapshot_with("users", &[("id", "int4")]);
        let after = snapshot_with("users", &[("id", "int4")]);
        let expected = after.checksum();
        let result = verifier
            .verify(&before, &after, &[], None, None, Some(&expected))
            .await
            .unwrap();
        assert_eq!(result.checksum_matches_expected, Some(true));
        assert_eq!(result.overall, VerificationStatus::Passed);
    }

    #[tokio::test]
    async fn test_strict_mode_raises_schema_comparison_error_on_column_removal() {
        let conn = ScriptedConnection::new(1, vec![]);
        let bus = EventBus::new(16);
        let mut config = VerifierConfig::default();
        config.strict = true;
        let verifier = MigrationVerifier::new(conn, bus.publisher("run"), config);
        let before = snapshot_with("users", &[("id", "int4"), ("legacy_flag", "bool")]);
        let after = snapshot_with("users", &[("id", "int4")]);
        let result = verifier.verify(&before, &after, &[], None, None, None).await;
        assert!(matches!(
            result.unwrap_err().kind(),
            ErrorKind::SchemaComparisonError(_)
        ));
    }
}
