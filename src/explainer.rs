//! Static, per-operation classification: the first stage any operation set goes
//! through. Pure function of each operation's SQL and kind, grounded on the
//! teacher's hint-table idiom (`hint_data.rs`/`hints.rs`) generalized from a
//! live-trace input to a static `MigrationOperation` input.

use serde::Serialize;

use crate::pg_types::lock_modes::LockMode;
use crate::pg_types::operation::{MigrationOperation, OperationKind, RiskLevel};

#[derive(Debug, Clone, Serialize)]
pub struct ExplainedOperation {
    pub kind: OperationKind,
    pub affected_tables: Vec<String>,
    pub lock_level: LockMode,
    pub risk_level: RiskLevel,
    pub estimated_duration_ms: u64,
    pub blocks_reads: bool,
    pub blocks_writes: bool,
    pub impact: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExplainSummary {
    pub operations: Vec<ExplainedOperation>,
    pub risk_counts: RiskCounts,
    pub blocking_operations: Vec<usize>,
    pub overall_risk: RiskLevel,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskCounts {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
}

impl RiskCounts {
    fn record(&mut self, level: RiskLevel) {
        match level {
            RiskLevel::Low => self.low += 1,
            RiskLevel::Medium => self.medium += 1,
            RiskLevel::High => self.high += 1,
            RiskLevel::Critical => self.critical += 1,
        }
    }
}

fn impact_text(op: &MigrationOperation) -> String {
    let tables = if op.affected_tables.is_empty() {
        "unknown relations".to_string()
    } else {
        op.affected_tables.iter().cloned().collect::<Vec<_>>().join(", ")
    };
    format!(
        "{:?} on {} takes a {} lock ({})",
        op.kind,
        tables,
        op.lock_level,
        if op.blocks_reads() {
            "blocks reads"
        } else if op.blocks_writes() {
            "blocks writes only"
        } else {
            "does not block normal traffic"
        }
    )
}

/// Recommendations for one operation, following the contract's rules: suggest
/// `CONCURRENTLY` for plain index builds, `NOT VALID` for foreign keys on large
/// tables, and a maintenance window for critical operations on large tables.
fn recommendations_for(op: &MigrationOperation, estimated_rows: Option<u64>) -> Vec<String> {
    let mut out = Vec::new();
    if op.kind == OperationKind::CreateIndex {
        out.push(
            "Consider CREATE INDEX CONCURRENTLY to avoid blocking writes on this table"
                .to_string(),
        );
    }
    if op.kind == OperationKind::AddConstraint && op.sql.to_ascii_uppercase().contains("FOREIGN KEY")
    {
        out.push(
            "Consider adding the foreign key with NOT VALID and validating it separately \
             to avoid a full-table scan under an exclusive lock"
                .to_string(),
        );
    }
    if op.risk_level == RiskLevel::Critical && estimated_rows.unwrap_or(0) > 10_000_000 {
        out.push(
            "This operation targets a very large table and should run in a maintenance window"
                .to_string(),
        );
    }
    if op.kind == OperationKind::AlterColumn {
        out.push(
            "A column type change rewrites the whole table; split into add-column, \
             backfill, swap, drop-old-column steps if the table is large"
                .to_string(),
        );
    }
    out
}

/// Statically classify one operation (already-parsed `MigrationOperation`, or raw SQL).
pub fn explain_operation(op: &MigrationOperation, estimated_rows: Option<u64>) -> ExplainedOperation {
    ExplainedOperation {
        kind: op.kind,
        affected_tables: op.affected_tables.iter().cloned().collect(),
        lock_level: op.lock_level,
        risk_level: op.risk_level,
        estimated_duration_ms: op.estimated_duration_ms,
        blocks_reads: op.blocks_reads(),
        blocks_writes: op.blocks_writes(),
        impact: impact_text(op),
        recommendations: recommendations_for(op, estimated_rows),
    }
}

/// Classify a full operation set and aggregate a summary.
pub fn explain(operations: &[MigrationOperation], estimated_rows: Option<u64>) -> ExplainSummary {
    let mut risk_counts = RiskCounts::default();
    let mut blocking_operations = Vec::new();
    let mut recommendations = Vec::new();
    let mut explained = Vec::with_capacity(operations.len());

    for (idx, op) in operations.iter().enumerate() {
        let e = explain_operation(op, estimated_rows);
        risk_counts.record(e.risk_level);
        if e.blocks_reads {
            blocking_operations.push(idx);
        }
        recommendations.extend(e.recommendations.clone());
        explained.push(e);
    }

    let overall_risk = if risk_counts.critical > 0 {
        RiskLevel::Critical
    } else if risk_counts.high > 0 {
        RiskLevel::High
    } else if risk_counts.medium > 0 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    ExplainSummary {
        operations: explained,
        risk_counts,
        blocking_operations,
        overall_risk,
        recommendations,
    }
}
