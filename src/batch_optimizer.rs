//! Groups operations into batches respecting dependency order, lock-class
//! separation, and a memory cap, per §4.3. Dependency extraction mirrors the
//! teacher's `StatementSummary::created_objects`/`lock_targets` idiom, generalized
//! from `lints/ast.rs`'s live-parse approach to the `MigrationOperation` model.

use serde::Serialize;

use crate::config::BatchConfig;
use crate::pg_types::operation::{MigrationOperation, OperationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatchType {
    Schema,
    Data,
    Index,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionMode {
    Explicit,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RollbackPolicy {
    Immediate,
    Deferred,
}

#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub operation_indices: Vec<usize>,
    pub batch_type: BatchType,
    pub transaction_mode: TransactionMode,
    pub requires_exclusive_lock: bool,
    pub can_run_concurrently: bool,
    pub rollback_policy: RollbackPolicy,
    pub estimated_memory_mb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPlan {
    pub batches: Vec<Batch>,
}

fn is_schema_op(kind: OperationKind) -> bool {
    !matches!(
        kind,
        OperationKind::Insert | OperationKind::Update | OperationKind::Delete | OperationKind::Select
    )
}

fn is_risky(op: &MigrationOperation) -> bool {
    matches!(
        op.kind,
        OperationKind::DropTable | OperationKind::AlterColumn | OperationKind::RenameTable
    )
}

/// Rough memory cost in MB for holding one operation's plan/lock state; indexes
/// and table rewrites cost far more than simple column adds.
fn estimated_memory_mb(op: &MigrationOperation) -> f64 {
    match op.kind {
        OperationKind::CreateIndex | OperationKind::CreateIndexConcurrent | OperationKind::Reindex => 32.0,
        OperationKind::AlterColumn => 48.0,
        OperationKind::CreateTable | OperationKind::AddColumn | OperationKind::AddConstraint => 4.0,
        _ => 1.0,
    }
}

/// True if `b` depends on `a` completing first: `a` creates a table that `b`
/// references (via a shared affected table) by adding a column, index, or
/// constraint to it, or `b` is a foreign-key add that targets a table `a` just
/// created.
fn depends_on(a: &MigrationOperation, b: &MigrationOperation) -> bool {
    if a.kind != OperationKind::CreateTable {
        return false;
    }
    let creates_shared_table = !a.affected_tables.is_disjoint(&b.affected_tables);
    creates_shared_table
        && matches!(
            b.kind,
            OperationKind::AddColumn
                | OperationKind::AddConstraint
                | OperationKind::CreateIndex
                | OperationKind::CreateIndexConcurrent
        )
}

/// Two operations may share a batch when they touch the same table with the
/// same lock class and neither is individually risky.
fn compatible(a: &MigrationOperation, b: &MigrationOperation, allow_concurrent_schema: bool) -> bool {
    if is_risky(a) || is_risky(b) {
        return false;
    }
    if is_schema_op(a.kind) != is_schema_op(b.kind) && !allow_concurrent_schema {
        return false;
    }
    a.lock_level == b.lock_level
}

fn batch_type_for(kind: OperationKind) -> BatchType {
    match kind {
        OperationKind::CreateIndex | OperationKind::CreateIndexConcurrent | OperationKind::DropIndex
        | OperationKind::Reindex => BatchType::Index,
        OperationKind::Insert | OperationKind::Update | OperationKind::Delete | OperationKind::Select => {
            BatchType::Data
        }
        _ => BatchType::Schema,
    }
}

pub fn optimize(operations: &[MigrationOperation], config: &BatchConfig) -> BatchPlan {
    let mut batches: Vec<Batch> = Vec::new();

    'outer: for (idx, op) in operations.iter().enumerate() {
        let blocked_by_dependency = operations[..idx]
            .iter()
            .enumerate()
            .any(|(j, other)| depends_on(other, op) && !batches.iter().any(|b| b.operation_indices.contains(&j)));

        if !blocked_by_dependency && !is_risky(op) {
            for batch in batches.iter_mut() {
                let last_idx = *batch.operation_indices.last().unwrap();
                let last_op = &operations[last_idx];
                let projected_memory = batch.estimated_memory_mb + estimated_memory_mb(op);
                if compatible(last_op, op, config.allow_concurrent_schema)
                    && batch.batch_type == batch_type_for(op.kind)
                    && batch.operation_indices.len() < config.max_batch_size
                    && projected_memory <= config.max_memory_mb
                    && batch.transaction_mode != TransactionMode::Explicit
                {
                    batch.operation_indices.push(idx);
                    batch.estimated_memory_mb = projected_memory;
                    continue 'outer;
                }
            }
        }

        let risky = is_risky(op);
        batches.push(Batch {
            operation_indices: vec![idx],
            batch_type: batch_type_for(op.kind),
            transaction_mode: if risky {
                TransactionMode::Explicit
            } else {
                TransactionMode::Auto
            },
            requires_exclusive_lock: op.blocks_reads(),
            can_run_concurrently: op.kind == OperationKind::CreateIndexConcurrent,
            rollback_policy: if risky {
                RollbackPolicy::Immediate
            } else {
                RollbackPolicy::Deferred
            },
            estimated_memory_mb: estimated_memory_mb(op),
        });
    }

    for batch in batches.iter_mut() {
        if batch.operation_indices.len() > 1 {
            let kinds: std::collections::HashSet<bool> = batch
                .operation_indices
                .iter()
                .map(|&i| is_schema_op(operations[i].kind))
                .collect();
            if kinds.len() > 1 {
                batch.batch_type = BatchType::Mixed;
            }
        }
    }

    BatchPlan { batches }
}
