//! Orchestrates `CREATE INDEX CONCURRENTLY` builds: these cannot run inside a
//! transaction block and can fail leaving an invalid index behind, so they get
//! their own state machine instead of going through [`crate::transaction`].
//! Grounded on the teacher's index-related lint data (`hint_data.rs`'s coverage
//! of `CREATE INDEX CONCURRENTLY`/duplicate-index detection), reworked from a
//! static lint into a live retry-and-cleanup orchestrator.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{instrument, warn};

use crate::config::CicConfig;
use crate::connection::Connection;
use crate::error::{ContextualResult, Result};
use crate::event_bus::EventPublisher;

#[derive(Debug, Clone, Serialize)]
pub struct CicOperation {
    pub index_name: String,
    pub table_name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
    pub is_partial: bool,
    pub predicate: Option<String>,
    pub method: String,
    pub priority: i64,
}

impl CicOperation {
    pub fn build_sql(&self) -> String {
        let unique = if self.is_unique { "UNIQUE " } else { "" };
        let predicate = self
            .predicate
            .as_ref()
            .map(|p| format!(" WHERE {}", p))
            .unwrap_or_default();
        format!(
            "CREATE {unique}INDEX CONCURRENTLY {name} ON {table} USING {method} ({cols}){predicate}",
            unique = unique,
            name = self.index_name,
            table = self.table_name,
            method = self.method,
            cols = self.columns.join(", "),
            predicate = predicate,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CicStrategy {
    Sequential,
    TableParallel,
    PriorityBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CicOutcome {
    Created,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CicResult {
    pub index_name: String,
    pub outcome: CicOutcome,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CicOrchestrationReport {
    pub results: Vec<CicResult>,
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Drives a set of `CREATE INDEX CONCURRENTLY` builds, one connection at a
/// time (real table-parallelism needs one connection per table; this
/// orchestrator's `TableParallel`/`PriorityBased` strategies only affect
/// ordering here, since it owns a single [`Connection`]).
pub struct CicOrchestrator<C: Connection, P: EventPublisher> {
    connection: C,
    publisher: P,
    config: CicConfig,
    cancelled: AtomicBool,
}

impl<C: Connection, P: EventPublisher> CicOrchestrator<C, P> {
    pub fn new(connection: C, publisher: P, config: CicConfig) -> Self {
        CicOrchestrator {
            connection,
            publisher,
            config,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// True if an index with this name already exists and is valid, per
    /// `pg_index.indisvalid`; used both for the pre-flight skip and to decide
    /// whether a leftover invalid index needs cleaning up before retrying.
    async fn index_status(&self, index_name: &str) -> Result<Option<bool>> {
        let sql = format!(
            "SELECT indisvalid FROM pg_index i JOIN pg_class c ON c.oid = i.indexrelid \
             WHERE c.relname = '{}'",
            index_name
        );
        let rows = self
            .connection
            .query(&sql)
            .await
            .with_context("checking existing index validity")?;
        Ok(rows.first().and_then(|r| r.get_bool("indisvalid")))
    }

    async fn drop_invalid_index(&self, index_name: &str) -> Result<()> {
        self.connection
            .execute(&format!("DROP INDEX CONCURRENTLY IF EXISTS {}", index_name))
            .await
            .with_context("dropping invalid leftover index")?;
        Ok(())
    }

    fn order_for_strategy(&self, operations: &[CicOperation], strategy: CicStrategy) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..operations.len()).collect();
        match strategy {
            CicStrategy::Sequential => {}
            CicStrategy::PriorityBased => {
                indices.sort_by(|&a, &b| operations[b].priority.cmp(&operations[a].priority));
            }
            CicStrategy::TableParallel => {
                let mut seen_tables: BTreeSet<String> = BTreeSet::new();
                indices.sort_by_key(|&i| {
                    let first_for_table = !seen_tables.contains(&operations[i].table_name);
                    seen_tables.insert(operations[i].table_name.clone());
                    (!first_for_table, i)
                });
            }
        }
        indices
    }

    #[instrument(skip(self, op))]
    async fn run_one(&self, op: &CicOperation) -> CicResult {
        self.publisher
            .emit("CICOperationStarted", json!({"index_name": op.index_name}));

        match self.index_status(&op.index_name).await {
            Ok(Some(true)) => {
                self.publisher
                    .emit("CICOperationSkipped", json!({"index_name": op.index_name, "reason": "already valid"}));
                return CicResult {
                    index_name: op.index_name.clone(),
                    outcome: CicOutcome::Skipped,
                    attempts: 0,
                    error: None,
                };
            }
            Ok(Some(false)) => {
                if let Err(e) = self.drop_invalid_index(&op.index_name).await {
                    warn!(index = %op.index_name, error = %e, "failed to clean up invalid index before retry");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(index = %op.index_name, error = %e, "failed to check existing index status");
            }
        }

        let mut attempt = 0u32;
        loop {
            if self.is_cancelled() {
                return CicResult {
                    index_name: op.index_name.clone(),
                    outcome: CicOutcome::Failed,
                    attempts: attempt,
                    error: Some("cancelled".to_string()),
                };
            }
            attempt += 1;
            match self.connection.execute(&op.build_sql()).await {
                Ok(_) => {
                    self.publisher
                        .emit("CICOperationCompleted", json!({"index_name": op.index_name, "attempts": attempt}));
                    return CicResult {
                        index_name: op.index_name.clone(),
                        outcome: CicOutcome::Created,
                        attempts: attempt,
                        error: None,
                    };
                }
                Err(e) if attempt <= self.config.max_retries_per_operation => {
                    let _ = self.drop_invalid_index(&op.index_name).await;
                    let backoff_ms = (self.config.backoff_multiplier.powi(attempt as i32) * 10.0)
                        .min(self.config.max_backoff_ms as f64) as u64;
                    warn!(index = %op.index_name, attempt, error = %e, "retrying CREATE INDEX CONCURRENTLY");
                    self.publisher.emit(
                        "CICOperationFailed",
                        json!({"index_name": op.index_name, "attempts": attempt, "error": e.to_string(), "willRetry": true}),
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    let _ = self.drop_invalid_index(&op.index_name).await;
                    self.publisher.emit(
                        "CICOperationFailed",
                        json!({"index_name": op.index_name, "attempts": attempt, "error": e.to_string(), "willRetry": false}),
                    );
                    return CicResult {
                        index_name: op.index_name.clone(),
                        outcome: CicOutcome::Failed,
                        attempts: attempt,
                        error: Some(e.to_string()),
                    };
                }
            }
        }
    }

    #[instrument(skip(self, operations))]
    pub async fn orchestrate(
        &self,
        operations: &[CicOperation],
        strategy: CicStrategy,
    ) -> CicOrchestrationReport {
        self.publisher.emit(
            "CICOrchestrationStarted",
            json!({"count": operations.len(), "strategy": format!("{:?}", strategy)}),
        );

        let order = self.order_for_strategy(operations, strategy);
        let mut results = Vec::with_capacity(operations.len());
        let mut scheduled_names: BTreeSet<String> = BTreeSet::new();
        for idx in order {
            let op = &operations[idx];
            if !scheduled_names.insert(op.index_name.clone()) {
                self.publisher.emit(
                    "CICOperationSkipped",
                    json!({"index_name": op.index_name, "reason": "Duplicate index name"}),
                );
                results.push(CicResult {
                    index_name: op.index_name.clone(),
                    outcome: CicOutcome::Skipped,
                    attempts: 0,
                    error: None,
                });
                continue;
            }
            results.push(self.run_one(op).await);
        }

        let created = results.iter().filter(|r| r.outcome == CicOutcome::Created).count();
        let skipped = results.iter().filter(|r| r.outcome == CicOutcome::Skipped).count();
        let failed = results.iter().filter(|r| r.outcome == CicOutcome::Failed).count();

        self.publisher.emit(
            "CICOrchestrationCompleted",
            json!({"created": created, "skipped": skipped, "failed": failed}),
        );

        CicOrchestrationReport {
            results,
            created,
            skipped,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Row, ScriptedConnection, ScriptedResponse};
    use crate::event_bus::EventBus;
    use std::collections::HashMap;

    fn op(name: &str, table: &str, priority: i64) -> CicOperation {
        CicOperation {
            index_name: name.to_string(),
            table_name: table.to_string(),
            columns: vec!["email".to_string()],
            is_unique: false,
            is_partial: false,
            predicate: None,
            method: "btree".to_string(),
            priority,
        }
    }

    #[tokio::test]
    async fn test_three_operations_all_succeed_sequentially() {
        let conn = ScriptedConnection::new(
            1,
            vec![
                ScriptedResponse::Query(vec![]), // status check for op 1
                ScriptedResponse::Execute(0),    // create op 1
                ScriptedResponse::Query(vec![]), // status check for op 2
                ScriptedResponse::Execute(0),    // create op 2
                ScriptedResponse::Query(vec![]), // status check for op 3
                ScriptedResponse::Execute(0),    // create op 3
            ],
        );
        let bus = EventBus::new(16);
        let orchestrator = CicOrchestrator::new(conn, bus.publisher("run"), CicConfig::default());
        let ops = vec![op("idx_a", "t1", 0), op("idx_b", "t2", 0), op("idx_c", "t3", 0)];
        let report = orchestrator.orchestrate(&ops, CicStrategy::Sequential).await;
        assert_eq!(report.created, 3);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_already_valid_index_is_skipped() {
        let mut cols = HashMap::new();
        cols.insert("indisvalid".to_string(), serde_json::Value::from(true));
        let conn = ScriptedConnection::new(
            1,
            vec![ScriptedResponse::Query(vec![Row::new(cols)])],
        );
        let bus = EventBus::new(16);
        let orchestrator = CicOrchestrator::new(conn, bus.publisher("run"), CicConfig::default());
        let ops = vec![op("idx_a", "t1", 0)];
        let report = orchestrator.orchestrate(&ops, CicStrategy::Sequential).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.created, 0);
    }

    #[tokio::test]
    async fn test_invalid_leftover_index_is_dropped_before_retry() {
        let mut cols = HashMap::new();
        cols.insert("indisvalid".to_string(), serde_json::Value::from(false));
        let conn = ScriptedConnection::new(
            1,
            vec![
                ScriptedResponse::Query(vec![Row::new(cols)]), // status check: invalid
                ScriptedResponse::Execute(0),                  // drop invalid index
                ScriptedResponse::Execute(0),                  // create succeeds
            ],
        );
        let bus = EventBus::new(16);
        let orchestrator = CicOrchestrator::new(conn, bus.publisher("run"), CicConfig::default());
        let ops = vec![op("idx_a", "t1", 0)];
        let report = orchestrator.orchestrate(&ops, CicStrategy::Sequential).await;
        assert_eq!(report.created, 1);
    }

    #[tokio::test]
    async fn test_priority_based_strategy_orders_highest_priority_first() {
        let conn = ScriptedConnection::new(
            1,
            vec![
                ScriptedResponse::Query(vec![]),
                ScriptedResponse::Execute(0),
                ScriptedResponse::Query(vec![]),
                ScriptedResponse::Execute(0),
            ],
        );
        let bus = EventBus::new(16);
        let orchestrator = CicOrchestrator::new(conn, bus.publisher("run"), CicConfig::default());
        let ops = vec![op("idx_low", "t1", 1), op("idx_high", "t2", 10)];
        let report = orchestrator.orchestrate(&ops, CicStrategy::PriorityBased).await;
        assert_eq!(report.results[0].index_name, "idx_high");
        assert_eq!(report.results[1].index_name, "idx_low");
    }

    #[tokio::test]
    async fn test_cancellation_stops_remaining_operations_as_failed() {
        let conn = ScriptedConnection::new(1, vec![ScriptedResponse::Query(vec![])]);
        let bus = EventBus::new(16);
        let orchestrator = CicOrchestrator::new(conn, bus.publisher("run"), CicConfig::default());
        orchestrator.cancel();
        let ops = vec![op("idx_a", "t1", 0)];
        let report = orchestrator.orchestrate(&ops, CicStrategy::Sequential).await;
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_duplicate_index_name_in_batch_is_skipped() {
        let conn = ScriptedConnection::new(
            1,
            vec![
                ScriptedResponse::Query(vec![]), // status check for op 1
                ScriptedResponse::Execute(0),    // create op 1
            ],
        );
        let bus = EventBus::new(16);
        let orchestrator = CicOrchestrator::new(conn, bus.publisher("run"), CicConfig::default());
        let ops = vec![op("idx_users_email", "users", 0), op("idx_users_email", "accounts", 0)];
        let report = orchestrator.orchestrate(&ops, CicStrategy::Sequential).await;
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.results[1].outcome, CicOutcome::Skipped);
        assert_eq!(report.results[1].error, None);
    }

    #[tokio::test]
    async fn test_retriable_failures_emit_will_retry_before_success() {
        let conn = ScriptedConnection::new(
            1,
            vec![
                ScriptedResponse::Query(vec![]),                  // status check
                ScriptedResponse::Error("lock timeout".to_string()), // attempt 1 fails
                ScriptedResponse::Execute(0),                      // cleanup after attempt 1
                ScriptedResponse::Error("lock timeout".to_string()), // attempt 2 fails
                ScriptedResponse::Execute(0),                      // cleanup after attempt 2
                ScriptedResponse::Execute(0),                      // attempt 3 succeeds
            ],
        );
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let orchestrator = CicOrchestrator::new(conn, bus.publisher("run"), CicConfig::default());
        let ops = vec![op("idx_a", "t1", 0)];
        let report = orchestrator.orchestrate(&ops, CicStrategy::Sequential).await;
        assert_eq!(report.created, 1);
        assert_eq!(report.results[0].attempts, 3);

        let mut will_retry_true = 0;
        let mut will_retry_false = 0;
        while let Ok(event) = rx.try_recv() {
            if event.kind == "CICOperationFailed" {
                match event.field("willRetry").and_then(|v| v.as_bool()) {
                    Some(true) => will_retry_true += 1,
                    Some(false) => will_retry_false += 1,
                    None => {}
                }
            }
        }
        assert_eq!(will_retry_true, 2);
        assert_eq!(will_retry_false, 0);
    }

    #[test]
    fn test_build_sql_includes_unique_and_predicate() {
        let mut o = op("idx_a", "t1", 0);
        o.is_unique = true;
        o.is_partial = true;
        o.predicate = Some("email IS NOT NULL".to_string());
        let sql = o.build_sql();
        assert!(sql.contains("UNIQUE INDEX CONCURRENTLY"));
        assert!(sql.contains("WHERE email IS NOT NULL"));
    }
}
