//! Owns one database session, serializes statements through it, and emits
//! per-operation events. Grounded on `orf-locksmith`'s `StatementExecutor` for
//! the connect/drive pattern, generalized from a one-shot statement runner into
//! a long-lived session with transaction and advisory-lock bookkeeping.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde_json::json;
use tracing::instrument;

use crate::connection::Connection;
use crate::error::{ContextualResult, ErrorKind, Result};
use crate::event_bus::EventPublisher;
use crate::pg_types::operation::MigrationOperation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct OperationResult {
    pub status: OperationStatus,
    pub duration_ms: u64,
    pub rows_affected: u64,
    pub retry_count: u32,
    pub error: Option<String>,
}

struct ExecutorState {
    transaction_active: bool,
    advisory_locks: BTreeSet<i64>,
}

/// Rows-affected parsing for statements that return a count directly from the
/// driver; kept as a separate function because `SELECT`'s row count comes from
/// the length of the returned rows, not from an affected-row trailer.
fn rows_affected_for(kind_is_select: bool, executed: u64, selected_rows: usize) -> u64 {
    if kind_is_select {
        selected_rows as u64
    } else {
        executed
    }
}

/// Executes [`MigrationOperation`]s against one [`Connection`], tracking
/// transaction and advisory-lock state for orderly shutdown.
pub struct SqlExecutor<C: Connection, P: EventPublisher> {
    connection: C,
    publisher: P,
    state: Mutex<ExecutorState>,
    started: AtomicBool,
}

impl<C: Connection, P: EventPublisher> SqlExecutor<C, P> {
    pub fn new(connection: C, publisher: P) -> Self {
        SqlExecutor {
            connection,
            publisher,
            state: Mutex::new(ExecutorState {
                transaction_active: false,
                advisory_locks: BTreeSet::new(),
            }),
            started: AtomicBool::new(false),
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        self.publisher.emit(
            "SQLExecutorStarted",
            json!({"backend_pid": self.connection.backend_pid()}),
        );
        Ok(())
    }

    /// Run one statement, optionally racing it against `timeout_ms` via
    /// cooperative cancellation: when the timer wins, the connection's
    /// `cancel` capability is invoked (`pg_cancel_backend` semantics) and an
    /// `ErrorKind::Timeout` is surfaced without touching transaction state,
    /// since a cancelled statement leaves the transaction for the caller to
    /// roll back explicitly.
    #[instrument(skip(self, op))]
    pub async fn execute_operation(
        &self,
        op: &MigrationOperation,
        timeout_ms: Option<u64>,
    ) -> Result<OperationResult> {
        self.publisher
            .emit("SQLOperationStarted", json!({"sql": op.sql, "kind": format!("{:?}", op.kind)}));

        let start = Instant::now();
        let is_select = matches!(op.kind, crate::pg_types::operation::OperationKind::Select);

        let statement = async {
            if is_select {
                self.connection.query(&op.sql).await.map(|rows| (0u64, rows.len()))
            } else {
                self.connection.execute(&op.sql).await.map(|n| (n, 0usize))
            }
        };

        let result = match timeout_ms {
            Some(ms) => {
                tokio::select! {
                    result = statement => result,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => {
                        let _ = self.connection.cancel().await;
                        self.publisher.emit(
                            "SQLExecutorError",
                            json!({"sql": op.sql, "error": format!("operation timed out after {}ms", ms)}),
                        );
                        return Err(ErrorKind::Timeout(ms).into());
                    }
                }
            }
            None => statement.await,
        };

        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok((executed, selected)) => {
                let rows_affected = rows_affected_for(is_select, executed, selected);
                self.publisher.emit(
                    "SQLOperationCompleted",
                    json!({"sql": op.sql, "rows_affected": rows_affected, "duration_ms": duration_ms}),
                );
                Ok(OperationResult {
                    status: OperationStatus::Completed,
                    duration_ms,
                    rows_affected,
                    retry_count: 0,
                    error: None,
                })
            }
            Err(e) => {
                self.publisher.emit(
                    "SQLExecutorError",
                    json!({"sql": op.sql, "error": e.to_string()}),
                );
                Err(e).with_context(format!("executing statement: {}", op.sql))
            }
        }
    }

    pub async fn start_transaction(&self, isolation: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.transaction_active {
            return Err(ErrorKind::TransactionAlreadyActive.into());
        }
        self.connection.execute("BEGIN").await?;
        if let Some(level) = isolation {
            self.connection
                .execute(&format!("SET TRANSACTION ISOLATION LEVEL {}", level))
                .await?;
        }
        state.transaction_active = true;
        drop(state);
        self.publisher.emit("SQLTransactionStarted", json!({"isolation": isolation}));
        Ok(())
    }

    pub async fn commit_transaction(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.transaction_active {
            return Err(ErrorKind::NoActiveTransaction.into());
        }
        self.connection.execute("COMMIT").await?;
        state.transaction_active = false;
        drop(state);
        self.publisher.emit("SQLTransactionCommitted", json!({}));
        Ok(())
    }

    pub async fn rollback_transaction(&self, reason: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.transaction_active {
            return Err(ErrorKind::NoActiveTransaction.into());
        }
        self.connection.execute("ROLLBACK").await?;
        state.transaction_active = false;
        drop(state);
        self.publisher
            .emit("SQLTransactionRolledBack", json!({"reason": reason}));
        Ok(())
    }

    pub fn transaction_active(&self) -> bool {
        self.state.lock().unwrap().transaction_active
    }

    pub async fn acquire_advisory_lock(&self, lock_id: i64, shared: bool) -> Result<()> {
        let sql = if shared {
            format!("SELECT pg_advisory_lock_shared({})", lock_id)
        } else {
            format!("SELECT pg_advisory_lock({})", lock_id)
        };
        self.connection.execute(&sql).await?;
        self.state.lock().unwrap().advisory_locks.insert(lock_id);
        self.publisher
            .emit("SQLAdvisoryLockAcquired", json!({"lock_id": lock_id, "shared": shared}));
        Ok(())
    }

    pub async fn release_advisory_lock(&self, lock_id: i64) -> Result<()> {
        self.connection
            .execute(&format!("SELECT pg_advisory_unlock({})", lock_id))
            .await?;
        self.state.lock().unwrap().advisory_locks.remove(&lock_id);
        self.publisher
            .emit("SQLAdvisoryLockReleased", json!({"lock_id": lock_id}));
        Ok(())
    }

    /// Release all held advisory locks and roll back an active transaction, in
    /// that order, so a shutdown never leaves either behind.
    pub async fn shutdown(&self) -> Result<()> {
        let locks: Vec<i64> = self.state.lock().unwrap().advisory_locks.iter().copied().collect();
        for lock_id in locks {
            let _ = self.release_advisory_lock(lock_id).await;
        }
        if self.transaction_active() {
            let _ = self.rollback_transaction(Some("executor shutdown")).await;
        }
        Ok(())
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ScriptedConnection, ScriptedResponse};
    use crate::event_bus::EventBus;
    use crate::pg_types::operation::MigrationOperation;

    #[tokio::test]
    async fn test_execute_operation_reports_rows_affected() {
        let conn = ScriptedConnection::new(1, vec![ScriptedResponse::Execute(3)]);
        let bus = EventBus::new(16);
        let executor = SqlExecutor::new(conn, bus.publisher("run"));
        executor.start().await.unwrap();
        let op = MigrationOperation::from_sql("UPDATE users SET active = true", None);
        let result = executor.execute_operation(&op, None).await.unwrap();
        assert_eq!(result.rows_affected, 3);
        assert_eq!(result.status, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn test_transaction_lifecycle() {
        let conn = ScriptedConnection::new(
            1,
            vec![
                ScriptedResponse::Execute(0), // BEGIN
                ScriptedResponse::Execute(0), // COMMIT
            ],
        );
        let bus = EventBus::new(16);
        let executor = SqlExecutor::new(conn, bus.publisher("run"));
        executor.start_transaction(None).await.unwrap();
        assert!(executor.transaction_active());
        executor.commit_transaction().await.unwrap();
        assert!(!executor.transaction_active());
    }

    #[tokio::test]
    async fn test_double_begin_is_an_error() {
        let conn = ScriptedConnection::new(1, vec![ScriptedResponse::Execute(0)]);
        let bus = EventBus::new(16);
        let executor = SqlExecutor::new(conn, bus.publisher("run"));
        executor.start_transaction(None).await.unwrap();
        let err = executor.start_transaction(None).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_failed_statement_surfaces_error_and_emits_event() {
        let conn = ScriptedConnection::new(1, vec![ScriptedResponse::Error("syntax error".to_string())]);
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let executor = SqlExecutor::new(conn, bus.publisher("run"));
        let op = MigrationOperation::from_sql("GARBAGE SQL", None);
        let result = executor.execute_operation(&op, None).await;
        assert!(result.is_err());
        let mut saw_error_event = false;
        while let Ok(event) = rx.try_recv() {
            if event.kind == "SQLExecutorError" {
                saw_error_event = true;
            }
        }
        assert!(saw_error_event);
    }

    #[tokio::test]
    async fn test_slow_statement_surfaces_timeout_and_cancels() {
        let conn = ScriptedConnection::new(
            1,
            vec![ScriptedResponse::Delayed(200, Box::new(ScriptedResponse::Execute(0)))],
        );
        let bus = EventBus::new(16);
        let executor = SqlExecutor::new(conn, bus.publisher("run"));
        let op = MigrationOperation::from_sql("ALTER TABLE users ADD COLUMN x int", None);
        let result = executor.execute_operation(&op, Some(10)).await;
        assert!(matches!(result.unwrap_err().kind(), ErrorKind::Timeout(10)));
        assert!(executor.connection().calls().iter().any(|c| c == "<cancel>"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_advisory_locks_and_rolls_back() {
        let conn = ScriptedConnection::new(
            1,
            vec![
                ScriptedResponse::Execute(0), // acquire lock
                ScriptedResponse::Execute(0), // begin
                ScriptedResponse::Execute(0), // release lock (shutdown)
                ScriptedResponse::Execute(0), // rollback (shutdown)
            ],
        );
        let bus = EventBus::new(16);
        let executor = SqlExecutor::new(conn, bus.publisher("run"));
        executor.acquire_advisory_lock(42, false).await.unwrap();
        executor.start_transaction(None).await.unwrap();
        executor.shutdown().await.unwrap();
        assert!(!executor.transaction_active());
    }
}
