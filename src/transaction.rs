//! Savepoint stack and deadlock-retry policy layered over a [`Connection`],
//! grounded on the SQLSTATE-classification idiom centralized in [`crate::error`]
//! and on the exponential-backoff retry shape used throughout the teacher's CLI
//! (`--lock-timeout`, `--retries` flags on `eugene trace`/`eugene run`), here
//! generalized into a reusable transaction-scoped retry loop.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{instrument, warn};

use crate::config::TransactionConfig;
use crate::connection::Connection;
use crate::error::{is_deadlock_message, is_serialization_failure_message, Error, ErrorKind, Result};
use crate::event_bus::EventPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Strict LIFO stack of savepoint names. `rollback_to` discards every savepoint
/// pushed after the target, matching Postgres's own savepoint semantics.
#[derive(Debug, Default)]
struct SavepointStack {
    names: Vec<String>,
}

impl SavepointStack {
    fn push(&mut self, name: String, max_depth: usize) -> Result<()> {
        if self.names.len() >= max_depth {
            return Err(ErrorKind::SavepointError(format!(
                "savepoint depth limit of {} reached",
                max_depth
            ))
            .into());
        }
        self.names.push(name);
        Ok(())
    }

    fn rollback_to(&mut self, name: &str) -> Result<()> {
        match self.names.iter().position(|n| n == name) {
            Some(idx) => {
                self.names.truncate(idx + 1);
                Ok(())
            }
            None => Err(ErrorKind::SavepointError(format!("unknown savepoint {}", name)).into()),
        }
    }

    fn release(&mut self, name: &str) -> Result<()> {
        match self.names.iter().position(|n| n == name) {
            Some(idx) => {
                self.names.truncate(idx);
                Ok(())
            }
            None => Err(ErrorKind::SavepointError(format!("unknown savepoint {}", name)).into()),
        }
    }

    fn depth(&self) -> usize {
        self.names.len()
    }
}

/// Manages one transaction's lifecycle over a [`Connection`]: begin/commit/rollback,
/// a nested savepoint stack, and a deadlock/serialization-failure retry loop.
pub struct TransactionManager<C: Connection, P: EventPublisher> {
    connection: C,
    publisher: P,
    config: TransactionConfig,
    savepoints: std::sync::Mutex<SavepointStack>,
    active: std::sync::atomic::AtomicBool,
}

impl<C: Connection, P: EventPublisher> TransactionManager<C, P> {
    pub fn new(connection: C, publisher: P, config: TransactionConfig) -> Self {
        TransactionManager {
            connection,
            publisher,
            config,
            savepoints: std::sync::Mutex::new(SavepointStack::default()),
            active: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.lock().unwrap().depth()
    }

    #[instrument(skip(self, body))]
    pub async fn execute_in_transaction<F, Fut, T>(&self, isolation: IsolationLevel, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.is_active() {
            return Err(ErrorKind::TransactionAlreadyActive.into());
        }
        self.connection.execute("BEGIN").await?;
        self.connection
            .execute(&format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql()))
            .await?;
        self.active.store(true, std::sync::atomic::Ordering::SeqCst);
        self.publisher
            .emit("TransactionStarted", json!({"isolation": isolation.as_sql()}));

        match body().await {
            Ok(value) => {
                self.connection.execute("COMMIT").await?;
                self.active.store(false, std::sync::atomic::Ordering::SeqCst);
                self.publisher.emit("TransactionCommitted", json!({}));
                Ok(value)
            }
            Err(e) => {
                let _ = self.connection.execute("ROLLBACK").await;
                self.active.store(false, std::sync::atomic::Ordering::SeqCst);
                self.savepoints.lock().unwrap().names.clear();
                self.publisher
                    .emit("TransactionRolledBack", json!({"reason": e.to_string()}));
                Err(e)
            }
        }
    }

    pub async fn savepoint(&self, name: &str) -> Result<()> {
        if !self.is_active() {
            return Err(ErrorKind::NoActiveTransaction.into());
        }
        self.savepoints
            .lock()
            .unwrap()
            .push(name.to_string(), self.config.max_savepoints)?;
        self.connection.execute(&format!("SAVEPOINT {}", name)).await?;
        self.publisher.emit("SavepointCreated", json!({"name": name}));
        Ok(())
    }

    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        if !self.is_active() {
            return Err(ErrorKind::NoActiveTransaction.into());
        }
        self.savepoints.lock().unwrap().rollback_to(name)?;
        self.connection
            .execute(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .await?;
        self.publisher
            .emit("SavepointRolledBack", json!({"name": name}));
        Ok(())
    }

    pub async fn release_savepoint(&self, name: &str) -> Result<()> {
        if !self.is_active() {
            return Err(ErrorKind::NoActiveTransaction.into());
        }
        self.savepoints.lock().unwrap().release(name)?;
        self.connection
            .execute(&format!("RELEASE SAVEPOINT {}", name))
            .await?;
        Ok(())
    }

    /// Run `body` inside a savepoint, rolling back just that savepoint (not the
    /// whole transaction) if `body` fails, and re-raising the error afterward.
    pub async fn execute_with_savepoint<F, Fut, T>(&self, name: &str, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.savepoint(name).await?;
        match body().await {
            Ok(value) => {
                self.release_savepoint(name).await?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.rollback_to_savepoint(name).await;
                Err(e)
            }
        }
    }

    /// Retry `body` under a fresh transaction whenever it fails with a deadlock
    /// or serialization failure, backing off exponentially between attempts, up
    /// to `config.max_retries` retries. Any other error is not retried.
    #[instrument(skip(self, body))]
    pub async fn execute_with_deadlock_retry<F, Fut, T>(
        &self,
        isolation: IsolationLevel,
        mut body: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = self.execute_in_transaction(isolation, || body()).await;
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.config.max_retries && is_retriable_transaction_error(&e) => {
                    attempt += 1;
                    let backoff_ms = (self.config.backoff_multiplier.powi(attempt as i32) * 10.0)
                        .min(self.config.max_backoff_ms as f64) as u64;
                    warn!(attempt, backoff_ms, error = %e, "retrying transaction after conflict");
                    self.publisher.emit(
                        "TransactionRetried",
                        json!({"attempt": attempt, "backoff_ms": backoff_ms, "error": e.to_string()}),
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_retriable_transaction_error(e: &Error) -> bool {
    let message = e.to_string();
    is_deadlock_message(&message) || is_serialization_failure_message(&message)
}
