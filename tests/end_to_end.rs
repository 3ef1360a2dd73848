//! End-to-end scenario tests driving the runtime components together over
//! `ScriptedConnection`, in the style of the teacher's `tests/` integration
//! suite but replacing its live-database fixtures with scripted responses
//! since this crate cannot depend on a running Postgres for its test suite.

use std::collections::HashMap;

use pretty_assertions::assert_eq;

use wesley_runtime::backpressure::{BackpressureController, CircuitState};
use wesley_runtime::cic_orchestrator::{CicOperation, CicOrchestrator, CicOutcome, CicStrategy};
use wesley_runtime::config::{BackpressureConfig, RuntimeConfig};
use wesley_runtime::connection::{Row, ScriptedConnection, ScriptedResponse};
use wesley_runtime::event_bus::EventBus;
use wesley_runtime::lock_monitor::LockMonitor;
use wesley_runtime::transaction::{IsolationLevel, TransactionManager};
use wesley_runtime::verifier::{MigrationVerifier, SchemaSnapshot, TableShape};
use wesley_runtime::{Error, ErrorKind};

fn lock_row(pid: i32, relation: &str, mode: &str, granted: bool) -> Row {
    let mut cols = HashMap::new();
    cols.insert("pid".to_string(), serde_json::Value::from(pid));
    cols.insert("relation".to_string(), serde_json::Value::from(relation));
    cols.insert("lock_mode".to_string(), serde_json::Value::from(mode));
    cols.insert("granted".to_string(), serde_json::Value::from(granted));
    Row::new(cols)
}

/// Scenario: three independent `CREATE INDEX CONCURRENTLY` operations on
/// different tables all succeed under the sequential strategy.
#[tokio::test]
async fn scenario_cic_orchestration_over_three_tables() {
    let conn = ScriptedConnection::new(
        1,
        vec![
            ScriptedResponse::Query(vec![]),
            ScriptedResponse::Execute(0),
            ScriptedResponse::Query(vec![]),
            ScriptedResponse::Execute(0),
            ScriptedResponse::Query(vec![]),
            ScriptedResponse::Execute(0),
        ],
    );
    let bus = EventBus::new(32);
    let config = RuntimeConfig::default();
    let orchestrator = CicOrchestrator::new(conn, bus.publisher("cic-run"), config.cic);

    let ops = vec![
        CicOperation {
            index_name: "idx_users_email".to_string(),
            table_name: "users".to_string(),
            columns: vec!["email".to_string()],
            is_unique: true,
            is_partial: false,
            predicate: None,
            method: "btree".to_string(),
            priority: 0,
        },
        CicOperation {
            index_name: "idx_orders_user_id".to_string(),
            table_name: "orders".to_string(),
            columns: vec!["user_id".to_string()],
            is_unique: false,
            is_partial: false,
            predicate: None,
            method: "btree".to_string(),
            priority: 0,
        },
        CicOperation {
            index_name: "idx_payments_status".to_string(),
            table_name: "payments".to_string(),
            columns: vec!["status".to_string()],
            is_unique: false,
            is_partial: true,
            predicate: Some("status = 'pending'".to_string()),
            method: "btree".to_string(),
            priority: 0,
        },
    ];

    let report = orchestrator.orchestrate(&ops, CicStrategy::Sequential).await;
    assert_eq!(report.created, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.skipped, 0);
}

/// Scenario: an index that already exists and is valid is skipped, not rebuilt.
#[tokio::test]
async fn scenario_duplicate_index_is_skipped_not_rebuilt() {
    let mut cols = HashMap::new();
    cols.insert("indisvalid".to_string(), serde_json::Value::from(true));
    let conn = ScriptedConnection::new(1, vec![ScriptedResponse::Query(vec![Row::new(cols)])]);
    let bus = EventBus::new(32);
    let orchestrator = CicOrchestrator::new(conn, bus.publisher("cic-run"), RuntimeConfig::default().cic);

    let op = CicOperation {
        index_name: "idx_users_email".to_string(),
        table_name: "users".to_string(),
        columns: vec!["email".to_string()],
        is_unique: true,
        is_partial: false,
        predicate: None,
        method: "btree".to_string(),
        priority: 0,
    };

    let report = orchestrator.orchestrate(&[op], CicStrategy::Sequential).await;
    assert_eq!(report.results[0].outcome, CicOutcome::Skipped);
    assert_eq!(report.created, 0);
}

/// Scenario: a transaction that deadlocks on its first attempt succeeds on
/// retry without the caller having to implement its own retry loop.
#[tokio::test]
async fn scenario_deadlock_is_retried_to_success() {
    let conn = ScriptedConnection::new(
        1,
        vec![
            ScriptedResponse::Execute(0), // BEGIN (attempt 1)
            ScriptedResponse::Execute(0), // SET ISOLATION (attempt 1)
            ScriptedResponse::Execute(0), // ROLLBACK (attempt 1)
            ScriptedResponse::Execute(0), // BEGIN (attempt 2)
            ScriptedResponse::Execute(0), // SET ISOLATION (attempt 2)
            ScriptedResponse::Execute(0), // COMMIT (attempt 2)
        ],
    );
    let bus = EventBus::new(32);
    let manager = TransactionManager::new(conn, bus.publisher("txn-run"), RuntimeConfig::default().transaction);

    let attempt = std::sync::atomic::AtomicU32::new(0);
    let result = manager
        .execute_with_deadlock_retry(IsolationLevel::ReadCommitted, || {
            let n = attempt.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ErrorKind::Deadlock.into())
                } else {
                    Ok::<_, Error>(1u64)
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(result, 1);
}

/// Scenario: the circuit breaker trips after consecutive failures, rejects
/// new work while open, and recovers through half-open back to closed once
/// the reset timeout has elapsed and a probe succeeds.
#[tokio::test]
async fn scenario_circuit_breaker_trips_and_resets() {
    let bus = EventBus::new(32);
    let mut config = BackpressureConfig::default();
    config.failure_threshold = 2;
    config.reset_timeout_ms = 0;
    let controller = BackpressureController::new(config, bus.publisher("bp-run"));

    for _ in 0..2 {
        controller.request_permission(0).await.unwrap();
        controller.report_completion(false, None);
    }
    assert_eq!(controller.status().circuit_state, CircuitState::Open);
    assert!(controller.request_permission(0).await.is_err());

    let probe = controller.request_permission(0).await.unwrap();
    assert!(probe.granted);
    assert_eq!(controller.status().circuit_state, CircuitState::HalfOpen);

    controller.report_completion(true, None);
    assert_eq!(controller.status().circuit_state, CircuitState::Closed);
}

/// Scenario: sustained high pool utilization and latency activates adaptive
/// backpressure, and recovery deactivates it again, each exactly once.
#[tokio::test]
async fn scenario_backpressure_activates_then_deactivates() {
    let bus = EventBus::new(32);
    let controller = BackpressureController::new(BackpressureConfig::default(), bus.publisher("bp-run"));

    controller.record_metrics(0.95, 900.0);
    controller.evaluate_backpressure();
    assert!(controller.status().active);

    controller.record_metrics(0.2, 100.0);
    for _ in 0..30 {
        controller.evaluate_backpressure();
    }
    assert!(!controller.status().active);
}

/// Scenario: two processes each waiting on a lock the other holds form a
/// two-cycle that the lock monitor must surface as a deadlock.
#[tokio::test]
async fn scenario_lock_monitor_detects_two_process_deadlock_cycle() {
    let conn = ScriptedConnection::new(
        1,
        vec![ScriptedResponse::Query(vec![
            lock_row(101, "public.accounts", "AccessExclusiveLock", true),
            lock_row(202, "public.ledger", "AccessExclusiveLock", true),
            lock_row(101, "public.ledger", "AccessExclusiveLock", false),
            lock_row(202, "public.accounts", "AccessExclusiveLock", false),
        ])],
    );
    let bus = EventBus::new(32);
    let monitor = LockMonitor::new(conn, bus.publisher("lock-run"), RuntimeConfig::default().lock_monitor);
    let snapshot = monitor.snapshot().await.unwrap();

    assert!(!snapshot.deadlock_cycles.is_empty());
    let cycle = &snapshot.deadlock_cycles[0];
    assert!(cycle.contains(&101));
    assert!(cycle.contains(&202));
}

/// Scenario: checksumming a schema before and after a real column-type
/// change produces different hashes, and the typed diff names the change.
#[tokio::test]
async fn scenario_schema_checksum_and_diff_after_migration() {
    let conn = ScriptedConnection::new(1, vec![]);
    let bus = EventBus::new(32);
    let verifier = MigrationVerifier::new(conn, bus.publisher("verify-run"), RuntimeConfig::default().verifier);

    let mut before = SchemaSnapshot::default();
    before.tables.insert(
        "users".to_string(),
        TableShape {
            columns: [("id".to_string(), "int4".to_string()), ("email".to_string(), "varchar".to_string())]
                .into_iter()
                .collect(),
            constraints: vec!["users_pkey".to_string()],
        },
    );

    let mut after = before.clone();
    after
        .tables
        .get_mut("users")
        .unwrap()
        .columns
        .insert("email".to_string(), "text".to_string());

    let result = verifier.verify(&before, &after, &[], None, None, None).await.unwrap();

    assert_ne!(result.checksum_before, result.checksum_after);
    assert!(result
        .schema_diff
        .iter()
        .any(|d| d.table == "users" && d.detail.contains("varchar") && d.detail.contains("text")));
}
