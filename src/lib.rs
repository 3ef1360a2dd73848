//! Runtime execution core for safely evolving a live PostgreSQL schema.
//!
//! This crate does not decide *what* to change (that's a schema-diffing planner
//! upstream) or generate DDL text. It takes a set of already-generated
//! [`pg_types::operation::MigrationOperation`]s and drives them through admission
//! control, lock-conflict analysis, batching, transactional execution, lock and
//! deadlock monitoring, a specialized `CREATE INDEX CONCURRENTLY` orchestrator, and
//! post-run verification.

/// Per-operation backoff, rate limiting, concurrency caps, circuit breaking and
/// priority admission to the execution pool.
pub mod backpressure;
/// Groups operations into dependency- and lock-respecting batches.
pub mod batch_optimizer;
/// `CREATE INDEX CONCURRENTLY` orchestration: per-table serialization, retries,
/// invalid-index cleanup, priority ordering.
pub mod cic_orchestrator;
/// Aggregated runtime tunables for every component.
pub mod config;
/// The `Connection` capability and its production and scripted-test implementations.
pub mod connection;
/// Compares an expected schema against an observed one and classifies drift.
pub mod differential_validator;
/// Typed error taxonomy shared by every component.
pub mod error;
/// In-process event bus: a tagged-union `Event` and publish/subscribe.
pub mod event_bus;
/// Static per-operation classification: lock level, risk, duration, recommendations.
pub mod explainer;
/// Small arena-and-adjacency-list directed graph helper, used for the lock
/// conflict graph and the lock-monitor's wait-for graph.
pub mod graph;
/// Periodic lock-state scraping, wait-for graph construction, deadlock cycle
/// detection, and contention hotspot alerts.
pub mod lock_monitor;
/// Types that directly translate to postgres concepts: lock modes, relkinds,
/// constraint types, and the `MigrationOperation` data model.
pub mod pg_types;
/// Builds the lock-conflict graph over an operation set and proposes an
/// execution strategy.
pub mod safety_analyzer;
/// Pre-flight gate: permission, resource-limit, concurrent-operation, and
/// dependency checks before a run is admitted.
pub mod safety_validator;
/// Owns one database session: statement execution, transactions, advisory locks.
pub mod executor;
/// Savepoint stacks, isolation levels, and deadlock-retry on top of the executor.
pub mod transaction;
/// Post-run checksum, schema diff, data-integrity, rollback-trigger, and
/// performance-baseline verification.
pub mod verifier;

pub use config::RuntimeConfig;
pub use connection::Connection;
pub use error::{Error, ErrorKind, Result};
pub use event_bus::{Event, EventBus, EventPublisher, Publisher};
