//! Periodic `pg_locks`/`pg_stat_activity` introspection, wait-for graph
//! construction, and deadlock-cycle detection. The join query is grounded on
//! the teacher's lock-wait tracer (`pg_locks` joined to `pg_class`/`pg_namespace`
//! to resolve a lock's human-readable target), generalized from a single-trace
//! snapshot into a recurring monitor with contention-hotspot tracking.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument};

use crate::config::LockMonitorConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::event_bus::EventPublisher;
use crate::graph::Graph;
use crate::pg_types::lock_modes::LockMode;

/// One row of `pg_locks`, joined against `pg_class`/`pg_namespace` to resolve a
/// human-readable relation name the way the teacher's tracer query does.
#[derive(Debug, Clone, Serialize)]
pub struct LockRow {
    pub pid: i32,
    pub relation: Option<String>,
    pub lock_mode: LockMode,
    pub granted: bool,
    pub wait_start: Option<String>,
}

/// One edge of the wait-for graph: `waiter` blocked on a lock `blocker` holds.
#[derive(Debug, Clone, Serialize)]
pub struct WaitEdge {
    pub waiter_pid: i32,
    pub blocker_pid: i32,
    pub relation: Option<String>,
    pub lock_mode: LockMode,
    pub wait_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockerSummary {
    pub blocker_pid: i32,
    pub blocked_count: usize,
    pub total_wait_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockSnapshot {
    pub locks: Vec<LockRow>,
    pub wait_edges: Vec<WaitEdge>,
    pub deadlock_cycles: Vec<Vec<i32>>,
    pub hotspots: Vec<BlockerSummary>,
}

/// Periodic lock introspection over one [`Connection`], deadlock cycle detection
/// via [`Graph::find_cycles`], and contention-hotspot aggregation.
pub struct LockMonitor<C: Connection, P: EventPublisher> {
    connection: C,
    publisher: P,
    config: LockMonitorConfig,
    wait_started_at: Mutex<BTreeMap<(i32, i32), Instant>>,
}

impl<C: Connection, P: EventPublisher> LockMonitor<C, P> {
    pub fn new(connection: C, publisher: P, config: LockMonitorConfig) -> Self {
        LockMonitor {
            connection,
            publisher,
            config,
            wait_started_at: Mutex::new(BTreeMap::new()),
        }
    }

    /// Query `pg_locks` joined to `pg_stat_activity`/`pg_class`/`pg_namespace`,
    /// mirroring the teacher's tracer query shape, to get a row per lock held or
    /// awaited, resolved to a readable relation name where possible.
    #[instrument(skip(self))]
    async fn query_locks(&self) -> Result<Vec<LockRow>> {
        let sql = "SELECT l.pid AS pid, \
                          coalesce(n.nspname || '.' || c.relname, l.relation::text) AS relation, \
                          l.mode AS lock_mode, l.granted AS granted, \
                          to_char(a.xact_start, 'YYYY-MM-DD\"T\"HH24:MI:SS') AS wait_start \
                   FROM pg_locks l \
                   LEFT JOIN pg_class c ON c.oid = l.relation \
                   LEFT JOIN pg_namespace n ON n.oid = c.relnamespace \
                   LEFT JOIN pg_stat_activity a ON a.pid = l.pid \
                   WHERE l.pid != pg_backend_pid()";
        let rows = self.connection.query(sql).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let pid = row.get_i32("pid").unwrap_or(0);
            let relation = row.get_str("relation").map(|s| s.to_string());
            let lock_mode = row
                .get_str("lock_mode")
                .and_then(LockMode::from_db_str)
                .unwrap_or(LockMode::AccessShare);
            let granted = row.get_bool("granted").unwrap_or(true);
            let wait_start = row.get_str("wait_start").map(|s| s.to_string());
            out.push(LockRow {
                pid,
                relation,
                lock_mode,
                granted,
                wait_start,
            });
        }
        Ok(out)
    }

    /// Build wait-for edges: for every ungranted lock request, pair it with
    /// every granted, conflicting lock on the same relation.
    fn build_wait_edges(&self, locks: &[LockRow]) -> Vec<WaitEdge> {
        let mut edges = Vec::new();
        let mut started = self.wait_started_at.lock().unwrap();
        let now = Instant::now();

        for waiter in locks.iter().filter(|l| !l.granted) {
            for blocker in locks
                .iter()
                .filter(|l| l.granted && l.pid != waiter.pid && l.relation == waiter.relation)
            {
                if !waiter.lock_mode.conflicts_with().contains(&blocker.lock_mode) {
                    continue;
                }
                let key = (waiter.pid, blocker.pid);
                let start = *started.entry(key).or_insert(now);
                let wait_ms = start.elapsed().as_millis() as f64;
                edges.push(WaitEdge {
                    waiter_pid: waiter.pid,
                    blocker_pid: blocker.pid,
                    relation: waiter.relation.clone(),
                    lock_mode: waiter.lock_mode,
                    wait_ms,
                });
            }
        }

        let live: std::collections::HashSet<(i32, i32)> =
            edges.iter().map(|e| (e.waiter_pid, e.blocker_pid)).collect();
        started.retain(|key, _| live.contains(key));

        edges
    }

    fn detect_deadlock_cycles(&self, edges: &[WaitEdge]) -> Vec<Vec<i32>> {
        let mut pid_index: BTreeMap<i32, usize> = BTreeMap::new();
        let mut graph: Graph<i32> = Graph::new();
        let mut index_of = |pid: i32, graph: &mut Graph<i32>, pid_index: &mut BTreeMap<i32, usize>| -> usize {
            *pid_index.entry(pid).or_insert_with(|| graph.add_node(pid))
        };

        for edge in edges {
            let w = index_of(edge.waiter_pid, &mut graph, &mut pid_index);
            let b = index_of(edge.blocker_pid, &mut graph, &mut pid_index);
            graph.add_edge(w, b, edge.wait_ms);
        }

        graph
            .find_cycles()
            .into_iter()
            .map(|cycle| cycle.into_iter().map(|idx| *graph.node(idx)).collect())
            .collect()
    }

    fn detect_hotspots(&self, edges: &[WaitEdge]) -> Vec<BlockerSummary> {
        let mut by_blocker: BTreeMap<i32, (usize, f64)> = BTreeMap::new();
        for edge in edges {
            let entry = by_blocker.entry(edge.blocker_pid).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += edge.wait_ms;
        }
        by_blocker
            .into_iter()
            .filter(|(_, (count, total_wait))| {
                *count >= self.config.contention_waiting_count_threshold
                    || *total_wait >= self.config.contention_total_wait_ms_threshold
            })
            .map(|(blocker_pid, (blocked_count, total_wait_ms))| BlockerSummary {
                blocker_pid,
                blocked_count,
                total_wait_ms,
            })
            .collect()
    }

    /// Take one snapshot: query locks, build the wait-for graph, detect cycles
    /// and hotspots, and emit events for anything noteworthy.
    #[instrument(skip(self))]
    pub async fn snapshot(&self) -> Result<LockSnapshot> {
        let locks = self.query_locks().await?;
        let wait_edges = self.build_wait_edges(&locks);
        let deadlock_cycles = self.detect_deadlock_cycles(&wait_edges);
        let hotspots = self.detect_hotspots(&wait_edges);

        if !deadlock_cycles.is_empty() {
            for cycle in &deadlock_cycles {
                self.publisher
                    .emit("DeadlockCycleDetected", json!({"pids": cycle}));
            }
        }
        for hotspot in &hotspots {
            self.publisher.emit(
                "ContentionHotspotDetected",
                json!({"blocker_pid": hotspot.blocker_pid, "blocked_count": hotspot.blocked_count}),
            );
        }
        for edge in wait_edges.iter().filter(|e| e.wait_ms >= self.config.max_wait_time_ms) {
            self.publisher.emit(
                "LockWaitExceededThreshold",
                json!({"waiter_pid": edge.waiter_pid, "blocker_pid": edge.blocker_pid, "relation": relation_id_opt(&edge.relation), "wait_ms": edge.wait_ms}),
            );
        }

        info!(
            lock_count = locks.len(),
            wait_edge_count = wait_edges.len(),
            deadlock_cycle_count = deadlock_cycles.len(),
            "lock snapshot taken"
        );

        Ok(LockSnapshot {
            locks,
            wait_edges,
            deadlock_cycles,
            hotspots,
        })
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.config.monitoring_interval_ms)
    }
}

fn relation_id_opt(relation: &Option<String>) -> String {
    relation.clone().unwrap_or_else(|| "<unresolved>".to_string())
}
