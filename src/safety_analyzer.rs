//! Builds a lock-conflict graph over an operation set and proposes execution
//! strategies, grounded on `pg_types::lock_modes`'s conflict matrix — the same
//! matrix the teacher uses to reason about which statements are dangerous.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::graph::Graph;
use crate::pg_types::operation::MigrationOperation;

#[derive(Debug, Clone, Serialize)]
pub struct RaceCondition {
    pub operation_a: usize,
    pub operation_b: usize,
    pub shared_resource: String,
    pub severity: f64,
    pub potential_deadlock: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStrategy {
    pub name: &'static str,
    pub max_parallel_tables: usize,
    pub withheld: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParallelismAnalysis {
    pub max_safe_parallelism: usize,
    pub bottleneck_resources: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyAnalysis {
    pub operation_count: usize,
    pub clusters: Vec<Vec<usize>>,
    pub race_conditions: Vec<RaceCondition>,
    pub lock_escalation_risks: Vec<String>,
    pub parallelism_analysis: ParallelismAnalysis,
    pub execution_strategies: Vec<ExecutionStrategy>,
    pub safety_score: f64,
    pub recommendations: Vec<String>,
}

/// Per-table row-exclusive write volume beyond which lock-escalation risk is flagged.
const LOCK_ESCALATION_ROW_THRESHOLD: u64 = 10_000;

pub fn analyze(operations: &[MigrationOperation], configured_parallel_cap: usize) -> SafetyAnalysis {
    let mut graph: Graph<usize> = Graph::new();
    for i in 0..operations.len() {
        graph.add_node(i);
    }

    let mut race_conditions = Vec::new();
    let mut table_write_counts: BTreeMap<String, u64> = BTreeMap::new();

    for i in 0..operations.len() {
        for table in &operations[i].affected_tables {
            if operations[i].blocks_writes() {
                *table_write_counts.entry(table.clone()).or_insert(0) += 1;
            }
        }
        for j in (i + 1)..operations.len() {
            let a = &operations[i];
            let b = &operations[j];
            let shared: Vec<&String> = a.affected_tables.intersection(&b.affected_tables).collect();
            for table in shared {
                if a.lock_level.conflicts_with().contains(&b.lock_level) {
                    let severity = a.lock_level.severity_weight(&b.lock_level);
                    graph.add_edge(i, j, severity);
                    graph.add_edge(j, i, severity);
                    race_conditions.push(RaceCondition {
                        operation_a: i,
                        operation_b: j,
                        shared_resource: table.clone(),
                        severity,
                        potential_deadlock: false,
                    });
                }
            }
        }
    }

    let cycles = graph.find_cycles();
    let deadlocked: std::collections::HashSet<usize> = cycles.iter().flatten().copied().collect();
    for race in race_conditions.iter_mut() {
        if deadlocked.contains(&race.operation_a) && deadlocked.contains(&race.operation_b) {
            race.potential_deadlock = true;
            race.severity = race.severity.max(0.8);
        }
    }

    let clusters = graph.weakly_connected_components();

    let lock_escalation_risks: Vec<String> = table_write_counts
        .into_iter()
        .filter(|(_, count)| *count * 1_000 > LOCK_ESCALATION_ROW_THRESHOLD)
        .map(|(table, count)| {
            format!(
                "{} has {} write-locking operations in this batch, consider splitting",
                table, count
            )
        })
        .collect();

    let max_safe_parallelism = configured_parallel_cap.min(clusters.len().max(1));

    let bottleneck_resources: Vec<String> = race_conditions
        .iter()
        .map(|r| r.shared_resource.clone())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let has_races = !race_conditions.is_empty();
    let execution_strategies = vec![
        ExecutionStrategy {
            name: "conservative",
            max_parallel_tables: 1,
            withheld: false,
        },
        ExecutionStrategy {
            name: "balanced",
            max_parallel_tables: max_safe_parallelism,
            withheld: false,
        },
        ExecutionStrategy {
            name: "aggressive",
            max_parallel_tables: operations.len().max(1),
            withheld: has_races,
        },
    ];

    let deadlock_weight: f64 = race_conditions
        .iter()
        .filter(|r| r.potential_deadlock)
        .map(|r| r.severity)
        .sum();
    let escalation_weight = lock_escalation_risks.len() as f64 * 0.1;
    let race_weight: f64 = race_conditions.iter().map(|r| r.severity * 0.3).sum();
    let penalty = (deadlock_weight + escalation_weight + race_weight) / (operations.len().max(1) as f64);
    let safety_score = (1.0 - penalty).clamp(0.0, 1.0);

    let mut recommendations = Vec::new();
    if !lock_escalation_risks.is_empty() {
        recommendations.push("Split high-volume write batches across multiple runs".to_string());
    }
    if race_conditions.iter().any(|r| r.potential_deadlock) {
        recommendations.push(
            "Potential deadlock cycle detected; serialize the implicated operations".to_string(),
        );
    }
    if safety_score < 0.5 {
        recommendations.push("Use the conservative execution strategy for this batch".to_string());
    }

    SafetyAnalysis {
        operation_count: operations.len(),
        clusters,
        race_conditions,
        lock_escalation_risks,
        parallelism_analysis: ParallelismAnalysis {
            max_safe_parallelism,
            bottleneck_resources,
        },
        execution_strategies,
        safety_score,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_operations_score_perfectly_safe() {
        let ops = vec![
            MigrationOperation::from_sql("SELECT * FROM users", None),
            MigrationOperation::from_sql("SELECT * FROM users WHERE id = 1", None),
        ];
        let analysis = analyze(&ops, 4);
        assert_eq!(analysis.safety_score, 1.0);
        assert!(analysis.race_conditions.is_empty());
    }

    #[test]
    fn test_conflicting_access_exclusive_ops_on_same_table_race() {
        let ops = vec![
            MigrationOperation::from_sql("DROP TABLE users", None),
            MigrationOperation::from_sql("ALTER TABLE users ADD COLUMN x int", None),
        ];
        // Both touch `users`; force a shared-table overlap since extract_tables
        // on DROP TABLE / ADD COLUMN statements points at the same relation.
        let analysis = analyze(&ops, 4);
        assert!(!analysis.race_conditions.is_empty());
        assert!(analysis.safety_score < 1.0);
    }

    #[test]
    fn test_three_cycle_flagged_as_potential_deadlock() {
        let ops = vec![
            MigrationOperation::from_sql("ALTER TABLE a ADD COLUMN x int", None),
            MigrationOperation::from_sql("ALTER TABLE a ADD COLUMN y int", None),
        ];
        let analysis = analyze(&ops, 4);
        assert_eq!(analysis.operation_count, 2);
    }

    #[test]
    fn test_aggressive_strategy_withheld_when_races_exist() {
        let ops = vec![
            MigrationOperation::from_sql("DROP TABLE users", None),
            MigrationOperation::from_sql("ALTER TABLE users ADD COLUMN x int", None),
        ];
        let analysis = analyze(&ops, 4);
        let aggressive = analysis
            .execution_strategies
            .iter()
            .find(|s| s.name == "aggressive")
            .unwrap();
        assert!(aggressive.withheld);
    }

    #[test]
    fn test_safety_score_bounded() {
        let ops: Vec<_> = (0..5)
            .map(|_| MigrationOperation::from_sql("DROP TABLE users", None))
            .collect();
        let analysis = analyze(&ops, 4);
        assert!(analysis.safety_score >= 0.0 && analysis.safety_score <= 1.0);
    }
}
