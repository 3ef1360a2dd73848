//! Pre-flight gate run before any operation touches the database: a registry
//! check for already-running conflicting operations, a resource-limit check,
//! a permission check, and a dependency-validation check, aggregated into one
//! [`ValidationResult`]. Grounded on `waypoint-core`'s `safety.rs` preflight
//! gate shape from `other_examples/`, adapted from its job-scheduling checks
//! to this crate's migration-operation checks.

use std::collections::HashSet;
use std::sync::Mutex;

use serde::Serialize;

use crate::config::SafetyConfig;
use crate::error::{ErrorKind, Result};
use crate::pg_types::operation::MigrationOperation;

#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub active_connections: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckOutcome {
    Passed,
    Warned,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub outcome: CheckOutcome,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub checks: Vec<CheckResult>,
    pub passed: bool,
}

/// Tracks tables with an operation currently in flight, so a second
/// conflicting operation on the same table can be rejected before it is ever
/// submitted to the executor.
#[derive(Default)]
pub struct ConcurrentOperationRegistry {
    active_tables: Mutex<HashSet<String>>,
}

impl ConcurrentOperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tables: &HashSet<String>) {
        self.active_tables.lock().unwrap().extend(tables.iter().cloned());
    }

    pub fn unregister(&self, tables: &HashSet<String>) {
        let mut active = self.active_tables.lock().unwrap();
        for table in tables {
            active.remove(table);
        }
    }

    fn conflicts(&self, tables: &std::collections::BTreeSet<String>) -> Vec<String> {
        let active = self.active_tables.lock().unwrap();
        tables.iter().filter(|t| active.contains(*t)).cloned().collect()
    }
}

/// Permissions an operation submitter must have to run a given class of
/// statement; checked against a caller-supplied grant set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Permission {
    Ddl,
    Dml,
    AdvisoryLock,
}

fn required_permission(op: &MigrationOperation) -> Permission {
    use crate::pg_types::operation::OperationKind::*;
    match op.kind {
        Insert | Update | Delete | Select => Permission::Dml,
        _ => Permission::Ddl,
    }
}

pub struct SafetyValidator {
    config: SafetyConfig,
    registry: ConcurrentOperationRegistry,
}

impl SafetyValidator {
    pub fn new(config: SafetyConfig) -> Self {
        SafetyValidator {
            config,
            registry: ConcurrentOperationRegistry::new(),
        }
    }

    fn check_concurrent_operations(&self, op: &MigrationOperation) -> CheckResult {
        let conflicts = self.registry.conflicts(&op.affected_tables);
        if conflicts.is_empty() {
            CheckResult {
                name: "concurrent_operations",
                outcome: CheckOutcome::Passed,
                detail: None,
            }
        } else {
            CheckResult {
                name: "concurrent_operations",
                outcome: CheckOutcome::Failed,
                detail: Some(format!("tables already in flight: {}", conflicts.join(", "))),
            }
        }
    }

    fn check_resources(&self, usage: &ResourceUsage) -> CheckResult {
        if usage.cpu_percent > self.config.max_cpu_percent
            || usage.memory_mb > self.config.max_memory_mb
            || usage.active_connections > self.config.max_connections
        {
            return CheckResult {
                name: "resource_limits",
                outcome: CheckOutcome::Failed,
                detail: Some(format!(
                    "cpu={:.1}% mem={:.0}MB conns={} exceeds configured limits",
                    usage.cpu_percent, usage.memory_mb, usage.active_connections
                )),
            };
        }
        let warn_cpu = usage.cpu_percent > self.config.max_cpu_percent * self.config.resource_warning_percent;
        let warn_mem = usage.memory_mb > self.config.max_memory_mb * self.config.resource_warning_percent;
        if warn_cpu || warn_mem {
            return CheckResult {
                name: "resource_limits",
                outcome: CheckOutcome::Warned,
                detail: Some("resource usage approaching configured limits".to_string()),
            };
        }
        CheckResult {
            name: "resource_limits",
            outcome: CheckOutcome::Passed,
            detail: None,
        }
    }

    fn check_permission(&self, op: &MigrationOperation, grants: &HashSet<Permission>) -> CheckResult {
        let required = required_permission(op);
        if grants.contains(&required) {
            CheckResult {
                name: "permission",
                outcome: CheckOutcome::Passed,
                detail: None,
            }
        } else {
            CheckResult {
                name: "permission",
                outcome: CheckOutcome::Failed,
                detail: Some(format!("missing {:?} permission", required)),
            }
        }
    }

    /// An `AddConstraint`/`CreateIndex`/`AddColumn` targeting a table must have
    /// seen that table created earlier in the same batch, or already exist;
    /// `known_tables` represents tables confirmed to exist (by prior operations
    /// in this run or by catalog lookup before the run started).
    fn check_dependencies(&self, op: &MigrationOperation, known_tables: &HashSet<String>) -> CheckResult {
        let missing: Vec<&String> = op
            .affected_tables
            .iter()
            .filter(|t| !known_tables.contains(*t))
            .collect();
        if missing.is_empty() {
            CheckResult {
                name: "dependency_validation",
                outcome: CheckOutcome::Passed,
                detail: None,
            }
        } else {
            CheckResult {
                name: "dependency_validation",
                outcome: CheckOutcome::Failed,
                detail: Some(format!(
                    "unresolved table dependency: {}",
                    missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                )),
            }
        }
    }

    pub fn validate(
        &self,
        op: &MigrationOperation,
        usage: &ResourceUsage,
        grants: &HashSet<Permission>,
        known_tables: &HashSet<String>,
    ) -> Result<ValidationResult> {
        let checks = vec![
            self.check_concurrent_operations(op),
            self.check_resources(usage),
            self.check_permission(op, grants),
            self.check_dependencies(op, known_tables),
        ];
        let passed = checks.iter().all(|c| c.outcome != CheckOutcome::Failed);

        if self.config.strict && !passed {
            let detail = checks
                .iter()
                .filter(|c| c.outcome == CheckOutcome::Failed)
                .filter_map(|c| c.detail.clone())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ErrorKind::DependencyValidationFailed(detail).into());
        }

        Ok(ValidationResult { checks, passed })
    }

    pub fn registry(&self) -> &ConcurrentOperationRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_usage() -> ResourceUsage {
        ResourceUsage {
            cpu_percent: 10.0,
            memory_mb: 100.0,
            active_connections: 2,
        }
    }

    fn all_grants() -> HashSet<Permission> {
        [Permission::Ddl, Permission::Dml, Permission::AdvisoryLock].into_iter().collect()
    }

    #[test]
    fn test_all_checks_pass_for_a_clean_ddl_operation() {
        let validator = SafetyValidator::new(SafetyConfig::default());
        let op = MigrationOperation::from_sql("CREATE TABLE t (id int)", None);
        let mut known = HashSet::new();
        known.insert("t".to_string());
        let result = validator.validate(&op, &healthy_usage(), &all_grants(), &known).unwrap();
        assert!(result.passed);
    }

    #[test]
    fn test_missing_permission_fails_validation() {
        let validator = SafetyValidator::new(SafetyConfig::default());
        let op = MigrationOperation::from_sql("CREATE TABLE t (id int)", None);
        let grants: HashSet<Permission> = [Permission::Dml].into_iter().collect();
        let mut known = HashSet::new();
        known.insert("t".to_string());
        let result = validator.validate(&op, &healthy_usage(), &grants, &known).unwrap();
        assert!(!result.passed);
    }

    #[test]
    fn test_resource_limits_exceeded_fails_validation() {
        let validator = SafetyValidator::new(SafetyConfig::default());
        let op = MigrationOperation::from_sql("SELECT 1", None);
        let overloaded = ResourceUsage {
            cpu_percent: 99.0,
            memory_mb: 8000.0,
            active_connections: 50,
        };
        let result = validator.validate(&op, &overloaded, &all_grants(), &HashSet::new()).unwrap();
        assert!(!result.passed);
    }

    #[test]
    fn test_concurrent_operation_registry_blocks_overlapping_table() {
        let validator = SafetyValidator::new(SafetyConfig::default());
        let op = MigrationOperation::from_sql("ALTER TABLE users ADD COLUMN x int", None);
        let mut tables = HashSet::new();
        tables.insert("users".to_string());
        validator.registry().register(&tables);
        let mut known = HashSet::new();
        known.insert("users".to_string());
        let result = validator.validate(&op, &healthy_usage(), &all_grants(), &known).unwrap();
        assert!(!result.passed);
    }

    #[test]
    fn test_unresolved_dependency_fails_validation() {
        let validator = SafetyValidator::new(SafetyConfig::default());
        let op = MigrationOperation::from_sql("ALTER TABLE ghost ADD COLUMN x int", None);
        let result = validator
            .validate(&op, &healthy_usage(), &all_grants(), &HashSet::new())
            .unwrap();
        assert!(!result.passed);
    }

    #[test]
    fn test_strict_mode_escalates_failure_to_error() {
        let mut config = SafetyConfig::default();
        config.strict = true;
        let validator = SafetyValidator::new(config);
        let op = MigrationOperation::from_sql("ALTER TABLE ghost ADD COLUMN x int", None);
        let result = validator.validate(&op, &healthy_usage(), &all_grants(), &HashSet::new());
        assert!(result.is_err());
    }
}
