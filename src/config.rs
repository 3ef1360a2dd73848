use serde::{Deserialize, Serialize};

/// Every runtime tunable named throughout the component contracts, aggregated into
/// one plain-data struct. Nothing in this crate reads environment variables or files
/// directly; populating a `RuntimeConfig` from outside sources is a caller concern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backpressure: BackpressureConfig,
    pub batch: BatchConfig,
    pub cic: CicConfig,
    pub transaction: TransactionConfig,
    pub lock_monitor: LockMonitorConfig,
    pub verifier: VerifierConfig,
    pub safety: SafetyConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            backpressure: BackpressureConfig::default(),
            batch: BatchConfig::default(),
            cic: CicConfig::default(),
            transaction: TransactionConfig::default(),
            lock_monitor: LockMonitorConfig::default(),
            verifier: VerifierConfig::default(),
            safety: SafetyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackpressureConfig {
    pub enabled: bool,
    pub max_concurrent_operations: usize,
    pub base_rate_limit: f64,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub monitoring_interval_ms: u64,
    pub pool_utilization_warning: f64,
    pub pool_utilization_critical: f64,
    pub response_time_warning_ms: f64,
    pub queue_depth_warning: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        BackpressureConfig {
            enabled: true,
            max_concurrent_operations: 10,
            base_rate_limit: 50.0,
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            monitoring_interval_ms: 1_000,
            pool_utilization_warning: 0.6,
            pool_utilization_critical: 0.85,
            response_time_warning_ms: 500.0,
            queue_depth_warning: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_memory_mb: f64,
    pub allow_concurrent_schema: bool,
    pub lock_timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_batch_size: 50,
            max_memory_mb: 256.0,
            allow_concurrent_schema: false,
            lock_timeout_ms: 5_000,
        }
    }
}

/// Minimum supported PostgreSQL major version for the CIC cleanup probe
/// (`pg_index.indisvalid`, stable since PG 8.2). No runtime feature detection
/// is performed; operators running an older server are unsupported.
pub const MIN_SUPPORTED_POSTGRES_MAJOR: u32 = 12;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CicConfig {
    pub max_parallel_tables: usize,
    pub max_retries_per_operation: u32,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for CicConfig {
    fn default() -> Self {
        CicConfig {
            max_parallel_tables: 4,
            max_retries_per_operation: 3,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransactionConfig {
    pub max_savepoints: usize,
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            max_savepoints: 16,
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockMonitorConfig {
    pub monitoring_interval_ms: u64,
    pub deadlock_check_interval_ms: u64,
    pub contention_waiting_count_threshold: usize,
    pub contention_total_wait_ms_threshold: f64,
    pub max_wait_time_ms: f64,
    pub max_blocked_queries: usize,
    pub max_lock_hold_time_ms: f64,
}

impl Default for LockMonitorConfig {
    fn default() -> Self {
        LockMonitorConfig {
            monitoring_interval_ms: 2_000,
            deadlock_check_interval_ms: 5_000,
            contention_waiting_count_threshold: 3,
            contention_total_wait_ms_threshold: 5_000.0,
            max_wait_time_ms: 10_000.0,
            max_blocked_queries: 5,
            max_lock_hold_time_ms: 60_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifierConfig {
    pub checksum_algorithm: ChecksumAlgorithm,
    pub strict: bool,
    pub performance_regression_threshold: f64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            strict: false,
            performance_regression_threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SafetyConfig {
    pub strict: bool,
    pub max_cpu_percent: f64,
    pub max_memory_mb: f64,
    pub max_connections: usize,
    pub resource_warning_percent: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        SafetyConfig {
            strict: false,
            max_cpu_percent: 80.0,
            max_memory_mb: 4096.0,
            max_connections: 20,
            resource_warning_percent: 0.75,
        }
    }
}
