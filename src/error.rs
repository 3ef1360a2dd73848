use std::fmt;

/// Stable, matchable error classification for every failure the runtime can surface.
///
/// Every variant maps to one of the error codes named in the specification: callers
/// should match on `kind()` rather than parse `Display` output.
#[derive(thiserror::Error, Debug)]
pub enum ErrorKind {
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("circuit breaker is open")]
    CircuitBreakerOpen,
    #[error("connection pool exhausted")]
    PoolExhausted,
    #[error("race condition detected between operations")]
    RaceCondition,
    #[error("lock escalation risk")]
    LockEscalationRisk,
    #[error("transaction deadlocked after exhausting retries")]
    Deadlock,
    #[error("savepoint error: {0}")]
    SavepointError(String),
    #[error("no active transaction")]
    NoActiveTransaction,
    #[error("a transaction is already active")]
    TransactionAlreadyActive,
    #[error("operation timed out after {0}ms")]
    Timeout(u64),
    #[error("concurrent operation conflict: {0}")]
    ConcurrentOperationConflict(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("dependency validation failed: {0}")]
    DependencyValidationFailed(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("schema comparison error: {0}")]
    SchemaComparisonError(String),
    #[error("data integrity error: {0}")]
    DataIntegrityError(String),
    #[error("deadlock cycle detected among processes: {0:?}")]
    DeadlockCycleDetected(Vec<i32>),
    #[error("invalid lock mode string: {0}")]
    InvalidLock(String),
    #[error("sql execution error: {0}")]
    SqlError(String),
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl ErrorKind {
    /// True for failures that a retry loop may reasonably retry without
    /// caller intervention (transient lock contention, not policy rejections).
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorKind::Deadlock)
    }

    /// True for admission-control rejections that a caller should treat as a signal
    /// to back off, not as evidence of a broken run.
    pub fn is_policy_reject(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimitExceeded
                | ErrorKind::CircuitBreakerOpen
                | ErrorKind::PoolExhausted
        )
    }
}

/// Classify a raw database error message by PostgreSQL SQLSTATE-style heuristics.
/// Used by the transaction manager and CIC orchestrator retry loops so they share
/// one definition of "this is a deadlock".
pub fn is_deadlock_message(message: &str) -> bool {
    message.contains("40P01") || message.to_lowercase().contains("deadlock")
}

/// Serialization failure (`40001`), also retriable under `SERIALIZABLE` isolation.
pub fn is_serialization_failure_message(message: &str) -> bool {
    message.contains("40001") || message.to_lowercase().contains("could not serialize access")
}

/// The runtime's error type: an inner [`ErrorKind`] plus a stack of context strings
/// pushed by each layer that handled (and re-raised) the error, outermost last.
#[derive(Debug)]
pub struct Error {
    context: Vec<String>,
    kind: ErrorKind,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            context: Vec::new(),
            kind,
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for ctx in self.context.iter().rev() {
            write!(f, ": {}", ctx)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(value: E) -> Self {
        Error::new(value.into())
    }
}

/// Extension trait for attaching human-readable context to a `Result` as it
/// propagates up through layers, without losing the original typed `ErrorKind`.
pub trait ContextualError {
    fn with_context<S: Into<String>>(self, context: S) -> Error;
}

impl ContextualError for Error {
    fn with_context<S: Into<String>>(mut self, context: S) -> Error {
        self.context.push(context.into());
        self
    }
}

impl ContextualError for ErrorKind {
    fn with_context<S: Into<String>>(self, context: S) -> Error {
        Error::new(self).with_context(context)
    }
}

pub trait ContextualResult<T> {
    fn with_context<S: Into<String>>(self, context: S) -> Result<T>;
}

impl<T, E> ContextualResult<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn with_context<S: Into<String>>(self, context: S) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
