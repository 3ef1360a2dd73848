use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::pg_types::lock_modes::LockMode;

/// The kind of change a [`MigrationOperation`] makes. Detection is pattern-based
/// on normalized SQL text; ties are broken by specificity (`CREATE INDEX
/// CONCURRENTLY` before `CREATE INDEX`, `CREATE UNIQUE INDEX` before plain
/// `CREATE INDEX`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    CreateTable,
    DropTable,
    AddColumn,
    DropColumn,
    AlterColumn,
    CreateIndex,
    CreateIndexConcurrent,
    DropIndex,
    AddConstraint,
    RenameTable,
    Insert,
    Update,
    Delete,
    Select,
    Reindex,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

struct KindPattern {
    kind: OperationKind,
    regex: &'static Lazy<Regex>,
}

// Order matters: more specific patterns are listed before the general patterns
// they're a special case of, matching the specificity rule in the contract.
static RE_CREATE_UNIQUE_INDEX_CONCURRENTLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*CREATE\s+UNIQUE\s+INDEX\s+CONCURRENTLY").unwrap()
});
static RE_CREATE_INDEX_CONCURRENTLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*CREATE\s+(UNIQUE\s+)?INDEX\s+CONCURRENTLY").unwrap());
static RE_CREATE_UNIQUE_INDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*CREATE\s+UNIQUE\s+INDEX\b").unwrap());
static RE_CREATE_INDEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*CREATE\s+INDEX\b").unwrap());
static RE_DROP_INDEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*DROP\s+INDEX\b").unwrap());
static RE_REINDEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*REINDEX\b").unwrap());
static RE_CREATE_TABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*CREATE\s+TABLE\b").unwrap());
static RE_DROP_TABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*DROP\s+TABLE\b").unwrap());
static RE_RENAME_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*ALTER\s+TABLE\s+\S+\s+RENAME\s+TO\b").unwrap());
static RE_ADD_COLUMN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*ALTER\s+TABLE\s+\S+\s+ADD\s+COLUMN\b").unwrap());
static RE_DROP_COLUMN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*ALTER\s+TABLE\s+\S+\s+DROP\s+COLUMN\b").unwrap());
static RE_ADD_CONSTRAINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*ALTER\s+TABLE\s+\S+\s+ADD\s+CONSTRAINT\b").unwrap());
static RE_ALTER_COLUMN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*ALTER\s+TABLE\s+\S+\s+ALTER\s+COLUMN\b").unwrap());
static RE_INSERT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*INSERT\s+INTO\b").unwrap());
static RE_UPDATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*UPDATE\b").unwrap());
static RE_DELETE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*DELETE\s+FROM\b").unwrap());
static RE_SELECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*SELECT\b").unwrap());

fn kind_patterns() -> Vec<KindPattern> {
    vec![
        KindPattern { kind: OperationKind::CreateIndexConcurrent, regex: &RE_CREATE_UNIQUE_INDEX_CONCURRENTLY },
        KindPattern { kind: OperationKind::CreateIndexConcurrent, regex: &RE_CREATE_INDEX_CONCURRENTLY },
        KindPattern { kind: OperationKind::CreateIndex, regex: &RE_CREATE_UNIQUE_INDEX },
        KindPattern { kind: OperationKind::CreateIndex, regex: &RE_CREATE_INDEX },
        KindPattern { kind: OperationKind::DropIndex, regex: &RE_DROP_INDEX },
        KindPattern { kind: OperationKind::Reindex, regex: &RE_REINDEX },
        KindPattern { kind: OperationKind::RenameTable, regex: &RE_RENAME_TABLE },
        KindPattern { kind: OperationKind::AddColumn, regex: &RE_ADD_COLUMN },
        KindPattern { kind: OperationKind::DropColumn, regex: &RE_DROP_COLUMN },
        KindPattern { kind: OperationKind::AddConstraint, regex: &RE_ADD_CONSTRAINT },
        KindPattern { kind: OperationKind::AlterColumn, regex: &RE_ALTER_COLUMN },
        KindPattern { kind: OperationKind::CreateTable, regex: &RE_CREATE_TABLE },
        KindPattern { kind: OperationKind::DropTable, regex: &RE_DROP_TABLE },
        KindPattern { kind: OperationKind::Insert, regex: &RE_INSERT },
        KindPattern { kind: OperationKind::Update, regex: &RE_UPDATE },
        KindPattern { kind: OperationKind::Delete, regex: &RE_DELETE },
        KindPattern { kind: OperationKind::Select, regex: &RE_SELECT },
    ]
}

/// Classify normalized SQL text into an [`OperationKind`]. Pure function of the
/// input string.
pub fn classify(sql: &str) -> OperationKind {
    for pattern in kind_patterns() {
        if pattern.regex.is_match(sql) {
            return pattern.kind;
        }
    }
    OperationKind::Other
}

/// The table-level lock a statement of this kind takes, absent any finer-grained
/// knowledge of which variant (e.g. which `ALTER TABLE` subform) was used. This
/// is deliberately the *strongest* lock a kind can plausibly take; the explainer
/// may refine it using `hints_for` when more context is available.
pub fn default_lock_level(kind: OperationKind) -> LockMode {
    use LockMode::*;
    match kind {
        OperationKind::Select => AccessShare,
        OperationKind::Insert | OperationKind::Update | OperationKind::Delete => RowExclusive,
        OperationKind::CreateIndexConcurrent => ShareUpdateExclusive,
        OperationKind::CreateIndex => Share,
        OperationKind::AddColumn | OperationKind::AddConstraint => AccessExclusive,
        OperationKind::AlterColumn
        | OperationKind::DropColumn
        | OperationKind::DropTable
        | OperationKind::DropIndex
        | OperationKind::RenameTable
        | OperationKind::Reindex => AccessExclusive,
        OperationKind::CreateTable => AccessExclusive,
        OperationKind::Other => AccessExclusive,
    }
}

static RE_TABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?:FROM|INTO|TABLE|UPDATE|ON)\s+("?[a-zA-Z_][a-zA-Z0-9_.]*"?)"#).unwrap()
});

/// Extract the relation names referenced by a statement, best-effort. This is
/// intentionally a lightweight regex scan (matching the teacher's comment-parsing
/// idiom) rather than a full AST walk: the analyzer only needs a conservative
/// over-approximation of affected tables to build the conflict graph.
pub fn extract_tables(sql: &str) -> BTreeSet<String> {
    RE_TABLE_NAME
        .captures_iter(sql)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().trim_matches('"').to_ascii_lowercase())
        .collect()
}

/// One atomic unit of schema or data change, annotated with everything the
/// runtime derives from its SQL before scheduling it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOperation {
    pub sql: String,
    pub kind: OperationKind,
    pub affected_tables: BTreeSet<String>,
    pub affected_columns: BTreeSet<String>,
    pub lock_level: LockMode,
    pub risk_level: RiskLevel,
    pub estimated_duration_ms: u64,
    pub is_partial: bool,
    pub is_unique: bool,
    pub index_method: Option<String>,
    pub predicate: Option<String>,
}

impl MigrationOperation {
    /// Build an operation from raw SQL, deriving every field the contract
    /// requires to be deterministic given `sql` (and an optional row-count hint
    /// used for duration estimation).
    pub fn from_sql(sql: impl Into<String>, estimated_rows: Option<u64>) -> Self {
        let sql = sql.into();
        let kind = classify(&sql);
        let affected_tables = extract_tables(&sql);
        let lock_level = default_lock_level(kind);
        let is_unique = Regex::new(r"(?i)CREATE\s+UNIQUE\s+INDEX")
            .unwrap()
            .is_match(&sql);
        let is_partial = sql.to_ascii_uppercase().contains(" WHERE ")
            && matches!(kind, OperationKind::CreateIndex | OperationKind::CreateIndexConcurrent);
        let index_method = Regex::new(r"(?i)USING\s+(\w+)")
            .unwrap()
            .captures(&sql)
            .map(|c| c[1].to_ascii_lowercase());
        let predicate = if is_partial {
            Regex::new(r"(?i)WHERE\s+(.+)$")
                .unwrap()
                .captures(&sql)
                .map(|c| c[1].trim_end_matches(';').trim().to_string())
        } else {
            None
        };
        let risk_level = default_risk_level(kind, estimated_rows);
        let estimated_duration_ms = estimate_duration_ms(kind, estimated_rows);

        MigrationOperation {
            sql,
            kind,
            affected_tables,
            affected_columns: BTreeSet::new(),
            lock_level,
            risk_level,
            estimated_duration_ms,
            is_partial,
            is_unique,
            index_method,
            predicate,
        }
    }

    pub fn blocks_reads(&self) -> bool {
        matches!(self.lock_level, LockMode::AccessExclusive)
    }

    pub fn blocks_writes(&self) -> bool {
        matches!(
            self.lock_level,
            LockMode::Share | LockMode::ShareRowExclusive | LockMode::Exclusive | LockMode::AccessExclusive
        )
    }
}

fn default_risk_level(kind: OperationKind, _estimated_rows: Option<u64>) -> RiskLevel {
    match kind {
        OperationKind::DropTable | OperationKind::AlterColumn | OperationKind::Reindex => {
            RiskLevel::Critical
        }
        OperationKind::CreateIndex | OperationKind::AddColumn | OperationKind::AddConstraint => {
            RiskLevel::High
        }
        OperationKind::DropColumn | OperationKind::RenameTable | OperationKind::DropIndex => {
            RiskLevel::Medium
        }
        OperationKind::CreateIndexConcurrent => RiskLevel::Medium,
        OperationKind::CreateTable => RiskLevel::Low,
        OperationKind::Insert | OperationKind::Update | OperationKind::Delete | OperationKind::Select => {
            RiskLevel::Low
        }
        OperationKind::Other => RiskLevel::Medium,
    }
}

fn estimate_duration_ms(kind: OperationKind, estimated_rows: Option<u64>) -> u64 {
    let rows = estimated_rows.unwrap_or(1_000);
    match kind {
        // Concurrent index builds scan the table twice.
        OperationKind::CreateIndexConcurrent => (rows / 1_000).max(50) * 2,
        OperationKind::CreateIndex | OperationKind::Reindex => (rows / 1_000).max(50),
        OperationKind::AlterColumn => (rows / 500).max(100),
        OperationKind::AddColumn | OperationKind::AddConstraint => (rows / 2_000).max(20),
        OperationKind::CreateTable | OperationKind::DropTable | OperationKind::DropColumn
        | OperationKind::DropIndex | OperationKind::RenameTable => 20,
        OperationKind::Insert | OperationKind::Update | OperationKind::Delete => (rows / 5_000).max(5),
        OperationKind::Select => 5,
        OperationKind::Other => 20,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_prefers_concurrent_unique_index_over_plain_index() {
        let op = "CREATE UNIQUE INDEX CONCURRENTLY idx_x ON t (a)";
        assert_eq!(classify(op), OperationKind::CreateIndexConcurrent);
    }

    #[test]
    fn test_classify_plain_create_index() {
        assert_eq!(classify("CREATE INDEX idx_x ON t (a)"), OperationKind::CreateIndex);
    }

    #[test]
    fn test_classify_drop_table_is_critical() {
        let op = MigrationOperation::from_sql("DROP TABLE users", None);
        assert_eq!(op.kind, OperationKind::DropTable);
        assert_eq!(op.risk_level, RiskLevel::Critical);
        assert!(op.blocks_reads());
    }

    #[test]
    fn test_extract_tables_from_simple_statements() {
        let tables = extract_tables("INSERT INTO public.users (id) VALUES (1)");
        assert!(tables.contains("public.users"));
    }

    #[test]
    fn test_partial_index_detection() {
        let op = MigrationOperation::from_sql(
            "CREATE INDEX CONCURRENTLY idx_active ON users (id) WHERE active = true",
            None,
        );
        assert!(op.is_partial);
        assert_eq!(op.predicate.as_deref(), Some("active = true"));
    }

    #[test]
    fn test_select_blocks_neither_reads_nor_writes() {
        let op = MigrationOperation::from_sql("SELECT * FROM users", None);
        assert!(!op.blocks_reads());
        assert!(!op.blocks_writes());
    }
}
