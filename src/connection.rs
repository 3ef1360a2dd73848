use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::select;
use tracing::{debug, instrument, warn};

use crate::error::{ContextualResult, ErrorKind, Result};

/// One result row, represented independently of any concrete driver's row type so
/// that [`Connection`] implementors (real or scripted) can produce it uniformly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: HashMap<String, Value>,
}

impl Row {
    pub fn new(columns: HashMap<String, Value>) -> Self {
        Row { columns }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    pub fn get_i32(&self, column: &str) -> Option<i32> {
        self.get_i64(column).map(|v| v as i32)
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(Value::as_bool)
    }
}

/// The capability every runtime component depends on in order to talk to the
/// database, per the design note's guidance to define an explicit capability
/// trait rather than reach for a concrete driver type or duck-typed client.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement that does not return rows, returning the affected-row count.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Execute a statement and return its result rows.
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// The backend process id of this session, as reported by `pg_backend_pid()`.
    /// Used by cooperative statement cancellation.
    fn backend_pid(&self) -> i32;

    /// Request cancellation of whatever statement is currently executing on this
    /// session (`pg_cancel_backend` semantics). Does not close the session.
    async fn cancel(&self) -> Result<()>;
}

/// Production [`Connection`] backed by `tokio-postgres`.
///
/// Grounded on `orf-locksmith`'s `StatementExecutor`: the client and its driving
/// `Connection` future are raced with `tokio::select!` so the connection task keeps
/// polling for `AsyncMessage::Notice` (lock-wait log lines) while statements run.
pub struct PgConnection {
    client: tokio_postgres::Client,
    backend_pid: i32,
    cancel_token: tokio_postgres::CancelToken,
}

impl PgConnection {
    #[instrument(skip(config))]
    pub async fn connect(config: &tokio_postgres::Config) -> Result<Self> {
        let (client, mut connection) = config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| ErrorKind::ConnectionError(e.to_string()))
            .with_context("connecting to postgres")?;

        let cancel_token = client.cancel_token();

        let backend_pid_row = client
            .query_one("SELECT pg_backend_pid() AS pid", &[])
            .await
            .map_err(|e| ErrorKind::SqlError(e.to_string()))
            .with_context("fetching backend pid")?;
        let backend_pid: i32 = backend_pid_row.get("pid");

        // Drive the connection in the background, forwarding async notices
        // (lock-wait log lines under log_lock_waits) to tracing instead of
        // dropping them, as locksmith's executor does with AsyncMessage::Notice.
        tokio::spawn(async move {
            loop {
                select! {
                    message = futures_util::future::poll_fn(|cx| connection.poll_message(cx)) => {
                        match message {
                            Some(Ok(tokio_postgres::AsyncMessage::Notice(notice))) => {
                                debug!(message = %notice, "postgres notice");
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "postgres connection error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        client
            .batch_execute(
                "SET log_lock_waits = true; SET client_min_messages = 'log';",
            )
            .await
            .map_err(|e| ErrorKind::SqlError(e.to_string()))
            .with_context("configuring session for lock-wait logging")?;

        Ok(PgConnection {
            client,
            backend_pid,
            cancel_token,
        })
    }

    fn convert_row(row: &tokio_postgres::Row) -> Row {
        let mut columns = HashMap::new();
        for (i, col) in row.columns().iter().enumerate() {
            let value = pg_value_to_json(row, i);
            columns.insert(col.name().to_string(), value);
        }
        Row::new(columns)
    }
}

fn pg_value_to_json(row: &tokio_postgres::Row, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<_, Option<String>>(idx) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<i64>>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<i32>>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<f64>>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<bool>>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    Value::Null
}

#[async_trait]
impl Connection for PgConnection {
    #[instrument(skip(self, sql))]
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.client
            .execute(sql, &[])
            .await
            .map_err(|e| ErrorKind::SqlError(e.to_string()).into())
    }

    #[instrument(skip(self, sql))]
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let rows = self
            .client
            .query(sql, &[])
            .await
            .map_err(|e| ErrorKind::SqlError(e.to_string()))
            .with_context("executing query")?;
        Ok(rows.iter().map(Self::convert_row).collect())
    }

    fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    async fn cancel(&self) -> Result<()> {
        self.cancel_token
            .cancel_query(tokio_postgres::NoTls)
            .await
            .map_err(|e| ErrorKind::SqlError(e.to_string()).into())
    }
}

/// A scripted response for one call made against a [`ScriptedConnection`].
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Execute(u64),
    Query(Vec<Row>),
    Error(String),
    /// Sleep for the given number of milliseconds before yielding the wrapped
    /// response; used to exercise timeout/cancellation behavior in tests.
    Delayed(u64, Box<ScriptedResponse>),
}

/// Deterministic, in-memory [`Connection`] used throughout this crate's test suite,
/// since the runtime core cannot depend on a live database for unit tests. Calls
/// are matched against a queue of scripted responses in order; call text is
/// recorded so tests can assert on what SQL was actually issued.
pub struct ScriptedConnection {
    responses: Mutex<Vec<ScriptedResponse>>,
    calls: Mutex<Vec<String>>,
    cursor: AtomicUsize,
    backend_pid: i32,
}

impl ScriptedConnection {
    pub fn new(backend_pid: i32, responses: Vec<ScriptedResponse>) -> Self {
        ScriptedConnection {
            responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            backend_pid,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn next_response(&self) -> Option<ScriptedResponse> {
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.responses.lock().unwrap().get(idx).cloned()
    }

    /// Resolve a response to its non-`Delayed` form, sleeping first if it was
    /// wrapped in one. Used so `execute`/`query` don't each need to unwrap it.
    async fn resolve(response: Option<ScriptedResponse>) -> Option<ScriptedResponse> {
        match response {
            Some(ScriptedResponse::Delayed(ms, inner)) => {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                Some(*inner)
            }
            other => other,
        }
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.calls.lock().unwrap().push(sql.to_string());
        match Self::resolve(self.next_response()).await {
            Some(ScriptedResponse::Execute(n)) => Ok(n),
            Some(ScriptedResponse::Error(message)) => Err(ErrorKind::SqlError(message).into()),
            Some(ScriptedResponse::Query(_)) | Some(ScriptedResponse::Delayed(..)) | None => Ok(0),
        }
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.calls.lock().unwrap().push(sql.to_string());
        match Self::resolve(self.next_response()).await {
            Some(ScriptedResponse::Query(rows)) => Ok(rows),
            Some(ScriptedResponse::Error(message)) => Err(ErrorKind::SqlError(message).into()),
            Some(ScriptedResponse::Execute(_)) | Some(ScriptedResponse::Delayed(..)) | None => Ok(Vec::new()),
        }
    }

    fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    async fn cancel(&self) -> Result<()> {
        self.calls.lock().unwrap().push("<cancel>".to_string());
        Ok(())
    }
}
