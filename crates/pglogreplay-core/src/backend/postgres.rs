//! PostgreSQL backend.
//!
//! Each statement runs under `EXPLAIN (FORMAT JSON, ANALYZE, BUFFERS, VERBOSE)`
//! in a read-only transaction that is always rolled back. Statements go over
//! the extended query protocol, so the server refuses text holding more than
//! one command. The connection is opened on first use and kept for the rest
//! of the run.

use postgres::error::SqlState;
use postgres::{Client, NoTls, Row};
use tracing::{debug, info, warn};

use super::{Backend, parse_explain_value};
use crate::cancel::CancelFlag;
use crate::error::BackendError;
use crate::stats::PlanMetrics;

/// Connection timeout passed to libpq, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 2;

/// Connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub connect_timeout_secs: u64,
    /// `statement_timeout` applied to the session, in milliseconds.
    pub statement_timeout_ms: Option<u64>,
}

impl PostgresConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            statement_timeout_ms: None,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    pub fn with_statement_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.statement_timeout_ms = timeout_ms.filter(|&ms| ms > 0);
        self
    }

    /// libpq key/value connection string.
    pub fn connection_string(&self) -> String {
        let mut parts = vec![
            format!("host={}", quote_conn_value(&self.host)),
            format!("port={}", self.port),
            format!("user={}", quote_conn_value(&self.user)),
        ];
        if let Some(password) = &self.password {
            parts.push(format!("password={}", quote_conn_value(password)));
        }
        parts.push(format!("dbname={}", quote_conn_value(&self.database)));
        parts.push(format!("connect_timeout={}", self.connect_timeout_secs));
        parts.join(" ")
    }
}

/// Quote a connection string value when it is empty or contains spaces,
/// quotes or backslashes.
fn quote_conn_value(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

/// Backend replaying statements on a live PostgreSQL server.
pub struct PostgresBackend {
    config: PostgresConfig,
    client: Option<Client>,
    cancel: CancelFlag,
}

impl PostgresBackend {
    pub fn new(config: PostgresConfig, cancel: CancelFlag) -> Self {
        Self {
            config,
            client: None,
            cancel,
        }
    }

    /// Connect eagerly, surfacing configuration problems before the run.
    pub fn try_connect(&mut self) -> Result<(), BackendError> {
        self.ensure_connected().map(|_| ())
    }

    fn ensure_connected(&mut self) -> Result<&mut Client, BackendError> {
        if self.client.is_none() {
            let mut client = Client::connect(&self.config.connection_string(), NoTls)
                .map_err(|e| BackendError::Connection(format_postgres_error(&e)))?;

            if let Some(ms) = self.config.statement_timeout_ms {
                client
                    .batch_execute(&format!("SET statement_timeout = {}", ms))
                    .map_err(|e| classify_error(&e, false))?;
            }

            let token = client.cancel_token();
            self.cancel.on_cancel(move || {
                if let Err(e) = token.cancel_query(NoTls) {
                    warn!(error = %e, "failed to cancel running query");
                }
            });

            info!(
                host = %self.config.host,
                port = self.config.port,
                database = %self.config.database,
                "connected to PostgreSQL"
            );
            self.client = Some(client);
        }
        self.client
            .as_mut()
            .ok_or_else(|| BackendError::Connection("not connected".to_string()))
    }

    fn explain(&mut self, sql: &str) -> Result<Vec<Row>, BackendError> {
        let client = self.ensure_connected()?;
        let mut tx = client
            .build_transaction()
            .read_only(true)
            .start()
            .map_err(|e| classify_error(&e, false))?;
        let outcome = tx.query(sql, &[]);
        let rolled_back = tx.rollback();

        let cancelled = self.cancel.is_cancelled();
        let rows = outcome.map_err(|e| classify_error(&e, cancelled))?;
        rolled_back.map_err(|e| classify_error(&e, cancelled))?;
        Ok(rows)
    }
}

impl Backend for PostgresBackend {
    fn execute_with_plan(&mut self, query: &str) -> Result<PlanMetrics, BackendError> {
        if self.cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let sql = format!("EXPLAIN (FORMAT JSON, ANALYZE, BUFFERS, VERBOSE) {}", query);
        let rows = match self.explain(&sql) {
            Ok(rows) => rows,
            Err(e) => {
                if matches!(e, BackendError::Connection(_)) {
                    self.client = None;
                }
                return Err(e);
            }
        };

        let row = rows
            .first()
            .ok_or_else(|| BackendError::InvalidPlan("EXPLAIN returned no rows".to_string()))?;
        let plan: serde_json::Value = row
            .try_get(0)
            .map_err(|e| BackendError::InvalidPlan(format!("unexpected EXPLAIN column: {}", e)))?;
        parse_explain_value(plan)
    }

    fn close(&mut self) {
        if let Some(client) = self.client.take() {
            match client.close() {
                Ok(()) => debug!("PostgreSQL connection closed"),
                Err(e) => warn!(error = %format_postgres_error(&e), "error closing PostgreSQL connection"),
            }
        }
    }
}

impl Drop for PostgresBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Map a driver error onto the backend error taxonomy.
fn classify_error(e: &postgres::Error, cancelled: bool) -> BackendError {
    let Some(db) = e.as_db_error() else {
        return BackendError::Connection(format_postgres_error(e));
    };
    let code = db.code();
    if *code == SqlState::QUERY_CANCELED && cancelled {
        return BackendError::Cancelled;
    }
    if is_connection_state(code.code()) {
        return BackendError::Connection(format_postgres_error(e));
    }
    BackendError::Statement {
        severity: db.severity().to_string(),
        code: code.code().to_string(),
        message: db.message().to_string(),
    }
}

/// SQLSTATE class 08 (connection exception) and 57P0x (operator intervention
/// that ends the session).
fn is_connection_state(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("57P0")
}

/// Formats a PostgreSQL error into a concise, user-readable message.
fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}
