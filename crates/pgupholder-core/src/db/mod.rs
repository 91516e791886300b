//! PostgreSQL driver integration: error classification, the pool's
//! connection manager, and the session type application code executes on.

pub mod queries;
pub mod statements;

use postgres::types::ToSql;
use postgres::{Client, NoTls, Row, Statement};
use tracing::debug;

use crate::pool::Manager;
use statements::{StatementCache, StatementKey, fingerprint};

/// Classified database error kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Connection-level failure (refused, reset, closed mid-query).
    Connection,
    /// Serialization failure or deadlock; safe to retry.
    Serialization,
    /// Insufficient privilege on a relation or function.
    PermissionDenied,
    /// Relation, extension, or function does not exist.
    UndefinedObject,
    /// Constraint violation (unique, foreign key, check, not-null).
    Constraint,
    /// Statement cancelled by statement_timeout.
    Cancelled,
    /// Feature not supported by the server or session.
    Unsupported,
    /// Anything else.
    Query,
}

/// Error type for driver operations.
#[derive(Debug)]
pub struct DbError {
    kind: DbErrorKind,
    message: String,
    sqlstate: Option<String>,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            sqlstate: None,
        }
    }

    pub fn kind(&self) -> DbErrorKind {
        self.kind
    }

    pub fn sqlstate(&self) -> Option<&str> {
        self.sqlstate.as_deref()
    }

    /// Transient errors are retried by the bulk loader with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, DbErrorKind::Connection | DbErrorKind::Serialization)
    }
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sqlstate {
            Some(code) => write!(f, "PostgreSQL [{}]: {}", code, self.message),
            None => write!(f, "PostgreSQL: {}", self.message),
        }
    }
}

impl std::error::Error for DbError {}

/// Map a five-character SQLSTATE to an error kind.
pub(crate) fn classify_sqlstate(code: &str) -> DbErrorKind {
    match code {
        "40001" | "40P01" => DbErrorKind::Serialization,
        "42501" => DbErrorKind::PermissionDenied,
        "42P01" | "42883" | "42704" => DbErrorKind::UndefinedObject,
        "57014" => DbErrorKind::Cancelled,
        "0A000" => DbErrorKind::Unsupported,
        _ if code.starts_with("08") => DbErrorKind::Connection,
        _ if code.starts_with("23") => DbErrorKind::Constraint,
        _ => DbErrorKind::Query,
    }
}

impl From<postgres::Error> for DbError {
    fn from(e: postgres::Error) -> Self {
        if let Some(db) = e.as_db_error() {
            let code = db.code().code().to_string();
            return Self {
                kind: classify_sqlstate(&code),
                message: format!("{}: {}", db.severity(), db.message()),
                sqlstate: Some(code),
            };
        }
        let msg = e.to_string();
        let message = if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else {
            msg
        };
        Self {
            kind: DbErrorKind::Connection,
            message,
            sqlstate: None,
        }
    }
}

/// Assemble a libpq-style connection string from parts, omitting an empty
/// password the way libpq tools do.
fn build_conn_string(host: &str, port: &str, user: &str, password: &str, dbname: &str) -> String {
    if password.is_empty() {
        format!("host={} port={} user={} dbname={}", host, port, user, dbname)
    } else {
        format!(
            "host={} port={} user={} password={} dbname={}",
            host, port, user, password, dbname
        )
    }
}

/// Creates sessions for the pool from a libpq-style connection string.
///
/// Connects using standard environment variables when built with
/// [`PgManager::from_env`]:
/// - PGHOST (default: localhost)
/// - PGPORT (default: 5432)
/// - PGUSER (default: $USER)
/// - PGPASSWORD (default: empty)
/// - PGDATABASE (default: same as PGUSER)
#[derive(Clone)]
pub struct PgManager {
    connection_string: String,
    statement_cache_cap: usize,
}

impl PgManager {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            statement_cache_cap: crate::config::StatementCacheConfig::default()
                .cache_cap_per_session,
        }
    }

    pub fn from_env() -> Result<Self, DbError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| DbError::new(DbErrorKind::Connection, "PGUSER or USER not set"))?;

        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_default();
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        Ok(Self::new(build_conn_string(
            &host, &port, &user, &password, &database,
        )))
    }

    /// Sets the per-session prepared statement cache capacity.
    pub fn with_statement_cache_cap(mut self, cap: usize) -> Self {
        self.statement_cache_cap = cap;
        self
    }
}

impl Manager for PgManager {
    type Conn = PgConn;

    fn connect(&self) -> Result<PgConn, DbError> {
        let mut client = Client::connect(&self.connection_string, NoTls)?;

        // Determine server version once per connection.
        let server_version_num = client
            .query_one("SHOW server_version_num", &[])
            .ok()
            .and_then(|row| row.try_get::<_, String>(0).ok())
            .and_then(|v| v.parse::<i32>().ok());

        debug!(server_version_num, "session established");

        Ok(PgConn {
            client,
            statements: StatementCache::new(self.statement_cache_cap),
            server_version_num,
        })
    }

    fn is_valid(&self, conn: &mut PgConn) -> bool {
        conn.client.simple_query("").is_ok()
    }
}

/// How `exec`/`query` treat server-side prepared statements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Prepared {
    /// Prepare and cache when the statement has parameters.
    #[default]
    Auto,
    Never,
    Force,
}

/// Per-call execution options.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecOptions {
    pub timeout_ms: Option<u64>,
    pub prepared: Prepared,
    pub read_only: bool,
}

impl ExecOptions {
    fn needs_transaction(&self) -> bool {
        self.read_only || self.timeout_ms.is_some()
    }
}

/// One database session: the driver client plus its private prepared
/// statement cache. The cache dies with the session.
pub struct PgConn {
    pub(crate) client: Client,
    statements: StatementCache<Statement>,
    server_version_num: Option<i32>,
}

impl PgConn {
    pub fn server_version_num(&self) -> Option<i32> {
        self.server_version_num
    }

    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    /// Resolve a statement through the cache, preparing it on first use.
    /// Eviction drops the displaced handle, closing it at the protocol level.
    pub(crate) fn prepared(&mut self, sql: &str) -> Result<Statement, DbError> {
        let key = fingerprint(sql);
        if let Some(stmt) = self.statements.get(&key) {
            return Ok(stmt.clone());
        }
        let stmt = self.client.prepare(sql)?;
        let _evicted = self.statements.put(&key, stmt.clone());
        Ok(stmt)
    }

    /// Whether a statement for this key is currently cached.
    pub fn has_cached(&mut self, key: &StatementKey) -> bool {
        self.statements.get(key).is_some()
    }

    /// Execute a statement, returning the affected row count.
    pub fn exec(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        opts: &ExecOptions,
    ) -> Result<u64, DbError> {
        let stmt = self.resolve(sql, params, opts)?;
        if opts.needs_transaction() {
            let mut builder = self.client.build_transaction();
            if opts.read_only {
                builder = builder.read_only(true);
            }
            let mut tx = builder.start()?;
            if let Some(ms) = opts.timeout_ms {
                tx.batch_execute(&format!("SET LOCAL statement_timeout = {}", ms))?;
            }
            let n = match &stmt {
                Some(s) => tx.execute(s, params)?,
                None => tx.execute(sql, params)?,
            };
            tx.commit()?;
            Ok(n)
        } else {
            match &stmt {
                Some(s) => Ok(self.client.execute(s, params)?),
                None => Ok(self.client.execute(sql, params)?),
            }
        }
    }

    /// Run a query, returning all rows.
    pub fn query(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        opts: &ExecOptions,
    ) -> Result<Vec<Row>, DbError> {
        let stmt = self.resolve(sql, params, opts)?;
        if opts.needs_transaction() {
            let mut builder = self.client.build_transaction();
            if opts.read_only {
                builder = builder.read_only(true);
            }
            let mut tx = builder.start()?;
            if let Some(ms) = opts.timeout_ms {
                tx.batch_execute(&format!("SET LOCAL statement_timeout = {}", ms))?;
            }
            let rows = match &stmt {
                Some(s) => tx.query(s, params)?,
                None => tx.query(sql, params)?,
            };
            tx.commit()?;
            Ok(rows)
        } else {
            match &stmt {
                Some(s) => Ok(self.client.query(s, params)?),
                None => Ok(self.client.query(sql, params)?),
            }
        }
    }

    /// Run a query expecting zero or one row.
    pub fn query_opt(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, DbError> {
        Ok(self.client.query_opt(sql, params)?)
    }

    pub fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        Ok(self.client.batch_execute(sql)?)
    }

    fn resolve(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        opts: &ExecOptions,
    ) -> Result<Option<Statement>, DbError> {
        let use_prepared = match opts.prepared {
            Prepared::Force => true,
            Prepared::Auto => !params.is_empty(),
            Prepared::Never => false,
        };
        if use_prepared {
            Ok(Some(self.prepared(sql)?))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_classification() {
        assert_eq!(classify_sqlstate("40001"), DbErrorKind::Serialization);
        assert_eq!(classify_sqlstate("40P01"), DbErrorKind::Serialization);
        assert_eq!(classify_sqlstate("42501"), DbErrorKind::PermissionDenied);
        assert_eq!(classify_sqlstate("42P01"), DbErrorKind::UndefinedObject);
        assert_eq!(classify_sqlstate("57014"), DbErrorKind::Cancelled);
        assert_eq!(classify_sqlstate("0A000"), DbErrorKind::Unsupported);
        assert_eq!(classify_sqlstate("08006"), DbErrorKind::Connection);
        assert_eq!(classify_sqlstate("23505"), DbErrorKind::Constraint);
        assert_eq!(classify_sqlstate("22012"), DbErrorKind::Query);
    }

    #[test]
    fn transient_errors_are_connection_and_serialization() {
        assert!(DbError::new(DbErrorKind::Connection, "reset").is_transient());
        assert!(DbError::new(DbErrorKind::Serialization, "retry").is_transient());
        assert!(!DbError::new(DbErrorKind::Constraint, "dup").is_transient());
        assert!(!DbError::new(DbErrorKind::PermissionDenied, "no").is_transient());
    }

    #[test]
    fn conn_string_omits_empty_password() {
        assert_eq!(
            build_conn_string("localhost", "5432", "app", "", "appdb"),
            "host=localhost port=5432 user=app dbname=appdb"
        );
        assert_eq!(
            build_conn_string("db1", "5433", "app", "secret", "appdb"),
            "host=db1 port=5433 user=app password=secret dbname=appdb"
        );
    }

    #[test]
    fn exec_options_transaction_detection() {
        assert!(!ExecOptions::default().needs_transaction());
        let ro = ExecOptions {
            read_only: true,
            ..Default::default()
        };
        assert!(ro.needs_transaction());
        let timed = ExecOptions {
            timeout_ms: Some(100),
            ..Default::default()
        };
        assert!(timed.needs_transaction());
    }
}
