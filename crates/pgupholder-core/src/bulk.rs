//! Bulk loader: routes batch writes to the cheapest viable mechanism.
//!
//! Method selection by row count: per-row inserts for tiny batches,
//! multi-row VALUES statements for small ones, prepared-statement batches
//! for medium ones, and server-side COPY for large loads. Conflict-bearing
//! COPY streams into a session-temporary staging table and upserts from
//! there in one statement.
//!
//! Every attempt runs in a single transaction on a freshly acquired session;
//! transient failures retry with full-jitter exponential backoff.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use bytes::BytesMut;
use chrono::{TimeZone, Utc};
use postgres::types::{IsNull, ToSql, Type};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::BulkConfig;
use crate::db::{DbError, DbErrorKind, PgManager};
use crate::pool::{Pool, PoolError};

const SINGLE_INSERT_MAX: usize = 50;
const MULTI_VALUES_MAX: usize = 1_000;
const PREPARED_BATCH_MAX: usize = 10_000;

/// One column value in a bulk row.
#[derive(Clone, Debug, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    TimestampMs(i64),
    Json(serde_json::Value),
}

impl Datum {
    fn kind_tag(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Int(_) => 2,
            Datum::Float(_) => 3,
            Datum::Text(_) => 4,
            Datum::TimestampMs(_) => 5,
            Datum::Json(_) => 6,
        }
    }

    fn approx_bytes(&self) -> u64 {
        match self {
            Datum::Null => 1,
            Datum::Bool(_) => 1,
            Datum::Int(_) | Datum::Float(_) | Datum::TimestampMs(_) => 8,
            Datum::Text(s) => s.len() as u64,
            Datum::Json(v) => v.to_string().len() as u64,
        }
    }
}

impl ToSql for Datum {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Datum::Null => Ok(IsNull::Yes),
            Datum::Bool(b) => b.to_sql(ty, out),
            Datum::Int(i) => match *ty {
                Type::INT2 => (*i as i16).to_sql(ty, out),
                Type::INT4 => (*i as i32).to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            Datum::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            Datum::Text(s) => s.as_str().to_sql(ty, out),
            Datum::TimestampMs(ms) => {
                let when = UNIX_EPOCH + Duration::from_millis((*ms).max(0) as u64);
                when.to_sql(ty, out)
            }
            Datum::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Dynamic values: type mismatches surface as encode errors at
        // execution time rather than being rejected up front.
        true
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        self.to_sql(ty, out)
    }
}

/// Mechanism selected for a load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkMethod {
    SingleInsert,
    MultiValues,
    PreparedBatch,
    CopyFrom,
}

/// Server-side conflict handling for insert-style methods.
#[derive(Clone, Debug, PartialEq)]
pub enum OnConflict {
    /// Constraint violations abort the load.
    Error,
    Ignore,
    UpdateAll,
    UpdateColumns(Vec<String>),
}

/// One bulk load request.
#[derive(Clone, Debug)]
pub struct BulkJob {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Datum>>,
    /// Conflict target columns; required for the update policies.
    pub key_columns: Vec<String>,
    pub on_conflict: OnConflict,
}

/// Outcome of one bulk load.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct BulkResult {
    pub rows_loaded: u64,
    pub conflicts_skipped: u64,
    pub bytes: u64,
    pub elapsed_ms: u64,
    pub method_used: BulkMethod,
    pub retries: u32,
}

/// Bulk load error.
#[derive(Debug)]
pub enum BulkError {
    /// Malformed job: ragged rows, bad conflict spec. Never retried.
    BadInput(String),
    Pool(PoolError),
    Db(DbError),
    /// Transient failures exhausted the retry budget.
    Exhausted { attempts: u32, last: DbError },
}

impl std::fmt::Display for BulkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BulkError::BadInput(msg) => write!(f, "bad bulk input: {}", msg),
            BulkError::Pool(e) => write!(f, "bulk load could not acquire a session: {}", e),
            BulkError::Db(e) => write!(f, "bulk load failed: {}", e),
            BulkError::Exhausted { attempts, last } => {
                write!(f, "bulk load gave up after {} attempts: {}", attempts, last)
            }
        }
    }
}

impl std::error::Error for BulkError {}

/// Routes bulk writes through the pool. Never retains a session across calls.
pub struct BulkLoader {
    pool: Arc<Pool<PgManager>>,
    cfg: BulkConfig,
}

impl BulkLoader {
    pub fn new(pool: Arc<Pool<PgManager>>, cfg: BulkConfig) -> Self {
        Self { pool, cfg }
    }

    pub fn load(&self, job: &BulkJob) -> Result<BulkResult, BulkError> {
        validate(job)?;
        let t0 = Instant::now();

        if job.rows.is_empty() {
            return Ok(BulkResult {
                rows_loaded: 0,
                conflicts_skipped: 0,
                bytes: 0,
                elapsed_ms: 0,
                method_used: BulkMethod::SingleInsert,
                retries: 0,
            });
        }

        let mut method = select_method(job.rows.len(), stable_types(&job.rows), &self.cfg);
        let mut retries: u32 = 0;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let mut conn = self
                .pool
                .acquire(self.pool.config().acquire_timeout())
                .map_err(BulkError::Pool)?;

            match execute(&mut conn, job, method, &self.cfg) {
                Ok((rows_loaded, bytes)) => {
                    let sent = job.rows.len() as u64;
                    return Ok(BulkResult {
                        rows_loaded,
                        conflicts_skipped: sent.saturating_sub(rows_loaded),
                        bytes,
                        elapsed_ms: t0.elapsed().as_millis() as u64,
                        method_used: method,
                        retries,
                    });
                }
                Err(e)
                    if method == BulkMethod::CopyFrom
                        && matches!(
                            e.kind(),
                            DbErrorKind::PermissionDenied | DbErrorKind::Unsupported
                        ) =>
                {
                    warn!(error = %e, "copy stream refused, falling back to prepared batch");
                    conn.discard();
                    method = BulkMethod::PreparedBatch;
                    retries += 1;
                }
                Err(e) if e.is_transient() && attempt < self.cfg.max_attempts => {
                    let delay = backoff_delay_ms(attempt, self.cfg.backoff_base_ms);
                    debug!(error = %e, attempt, delay_ms = delay, "transient bulk failure, retrying");
                    conn.discard();
                    retries += 1;
                    std::thread::sleep(Duration::from_millis(delay));
                }
                Err(e) if e.is_transient() => {
                    conn.discard();
                    return Err(BulkError::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    conn.discard();
                    return Err(BulkError::Db(e));
                }
            }
        }
    }
}

/// Selection rules, first match wins.
pub fn select_method(rows: usize, stable_types: bool, _cfg: &BulkConfig) -> BulkMethod {
    if rows < SINGLE_INSERT_MAX {
        BulkMethod::SingleInsert
    } else if rows < MULTI_VALUES_MAX {
        BulkMethod::MultiValues
    } else if rows < PREPARED_BATCH_MAX {
        if stable_types {
            BulkMethod::PreparedBatch
        } else {
            BulkMethod::MultiValues
        }
    } else {
        BulkMethod::CopyFrom
    }
}

/// Whether every column carries one consistent value type (nulls aside).
pub fn stable_types(rows: &[Vec<Datum>]) -> bool {
    let Some(first) = rows.first() else {
        return true;
    };
    let width = first.len();
    for col in 0..width {
        let mut seen: Option<u8> = None;
        for row in rows {
            let datum = &row[col];
            if matches!(datum, Datum::Null) {
                continue;
            }
            match seen {
                None => seen = Some(datum.kind_tag()),
                Some(tag) if tag != datum.kind_tag() => return false,
                Some(_) => {}
            }
        }
    }
    true
}

fn validate(job: &BulkJob) -> Result<(), BulkError> {
    if job.columns.is_empty() {
        return Err(BulkError::BadInput("no columns".to_string()));
    }
    for (i, row) in job.rows.iter().enumerate() {
        if row.len() != job.columns.len() {
            return Err(BulkError::BadInput(format!(
                "row {} has {} values, expected {}",
                i,
                row.len(),
                job.columns.len()
            )));
        }
    }
    match &job.on_conflict {
        OnConflict::UpdateAll if job.key_columns.is_empty() => Err(BulkError::BadInput(
            "update_all requires key_columns".to_string(),
        )),
        OnConflict::UpdateColumns(cols) => {
            if job.key_columns.is_empty() {
                return Err(BulkError::BadInput(
                    "update_specified requires key_columns".to_string(),
                ));
            }
            for col in cols {
                if !job.columns.contains(col) {
                    return Err(BulkError::BadInput(format!(
                        "update column {} not in column list",
                        col
                    )));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn execute(
    conn: &mut crate::db::PgConn,
    job: &BulkJob,
    method: BulkMethod,
    cfg: &BulkConfig,
) -> Result<(u64, u64), DbError> {
    let approx_bytes = || -> u64 {
        job.rows
            .iter()
            .flat_map(|r| r.iter())
            .map(Datum::approx_bytes)
            .sum()
    };

    match method {
        BulkMethod::SingleInsert | BulkMethod::PreparedBatch => {
            let sql = build_insert_sql_for(job, 1)?;
            let stmt = conn.prepared(&sql)?;
            let mut tx = conn.client.transaction()?;
            let mut loaded = 0;
            for row in &job.rows {
                let params: Vec<&(dyn ToSql + Sync)> =
                    row.iter().map(|d| d as &(dyn ToSql + Sync)).collect();
                loaded += tx.execute(&stmt, &params)?;
            }
            tx.commit()?;
            Ok((loaded, approx_bytes()))
        }
        BulkMethod::MultiValues => {
            let mut tx = conn.client.transaction()?;
            let mut loaded = 0;
            for chunk in job.rows.chunks(cfg.values_per_statement) {
                let sql = build_insert_sql_for(job, chunk.len())?;
                let params: Vec<&(dyn ToSql + Sync)> = chunk
                    .iter()
                    .flat_map(|r| r.iter())
                    .map(|d| d as &(dyn ToSql + Sync))
                    .collect();
                loaded += tx.execute(&sql, &params)?;
            }
            tx.commit()?;
            Ok((loaded, approx_bytes()))
        }
        BulkMethod::CopyFrom => execute_copy(conn, job, cfg),
    }
}

fn execute_copy(
    conn: &mut crate::db::PgConn,
    job: &BulkJob,
    cfg: &BulkConfig,
) -> Result<(u64, u64), DbError> {
    let columns = job.columns.join(", ");
    let direct = matches!(job.on_conflict, OnConflict::Error);
    let staging = format!("{}_load_stage", job.table.replace('.', "_"));

    let mut tx = conn.client.transaction()?;

    let copy_target = if direct {
        job.table.clone()
    } else {
        tx.batch_execute(&format!(
            "CREATE TEMP TABLE {} (LIKE {} INCLUDING DEFAULTS) ON COMMIT DROP",
            staging, job.table
        ))?;
        staging.clone()
    };

    let mut writer = tx.copy_in(&format!(
        "COPY {} ({}) FROM STDIN",
        copy_target, columns
    ))?;
    let mut bytes: u64 = 0;
    let mut buf = String::new();
    for chunk in job.rows.chunks(cfg.copy_chunk_rows) {
        buf.clear();
        for row in chunk {
            encode_copy_row(row, &mut buf);
        }
        bytes += buf.len() as u64;
        writer
            .write_all(buf.as_bytes())
            .map_err(|e| DbError::new(DbErrorKind::Connection, e.to_string()))?;
    }
    let copied = writer.finish()?;

    let loaded = if direct {
        copied
    } else {
        let clause = conflict_clause(&job.on_conflict, &job.columns, &job.key_columns)
            .map_err(|e| DbError::new(DbErrorKind::Query, e.to_string()))?;
        tx.execute(
            &format!(
                "INSERT INTO {} ({}) SELECT {} FROM {} {}",
                job.table, columns, columns, staging, clause
            ),
            &[],
        )?
    };
    tx.commit()?;
    Ok((loaded, bytes))
}

fn build_insert_sql_for(job: &BulkJob, rows: usize) -> Result<String, DbError> {
    let clause = conflict_clause(&job.on_conflict, &job.columns, &job.key_columns)
        .map_err(|e| DbError::new(DbErrorKind::Query, e.to_string()))?;
    let width = job.columns.len();
    let mut values = String::new();
    for r in 0..rows {
        if r > 0 {
            values.push_str(", ");
        }
        values.push('(');
        for c in 0..width {
            if c > 0 {
                values.push_str(", ");
            }
            values.push('$');
            values.push_str(&(r * width + c + 1).to_string());
        }
        values.push(')');
    }
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        job.table,
        job.columns.join(", "),
        values
    );
    if !clause.is_empty() {
        sql.push(' ');
        sql.push_str(&clause);
    }
    Ok(sql)
}

fn conflict_clause(
    policy: &OnConflict,
    columns: &[String],
    keys: &[String],
) -> Result<String, String> {
    match policy {
        OnConflict::Error => Ok(String::new()),
        OnConflict::Ignore => {
            if keys.is_empty() {
                Ok("ON CONFLICT DO NOTHING".to_string())
            } else {
                Ok(format!("ON CONFLICT ({}) DO NOTHING", keys.join(", ")))
            }
        }
        OnConflict::UpdateAll => {
            if keys.is_empty() {
                return Err("update_all requires key columns".to_string());
            }
            let sets: Vec<String> = columns
                .iter()
                .filter(|c| !keys.contains(c))
                .map(|c| format!("{} = EXCLUDED.{}", c, c))
                .collect();
            if sets.is_empty() {
                return Ok(format!("ON CONFLICT ({}) DO NOTHING", keys.join(", ")));
            }
            Ok(format!(
                "ON CONFLICT ({}) DO UPDATE SET {}",
                keys.join(", "),
                sets.join(", ")
            ))
        }
        OnConflict::UpdateColumns(cols) => {
            if keys.is_empty() {
                return Err("update_specified requires key columns".to_string());
            }
            let sets: Vec<String> = cols
                .iter()
                .map(|c| format!("{} = EXCLUDED.{}", c, c))
                .collect();
            Ok(format!(
                "ON CONFLICT ({}) DO UPDATE SET {}",
                keys.join(", "),
                sets.join(", ")
            ))
        }
    }
}

/// Full-jitter exponential backoff: uniform in [0, base * 2^(attempt-1)].
fn backoff_delay_ms(attempt: u32, base_ms: u64) -> u64 {
    let ceiling = base_ms.saturating_mul(1_u64 << (attempt - 1).min(16));
    rand::thread_rng().gen_range(0..=ceiling)
}

/// COPY text-format encoding: tab-separated, newline-terminated, `\N` nulls.
pub(crate) fn encode_copy_row(row: &[Datum], out: &mut String) {
    for (i, datum) in row.iter().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        encode_copy_value(datum, out);
    }
    out.push('\n');
}

fn encode_copy_value(datum: &Datum, out: &mut String) {
    match datum {
        Datum::Null => out.push_str("\\N"),
        Datum::Bool(true) => out.push('t'),
        Datum::Bool(false) => out.push('f'),
        Datum::Int(i) => out.push_str(&i.to_string()),
        Datum::Float(f) => out.push_str(&f.to_string()),
        Datum::Text(s) => escape_copy_text(s, out),
        Datum::TimestampMs(ms) => out.push_str(&format_timestamp_ms(*ms)),
        Datum::Json(v) => escape_copy_text(&v.to_string(), out),
    }
}

fn escape_copy_text(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
}

/// Epoch milliseconds to `YYYY-MM-DD HH:MM:SS.mmm` UTC, the form the COPY
/// text protocol accepts for timestamp columns.
fn format_timestamp_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(rows: Vec<Vec<Datum>>, on_conflict: OnConflict, keys: &[&str]) -> BulkJob {
        BulkJob {
            table: "clicks".to_string(),
            columns: vec!["id".to_string(), "campaign_id".to_string(), "ip".to_string()],
            rows,
            key_columns: keys.iter().map(|k| k.to_string()).collect(),
            on_conflict,
        }
    }

    fn row(id: i64) -> Vec<Datum> {
        vec![
            Datum::Int(id),
            Datum::Int(id * 10),
            Datum::Text(format!("10.0.0.{}", id)),
        ]
    }

    #[test]
    fn method_selection_by_row_count() {
        let cfg = BulkConfig::default();
        assert_eq!(select_method(20, true, &cfg), BulkMethod::SingleInsert);
        assert_eq!(select_method(49, true, &cfg), BulkMethod::SingleInsert);
        assert_eq!(select_method(50, true, &cfg), BulkMethod::MultiValues);
        assert_eq!(select_method(500, true, &cfg), BulkMethod::MultiValues);
        assert_eq!(select_method(999, true, &cfg), BulkMethod::MultiValues);
        assert_eq!(select_method(1_000, true, &cfg), BulkMethod::PreparedBatch);
        assert_eq!(select_method(5_000, true, &cfg), BulkMethod::PreparedBatch);
        assert_eq!(select_method(9_999, true, &cfg), BulkMethod::PreparedBatch);
        assert_eq!(select_method(10_000, true, &cfg), BulkMethod::CopyFrom);
        assert_eq!(select_method(50_000, true, &cfg), BulkMethod::CopyFrom);
    }

    #[test]
    fn unstable_types_demote_prepared_batch() {
        let cfg = BulkConfig::default();
        assert_eq!(select_method(5_000, false, &cfg), BulkMethod::MultiValues);
        // Copy handles mixed rows via text encoding regardless.
        assert_eq!(select_method(50_000, false, &cfg), BulkMethod::CopyFrom);
    }

    #[test]
    fn stable_types_ignores_nulls() {
        let rows = vec![
            vec![Datum::Int(1), Datum::Null],
            vec![Datum::Null, Datum::Text("x".to_string())],
            vec![Datum::Int(3), Datum::Text("y".to_string())],
        ];
        assert!(stable_types(&rows));

        let mixed = vec![
            vec![Datum::Int(1)],
            vec![Datum::Text("oops".to_string())],
        ];
        assert!(!stable_types(&mixed));
    }

    #[test]
    fn insert_sql_single_row_with_ignore() {
        let j = job(vec![row(1)], OnConflict::Ignore, &[]);
        let sql = build_insert_sql_for(&j, 1).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO clicks (id, campaign_id, ip) VALUES ($1, $2, $3) \
             ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn insert_sql_numbers_placeholders_across_rows() {
        let j = job(vec![row(1), row(2)], OnConflict::Error, &[]);
        let sql = build_insert_sql_for(&j, 2).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO clicks (id, campaign_id, ip) VALUES ($1, $2, $3), ($4, $5, $6)"
        );
    }

    #[test]
    fn conflict_clause_update_all_excludes_keys() {
        let clause = conflict_clause(
            &OnConflict::UpdateAll,
            &["id".to_string(), "campaign_id".to_string(), "ip".to_string()],
            &["id".to_string()],
        )
        .unwrap();
        assert_eq!(
            clause,
            "ON CONFLICT (id) DO UPDATE SET campaign_id = EXCLUDED.campaign_id, \
             ip = EXCLUDED.ip"
        );
    }

    #[test]
    fn conflict_clause_update_specified() {
        let clause = conflict_clause(
            &OnConflict::UpdateColumns(vec!["ip".to_string()]),
            &["id".to_string(), "ip".to_string()],
            &["id".to_string()],
        )
        .unwrap();
        assert_eq!(clause, "ON CONFLICT (id) DO UPDATE SET ip = EXCLUDED.ip");
    }

    #[test]
    fn update_policies_require_keys() {
        assert!(conflict_clause(&OnConflict::UpdateAll, &["a".to_string()], &[]).is_err());
        assert!(
            conflict_clause(&OnConflict::UpdateColumns(vec!["a".to_string()]), &["a".to_string()], &[])
                .is_err()
        );
    }

    #[test]
    fn validate_rejects_ragged_rows() {
        let mut j = job(vec![row(1)], OnConflict::Error, &[]);
        j.rows.push(vec![Datum::Int(2)]);
        let err = validate(&j).unwrap_err();
        assert!(matches!(err, BulkError::BadInput(_)));
    }

    #[test]
    fn validate_rejects_unknown_update_column() {
        let j = job(
            vec![row(1)],
            OnConflict::UpdateColumns(vec!["nope".to_string()]),
            &["id"],
        );
        assert!(matches!(validate(&j).unwrap_err(), BulkError::BadInput(_)));
    }

    #[test]
    fn validate_accepts_well_formed_jobs() {
        assert!(validate(&job(vec![row(1), row(2)], OnConflict::Ignore, &["id"])).is_ok());
    }

    #[test]
    fn copy_encoding_escapes_and_terminates() {
        let mut out = String::new();
        encode_copy_row(
            &[
                Datum::Int(7),
                Datum::Null,
                Datum::Text("a\tb\nc\\d".to_string()),
                Datum::Bool(true),
            ],
            &mut out,
        );
        assert_eq!(out, "7\t\\N\ta\\tb\\nc\\\\d\tt\n");
    }

    #[test]
    fn copy_encoding_formats_timestamps() {
        let mut out = String::new();
        encode_copy_value(&Datum::TimestampMs(0), &mut out);
        assert_eq!(out, "1970-01-01 00:00:00.000");

        let mut out = String::new();
        // 2026-08-02 03:04:05.678 UTC
        encode_copy_value(&Datum::TimestampMs(1_785_639_845_678), &mut out);
        assert!(out.starts_with("2026-08-02 "));
        assert!(out.ends_with(".678"));
    }

    #[test]
    fn backoff_delay_is_bounded_full_jitter() {
        for attempt in 1..=4 {
            for _ in 0..50 {
                let d = backoff_delay_ms(attempt, 100);
                assert!(d <= 100 * (1 << (attempt - 1)));
            }
        }
    }

    #[test]
    fn approx_bytes_counts_payload() {
        assert_eq!(Datum::Text("abcd".to_string()).approx_bytes(), 4);
        assert_eq!(Datum::Int(1).approx_bytes(), 8);
        assert_eq!(Datum::Null.approx_bytes(), 1);
    }
}
