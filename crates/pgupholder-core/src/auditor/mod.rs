//! Index auditor: reconciles observed workload against existing indexes.
//!
//! Catalog enumeration is a thin pass over pg_stat_user_tables /
//! pg_stat_user_indexes; every detection rule is a pure function over the
//! collected profiles so the heuristics are tested without a server.
//!
//! PostgreSQL keeps no portable index creation time, so the auditor records
//! when it first observed each index and only calls one unused after it has
//! been watched for `min_age_days`. Findings are always advisory here; the
//! orchestrator decides what may be applied.

use std::collections::HashMap;

use tracing::debug;

use crate::analyzer::WorkloadRef;
use crate::config::AuditorConfig;
use crate::db::queries::{build_avg_width_query, build_index_profiles_query,
    build_table_profiles_query};
use crate::db::{DbError, ExecOptions, PgConn};
use crate::fmt::format_bytes;
use crate::report::{FindingKind, IndexFinding};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
/// Modified-tuple count beyond which statistics are considered stale.
const STALE_MIN_MODIFICATIONS: i64 = 1_000;
const STALE_MODIFIED_FRACTION: f64 = 0.2;

/// Statistics snapshot for one user table.
#[derive(Clone, Debug)]
pub struct TableProfile {
    pub schema: String,
    pub name: String,
    pub row_estimate: f64,
    pub total_bytes: i64,
    pub heap_bytes: i64,
    pub index_bytes: i64,
    pub seq_scan_count: i64,
    pub idx_scan_count: i64,
    pub n_tup_upd: i64,
    pub n_tup_hot_upd: i64,
    pub n_live_tup: i64,
    pub n_dead_tup: i64,
    pub n_mod_since_analyze: i64,
    pub last_analyze_ms: i64,
    /// Sum of column widths from pg_stats; 0 when never analyzed.
    pub avg_row_width: f64,
}

impl TableProfile {
    pub fn seq_ratio(&self) -> f64 {
        self.seq_scan_count as f64 / (self.seq_scan_count + self.idx_scan_count + 1) as f64
    }

    pub fn hot_update_ratio(&self) -> f64 {
        self.n_tup_hot_upd as f64 / (self.n_tup_upd + 1) as f64
    }

    pub fn qualified(&self) -> String {
        if self.schema == "public" {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }
}

/// Statistics snapshot for one index.
#[derive(Clone, Debug)]
pub struct IndexProfile {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
    pub is_primary: bool,
    pub is_exclusion: bool,
    pub is_partial: bool,
    pub predicate: String,
    pub size_bytes: i64,
    pub scans: i64,
    pub tuples_read: i64,
    pub tuples_fetched: i64,
}

impl IndexProfile {
    /// Indexes that enforce constraints are never drop candidates.
    pub fn constraint_backed(&self) -> bool {
        self.is_unique || self.is_primary || self.is_exclusion
    }

    pub fn qualified(&self) -> String {
        if self.schema == "public" {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }
}

/// Result of one audit pass.
#[derive(Debug, Default)]
pub struct AuditOutcome {
    pub findings: Vec<IndexFinding>,
    /// Qualified names of tables whose statistics look stale (ANALYZE
    /// candidates for the safe-apply path).
    pub stale_tables: Vec<String>,
    pub tables_seen: usize,
    pub indexes_seen: usize,
}

/// Enumerates the catalog and evaluates the detection rules.
pub struct IndexAuditor {
    cfg: AuditorConfig,
    first_seen_ms: HashMap<String, i64>,
}

impl IndexAuditor {
    pub fn new(cfg: AuditorConfig) -> Self {
        Self {
            cfg,
            first_seen_ms: HashMap::new(),
        }
    }

    pub fn config(&self) -> &AuditorConfig {
        &self.cfg
    }

    /// Run one audit pass on the given session.
    pub fn run(
        &mut self,
        conn: &mut PgConn,
        now_ms: i64,
        workload: &[WorkloadRef],
    ) -> Result<AuditOutcome, DbError> {
        let tables = self.collect_tables(conn)?;
        let indexes = self.collect_indexes(conn)?;
        debug!(tables = tables.len(), indexes = indexes.len(), "catalog enumerated");

        // Track first observation per index; forget vanished ones.
        for idx in &indexes {
            self.first_seen_ms.entry(idx.qualified()).or_insert(now_ms);
        }
        let live: Vec<String> = indexes.iter().map(|i| i.qualified()).collect();
        self.first_seen_ms.retain(|name, _| live.contains(name));

        let findings = audit(
            &tables,
            &indexes,
            workload,
            &self.first_seen_ms,
            now_ms,
            &self.cfg,
        );

        Ok(AuditOutcome {
            findings,
            stale_tables: stale_tables(&tables),
            tables_seen: tables.len(),
            indexes_seen: indexes.len(),
        })
    }

    fn collect_tables(&self, conn: &mut PgConn) -> Result<Vec<TableProfile>, DbError> {
        let limit = self.cfg.max_tables_per_pass as i64;
        let rows = conn.query(
            build_table_profiles_query(),
            &[&self.cfg.schemas, &limit],
            &ExecOptions::default(),
        )?;

        let mut widths: HashMap<String, f64> = HashMap::new();
        for row in conn.query(
            build_avg_width_query(),
            &[&self.cfg.schemas],
            &ExecOptions::default(),
        )? {
            widths.insert(row.get("tablename"), row.get("avg_row_width"));
        }

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("relname");
            let avg_row_width = widths.get(&name).copied().unwrap_or(0.0);
            tables.push(TableProfile {
                schema: row.get("schemaname"),
                name,
                row_estimate: row.get("row_estimate"),
                total_bytes: row.get("total_bytes"),
                heap_bytes: row.get("heap_bytes"),
                index_bytes: row.get("index_bytes"),
                seq_scan_count: row.get("seq_scan"),
                idx_scan_count: row.get("idx_scan"),
                n_tup_upd: row.get("n_tup_upd"),
                n_tup_hot_upd: row.get("n_tup_hot_upd"),
                n_live_tup: row.get("n_live_tup"),
                n_dead_tup: row.get("n_dead_tup"),
                n_mod_since_analyze: row.get("n_mod_since_analyze"),
                last_analyze_ms: row.get::<_, i64>("last_analyze_epoch") * 1000,
                avg_row_width,
            });
        }
        Ok(tables)
    }

    fn collect_indexes(&self, conn: &mut PgConn) -> Result<Vec<IndexProfile>, DbError> {
        let rows = conn.query(
            build_index_profiles_query(),
            &[&self.cfg.schemas],
            &ExecOptions::default(),
        )?;
        let mut indexes = Vec::with_capacity(rows.len());
        for row in rows {
            let key_columns: String = row.get("key_columns");
            indexes.push(IndexProfile {
                schema: row.get("schemaname"),
                table: row.get("relname"),
                name: row.get("indexrelname"),
                columns: key_columns
                    .split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect(),
                is_unique: row.get("is_unique"),
                is_primary: row.get("is_primary"),
                is_exclusion: row.get("is_exclusion"),
                is_partial: row.get("is_partial"),
                predicate: row.get("predicate"),
                size_bytes: row.get("size_bytes"),
                scans: row.get("idx_scan"),
                tuples_read: row.get("idx_tup_read"),
                tuples_fetched: row.get("idx_tup_fetch"),
            });
        }
        Ok(indexes)
    }
}

/// Evaluate every detection rule over the collected profiles.
pub fn audit(
    tables: &[TableProfile],
    indexes: &[IndexProfile],
    workload: &[WorkloadRef],
    first_seen_ms: &HashMap<String, i64>,
    now_ms: i64,
    cfg: &AuditorConfig,
) -> Vec<IndexFinding> {
    let mut findings = Vec::new();
    findings.extend(detect_missing(tables, indexes, workload, cfg));
    findings.extend(detect_unused(indexes, first_seen_ms, now_ms, cfg));
    findings.extend(detect_duplicates(indexes));
    findings.extend(detect_bloated(tables, indexes, cfg));
    findings
}

/// Tables whose statistics have drifted enough that ANALYZE is warranted.
fn stale_tables(tables: &[TableProfile]) -> Vec<String> {
    tables
        .iter()
        .filter(|t| {
            t.n_mod_since_analyze
                > STALE_MIN_MODIFICATIONS
                    .max((t.row_estimate * STALE_MODIFIED_FRACTION) as i64)
        })
        .map(TableProfile::qualified)
        .collect()
}

/// Missing-index heuristic: seq-scan-heavy tables cross-referenced with the
/// analyzer's workload; suppressed when an existing index already leads with
/// the same columns.
fn detect_missing(
    tables: &[TableProfile],
    indexes: &[IndexProfile],
    workload: &[WorkloadRef],
    cfg: &AuditorConfig,
) -> Vec<IndexFinding> {
    let mut findings = Vec::new();

    for table in tables {
        if table.seq_ratio() <= cfg.seq_ratio_threshold
            || table.row_estimate <= cfg.min_rows
            || table.total_bytes < cfg.min_table_bytes
        {
            continue;
        }

        // Qualifying statements: seq-scan flagged by a sampled plan, or
        // plan-less statements on this already seq-scan-heavy table.
        let mut by_columns: HashMap<Vec<String>, i64> = HashMap::new();
        for wref in workload {
            if wref.relation != table.name || wref.columns.is_empty() {
                continue;
            }
            if wref.seq_scan || !wref.has_plan {
                *by_columns.entry(wref.columns.clone()).or_insert(0) += wref.calls;
            }
        }

        let Some((columns, calls)) = by_columns
            .into_iter()
            .max_by_key(|&(_, calls)| calls)
        else {
            continue;
        };

        let covered = indexes.iter().any(|idx| {
            idx.table == table.name
                && idx.columns.len() >= columns.len()
                && idx.columns[..columns.len()] == columns[..]
        });
        if covered {
            continue;
        }

        let confidence = (calls as f64 / 100.0).min(1.0);
        findings.push(IndexFinding {
            schema: table.schema.clone(),
            table: table.name.clone(),
            kind: FindingKind::Missing,
            index: None,
            columns: columns.clone(),
            evidence: format!(
                "{:.0}% of scans are sequential over ~{:.0} rows; {} qualifying calls \
                 filter on ({})",
                table.seq_ratio() * 100.0,
                table.row_estimate,
                calls,
                columns.join(", ")
            ),
            confidence,
            recommendation: format!(
                "create an index on {} ({})",
                table.qualified(),
                columns.join(", ")
            ),
            ddl: Some(format!(
                "CREATE INDEX ON {} ({})",
                table.qualified(),
                columns.join(", ")
            )),
            safe: true,
        });
    }
    findings
}

/// Unused-index detection. Constraint-backed indexes are never flagged, and
/// an index must have been observed for `min_age_days` before it qualifies.
fn detect_unused(
    indexes: &[IndexProfile],
    first_seen_ms: &HashMap<String, i64>,
    now_ms: i64,
    cfg: &AuditorConfig,
) -> Vec<IndexFinding> {
    let min_age_ms = cfg.min_age_days * DAY_MS;
    let mut findings = Vec::new();

    for idx in indexes {
        if idx.constraint_backed() || idx.scans > cfg.unused_idx_scan_threshold {
            continue;
        }
        let Some(&first_seen) = first_seen_ms.get(&idx.qualified()) else {
            continue;
        };
        let age_ms = now_ms - first_seen;
        if age_ms < min_age_ms {
            continue;
        }
        findings.push(IndexFinding {
            schema: idx.schema.clone(),
            table: idx.table.clone(),
            kind: FindingKind::Unused,
            index: Some(idx.name.clone()),
            columns: idx.columns.clone(),
            evidence: format!(
                "{} scans over {} days observed; size {}",
                idx.scans,
                age_ms / DAY_MS,
                format_bytes(idx.size_bytes.max(0) as u64)
            ),
            confidence: 0.9,
            recommendation: format!(
                "index {} appears unused; review and drop manually",
                idx.qualified()
            ),
            ddl: Some(format!("DROP INDEX {}", idx.qualified())),
            safe: false,
        });
    }
    findings
}

/// Duplicate and redundant-prefix detection over per-table index groups.
fn detect_duplicates(indexes: &[IndexProfile]) -> Vec<IndexFinding> {
    let mut findings = Vec::new();
    let mut flagged: Vec<String> = Vec::new();

    let mut by_table: HashMap<(&str, &str), Vec<&IndexProfile>> = HashMap::new();
    for idx in indexes {
        by_table
            .entry((idx.schema.as_str(), idx.table.as_str()))
            .or_default()
            .push(idx);
    }

    for group in by_table.values_mut() {
        group.sort_by(|a, b| a.name.cmp(&b.name));
        for i in 0..group.len() {
            for j in (i + 1)..group.len() {
                let (a, b) = (group[i], group[j]);
                if a.is_partial || b.is_partial || a.columns.is_empty() {
                    continue;
                }
                if a.columns == b.columns && a.is_unique == b.is_unique {
                    if !flagged.contains(&b.name) {
                        flagged.push(b.name.clone());
                        findings.push(IndexFinding {
                            schema: b.schema.clone(),
                            table: b.table.clone(),
                            kind: FindingKind::Duplicate,
                            index: Some(b.name.clone()),
                            columns: b.columns.clone(),
                            evidence: format!("identical column list to {}", a.name),
                            confidence: 1.0,
                            recommendation: format!(
                                "index {} duplicates {}; drop one of them",
                                b.name, a.name
                            ),
                            ddl: Some(format!("DROP INDEX {}", b.qualified())),
                            safe: false,
                        });
                    }
                    continue;
                }
                // A strict prefix of B makes the shorter, non-unique one redundant.
                let (short, long) = if a.columns.len() < b.columns.len() {
                    (a, b)
                } else {
                    (b, a)
                };
                if !short.is_unique
                    && short.columns.len() < long.columns.len()
                    && long.columns[..short.columns.len()] == short.columns[..]
                    && !flagged.contains(&short.name)
                {
                    flagged.push(short.name.clone());
                    findings.push(IndexFinding {
                        schema: short.schema.clone(),
                        table: short.table.clone(),
                        kind: FindingKind::RedundantPrefix,
                        index: Some(short.name.clone()),
                        columns: short.columns.clone(),
                        evidence: format!(
                            "({}) is a prefix of {} ({})",
                            short.columns.join(", "),
                            long.name,
                            long.columns.join(", ")
                        ),
                        confidence: 0.9,
                        recommendation: format!(
                            "index {} is covered by {}; consider dropping it",
                            short.name, long.name
                        ),
                        ddl: Some(format!("DROP INDEX {}", short.qualified())),
                        safe: false,
                    });
                }
            }
        }
    }
    findings
}

/// Statistics-driven bloat estimate: expected heap bytes from row estimate
/// and average width vs. actual heap size, cross-checked against the dead
/// tuple counters.
fn detect_bloated(
    tables: &[TableProfile],
    indexes: &[IndexProfile],
    cfg: &AuditorConfig,
) -> Vec<IndexFinding> {
    let mut findings = Vec::new();

    for table in tables {
        let dead_frac = dead_fraction(table, cfg);
        if dead_frac <= cfg.bloat_threshold {
            continue;
        }
        for idx in indexes
            .iter()
            .filter(|i| i.table == table.name && i.schema == table.schema)
        {
            if idx.size_bytes <= cfg.min_bloat_bytes {
                continue;
            }
            findings.push(IndexFinding {
                schema: idx.schema.clone(),
                table: idx.table.clone(),
                kind: FindingKind::Bloated,
                index: Some(idx.name.clone()),
                columns: idx.columns.clone(),
                evidence: format!(
                    "estimated dead fraction {:.0}% on {} ({} index)",
                    dead_frac * 100.0,
                    table.qualified(),
                    format_bytes(idx.size_bytes.max(0) as u64)
                ),
                confidence: dead_frac.min(1.0),
                recommendation: format!(
                    "rebuild {} with REINDEX CONCURRENTLY during low traffic",
                    idx.qualified()
                ),
                ddl: Some(format!("REINDEX INDEX CONCURRENTLY {}", idx.qualified())),
                safe: false,
            });
        }
    }
    findings
}

fn dead_fraction(table: &TableProfile, cfg: &AuditorConfig) -> f64 {
    let counter_frac =
        table.n_dead_tup as f64 / (table.n_live_tup + table.n_dead_tup + 1) as f64;

    if table.avg_row_width <= 0.0 || table.heap_bytes <= 0 {
        return counter_frac;
    }
    let expected = table.row_estimate * (cfg.tuple_header_bytes + table.avg_row_width)
        / cfg.fillfactor;
    let estimator_frac = (1.0 - expected / table.heap_bytes as f64).clamp(0.0, 1.0);
    estimator_frac.max(counter_frac)
}
