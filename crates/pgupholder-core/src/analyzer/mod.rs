//! Query analyzer: turns pg_stat_statements rows and sampled plans into
//! actionable issues.
//!
//! Collection is a thin pass over the statistics view; everything that
//! decides severity is a pure function over the collected data, so the
//! classification rules are tested without a server.

pub mod plan;
pub mod sqlscan;

use std::collections::HashMap;

use rand::Rng;
use tracing::{debug, info};

use crate::config::AnalyzerConfig;
use crate::db::queries::{build_extension_check_query, build_relation_rows_query,
    build_mcv_query, build_statement_stats_query};
use crate::db::statements::fingerprint;
use crate::db::{DbError, ExecOptions, PgConn, Prepared};
use crate::fmt::truncate_sql;
use crate::report::{IssueKind, QueryIssue, Severity};
use plan::{Plan, parse_explain};

const SAMPLE_DISPLAY_CHARS: usize = 100;
/// Below this many touched blocks the locality ratio is noise.
const LOCALITY_MIN_BLOCKS: i64 = 100;
const VARIANCE_RATIO_MAX: f64 = 5.0;
const CACHE_LOCALITY_MIN: f64 = 0.5;
/// slow_mean turns critical at this multiple of the threshold.
const CRITICAL_SLOW_FACTOR: f64 = 10.0;

/// One row of statement statistics.
#[derive(Clone, Debug)]
pub struct QueryStat {
    pub fingerprint: u64,
    pub sample_text: String,
    pub calls: i64,
    pub total_ms: f64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub stddev_ms: f64,
    pub rows: i64,
    pub shared_blks_hit: i64,
    pub shared_blks_read: i64,
}

impl QueryStat {
    /// Share of block reads served from shared buffers.
    pub fn cache_locality(&self) -> f64 {
        self.shared_blks_hit as f64
            / (self.shared_blks_hit + self.shared_blks_read + 1) as f64
    }

    pub fn variance_ratio(&self) -> f64 {
        (self.max_ms - self.min_ms) / (self.mean_ms + f64::EPSILON)
    }
}

/// Per-(statement, relation) workload reference handed to the index auditor.
#[derive(Clone, Debug)]
pub struct WorkloadRef {
    pub fingerprint: u64,
    pub relation: String,
    pub columns: Vec<String>,
    pub calls: i64,
    pub seq_scan: bool,
    /// Whether a sampled plan backs the seq_scan flag. Without a plan the
    /// auditor falls back to table-level scan ratios.
    pub has_plan: bool,
}

/// Result of one analyzer pass.
#[derive(Debug, Default)]
pub struct AnalyzerOutcome {
    pub issues: Vec<QueryIssue>,
    pub workload: Vec<WorkloadRef>,
    pub statements_seen: usize,
    pub extension_present: bool,
}

/// Reads statement statistics, samples plans, and classifies issues.
pub struct QueryAnalyzer {
    cfg: AnalyzerConfig,
    prev_calls: HashMap<u64, i64>,
    missing_logged: bool,
}

impl QueryAnalyzer {
    pub fn new(cfg: AnalyzerConfig) -> Self {
        Self {
            cfg,
            prev_calls: HashMap::new(),
            missing_logged: false,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.cfg
    }

    /// Run one analysis pass on the given session.
    pub fn run(&mut self, conn: &mut PgConn) -> Result<AnalyzerOutcome, DbError> {
        if conn.query_opt(build_extension_check_query(), &[])?.is_none() {
            if !self.missing_logged {
                info!("pg_stat_statements is not installed; query analysis disabled");
                self.missing_logged = true;
            }
            return Ok(AnalyzerOutcome {
                issues: vec![extension_missing_issue()],
                ..AnalyzerOutcome::default()
            });
        }
        self.missing_logged = false;

        let sql = build_statement_stats_query(conn.server_version_num());
        let rows = conn.query(
            &sql,
            &[&self.cfg.min_calls, &self.cfg.top_n],
            &ExecOptions::default(),
        )?;

        let mut stats = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row.get("query");
            let trimmed = text.trim_start();
            if self
                .cfg
                .ignore_prefixes
                .iter()
                .any(|p| trimmed.starts_with(p.as_str()))
            {
                continue;
            }
            stats.push(QueryStat {
                fingerprint: fingerprint(&text).hash(),
                sample_text: text,
                calls: row.get("calls"),
                total_ms: row.get("total_ms"),
                mean_ms: row.get("mean_ms"),
                min_ms: row.get("min_ms"),
                max_ms: row.get("max_ms"),
                stddev_ms: row.get("stddev_ms"),
                rows: row.get("rows"),
                shared_blks_hit: row.get("shared_blks_hit"),
                shared_blks_read: row.get("shared_blks_read"),
            });
        }

        self.detect_counter_reset(&stats);

        // Sample plans for a fraction of statements; EXPLAIN failures are
        // swallowed so one bad reconstruction never fails the pass.
        let mut plans: HashMap<u64, Plan> = HashMap::new();
        let mut rng = rand::thread_rng();
        for stat in &stats {
            if rng.gen_range(0.0..1.0) >= self.cfg.explain_sample_rate {
                continue;
            }
            match self.explain(conn, &stat.sample_text) {
                Ok(Some(plan)) => {
                    plans.insert(stat.fingerprint, plan);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(fingerprint = stat.fingerprint, error = %e, "explain skipped");
                }
            }
        }

        let row_estimates = self.relation_row_estimates(conn, &plans)?;
        let issues = classify(&stats, &plans, &row_estimates, &self.cfg);
        let workload = build_workload(&stats, &plans);

        Ok(AnalyzerOutcome {
            issues,
            workload,
            statements_seen: stats.len(),
            extension_present: true,
        })
    }

    /// Counters going backwards mean the extension was reset; drop the
    /// baseline rather than reporting negative activity.
    fn detect_counter_reset(&mut self, stats: &[QueryStat]) {
        let reset = stats
            .iter()
            .any(|s| self.prev_calls.get(&s.fingerprint).is_some_and(|&p| s.calls < p));
        if reset {
            info!("pg_stat_statements counters reset detected, baseline cleared");
            self.prev_calls.clear();
        }
        for s in stats {
            self.prev_calls.insert(s.fingerprint, s.calls);
        }
    }

    /// EXPLAIN one statement, reconstructing parameterized text from
    /// most-common-value statistics. Returns None when reconstruction is
    /// not possible; never runs EXPLAIN ANALYZE.
    fn explain(&self, conn: &mut PgConn, text: &str) -> Result<Option<Plan>, DbError> {
        let query_text = if sqlscan::has_placeholders(text) {
            match self.reconstruct(conn, text)? {
                Some(t) => t,
                None => return Ok(None),
            }
        } else {
            text.to_string()
        };

        let explain_sql = format!("/* pgupholder */ EXPLAIN (FORMAT JSON) {}", query_text);
        let opts = ExecOptions {
            timeout_ms: Some(self.cfg.explain_timeout_ms),
            prepared: Prepared::Never,
            read_only: true,
        };
        let rows = conn.query(&explain_sql, &[], &opts)?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let value: serde_json::Value = row.get(0);
        Ok(parse_explain(&value))
    }

    /// Substitute `$n` placeholders with representative literals from
    /// pg_stats most-common-values. Any unresolved placeholder aborts.
    fn reconstruct(&self, conn: &mut PgConn, text: &str) -> Result<Option<String>, DbError> {
        let tables = sqlscan::tables_of(text);
        let Some(table) = tables.first() else {
            return Ok(None);
        };

        let mut substitutions: HashMap<u32, String> = HashMap::new();
        for pred in sqlscan::where_predicates(text) {
            if let sqlscan::Rhs::Placeholder(n) = pred.rhs {
                let row = conn.query_opt(build_mcv_query(), &[table, &pred.column])?;
                let literal = row
                    .and_then(|r| r.get::<_, Option<String>>(0))
                    .as_deref()
                    .and_then(parse_first_mcv)
                    .map(|v| quote_literal(&v));
                match literal {
                    Some(l) => {
                        substitutions.insert(n, l);
                    }
                    None => return Ok(None),
                }
            }
        }
        Ok(substitute_placeholders(text, &substitutions))
    }

    fn relation_row_estimates(
        &self,
        conn: &mut PgConn,
        plans: &HashMap<u64, Plan>,
    ) -> Result<HashMap<String, f64>, DbError> {
        let mut relations: Vec<String> = Vec::new();
        for plan in plans.values() {
            for rel in &plan.relations {
                if !relations.contains(rel) {
                    relations.push(rel.clone());
                }
            }
        }
        let mut estimates = HashMap::new();
        if relations.is_empty() {
            return Ok(estimates);
        }
        let rows = conn.query(
            build_relation_rows_query(),
            &[&relations],
            &ExecOptions::default(),
        )?;
        for row in rows {
            let name: String = row.get("relname");
            let estimate: f64 = row.get("row_estimate");
            let slot = estimates.entry(name).or_insert(0.0_f64);
            if estimate > *slot {
                *slot = estimate;
            }
        }
        Ok(estimates)
    }
}

fn extension_missing_issue() -> QueryIssue {
    QueryIssue {
        fingerprint: 0,
        kind: IssueKind::ExtensionMissing,
        severity: Severity::Info,
        sample: String::new(),
        recommendation: "pg_stat_statements is not installed; add it to \
            shared_preload_libraries and CREATE EXTENSION pg_stat_statements"
            .to_string(),
    }
}

/// Classify collected statistics into issues. Emits one issue per matching
/// kind per statement so reports enumerate every problem.
pub fn classify(
    stats: &[QueryStat],
    plans: &HashMap<u64, Plan>,
    row_estimates: &HashMap<String, f64>,
    cfg: &AnalyzerConfig,
) -> Vec<QueryIssue> {
    let mut issues = Vec::new();

    for stat in stats {
        let sample = truncate_sql(&stat.sample_text, SAMPLE_DISPLAY_CHARS);

        if stat.mean_ms >= cfg.slow_mean_ms {
            let severity = if stat.mean_ms >= cfg.slow_mean_ms * CRITICAL_SLOW_FACTOR {
                Severity::Critical
            } else {
                Severity::Warn
            };
            issues.push(QueryIssue {
                fingerprint: stat.fingerprint,
                kind: IssueKind::SlowMean,
                severity,
                sample: sample.clone(),
                recommendation: format!(
                    "mean {:.1}ms over {} calls exceeds {:.0}ms; review the plan and indexes",
                    stat.mean_ms, stat.calls, cfg.slow_mean_ms
                ),
            });
        }

        if let Some(plan) = plans.get(&stat.fingerprint) {
            if plan.has_seq_scan {
                let largest = plan
                    .relations
                    .iter()
                    .filter_map(|r| row_estimates.get(r).map(|&e| (r.as_str(), e)))
                    .max_by(|a, b| a.1.total_cmp(&b.1));
                if let Some((relation, estimate)) = largest {
                    if estimate > cfg.seq_scan_threshold_rows {
                        issues.push(QueryIssue {
                            fingerprint: stat.fingerprint,
                            kind: IssueKind::SeqScanOnLargeTable,
                            severity: Severity::Critical,
                            sample: sample.clone(),
                            recommendation: format!(
                                "sequential scan on {} (~{:.0} rows); an index on the \
                                 filtered columns would avoid it",
                                relation, estimate
                            ),
                        });
                    }
                }
            }
        }

        let touched = stat.shared_blks_hit + stat.shared_blks_read;
        if touched >= LOCALITY_MIN_BLOCKS && stat.cache_locality() < CACHE_LOCALITY_MIN {
            issues.push(QueryIssue {
                fingerprint: stat.fingerprint,
                kind: IssueKind::PoorCacheLocality,
                severity: Severity::Warn,
                sample: sample.clone(),
                recommendation: format!(
                    "only {:.0}% of blocks served from cache; consider shared_buffers \
                     sizing or narrower reads",
                    stat.cache_locality() * 100.0
                ),
            });
        }

        if stat.variance_ratio() > VARIANCE_RATIO_MAX {
            issues.push(QueryIssue {
                fingerprint: stat.fingerprint,
                kind: IssueKind::HighVariance,
                severity: Severity::Info,
                sample: sample.clone(),
                recommendation: format!(
                    "runtime spread {:.1}ms..{:.1}ms around mean {:.1}ms; check \
                     parameter-dependent plans or lock waits",
                    stat.min_ms, stat.max_ms, stat.mean_ms
                ),
            });
        }

        if sqlscan::is_unparameterized(&stat.sample_text) {
            issues.push(QueryIssue {
                fingerprint: stat.fingerprint,
                kind: IssueKind::Unparameterized,
                severity: Severity::Warn,
                sample: sample.clone(),
                recommendation: "literal values where placeholders are expected; \
                    parameterize to share plans and statistics"
                    .to_string(),
            });
        }
    }

    issues.sort_by(|a, b| b.severity.cmp(&a.severity));
    issues
}

/// Build per-(statement, relation) references for the index auditor.
fn build_workload(stats: &[QueryStat], plans: &HashMap<u64, Plan>) -> Vec<WorkloadRef> {
    let mut refs = Vec::new();
    for stat in stats {
        let plan = plans.get(&stat.fingerprint);
        let relations = match plan {
            Some(p) if !p.relations.is_empty() => p.relations.clone(),
            _ => sqlscan::tables_of(&stat.sample_text),
        };
        let columns: Vec<String> = sqlscan::where_predicates(&stat.sample_text)
            .into_iter()
            .map(|p| p.column)
            .collect();
        for relation in relations {
            refs.push(WorkloadRef {
                fingerprint: stat.fingerprint,
                relation,
                columns: columns.clone(),
                calls: stat.calls,
                seq_scan: plan.is_some_and(|p| p.has_seq_scan),
                has_plan: plan.is_some(),
            });
        }
    }
    refs
}

/// First element of a `most_common_vals` array rendered as text,
/// e.g. `{paid,refunded}` or `{"new york",boston}`.
fn parse_first_mcv(text: &str) -> Option<String> {
    let inner = text.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() {
        return None;
    }
    let mut chars = inner.chars().peekable();
    let mut value = String::new();
    if chars.peek() == Some(&'"') {
        chars.next();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                }
                '"' => break,
                _ => value.push(c),
            }
        }
    } else {
        for c in chars {
            if c == ',' {
                break;
            }
            value.push(c);
        }
    }
    if value.is_empty() { None } else { Some(value) }
}

/// Render a stats value as a SQL literal: numbers bare, text quoted.
fn quote_literal(value: &str) -> String {
    if value.parse::<f64>().is_ok() {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

/// Replace `$n` placeholders. None when a placeholder has no substitution.
fn substitute_placeholders(sql: &str, subs: &HashMap<u32, String>) -> Option<String> {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek().is_some_and(|n| n.is_ascii_digit()) {
            let mut num: u32 = 0;
            while let Some(&d) = chars.peek() {
                if let Some(v) = d.to_digit(10) {
                    num = num * 10 + v;
                    chars.next();
                } else {
                    break;
                }
            }
            out.push_str(subs.get(&num)?);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(fingerprint: u64, text: &str, calls: i64, mean_ms: f64) -> QueryStat {
        QueryStat {
            fingerprint,
            sample_text: text.to_string(),
            calls,
            total_ms: mean_ms * calls as f64,
            mean_ms,
            min_ms: mean_ms * 0.8,
            max_ms: mean_ms * 1.2,
            stddev_ms: mean_ms * 0.1,
            rows: calls,
            shared_blks_hit: 1_000,
            shared_blks_read: 10,
        }
    }

    fn seq_scan_plan(relation: &str) -> Plan {
        Plan {
            has_seq_scan: true,
            relations: vec![relation.to_string()],
            node_types: vec!["Seq Scan".to_string()],
            depth: 1,
            est_rows: 1000.0,
            ..Plan::default()
        }
    }

    #[test]
    fn slow_seq_scan_yields_both_issue_kinds() {
        let cfg = AnalyzerConfig::default();
        let s = stat(7, "SELECT * FROM orders WHERE status = $1", 500, 180.0);
        let mut plans = HashMap::new();
        plans.insert(7, seq_scan_plan("orders"));
        let mut estimates = HashMap::new();
        estimates.insert("orders".to_string(), 2_000_000.0);

        let issues = classify(&[s], &plans, &estimates, &cfg);
        let kinds: Vec<IssueKind> = issues.iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&IssueKind::SlowMean));
        assert!(kinds.contains(&IssueKind::SeqScanOnLargeTable));
        assert!(issues.iter().all(|i| i.fingerprint == 7));

        let seq = issues
            .iter()
            .find(|i| i.kind == IssueKind::SeqScanOnLargeTable)
            .unwrap();
        assert_eq!(seq.severity, Severity::Critical);
        let slow = issues.iter().find(|i| i.kind == IssueKind::SlowMean).unwrap();
        assert_eq!(slow.severity, Severity::Warn);
    }

    #[test]
    fn seq_scan_on_small_table_is_not_flagged() {
        let cfg = AnalyzerConfig::default();
        let s = stat(1, "SELECT * FROM tiny WHERE a = $1", 100, 10.0);
        let mut plans = HashMap::new();
        plans.insert(1, seq_scan_plan("tiny"));
        let mut estimates = HashMap::new();
        estimates.insert("tiny".to_string(), 500.0);

        let issues = classify(&[s], &plans, &estimates, &cfg);
        assert!(issues.is_empty());
    }

    #[test]
    fn slow_mean_turns_critical_at_ten_times_threshold() {
        let cfg = AnalyzerConfig::default();
        let s = stat(1, "SELECT * FROM t WHERE a = $1", 50, 1_500.0);
        let issues = classify(&[s], &HashMap::new(), &HashMap::new(), &cfg);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Critical);
    }

    #[test]
    fn poor_cache_locality_needs_enough_blocks() {
        let cfg = AnalyzerConfig::default();
        let mut s = stat(1, "SELECT * FROM t WHERE a = $1", 50, 10.0);
        s.shared_blks_hit = 10;
        s.shared_blks_read = 990;
        let issues = classify(&[s.clone()], &HashMap::new(), &HashMap::new(), &cfg);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::PoorCacheLocality);

        // Same ratio, negligible traffic: noise, not an issue.
        s.shared_blks_hit = 0;
        s.shared_blks_read = 5;
        let issues = classify(&[s], &HashMap::new(), &HashMap::new(), &cfg);
        assert!(issues.is_empty());
    }

    #[test]
    fn high_variance_is_informational() {
        let cfg = AnalyzerConfig::default();
        let mut s = stat(1, "SELECT * FROM t WHERE a = $1", 50, 10.0);
        s.min_ms = 1.0;
        s.max_ms = 90.0;
        let issues = classify(&[s], &HashMap::new(), &HashMap::new(), &cfg);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::HighVariance);
        assert_eq!(issues[0].severity, Severity::Info);
    }

    #[test]
    fn unparameterized_statement_is_flagged() {
        let cfg = AnalyzerConfig::default();
        let s = stat(1, "SELECT * FROM orders WHERE status = 'paid'", 50, 10.0);
        let issues = classify(&[s], &HashMap::new(), &HashMap::new(), &cfg);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::Unparameterized);
    }

    #[test]
    fn issues_sort_by_severity() {
        let cfg = AnalyzerConfig::default();
        let slow = stat(1, "SELECT * FROM a WHERE x = $1", 50, 150.0);
        let mut noisy = stat(2, "SELECT * FROM b WHERE y = $1", 50, 10.0);
        noisy.min_ms = 1.0;
        noisy.max_ms = 90.0;
        let critical = stat(3, "SELECT * FROM c WHERE z = $1", 50, 2_000.0);

        let issues = classify(&[noisy, slow, critical], &HashMap::new(), &HashMap::new(), &cfg);
        assert_eq!(issues[0].severity, Severity::Critical);
        assert_eq!(issues.last().unwrap().severity, Severity::Info);
    }

    #[test]
    fn workload_refs_prefer_plan_relations() {
        let s = stat(9, "SELECT * FROM orders WHERE status = $1", 500, 20.0);
        let mut plans = HashMap::new();
        plans.insert(9, seq_scan_plan("orders"));
        let refs = build_workload(&[s], &plans);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].relation, "orders");
        assert_eq!(refs[0].columns, vec!["status"]);
        assert!(refs[0].seq_scan);
        assert!(refs[0].has_plan);
    }

    #[test]
    fn workload_refs_fall_back_to_text_scan() {
        let s = stat(9, "SELECT * FROM orders WHERE status = $1", 500, 20.0);
        let refs = build_workload(&[s], &HashMap::new());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].relation, "orders");
        assert!(!refs[0].seq_scan);
        assert!(!refs[0].has_plan);
    }

    #[test]
    fn mcv_parsing_handles_plain_and_quoted() {
        assert_eq!(parse_first_mcv("{paid,refunded}"), Some("paid".to_string()));
        assert_eq!(
            parse_first_mcv("{\"new york\",boston}"),
            Some("new york".to_string())
        );
        assert_eq!(parse_first_mcv("{42,17}"), Some("42".to_string()));
        assert_eq!(parse_first_mcv("{}"), None);
        assert_eq!(parse_first_mcv("not an array"), None);
    }

    #[test]
    fn literals_quote_text_but_not_numbers() {
        assert_eq!(quote_literal("42"), "42");
        assert_eq!(quote_literal("3.5"), "3.5");
        assert_eq!(quote_literal("paid"), "'paid'");
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn placeholder_substitution_is_all_or_nothing() {
        let mut subs = HashMap::new();
        subs.insert(1, "'paid'".to_string());
        assert_eq!(
            substitute_placeholders("SELECT * FROM o WHERE s = $1", &subs),
            Some("SELECT * FROM o WHERE s = 'paid'".to_string())
        );
        assert_eq!(
            substitute_placeholders("SELECT * FROM o WHERE s = $1 AND t = $2", &subs),
            None
        );
    }

    #[test]
    fn extension_missing_issue_is_single_info() {
        let issue = extension_missing_issue();
        assert_eq!(issue.kind, IssueKind::ExtensionMissing);
        assert_eq!(issue.severity, Severity::Info);
    }
}
