//! Report and alert types emitted by the upholder.
//!
//! Everything here is immutable after construction and carries stable
//! snake_case `kind` strings so sink consumers can key on them.

use serde::Serialize;

use crate::pool::PoolStats;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

/// Classification of a statement-level problem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    SeqScanOnLargeTable,
    SlowMean,
    HighVariance,
    PoorCacheLocality,
    Unparameterized,
    ExtensionMissing,
}

/// One problem found for one statement fingerprint. A statement exhibiting
/// several problems yields one issue per kind.
#[derive(Clone, Debug, Serialize)]
pub struct QueryIssue {
    pub fingerprint: u64,
    pub kind: IssueKind,
    pub severity: Severity,
    /// Truncated one-line statement text for display.
    pub sample: String,
    pub recommendation: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Missing,
    Unused,
    Duplicate,
    RedundantPrefix,
    Bloated,
}

/// One index-level finding. Findings are advisory; `ddl` is reviewable text
/// and only findings with `safe = true` are ever auto-applied.
#[derive(Clone, Debug, Serialize)]
pub struct IndexFinding {
    pub schema: String,
    pub table: String,
    pub kind: FindingKind,
    /// Index name for findings about an existing index; None for `missing`.
    pub index: Option<String>,
    pub columns: Vec<String>,
    pub evidence: String,
    pub confidence: f64,
    pub recommendation: String,
    pub ddl: Option<String>,
    /// Non-unique, non-partial index creation only.
    pub safe: bool,
}

/// One buffer-cache observation.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct CacheSample {
    pub timestamp_ms: i64,
    pub heap_hit_ratio: f64,
    pub index_hit_ratio: f64,
    /// Requires pg_buffercache; None when the extension is absent.
    pub buffers_used_pct: Option<f64>,
    /// Share of buffers written directly by backends since the previous
    /// sample (0 on PostgreSQL 17+, where the counter moved to pg_stat_io).
    pub bgwriter_lag: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowHeap,
    LowIndex,
    HighBufferPressure,
}

/// Threshold-crossing alert, subject to per-(kind, subject) cooldown.
#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub subject: String,
    pub severity: Severity,
    pub message: String,
    pub observed: f64,
    pub threshold: f64,
    pub recommendations: Vec<String>,
    pub timestamp_ms: i64,
    pub cooldown_until_ms: i64,
}

/// Min / mean / p95 of the sampled ratios over the monitor's window.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CacheWindowStats {
    pub samples: usize,
    pub heap_min: f64,
    pub heap_mean: f64,
    pub heap_p95: f64,
    pub index_min: f64,
    pub index_mean: f64,
    pub index_p95: f64,
}

/// Deltas against the baseline captured when the upholder started.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct BaselineDelta {
    pub heap_hit_ratio: f64,
    pub index_hit_ratio: f64,
    pub slow_queries: i64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ReportSummary {
    pub total_issues: usize,
    pub critical_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
    pub findings_count: usize,
    pub cache_window: CacheWindowStats,
    pub baseline_delta: Option<BaselineDelta>,
}

/// Full audit cycle output, delivered once per cycle.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub queries: Vec<QueryIssue>,
    pub indexes: Vec<IndexFinding>,
    pub cache: Vec<CacheSample>,
    pub pool: PoolStats,
    pub summary: ReportSummary,
    /// Safe optimizations executed this cycle (empty in dry-run mode).
    pub applied: Vec<String>,
    pub cancelled: bool,
    pub partial: bool,
    pub failed_components: Vec<String>,
}

impl Report {
    pub fn summarize(
        queries: &[QueryIssue],
        indexes: &[IndexFinding],
        cache_window: CacheWindowStats,
        baseline_delta: Option<BaselineDelta>,
    ) -> ReportSummary {
        ReportSummary {
            total_issues: queries.len(),
            critical_count: queries
                .iter()
                .filter(|q| q.severity == Severity::Critical)
                .count(),
            warning_count: queries
                .iter()
                .filter(|q| q.severity == Severity::Warn)
                .count(),
            info_count: queries
                .iter()
                .filter(|q| q.severity == Severity::Info)
                .count(),
            findings_count: indexes.len(),
            cache_window,
            baseline_delta,
        }
    }
}
