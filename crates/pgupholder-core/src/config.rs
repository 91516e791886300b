//! Typed configuration for every upholder component.
//!
//! The recognized `key=value` surface is exactly the set accepted by
//! [`Config::apply_kv`]; an unknown key is a hard error at construction time,
//! never silently ignored. Fields not reachable through `apply_kv` are tuning
//! knobs with fixed defaults that callers set directly in code.

use std::time::Duration;

/// Connection pool sizing and lifecycle.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_conn: usize,
    pub max_conn: usize,
    pub acquire_timeout_ms: u64,
    pub max_idle_age_s: u64,
    pub health_sweep_interval_s: u64,
    /// Queries slower than this count into `PoolStats::slow_queries`.
    pub slow_query_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_conn: 5,
            max_conn: 32,
            acquire_timeout_ms: 5_000,
            max_idle_age_s: 300,
            health_sweep_interval_s: 60,
            slow_query_ms: 100,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Per-session prepared statement cache.
#[derive(Debug, Clone)]
pub struct StatementCacheConfig {
    pub cache_cap_per_session: usize,
}

impl Default for StatementCacheConfig {
    fn default() -> Self {
        Self {
            cache_cap_per_session: 128,
        }
    }
}

/// Query analyzer thresholds.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub interval_min: u64,
    pub slow_mean_ms: f64,
    pub min_calls: i64,
    pub top_n: i64,
    pub explain_sample_rate: f64,
    pub seq_scan_threshold_rows: f64,
    /// Statements whose text starts with one of these are never analyzed.
    /// The default covers the upholder's own catalog queries.
    pub ignore_prefixes: Vec<String>,
    /// Session statement_timeout applied around each EXPLAIN.
    pub explain_timeout_ms: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            interval_min: 60,
            slow_mean_ms: 100.0,
            min_calls: 10,
            top_n: 50,
            explain_sample_rate: 0.2,
            seq_scan_threshold_rows: 10_000.0,
            ignore_prefixes: vec!["/* pgupholder */".to_string()],
            explain_timeout_ms: 5_000,
        }
    }
}

/// Index auditor thresholds.
#[derive(Debug, Clone)]
pub struct AuditorConfig {
    pub interval_min: u64,
    pub schemas: Vec<String>,
    pub min_table_bytes: i64,
    pub unused_idx_scan_threshold: i64,
    pub min_age_days: i64,
    pub bloat_threshold: f64,
    pub min_bloat_bytes: i64,
    pub max_tables_per_pass: usize,
    /// Seq-scan share above which a table is a missing-index candidate.
    pub seq_ratio_threshold: f64,
    /// Tables smaller than this row estimate are not missing-index candidates.
    pub min_rows: f64,
    /// Bloat estimator constants.
    pub tuple_header_bytes: f64,
    pub fillfactor: f64,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            interval_min: 240,
            schemas: vec!["public".to_string()],
            min_table_bytes: 1_048_576,
            unused_idx_scan_threshold: 0,
            min_age_days: 7,
            bloat_threshold: 0.3,
            min_bloat_bytes: 8 * 1024 * 1024,
            max_tables_per_pass: 200,
            seq_ratio_threshold: 0.5,
            min_rows: 10_000.0,
            tuple_header_bytes: 24.0,
            fillfactor: 0.9,
        }
    }
}

/// Buffer-cache monitor thresholds.
#[derive(Debug, Clone)]
pub struct CacheMonitorConfig {
    pub interval_s: u64,
    pub heap_hit_min: f64,
    pub index_hit_min: f64,
    pub buffers_used_max: f64,
    pub history_len: usize,
}

impl Default for CacheMonitorConfig {
    fn default() -> Self {
        Self {
            interval_s: 30,
            heap_hit_min: 0.95,
            index_hit_min: 0.90,
            buffers_used_max: 0.90,
            history_len: 480,
        }
    }
}

/// Bulk loader behavior.
#[derive(Debug, Clone)]
pub struct BulkConfig {
    pub values_per_statement: usize,
    pub copy_chunk_rows: usize,
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub backoff_base_ms: u64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            values_per_statement: 500,
            copy_chunk_rows: 10_000,
            max_attempts: 3,
            backoff_base_ms: 100,
        }
    }
}

/// Orchestrator safety and alerting.
#[derive(Debug, Clone)]
pub struct UpholderConfig {
    pub dry_run: bool,
    pub auto_apply_safe: bool,
    pub alert_cooldown_min: u64,
    /// Consecutive sink delivery failures before a sink is disabled.
    pub sink_max_failures: u32,
    /// Per-sink delivery time budget.
    pub sink_budget_ms: u64,
}

impl Default for UpholderConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            auto_apply_safe: false,
            alert_cooldown_min: 60,
            sink_max_failures: 3,
            sink_budget_ms: 500,
        }
    }
}

/// Aggregate configuration for the whole subsystem.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pool: PoolConfig,
    pub statements: StatementCacheConfig,
    pub analyzer: AnalyzerConfig,
    pub auditor: AuditorConfig,
    pub cache: CacheMonitorConfig,
    pub bulk: BulkConfig,
    pub upholder: UpholderConfig,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// Key is not part of the recognized option surface.
    UnknownKey(String),
    /// Value failed to parse for the given key.
    InvalidValue { key: String, value: String },
    /// Cross-field validation failed.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::UnknownKey(k) => write!(f, "unknown configuration key: {}", k),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value '{}' for key {}", value, key)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl Config {
    /// Apply one `section.key=value` option. Unknown keys are a hard error.
    pub fn apply_kv(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "pool.min_conn" => self.pool.min_conn = parse(key, value)?,
            "pool.max_conn" => self.pool.max_conn = parse(key, value)?,
            "pool.acquire_timeout_ms" => self.pool.acquire_timeout_ms = parse(key, value)?,
            "pool.max_idle_age_s" => self.pool.max_idle_age_s = parse(key, value)?,
            "pool.health_sweep_interval_s" => {
                self.pool.health_sweep_interval_s = parse(key, value)?
            }
            "statements.cache_cap_per_session" => {
                self.statements.cache_cap_per_session = parse(key, value)?
            }
            "analyzer.interval_min" => self.analyzer.interval_min = parse(key, value)?,
            "analyzer.slow_mean_ms" => self.analyzer.slow_mean_ms = parse(key, value)?,
            "analyzer.min_calls" => self.analyzer.min_calls = parse(key, value)?,
            "analyzer.top_n" => self.analyzer.top_n = parse(key, value)?,
            "analyzer.explain_sample_rate" => {
                self.analyzer.explain_sample_rate = parse(key, value)?
            }
            "analyzer.seq_scan_threshold_rows" => {
                self.analyzer.seq_scan_threshold_rows = parse(key, value)?
            }
            "auditor.interval_min" => self.auditor.interval_min = parse(key, value)?,
            "auditor.min_table_bytes" => self.auditor.min_table_bytes = parse(key, value)?,
            "auditor.unused_idx_scan_threshold" => {
                self.auditor.unused_idx_scan_threshold = parse(key, value)?
            }
            "auditor.min_age_days" => self.auditor.min_age_days = parse(key, value)?,
            "auditor.bloat_threshold" => self.auditor.bloat_threshold = parse(key, value)?,
            "cache.interval_s" => self.cache.interval_s = parse(key, value)?,
            "cache.heap_hit_min" => self.cache.heap_hit_min = parse(key, value)?,
            "cache.index_hit_min" => self.cache.index_hit_min = parse(key, value)?,
            "cache.history_len" => self.cache.history_len = parse(key, value)?,
            "bulk.values_per_statement" => self.bulk.values_per_statement = parse(key, value)?,
            "bulk.copy_chunk_rows" => self.bulk.copy_chunk_rows = parse(key, value)?,
            "bulk.max_attempts" => self.bulk.max_attempts = parse(key, value)?,
            "upholder.dry_run" => self.upholder.dry_run = parse(key, value)?,
            "upholder.auto_apply_safe" => self.upholder.auto_apply_safe = parse(key, value)?,
            "upholder.alert_cooldown_min" => {
                self.upholder.alert_cooldown_min = parse(key, value)?
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Cross-field validation, run once after all options are applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_conn == 0 {
            return Err(ConfigError::Invalid("pool.max_conn must be > 0".into()));
        }
        if self.pool.min_conn > self.pool.max_conn {
            return Err(ConfigError::Invalid(format!(
                "pool.min_conn ({}) exceeds pool.max_conn ({})",
                self.pool.min_conn, self.pool.max_conn
            )));
        }
        if !(0.0..=1.0).contains(&self.analyzer.explain_sample_rate) {
            return Err(ConfigError::Invalid(
                "analyzer.explain_sample_rate must be within [0, 1]".into(),
            ));
        }
        for (name, v) in [
            ("cache.heap_hit_min", self.cache.heap_hit_min),
            ("cache.index_hit_min", self.cache.index_hit_min),
            ("auditor.bloat_threshold", self.auditor.bloat_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be within [0, 1]",
                    name
                )));
            }
        }
        if self.cache.history_len == 0 {
            return Err(ConfigError::Invalid("cache.history_len must be >= 1".into()));
        }
        if self.bulk.max_attempts == 0 {
            return Err(ConfigError::Invalid("bulk.max_attempts must be >= 1".into()));
        }
        if self.bulk.values_per_statement == 0 {
            return Err(ConfigError::Invalid(
                "bulk.values_per_statement must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.pool.min_conn, 5);
        assert_eq!(cfg.pool.max_conn, 32);
        assert_eq!(cfg.pool.acquire_timeout_ms, 5_000);
        assert_eq!(cfg.statements.cache_cap_per_session, 128);
        assert_eq!(cfg.analyzer.interval_min, 60);
        assert_eq!(cfg.analyzer.top_n, 50);
        assert_eq!(cfg.auditor.interval_min, 240);
        assert_eq!(cfg.cache.history_len, 480);
        assert_eq!(cfg.bulk.values_per_statement, 500);
        assert!(cfg.upholder.dry_run);
        assert!(!cfg.upholder.auto_apply_safe);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn apply_kv_sets_known_keys() {
        let mut cfg = Config::default();
        cfg.apply_kv("pool.max_conn", "8").unwrap();
        cfg.apply_kv("analyzer.slow_mean_ms", "250").unwrap();
        cfg.apply_kv("upholder.dry_run", "false").unwrap();
        assert_eq!(cfg.pool.max_conn, 8);
        assert_eq!(cfg.analyzer.slow_mean_ms, 250.0);
        assert!(!cfg.upholder.dry_run);
    }

    #[test]
    fn apply_kv_rejects_unknown_key() {
        let mut cfg = Config::default();
        let err = cfg.apply_kv("pool.turbo_mode", "on").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(_)));
    }

    #[test]
    fn apply_kv_rejects_bad_value() {
        let mut cfg = Config::default();
        let err = cfg.apply_kv("pool.max_conn", "many").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn validate_catches_inverted_pool_bounds() {
        let mut cfg = Config::default();
        cfg.pool.min_conn = 40;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_catches_out_of_range_rate() {
        let mut cfg = Config::default();
        cfg.analyzer.explain_sample_rate = 1.5;
        assert!(cfg.validate().is_err());
    }
}
