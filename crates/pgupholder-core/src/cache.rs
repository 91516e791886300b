//! Buffer-cache monitor: samples hit ratios on a fixed cadence, keeps a
//! bounded history, and raises cooldown-gated alerts on threshold crossings.
//!
//! Collection touches pg_statio_user_tables, pg_stat_bgwriter and, when the
//! extension is installed, pg_buffercache. Threshold evaluation is pure and
//! driven by the caller's clock.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info};

use crate::config::CacheMonitorConfig;
use crate::db::queries::{build_bgwriter_query, build_buffercache_usage_query,
    build_cache_ratios_query};
use crate::db::{DbError, DbErrorKind, ExecOptions, PgConn};
use crate::report::{Alert, AlertKind, CacheSample, CacheWindowStats, Severity};

/// Margin below the threshold at which an alert becomes critical.
const CRITICAL_MARGIN: f64 = 0.05;

#[derive(Clone, Copy, Debug)]
struct BgwriterCounters {
    checkpoint: i64,
    clean: i64,
    backend: i64,
}

/// Rolling cache health monitor.
pub struct CacheMonitor {
    cfg: CacheMonitorConfig,
    cooldown_ms: i64,
    history: VecDeque<CacheSample>,
    cooldowns: HashMap<(AlertKind, String), i64>,
    prev_bgwriter: Option<BgwriterCounters>,
    buffercache_unavailable: bool,
}

impl CacheMonitor {
    pub fn new(cfg: CacheMonitorConfig, cooldown_ms: i64) -> Self {
        Self {
            cfg,
            cooldown_ms,
            history: VecDeque::new(),
            cooldowns: HashMap::new(),
            prev_bgwriter: None,
            buffercache_unavailable: false,
        }
    }

    pub fn config(&self) -> &CacheMonitorConfig {
        &self.cfg
    }

    /// Take one sample from the server. The sample is not recorded until
    /// passed to [`CacheMonitor::observe`].
    pub fn collect(&mut self, conn: &mut PgConn, now_ms: i64) -> Result<CacheSample, DbError> {
        let row = conn
            .query(build_cache_ratios_query(), &[], &ExecOptions::default())?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::new(DbErrorKind::Query, "empty pg_statio result"))?;

        let heap_hit: f64 = row.get("heap_hit");
        let heap_read: f64 = row.get("heap_read");
        let idx_hit: f64 = row.get("idx_hit");
        let idx_read: f64 = row.get("idx_read");

        let buffers_used_pct = self.collect_buffercache(conn)?;
        let bgwriter_lag = self.collect_bgwriter(conn)?;

        Ok(CacheSample {
            timestamp_ms: now_ms,
            heap_hit_ratio: ratio(heap_hit, heap_read),
            index_hit_ratio: ratio(idx_hit, idx_read),
            buffers_used_pct,
            bgwriter_lag,
        })
    }

    /// pg_buffercache is optional; a missing or unreadable extension turns
    /// the metric off instead of failing the sample.
    fn collect_buffercache(&mut self, conn: &mut PgConn) -> Result<Option<f64>, DbError> {
        if self.buffercache_unavailable {
            return Ok(None);
        }
        match conn.query(build_buffercache_usage_query(), &[], &ExecOptions::default()) {
            Ok(rows) => Ok(rows.first().and_then(|r| r.get::<_, Option<f64>>(0))),
            Err(e)
                if matches!(
                    e.kind(),
                    DbErrorKind::UndefinedObject | DbErrorKind::PermissionDenied
                ) =>
            {
                info!(error = %e, "pg_buffercache unavailable, buffer usage disabled");
                self.buffercache_unavailable = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn collect_bgwriter(&mut self, conn: &mut PgConn) -> Result<f64, DbError> {
        let sql = build_bgwriter_query(conn.server_version_num());
        let Some(row) = conn
            .query(&sql, &[], &ExecOptions::default())?
            .into_iter()
            .next()
        else {
            return Ok(0.0);
        };
        let current = BgwriterCounters {
            checkpoint: row.get("buffers_checkpoint"),
            clean: row.get("buffers_clean"),
            backend: row.get("buffers_backend"),
        };
        let lag = match self.prev_bgwriter {
            Some(prev) => {
                let backend = (current.backend - prev.backend).max(0);
                let total = (current.checkpoint - prev.checkpoint).max(0)
                    + (current.clean - prev.clean).max(0)
                    + backend;
                if total > 0 {
                    backend as f64 / total as f64
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.prev_bgwriter = Some(current);
        Ok(lag)
    }

    /// Record a sample into the ring buffer and evaluate thresholds.
    /// Alerts under cooldown for their (kind, subject) are suppressed.
    pub fn observe(&mut self, sample: CacheSample, now_ms: i64) -> Vec<Alert> {
        self.history.push_back(sample);
        while self.history.len() > self.cfg.history_len {
            self.history.pop_front();
        }

        let mut alerts = Vec::new();

        if sample.heap_hit_ratio < self.cfg.heap_hit_min {
            self.raise(
                &mut alerts,
                AlertKind::LowHeap,
                "heap",
                sample.heap_hit_ratio,
                self.cfg.heap_hit_min,
                format!(
                    "heap cache hit ratio {:.1}% below threshold {:.1}%",
                    sample.heap_hit_ratio * 100.0,
                    self.cfg.heap_hit_min * 100.0
                ),
                vec![
                    "consider increasing shared_buffers".to_string(),
                    "review frequently scanned tables for proper indexing".to_string(),
                    "run ANALYZE on tables with stale statistics".to_string(),
                ],
                now_ms,
            );
        }

        if sample.index_hit_ratio < self.cfg.index_hit_min {
            self.raise(
                &mut alerts,
                AlertKind::LowIndex,
                "index",
                sample.index_hit_ratio,
                self.cfg.index_hit_min,
                format!(
                    "index cache hit ratio {:.1}% below threshold {:.1}%",
                    sample.index_hit_ratio * 100.0,
                    self.cfg.index_hit_min * 100.0
                ),
                vec![
                    "review index usage and drop unused indexes".to_string(),
                    "check for index bloat and rebuild if necessary".to_string(),
                    "consider increasing shared_buffers".to_string(),
                ],
                now_ms,
            );
        }

        if let Some(used) = sample.buffers_used_pct {
            if used > self.cfg.buffers_used_max {
                self.raise(
                    &mut alerts,
                    AlertKind::HighBufferPressure,
                    "shared_buffers",
                    used,
                    self.cfg.buffers_used_max,
                    format!(
                        "shared buffer usage {:.1}% above threshold {:.1}%",
                        used * 100.0,
                        self.cfg.buffers_used_max * 100.0
                    ),
                    vec![
                        "consider increasing shared_buffers".to_string(),
                        "review working set size of the hottest tables".to_string(),
                    ],
                    now_ms,
                );
            }
        }

        alerts
    }

    #[allow(clippy::too_many_arguments)]
    fn raise(
        &mut self,
        alerts: &mut Vec<Alert>,
        kind: AlertKind,
        subject: &str,
        observed: f64,
        threshold: f64,
        message: String,
        recommendations: Vec<String>,
        now_ms: i64,
    ) {
        let key = (kind, subject.to_string());
        if let Some(&until) = self.cooldowns.get(&key) {
            if now_ms < until {
                debug!(?kind, subject, "alert suppressed by cooldown");
                return;
            }
        }
        let cooldown_until_ms = now_ms + self.cooldown_ms;
        self.cooldowns.insert(key, cooldown_until_ms);

        let severity = if (threshold - observed).abs() > CRITICAL_MARGIN
            && matches!(kind, AlertKind::LowHeap | AlertKind::LowIndex)
        {
            Severity::Critical
        } else {
            Severity::Warn
        };
        alerts.push(Alert {
            kind,
            subject: subject.to_string(),
            severity,
            message,
            observed,
            threshold,
            recommendations,
            timestamp_ms: now_ms,
            cooldown_until_ms,
        });
    }

    pub fn samples(&self) -> impl Iterator<Item = &CacheSample> {
        self.history.iter()
    }

    /// Min / mean / p95 over the current window.
    pub fn window_stats(&self) -> CacheWindowStats {
        let heap: Vec<f64> = self.history.iter().map(|s| s.heap_hit_ratio).collect();
        let index: Vec<f64> = self.history.iter().map(|s| s.index_hit_ratio).collect();
        if heap.is_empty() {
            return CacheWindowStats::default();
        }
        CacheWindowStats {
            samples: heap.len(),
            heap_min: min_of(&heap),
            heap_mean: mean_of(&heap),
            heap_p95: percentile(&heap, 0.95),
            index_min: min_of(&index),
            index_mean: mean_of(&index),
            index_p95: percentile(&index, 0.95),
        }
    }
}

fn ratio(hit: f64, read: f64) -> f64 {
    let total = hit + read;
    if total > 0.0 { hit / total } else { 1.0 }
}

fn min_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn mean_of(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    fn monitor() -> CacheMonitor {
        CacheMonitor::new(CacheMonitorConfig::default(), 60 * MIN)
    }

    fn sample(ts_ms: i64, heap: f64, index: f64) -> CacheSample {
        CacheSample {
            timestamp_ms: ts_ms,
            heap_hit_ratio: heap,
            index_hit_ratio: index,
            buffers_used_pct: None,
            bgwriter_lag: 0.0,
        }
    }

    #[test]
    fn healthy_samples_raise_nothing() {
        let mut mon = monitor();
        let alerts = mon.observe(sample(0, 0.99, 0.98), 0);
        assert!(alerts.is_empty());
    }

    #[test]
    fn low_heap_alert_respects_cooldown() {
        let mut mon = monitor();

        let alerts = mon.observe(sample(0, 0.87, 0.95), 0);
        assert_eq!(alerts.len(), 1);
        let first = &alerts[0];
        assert_eq!(first.kind, AlertKind::LowHeap);
        assert_eq!(first.severity, Severity::Critical);
        assert_eq!(first.cooldown_until_ms, 60 * MIN);

        // Still below threshold but inside the cooldown: ring buffer only.
        assert!(mon.observe(sample(30 * MIN, 0.88, 0.95), 30 * MIN).is_empty());
        assert!(mon.observe(sample(59 * MIN, 0.90, 0.95), 59 * MIN).is_empty());
        assert_eq!(mon.samples().count(), 3);

        // Past the cooldown a new crossing alerts again.
        let alerts = mon.observe(sample(61 * MIN, 0.85, 0.95), 61 * MIN);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowHeap);
    }

    #[test]
    fn severity_scales_with_distance_from_threshold() {
        let mut mon = monitor();
        let alerts = mon.observe(sample(0, 0.93, 0.99), 0);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warn);
    }

    #[test]
    fn independent_kinds_have_independent_cooldowns() {
        let mut mon = monitor();
        let alerts = mon.observe(sample(0, 0.87, 0.95), 0);
        assert_eq!(alerts.len(), 1);

        // Heap is cooling down; an index crossing still fires.
        let alerts = mon.observe(sample(MIN, 0.87, 0.80), MIN);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowIndex);
    }

    #[test]
    fn buffer_pressure_alert_from_optional_metric() {
        let mut mon = monitor();
        let mut s = sample(0, 0.99, 0.99);
        s.buffers_used_pct = Some(0.97);
        let alerts = mon.observe(s, 0);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::HighBufferPressure);
        assert_eq!(alerts[0].severity, Severity::Warn);
    }

    #[test]
    fn ring_buffer_is_bounded_by_history_len() {
        let cfg = CacheMonitorConfig {
            history_len: 4,
            ..CacheMonitorConfig::default()
        };
        let mut mon = CacheMonitor::new(cfg, 60 * MIN);
        for i in 0..10 {
            mon.observe(sample(i * MIN, 0.99, 0.99), i * MIN);
        }
        assert_eq!(mon.samples().count(), 4);
        assert_eq!(mon.samples().next().unwrap().timestamp_ms, 6 * MIN);
    }

    #[test]
    fn window_stats_single_sample_degenerates() {
        let cfg = CacheMonitorConfig {
            history_len: 1,
            ..CacheMonitorConfig::default()
        };
        let mut mon = CacheMonitor::new(cfg, 60 * MIN);
        mon.observe(sample(0, 0.97, 0.93), 0);
        let w = mon.window_stats();
        assert_eq!(w.samples, 1);
        assert_eq!(w.heap_min, w.heap_mean);
        assert_eq!(w.heap_mean, w.heap_p95);
        assert_eq!(w.index_min, w.index_p95);
    }

    #[test]
    fn window_stats_aggregate() {
        let mut mon = monitor();
        for (i, heap) in [0.90, 0.95, 1.00].iter().enumerate() {
            mon.observe(sample(i as i64 * MIN, *heap, 0.99), i as i64 * MIN);
        }
        let w = mon.window_stats();
        assert_eq!(w.samples, 3);
        assert!((w.heap_min - 0.90).abs() < 1e-9);
        assert!((w.heap_mean - 0.95).abs() < 1e-9);
        assert!((w.heap_p95 - 1.00).abs() < 1e-9);
    }

    #[test]
    fn ratio_with_no_traffic_is_healthy() {
        assert_eq!(ratio(0.0, 0.0), 1.0);
        assert!((ratio(99.0, 1.0) - 0.99).abs() < 1e-9);
    }
}
