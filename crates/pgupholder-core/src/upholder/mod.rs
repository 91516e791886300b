//! Upholder orchestrator: owns lifecycle and composes the analyzers into
//! audit cycles, reports, and alerts.
//!
//! One audit cycle runs at a time. The scheduled cycle and `trigger_audit`
//! share a single-flight guard: a trigger arriving while a cycle is in
//! flight waits for that cycle and returns its report instead of queueing
//! another run. Component failures are recorded in the report; only a
//! database-unreachable condition fails the cycle, and three failed cycles
//! in a row flip the orchestrator to degraded until one succeeds.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analyzer::QueryAnalyzer;
use crate::auditor::IndexAuditor;
use crate::cache::CacheMonitor;
use crate::clock::Clock;
use crate::config::{Config, ConfigError};
use crate::db::{DbError, DbErrorKind, PgManager};
use crate::pool::{Pool, PoolError, PoolStats};
use crate::report::{BaselineDelta, IndexFinding, IssueKind, Report};
use crate::scheduler::{CancelToken, Scheduler, TaskStatus};
use crate::sink::{Sink, SinkRegistry, SinkStatus};

const DEGRADED_AFTER_CYCLES: u32 = 3;
/// How many completed reports are kept in memory.
const REPORT_HISTORY: usize = 10;
const AUDIT_TASK: &str = "audit-cycle";
const CACHE_TASK: &str = "cache-sample";
const SWEEP_TASK: &str = "pool-sweep";
const WORKERS: usize = 2;

/// Orchestrator lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpholderState {
    New,
    Running,
    Degraded,
    Stopping,
    Stopped,
}

/// Orchestrator API error.
#[derive(Debug)]
pub enum UpholderError {
    /// start() from a state that is not new or stopped.
    AlreadyRunning,
    /// trigger_audit()/stop() without a running orchestrator.
    NotRunning,
    Pool(PoolError),
}

impl std::fmt::Display for UpholderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpholderError::AlreadyRunning => write!(f, "upholder is already running"),
            UpholderError::NotRunning => write!(f, "upholder is not running"),
            UpholderError::Pool(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for UpholderError {}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct CycleInfo {
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub ok: bool,
}

/// JSON-serializable status snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct UpholderStatus {
    pub state: UpholderState,
    pub started_at_ms: Option<i64>,
    pub last_cycle: Option<CycleInfo>,
    pub consecutive_failures: u32,
    pub pool: PoolStats,
    pub workers: Vec<TaskStatus>,
    pub alert_sinks: Vec<SinkStatus>,
    pub report_sinks: Vec<SinkStatus>,
}

#[derive(Clone, Copy, Debug)]
struct Baseline {
    heap_hit_ratio: f64,
    index_hit_ratio: f64,
    slow_queries: i64,
}

struct CycleState {
    running: bool,
    seq: u64,
    last_report: Option<Arc<Report>>,
    /// The last [`REPORT_HISTORY`] reports, oldest first.
    recent_reports: VecDeque<Arc<Report>>,
    last_cycle: Option<CycleInfo>,
    consecutive_failures: u32,
    /// Findings from the most recent index audit, reused on cycles where
    /// the auditor is not yet due so reports stay comparable.
    last_findings: Vec<IndexFinding>,
    last_audit_ms: i64,
}

/// The orchestrating subsystem driving analyzers and loaders on a cadence.
pub struct Upholder {
    pool: Arc<Pool<PgManager>>,
    clock: Arc<dyn Clock>,
    cfg: Config,
    state: Mutex<UpholderState>,
    started_at_ms: Mutex<Option<i64>>,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    cancel: Mutex<Option<CancelToken>>,
    analyzer: Mutex<QueryAnalyzer>,
    auditor: Mutex<IndexAuditor>,
    cache_monitor: Mutex<CacheMonitor>,
    cycle: Mutex<CycleState>,
    cycle_done: Condvar,
    alert_sinks: SinkRegistry,
    report_sinks: SinkRegistry,
    baseline: Mutex<Option<Baseline>>,
    /// Components shut off by a permission error; cleared on the next start.
    disabled: Mutex<Vec<String>>,
}

impl Upholder {
    pub fn new(
        pool: Arc<Pool<PgManager>>,
        clock: Arc<dyn Clock>,
        cfg: Config,
    ) -> Result<Arc<Self>, ConfigError> {
        cfg.validate()?;
        let cooldown_ms = cfg.upholder.alert_cooldown_min as i64 * 60_000;
        let sink_budget = Duration::from_millis(cfg.upholder.sink_budget_ms);
        Ok(Arc::new(Self {
            analyzer: Mutex::new(QueryAnalyzer::new(cfg.analyzer.clone())),
            auditor: Mutex::new(IndexAuditor::new(cfg.auditor.clone())),
            cache_monitor: Mutex::new(CacheMonitor::new(cfg.cache.clone(), cooldown_ms)),
            alert_sinks: SinkRegistry::new(cfg.upholder.sink_max_failures, sink_budget),
            report_sinks: SinkRegistry::new(cfg.upholder.sink_max_failures, sink_budget),
            pool,
            clock,
            cfg,
            state: Mutex::new(UpholderState::New),
            started_at_ms: Mutex::new(None),
            scheduler: Mutex::new(None),
            cancel: Mutex::new(None),
            cycle: Mutex::new(CycleState {
                running: false,
                seq: 0,
                last_report: None,
                recent_reports: VecDeque::new(),
                last_cycle: None,
                consecutive_failures: 0,
                last_findings: Vec::new(),
                last_audit_ms: 0,
            }),
            cycle_done: Condvar::new(),
            baseline: Mutex::new(None),
            disabled: Mutex::new(Vec::new()),
        }))
    }

    pub fn register_alert_sink(&self, sink: Box<dyn Sink>) {
        self.alert_sinks.register(sink);
    }

    pub fn register_report_sink(&self, sink: Box<dyn Sink>) {
        self.report_sinks.register(sink);
    }

    pub fn pool(&self) -> &Arc<Pool<PgManager>> {
        &self.pool
    }

    pub fn state(&self) -> UpholderState {
        *self.state.lock().unwrap()
    }

    /// Start background workers. Valid from new or stopped.
    pub fn start(self: &Arc<Self>) -> Result<(), UpholderError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                UpholderState::New | UpholderState::Stopped => {}
                _ => return Err(UpholderError::AlreadyRunning),
            }
            *state = UpholderState::Running;
        }
        *self.started_at_ms.lock().unwrap() = Some(self.clock.epoch_ms());
        self.disabled.lock().unwrap().clear();

        let scheduler = Arc::new(Scheduler::new(self.clock.clone()));
        *self.cancel.lock().unwrap() = Some(scheduler.cancel_token());

        let me = self.clone();
        scheduler.schedule(
            AUDIT_TASK,
            Duration::from_secs(self.cfg.analyzer.interval_min * 60),
            0.1,
            move |token| {
                let (report, failed) = me.run_cycle_or_join(token);
                if failed {
                    Err(format!(
                        "audit cycle failed: {}",
                        report.failed_components.join(", ")
                    )
                    .into())
                } else {
                    Ok(())
                }
            },
        );

        let me = self.clone();
        scheduler.schedule(
            CACHE_TASK,
            Duration::from_secs(self.cfg.cache.interval_s),
            0.1,
            move |_token| me.sample_cache().map_err(Into::into),
        );

        let me = self.clone();
        scheduler.schedule(
            SWEEP_TASK,
            Duration::from_secs(self.cfg.pool.health_sweep_interval_s),
            0.1,
            move |_token| {
                me.pool.sweep();
                Ok(())
            },
        );

        scheduler.start(WORKERS);
        *self.scheduler.lock().unwrap() = Some(scheduler);
        info!("upholder started");
        Ok(())
    }

    /// Request cancellation and wait up to `timeout` for workers to drain.
    pub fn stop(&self, timeout: Duration) -> Result<bool, UpholderError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                UpholderState::Running | UpholderState::Degraded => {}
                _ => return Err(UpholderError::NotRunning),
            }
            *state = UpholderState::Stopping;
        }

        let scheduler = self.scheduler.lock().unwrap().take();
        let clean = match scheduler {
            Some(s) => s.stop(timeout),
            None => true,
        };
        *self.cancel.lock().unwrap() = None;
        *self.state.lock().unwrap() = UpholderState::Stopped;
        info!(clean, "upholder stopped");
        Ok(clean)
    }

    /// Run one audit cycle now and return its report. Coalesces with an
    /// in-flight cycle instead of queueing a second one.
    pub fn trigger_audit(&self) -> Result<Arc<Report>, UpholderError> {
        let token = {
            match *self.state.lock().unwrap() {
                UpholderState::Running | UpholderState::Degraded => {}
                _ => return Err(UpholderError::NotRunning),
            }
            self.cancel
                .lock()
                .unwrap()
                .clone()
                .ok_or(UpholderError::NotRunning)?
        };
        let (report, _failed) = self.run_cycle_or_join(&token);
        Ok(report)
    }

    pub fn last_report(&self) -> Option<Arc<Report>> {
        self.cycle.lock().unwrap().last_report.clone()
    }

    /// The most recent completed reports, oldest first, capped at ten.
    pub fn recent_reports(&self) -> Vec<Arc<Report>> {
        self.cycle
            .lock()
            .unwrap()
            .recent_reports
            .iter()
            .cloned()
            .collect()
    }

    pub fn status(&self) -> UpholderStatus {
        let cycle = self.cycle.lock().unwrap();
        UpholderStatus {
            state: self.state(),
            started_at_ms: *self.started_at_ms.lock().unwrap(),
            last_cycle: cycle.last_cycle,
            consecutive_failures: cycle.consecutive_failures,
            pool: self.pool.stats(),
            workers: self
                .scheduler
                .lock()
                .unwrap()
                .as_ref()
                .map(|s| s.tasks_status())
                .unwrap_or_default(),
            alert_sinks: self.alert_sinks.statuses(),
            report_sinks: self.report_sinks.statuses(),
        }
    }

    /// The cache-sample task body: one sample into the rolling window,
    /// alerts delivered immediately.
    fn sample_cache(&self) -> Result<(), DbError> {
        let mut conn = match self.pool.acquire(self.cfg.pool.acquire_timeout()) {
            Ok(c) => c,
            Err(e) => return Err(DbError::new(crate::db::DbErrorKind::Connection, e.to_string())),
        };
        let now = self.clock.epoch_ms();
        let mut monitor = self.cache_monitor.lock().unwrap();
        let sample = monitor.collect(&mut conn, now)?;
        let alerts = monitor.observe(sample, now);
        drop(monitor);
        for alert in &alerts {
            self.alert_sinks.deliver_alert(alert);
        }
        Ok(())
    }

    /// Single-flight cycle entry: run the cycle, or wait for the in-flight
    /// one and return its report. The bool is the cycle-failed flag.
    fn run_cycle_or_join(&self, token: &CancelToken) -> (Arc<Report>, bool) {
        {
            let mut cycle = self.cycle.lock().unwrap();
            if cycle.running {
                let seq = cycle.seq;
                while cycle.running && cycle.seq == seq {
                    cycle = self.cycle_done.wait(cycle).unwrap();
                }
                debug!("audit trigger coalesced with in-flight cycle");
                let report = cycle
                    .last_report
                    .clone()
                    .expect("completed cycle stores a report");
                let failed = cycle.last_cycle.map(|c| !c.ok).unwrap_or(false);
                return (report, failed);
            }
            cycle.running = true;
        }

        let (report, cycle_failed) = self.run_cycle(token);
        let report = Arc::new(report);

        let mut cycle = self.cycle.lock().unwrap();
        cycle.running = false;
        cycle.seq += 1;
        cycle.last_cycle = Some(CycleInfo {
            started_at_ms: report.started_at_ms,
            finished_at_ms: report.finished_at_ms,
            ok: !cycle_failed && !report.cancelled,
        });
        cycle.last_report = Some(report.clone());
        cycle.recent_reports.push_back(report.clone());
        while cycle.recent_reports.len() > REPORT_HISTORY {
            cycle.recent_reports.pop_front();
        }

        if cycle_failed {
            cycle.consecutive_failures += 1;
            if cycle.consecutive_failures >= DEGRADED_AFTER_CYCLES {
                let mut state = self.state.lock().unwrap();
                if *state == UpholderState::Running {
                    *state = UpholderState::Degraded;
                    warn!(
                        failures = cycle.consecutive_failures,
                        "upholder degraded after consecutive cycle failures"
                    );
                }
            }
        } else if !report.cancelled {
            cycle.consecutive_failures = 0;
            let mut state = self.state.lock().unwrap();
            if *state == UpholderState::Degraded {
                *state = UpholderState::Running;
                info!("upholder recovered from degraded state");
            }
        }
        drop(cycle);
        self.cycle_done.notify_all();
        (report, cycle_failed)
    }

    /// One full audit cycle: cache sample, query analysis, index audit when
    /// due, report assembly and delivery. Alerts always precede the report.
    fn run_cycle(&self, token: &CancelToken) -> (Report, bool) {
        let started_at_ms = self.clock.epoch_ms();
        let audit_was_due = audit_due(
            self.cycle.lock().unwrap().last_audit_ms,
            started_at_ms,
            self.cfg.auditor.interval_min,
        );
        let mut failed: Vec<String> = Vec::new();
        let mut cancelled = token.is_cancelled();
        let mut cycle_failed = false;
        let mut analyzed = false;
        let mut audited = false;
        let mut queries = Vec::new();
        let mut cache_samples = Vec::new();
        let mut applied = Vec::new();
        let mut workload = Vec::new();

        // C6 first, on its own session.
        if !cancelled {
            match self.pool.acquire(self.cfg.pool.acquire_timeout()) {
                Ok(mut conn) => {
                    let now = self.clock.epoch_ms();
                    let mut monitor = self.cache_monitor.lock().unwrap();
                    match monitor.collect(&mut conn, now) {
                        Ok(sample) => {
                            let alerts = monitor.observe(sample, now);
                            drop(monitor);
                            cache_samples.push(sample);
                            for alert in &alerts {
                                self.alert_sinks.deliver_alert(alert);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "cache sampling failed");
                            failed.push("cache_monitor".to_string());
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "database unreachable, audit cycle failed");
                    failed.push("database".to_string());
                    cycle_failed = true;
                }
            }
        }

        cancelled = cancelled || token.is_cancelled();

        // C4 and C5 share one session to keep catalog reads consistent.
        if !cancelled && !cycle_failed {
            match self.pool.acquire(self.cfg.pool.acquire_timeout()) {
                Ok(mut conn) => {
                    if self.is_disabled("query_analyzer") {
                        failed.push("query_analyzer".to_string());
                    } else {
                        match self.analyzer.lock().unwrap().run(&mut conn) {
                            Ok(outcome) => {
                                queries = outcome.issues;
                                workload = outcome.workload;
                                analyzed = true;
                            }
                            Err(e) => {
                                self.note_component_failure("query_analyzer", &e);
                                failed.push("query_analyzer".to_string());
                            }
                        }
                    }

                    cancelled = cancelled || token.is_cancelled();
                    if !cancelled && audit_was_due {
                        if self.is_disabled("index_auditor") {
                            failed.push("index_auditor".to_string());
                        } else {
                            let now = self.clock.epoch_ms();
                            match self.auditor.lock().unwrap().run(&mut conn, now, &workload)
                            {
                                Ok(outcome) => {
                                    applied = self.apply_safe(
                                        &mut conn,
                                        &outcome.findings,
                                        &outcome.stale_tables,
                                    );
                                    let mut cycle = self.cycle.lock().unwrap();
                                    cycle.last_findings = outcome.findings;
                                    cycle.last_audit_ms = now;
                                    audited = true;
                                }
                                Err(e) => {
                                    self.note_component_failure("index_auditor", &e);
                                    failed.push("index_auditor".to_string());
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "database unreachable, audit cycle failed");
                    if !failed.iter().any(|f| f == "database") {
                        failed.push("database".to_string());
                    }
                    cycle_failed = true;
                }
            }
        }

        // A cancelled cycle reports the components it never completed.
        if cancelled {
            if !analyzed && !failed.iter().any(|f| f == "query_analyzer") {
                failed.push("query_analyzer".to_string());
            }
            if audit_was_due && !audited && !failed.iter().any(|f| f == "index_auditor") {
                failed.push("index_auditor".to_string());
            }
        }

        let findings = self.cycle.lock().unwrap().last_findings.clone();
        let window = self.cache_monitor.lock().unwrap().window_stats();
        let baseline_delta = self.baseline_delta(&queries, &window, cycle_failed, cancelled);

        // Reports carry a strictly positive window even when a degenerate
        // cycle finishes within the clock's millisecond resolution.
        let finished_at_ms = self.clock.epoch_ms().max(started_at_ms + 1);
        let summary = Report::summarize(&queries, &findings, window, baseline_delta);
        let report = Report {
            started_at_ms,
            finished_at_ms,
            queries,
            indexes: findings,
            cache: cache_samples,
            pool: self.pool.stats(),
            summary,
            applied,
            cancelled,
            partial: cancelled || !failed.is_empty(),
            failed_components: failed,
        };

        self.report_sinks.deliver_report(&report);
        debug!(
            duration_ms = finished_at_ms - started_at_ms,
            issues = report.queries.len(),
            findings = report.indexes.len(),
            cancelled,
            "audit cycle finished"
        );
        (report, cycle_failed)
    }

    fn is_disabled(&self, component: &str) -> bool {
        self.disabled
            .lock()
            .unwrap()
            .iter()
            .any(|c| c == component)
    }

    /// A permission error shuts the component off until the next start;
    /// everything else stays a per-cycle failure.
    fn note_component_failure(&self, component: &str, error: &DbError) {
        warn!(component, error = %error, "component failed");
        if error.kind() == DbErrorKind::PermissionDenied {
            let mut disabled = self.disabled.lock().unwrap();
            if !disabled.iter().any(|c| c == component) {
                warn!(component, "insufficient privileges, component disabled until restart");
                disabled.push(component.to_string());
            }
        }
    }

    /// Execute the closed safe set: ANALYZE on stale tables, CREATE INDEX
    /// for findings flagged safe. Everything else stays advisory.
    fn apply_safe(
        &self,
        conn: &mut crate::db::PgConn,
        findings: &[IndexFinding],
        stale_tables: &[String],
    ) -> Vec<String> {
        if self.cfg.upholder.dry_run || !self.cfg.upholder.auto_apply_safe {
            return Vec::new();
        }

        let mut applied = Vec::new();
        for table in stale_tables {
            let sql = format!("ANALYZE {}", table);
            match conn.batch_execute(&sql) {
                Ok(()) => {
                    info!(table = %table, "applied ANALYZE");
                    applied.push(sql);
                }
                Err(e) => warn!(table = %table, error = %e, "ANALYZE failed"),
            }
        }
        for finding in findings.iter().filter(|f| f.safe) {
            let Some(ddl) = &finding.ddl else { continue };
            match conn.batch_execute(ddl) {
                Ok(()) => {
                    info!(ddl = %ddl, "applied safe index creation");
                    applied.push(ddl.clone());
                }
                Err(e) => warn!(ddl = %ddl, error = %e, "safe index creation failed"),
            }
        }
        applied
    }

    fn baseline_delta(
        &self,
        queries: &[crate::report::QueryIssue],
        window: &crate::report::CacheWindowStats,
        cycle_failed: bool,
        cancelled: bool,
    ) -> Option<BaselineDelta> {
        let slow_queries = queries
            .iter()
            .filter(|q| q.kind == IssueKind::SlowMean)
            .count() as i64;

        let mut baseline = self.baseline.lock().unwrap();
        match *baseline {
            None if !cycle_failed && !cancelled && window.samples > 0 => {
                *baseline = Some(Baseline {
                    heap_hit_ratio: window.heap_mean,
                    index_hit_ratio: window.index_mean,
                    slow_queries,
                });
                None
            }
            Some(b) => Some(BaselineDelta {
                heap_hit_ratio: window.heap_mean - b.heap_hit_ratio,
                index_hit_ratio: window.index_mean - b.index_hit_ratio,
                slow_queries: slow_queries - b.slow_queries,
            }),
            None => None,
        }
    }
}

/// Whether the index audit is due, measured from the last completed audit.
fn audit_due(last_audit_ms: i64, now_ms: i64, interval_min: u64) -> bool {
    last_audit_ms == 0 || now_ms - last_audit_ms >= interval_min as i64 * 60_000
}
