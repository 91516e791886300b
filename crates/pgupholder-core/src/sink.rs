//! Alert and report sinks.
//!
//! A sink is an isolated failure domain: delivery is best-effort, a sink
//! failing several consecutive deliveries is disabled until re-registered,
//! and one sink's failure never affects another's delivery. Sinks that need
//! to do heavy work are expected to buffer internally; the registry treats
//! deliveries that overrun the time budget as failures.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::report::{Alert, Report};

/// Sink delivery error.
#[derive(Debug)]
pub struct SinkError(pub String);

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SinkError {}

/// Receiver of alerts and reports.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    fn on_alert(&self, alert: &Alert) -> Result<(), SinkError>;

    fn on_report(&self, report: &Report) -> Result<(), SinkError>;
}

/// Logs alerts and report summaries through tracing.
pub struct LogSink;

impl Sink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn on_alert(&self, alert: &Alert) -> Result<(), SinkError> {
        warn!(
            kind = ?alert.kind,
            subject = %alert.subject,
            observed = alert.observed,
            threshold = alert.threshold,
            "{}",
            alert.message
        );
        Ok(())
    }

    fn on_report(&self, report: &Report) -> Result<(), SinkError> {
        info!(
            issues = report.queries.len(),
            findings = report.indexes.len(),
            critical = report.summary.critical_count,
            cancelled = report.cancelled,
            partial = report.partial,
            "audit report"
        );
        Ok(())
    }
}

/// Appends one JSON line per event to a file.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append<T: Serialize>(&self, event: &str, payload: &T) -> Result<(), SinkError> {
        let line = serde_json::json!({ "event": event, "data": payload });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SinkError(format!("open {}: {}", self.path.display(), e)))?;
        writeln!(file, "{}", line).map_err(|e| SinkError(e.to_string()))
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn on_alert(&self, alert: &Alert) -> Result<(), SinkError> {
        self.append("alert", alert)
    }

    fn on_report(&self, report: &Report) -> Result<(), SinkError> {
        self.append("report", report)
    }
}

/// POSTs events as JSON to an HTTP endpoint. The client timeout doubles as
/// the delivery budget.
pub struct HttpSink {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    fn post<T: Serialize>(&self, event: &str, payload: &T) -> Result<(), SinkError> {
        let body = serde_json::json!({ "event": event, "data": payload });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|e| SinkError(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SinkError(format!("endpoint returned {}", response.status())))
        }
    }
}

impl Sink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    fn on_alert(&self, alert: &Alert) -> Result<(), SinkError> {
        self.post("alert", alert)
    }

    fn on_report(&self, report: &Report) -> Result<(), SinkError> {
        self.post("report", report)
    }
}

/// Adapts user closures to the sink contract.
pub struct CallbackSink {
    name: String,
    on_alert: Box<dyn Fn(&Alert) + Send + Sync>,
    on_report: Box<dyn Fn(&Report) + Send + Sync>,
}

impl CallbackSink {
    pub fn new(
        name: impl Into<String>,
        on_alert: impl Fn(&Alert) + Send + Sync + 'static,
        on_report: impl Fn(&Report) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            on_alert: Box::new(on_alert),
            on_report: Box::new(on_report),
        }
    }
}

impl Sink for CallbackSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_alert(&self, alert: &Alert) -> Result<(), SinkError> {
        (self.on_alert)(alert);
        Ok(())
    }

    fn on_report(&self, report: &Report) -> Result<(), SinkError> {
        (self.on_report)(report);
        Ok(())
    }
}

struct SinkEntry {
    sink: Box<dyn Sink>,
    consecutive_failures: u32,
    disabled: bool,
}

/// Per-sink health, exposed through the status surface.
#[derive(Clone, Debug, Serialize)]
pub struct SinkStatus {
    pub name: String,
    pub consecutive_failures: u32,
    pub disabled: bool,
}

/// Holds registered sinks and fans events out to them.
pub struct SinkRegistry {
    entries: Mutex<Vec<SinkEntry>>,
    max_failures: u32,
    budget: Duration,
}

impl SinkRegistry {
    pub fn new(max_failures: u32, budget: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_failures,
            budget,
        }
    }

    /// Register a sink. Re-registering a name replaces the old entry and
    /// clears its failure state.
    pub fn register(&self, sink: Box<dyn Sink>) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| e.sink.name() != sink.name());
        entries.push(SinkEntry {
            sink,
            consecutive_failures: 0,
            disabled: false,
        });
    }

    pub fn deliver_alert(&self, alert: &Alert) {
        self.deliver(|sink| sink.on_alert(alert));
    }

    pub fn deliver_report(&self, report: &Report) {
        self.deliver(|sink| sink.on_report(report));
    }

    fn deliver(&self, send: impl Fn(&dyn Sink) -> Result<(), SinkError>) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if entry.disabled {
                continue;
            }
            let t0 = Instant::now();
            let result = send(entry.sink.as_ref());
            let elapsed = t0.elapsed();

            let failed = match result {
                Ok(()) if elapsed <= self.budget => {
                    entry.consecutive_failures = 0;
                    false
                }
                Ok(()) => {
                    warn!(
                        sink = entry.sink.name(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        budget_ms = self.budget.as_millis() as u64,
                        "sink delivery exceeded budget"
                    );
                    true
                }
                Err(e) => {
                    warn!(sink = entry.sink.name(), error = %e, "sink delivery failed");
                    true
                }
            };

            if failed {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.max_failures {
                    entry.disabled = true;
                    warn!(
                        sink = entry.sink.name(),
                        failures = entry.consecutive_failures,
                        "sink disabled until re-registered"
                    );
                }
            }
        }
    }

    pub fn statuses(&self) -> Vec<SinkStatus> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| SinkStatus {
                name: e.sink.name().to_string(),
                consecutive_failures: e.consecutive_failures,
                disabled: e.disabled,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolStats;
    use crate::report::{AlertKind, CacheWindowStats, ReportSummary, Severity};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn alert() -> Alert {
        Alert {
            kind: AlertKind::LowHeap,
            subject: "heap".to_string(),
            severity: Severity::Warn,
            message: "heap cache hit ratio 87.0% below threshold 95.0%".to_string(),
            observed: 0.87,
            threshold: 0.95,
            recommendations: vec!["consider increasing shared_buffers".to_string()],
            timestamp_ms: 1_000,
            cooldown_until_ms: 3_601_000,
        }
    }

    fn report() -> Report {
        Report {
            started_at_ms: 0,
            finished_at_ms: 10,
            queries: Vec::new(),
            indexes: Vec::new(),
            cache: Vec::new(),
            pool: PoolStats::default(),
            summary: ReportSummary {
                cache_window: CacheWindowStats::default(),
                ..ReportSummary::default()
            },
            applied: Vec::new(),
            cancelled: false,
            partial: false,
            failed_components: Vec::new(),
        }
    }

    struct CountingSink {
        name: String,
        alerts: Arc<AtomicUsize>,
        reports: Arc<AtomicUsize>,
        fail: bool,
        delay: Duration,
    }

    impl Sink for CountingSink {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_alert(&self, _alert: &Alert) -> Result<(), SinkError> {
            std::thread::sleep(self.delay);
            self.alerts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SinkError("nope".to_string()))
            } else {
                Ok(())
            }
        }

        fn on_report(&self, _report: &Report) -> Result<(), SinkError> {
            self.reports.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SinkError("nope".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn counting(name: &str, fail: bool, delay: Duration) -> (CountingSink, Arc<AtomicUsize>) {
        let alerts = Arc::new(AtomicUsize::new(0));
        (
            CountingSink {
                name: name.to_string(),
                alerts: alerts.clone(),
                reports: Arc::new(AtomicUsize::new(0)),
                fail,
                delay,
            },
            alerts,
        )
    }

    #[test]
    fn delivery_reaches_every_registered_sink() {
        let registry = SinkRegistry::new(3, Duration::from_millis(500));
        let (a, a_count) = counting("a", false, Duration::ZERO);
        let (b, b_count) = counting("b", false, Duration::ZERO);
        registry.register(Box::new(a));
        registry.register(Box::new(b));

        registry.deliver_alert(&alert());
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_sink_is_disabled_after_max_failures_without_affecting_others() {
        let registry = SinkRegistry::new(3, Duration::from_millis(500));
        let (bad, bad_count) = counting("bad", true, Duration::ZERO);
        let (good, good_count) = counting("good", false, Duration::ZERO);
        registry.register(Box::new(bad));
        registry.register(Box::new(good));

        for _ in 0..5 {
            registry.deliver_alert(&alert());
        }
        // The bad sink was tried three times, then skipped.
        assert_eq!(bad_count.load(Ordering::SeqCst), 3);
        assert_eq!(good_count.load(Ordering::SeqCst), 5);

        let statuses = registry.statuses();
        let bad_status = statuses.iter().find(|s| s.name == "bad").unwrap();
        assert!(bad_status.disabled);
        let good_status = statuses.iter().find(|s| s.name == "good").unwrap();
        assert!(!good_status.disabled);
    }

    #[test]
    fn reregistration_re_enables_a_sink() {
        let registry = SinkRegistry::new(2, Duration::from_millis(500));
        let (bad, _) = counting("flappy", true, Duration::ZERO);
        registry.register(Box::new(bad));
        registry.deliver_alert(&alert());
        registry.deliver_alert(&alert());
        assert!(registry.statuses()[0].disabled);

        let (fixed, fixed_count) = counting("flappy", false, Duration::ZERO);
        registry.register(Box::new(fixed));
        registry.deliver_alert(&alert());
        assert_eq!(fixed_count.load(Ordering::SeqCst), 1);
        assert!(!registry.statuses()[0].disabled);
        assert_eq!(registry.statuses().len(), 1);
    }

    #[test]
    fn overrunning_the_budget_counts_as_failure() {
        let registry = SinkRegistry::new(2, Duration::from_millis(10));
        let (slow, _) = counting("slow", false, Duration::from_millis(40));
        registry.register(Box::new(slow));

        registry.deliver_alert(&alert());
        registry.deliver_alert(&alert());
        assert!(registry.statuses()[0].disabled);
    }

    struct FlakySink {
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl Sink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        fn on_alert(&self, _alert: &Alert) -> Result<(), SinkError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(SinkError("warming up".to_string()))
            } else {
                Ok(())
            }
        }

        fn on_report(&self, _report: &Report) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let registry = SinkRegistry::new(3, Duration::from_millis(500));
        registry.register(Box::new(FlakySink {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        }));

        registry.deliver_alert(&alert());
        registry.deliver_alert(&alert());
        assert_eq!(registry.statuses()[0].consecutive_failures, 2);
        assert!(!registry.statuses()[0].disabled);

        // A success wipes the streak; the sink stays enabled indefinitely.
        registry.deliver_alert(&alert());
        assert_eq!(registry.statuses()[0].consecutive_failures, 0);
        registry.deliver_alert(&alert());
        assert!(!registry.statuses()[0].disabled);
    }

    #[test]
    fn callback_sink_invokes_user_closures() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let sink = CallbackSink::new("cb", move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        }, |_| {});
        sink.on_alert(&alert()).unwrap();
        sink.on_alert(&alert()).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = FileSink::new(&path);

        sink.on_alert(&alert()).unwrap();
        sink.on_report(&report()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "alert");
        assert_eq!(first["data"]["kind"], "low_heap");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "report");
        assert_eq!(second["data"]["cancelled"], false);
    }

    #[test]
    fn log_sink_never_fails() {
        let sink = LogSink;
        assert!(sink.on_alert(&alert()).is_ok());
        assert!(sink.on_report(&report()).is_ok());
    }
}
