//! Cooperative scheduler for repeating background tasks.
//!
//! Tasks fire on fixed intervals measured from fire start (drift-free, with a
//! catch-up cap of one interval), with a uniform random offset on the first
//! fire to avoid thundering herd. A task failing three consecutive runs is
//! marked degraded and runs at twice its interval until one success resets it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;

const DEGRADED_AFTER_FAILURES: u32 = 3;
/// Upper bound on one condvar wait, so cancellation is observed promptly.
const MAX_PARK: Duration = Duration::from_millis(500);

/// Cancellation signal shared between the scheduler and long-running tasks.
/// Tasks are expected to check it between database round-trips.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type TaskResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type TaskFn = dyn Fn(&CancelToken) -> TaskResult + Send + Sync;

struct TaskState {
    name: String,
    interval: Duration,
    next_fire: Instant,
    running: bool,
    triggered: bool,
    consecutive_failures: u32,
    degraded: bool,
    last_run_at_ms: i64,
    last_outcome: String,
    task: Arc<TaskFn>,
}

/// Per-task status for the observability surface.
#[derive(Clone, Debug, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub last_run_at_ms: i64,
    pub last_outcome: String,
    pub consecutive_failures: u32,
    pub degraded: bool,
}

struct Shared {
    tasks: Mutex<Vec<TaskState>>,
    wakeup: Condvar,
    cancel: CancelToken,
    clock: Arc<dyn Clock>,
    active: Mutex<usize>,
    drained: Condvar,
}

/// Timed task dispatcher over a fixed worker set.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks: Mutex::new(Vec::new()),
                wakeup: Condvar::new(),
                cancel: CancelToken::new(),
                clock,
                active: Mutex::new(0),
                drained: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// Register a repeating task. First fire lands at
    /// `now + uniform(0, interval * jitter_frac)`.
    pub fn schedule<F>(&self, name: &str, interval: Duration, jitter_frac: f64, task: F)
    where
        F: Fn(&CancelToken) -> TaskResult + Send + Sync + 'static,
    {
        let jitter = interval.mul_f64(rand::thread_rng().gen_range(0.0..=jitter_frac.max(0.0)));
        let mut tasks = self.shared.tasks.lock().unwrap();
        debug!(task = name, interval_ms = interval.as_millis() as u64,
            first_delay_ms = jitter.as_millis() as u64, "task scheduled");
        tasks.push(TaskState {
            name: name.to_string(),
            interval,
            next_fire: Instant::now() + jitter,
            running: false,
            triggered: false,
            consecutive_failures: 0,
            degraded: false,
            last_run_at_ms: 0,
            last_outcome: "never ran".to_string(),
            task: Arc::new(task),
        });
        self.shared.wakeup.notify_all();
    }

    /// Start `worker_count` dispatch threads.
    pub fn start(&self, worker_count: usize) {
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..worker_count.max(1) {
            let shared = self.shared.clone();
            *shared.active.lock().unwrap() += 1;
            workers.push(std::thread::spawn(move || worker_loop(shared)));
        }
    }

    /// Force an out-of-band run. A trigger while the task is already in
    /// flight is coalesced (dropped); returns whether the trigger was taken.
    pub fn trigger_now(&self, name: &str) -> bool {
        let mut tasks = self.shared.tasks.lock().unwrap();
        let Some(task) = tasks.iter_mut().find(|t| t.name == name) else {
            return false;
        };
        if task.running {
            debug!(task = name, "trigger coalesced with in-flight run");
            return false;
        }
        task.triggered = true;
        self.shared.wakeup.notify_all();
        true
    }

    /// Signal cancellation and wait up to `timeout` for workers to drain.
    /// Returns true when every worker observed the stop in time; tasks still
    /// running past the timeout are abandoned.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.shared.cancel.cancel();
        self.shared.wakeup.notify_all();

        let deadline = Instant::now() + timeout;
        let mut active = self.shared.active.lock().unwrap();
        while *active > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .shared
                .drained
                .wait_timeout(active, deadline - now)
                .unwrap();
            active = guard;
        }
        let clean = *active == 0;
        drop(active);

        let mut workers = self.workers.lock().unwrap();
        if clean {
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        } else {
            // Abandon workers stuck in a task; they exit on task completion.
            let abandoned = workers.len();
            workers.clear();
            warn!(abandoned, "scheduler stop timed out, workers abandoned");
        }
        clean
    }

    pub fn tasks_status(&self) -> Vec<TaskStatus> {
        self.shared
            .tasks
            .lock()
            .unwrap()
            .iter()
            .map(|t| TaskStatus {
                name: t.name.clone(),
                last_run_at_ms: t.last_run_at_ms,
                last_outcome: t.last_outcome.clone(),
                consecutive_failures: t.consecutive_failures,
                degraded: t.degraded,
            })
            .collect()
    }
}

/// Next fire instant for a completed run: anchored on the fire start, capped
/// so a long run catches up at most one interval late.
fn next_fire_after(fire_start: Instant, effective_interval: Duration, now: Instant) -> Instant {
    let next = fire_start + effective_interval;
    if next < now { now } else { next }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        let mut tasks = shared.tasks.lock().unwrap();
        let now = Instant::now();
        let due = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.running && (t.triggered || t.next_fire <= now))
            .min_by_key(|(_, t)| t.next_fire)
            .map(|(i, _)| i);

        match due {
            Some(i) => {
                let state = &mut tasks[i];
                state.running = true;
                state.triggered = false;
                let name = state.name.clone();
                let task = state.task.clone();
                drop(tasks);

                let fire_start = Instant::now();
                let result = task(&shared.cancel);

                let mut tasks = shared.tasks.lock().unwrap();
                let state = &mut tasks[i];
                state.running = false;
                state.last_run_at_ms = shared.clock.epoch_ms();
                match result {
                    Ok(()) => {
                        state.consecutive_failures = 0;
                        if state.degraded {
                            state.degraded = false;
                            info!(task = %name, "task recovered, interval restored");
                        }
                        state.last_outcome = "ok".to_string();
                    }
                    Err(_) if shared.cancel.is_cancelled() => {
                        // Structured cancellation is not a failure.
                        state.last_outcome = "cancelled".to_string();
                    }
                    Err(e) => {
                        state.consecutive_failures += 1;
                        state.last_outcome = format!("error: {}", e);
                        warn!(task = %name, error = %e,
                            consecutive_failures = state.consecutive_failures, "task failed");
                        if state.consecutive_failures >= DEGRADED_AFTER_FAILURES
                            && !state.degraded
                        {
                            state.degraded = true;
                            warn!(task = %name, "task degraded, interval doubled");
                        }
                    }
                }
                let effective = if state.degraded {
                    state.interval * 2
                } else {
                    state.interval
                };
                state.next_fire = next_fire_after(fire_start, effective, Instant::now());
                shared.wakeup.notify_all();
            }
            None => {
                let now = Instant::now();
                let earliest = tasks
                    .iter()
                    .filter(|t| !t.running)
                    .map(|t| t.next_fire)
                    .min();
                let wait = match earliest {
                    Some(e) if e > now => (e - now).min(MAX_PARK),
                    Some(_) => Duration::from_millis(1),
                    None => MAX_PARK,
                };
                let _ = shared.wakeup.wait_timeout(tasks, wait).unwrap();
            }
        }
    }

    let mut active = shared.active.lock().unwrap();
    *active -= 1;
    shared.drained.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::AtomicUsize;

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(SystemClock::new()))
    }

    #[test]
    fn repeating_task_fires_on_interval() {
        let sched = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sched.schedule("tick", Duration::from_millis(30), 0.0, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        sched.start(1);
        std::thread::sleep(Duration::from_millis(250));
        assert!(sched.stop(Duration::from_secs(1)));
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 3, "expected >= 3 fires, got {}", fired);
    }

    #[test]
    fn failures_degrade_after_three_and_success_recovers() {
        let sched = scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        sched.schedule("flaky", Duration::from_millis(15), 0.0, move |_| {
            let n = r.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                Err("boom".into())
            } else {
                Ok(())
            }
        });
        sched.start(1);

        // Wait for the three failures to land.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let status = &sched.tasks_status()[0];
            if status.degraded || Instant::now() > deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(sched.tasks_status()[0].degraded);

        // Degraded doubles the interval; the next (successful) run resets it.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let status = &sched.tasks_status()[0];
            if (!status.degraded && status.consecutive_failures == 0)
                || Instant::now() > deadline
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let status = &sched.tasks_status()[0];
        assert!(!status.degraded);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.last_outcome, "ok");
        sched.stop(Duration::from_secs(1));
    }

    #[test]
    fn trigger_during_run_is_coalesced() {
        let sched = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sched.schedule("slow", Duration::from_secs(3600), 0.0, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        });
        sched.start(1);

        // First fire is immediate (zero jitter); trigger while it runs.
        std::thread::sleep(Duration::from_millis(100));
        assert!(!sched.trigger_now("slow"), "in-flight trigger must coalesce");

        // After completion an out-of-band trigger is accepted.
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(sched.trigger_now("slow"));
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        sched.stop(Duration::from_secs(1));
    }

    #[test]
    fn trigger_unknown_task_is_rejected() {
        let sched = scheduler();
        assert!(!sched.trigger_now("nope"));
    }

    #[test]
    fn stop_abandons_tasks_past_timeout() {
        let sched = scheduler();
        sched.schedule("stuck", Duration::from_secs(3600), 0.0, move |_| {
            std::thread::sleep(Duration::from_millis(800));
            Ok(())
        });
        sched.start(1);
        std::thread::sleep(Duration::from_millis(100));

        let t0 = Instant::now();
        let clean = sched.stop(Duration::from_millis(100));
        assert!(!clean);
        assert!(t0.elapsed() < Duration::from_millis(600));
    }

    #[test]
    fn cancelled_run_is_not_counted_as_failure() {
        let sched = scheduler();
        sched.schedule("cancellable", Duration::from_millis(10), 0.0, move |token| {
            for _ in 0..100 {
                if token.is_cancelled() {
                    return Err("interrupted".into());
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        sched.start(1);
        std::thread::sleep(Duration::from_millis(50));
        assert!(sched.stop(Duration::from_secs(2)));
        let status = &sched.tasks_status()[0];
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.last_outcome, "cancelled");
    }

    #[test]
    fn next_fire_is_anchored_on_fire_start_with_catch_up_cap() {
        let start = Instant::now();
        let interval = Duration::from_millis(100);

        // Fast run: anchored exactly one interval after fire start.
        let next = next_fire_after(start, interval, start + Duration::from_millis(20));
        assert_eq!(next, start + interval);

        // Slow run: fires immediately, not repeatedly in a burst.
        let late_now = start + Duration::from_millis(350);
        let next = next_fire_after(start, interval, late_now);
        assert_eq!(next, late_now);
    }
}
