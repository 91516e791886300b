//! Bounded multi-producer/multi-consumer session pool.
//!
//! Idle sessions are reused LIFO for cache warmth; acquirers that have to
//! block queue FIFO on a ticket line, so contended waiters are served in
//! arrival order. The pool is generic over a [`Manager`] that knows how to
//! create and validate sessions, which keeps the whole machinery testable
//! without a server.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::PoolConfig;
use crate::db::{DbError, DbErrorKind, ExecOptions, PgConn};

/// Creates and validates pool sessions.
pub trait Manager: Send + Sync + 'static {
    type Conn: Send + 'static;

    fn connect(&self) -> Result<Self::Conn, DbError>;

    /// Cheap liveness check run on idle sessions before reuse.
    fn is_valid(&self, conn: &mut Self::Conn) -> bool;
}

/// Pool acquisition error.
#[derive(Debug)]
pub enum PoolError {
    /// No session became available within the acquire timeout. Retryable.
    Exhausted { waited_ms: u64 },
    /// The pool has been closed; no new acquires succeed.
    Closed,
    /// Session creation failed; carries the underlying driver error.
    Driver(DbError),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Exhausted { waited_ms } => {
                write!(f, "pool exhausted after {}ms", waited_ms)
            }
            PoolError::Closed => write!(f, "pool is closed"),
            PoolError::Driver(e) => write!(f, "session creation failed: {}", e),
        }
    }
}

impl std::error::Error for PoolError {}

/// Point-in-time pool counters.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PoolStats {
    pub min_size: usize,
    pub max_size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub total_created: u64,
    pub total_returned: u64,
    pub total_failed: u64,
    pub acquire_timeouts: u64,
    pub total_queries: u64,
    pub avg_query_ms: f64,
    pub slow_queries: u64,
}

struct Entry<C> {
    id: u64,
    conn: C,
    last_used_ms: i64,
    usage_count: u64,
    error_flag: bool,
}

struct Inner<C> {
    idle: Vec<Entry<C>>,
    in_use: usize,
    total: usize,
    closed: bool,
    next_id: u64,
    next_ticket: u64,
    waiters: VecDeque<u64>,
    total_created: u64,
    total_returned: u64,
    total_failed: u64,
    acquire_timeouts: u64,
    total_queries: u64,
    total_query_ms: f64,
    slow_queries: u64,
}

enum Take {
    Idle,
    Connect,
    Wait,
}

/// Thread-safe bounded session pool.
pub struct Pool<M: Manager> {
    manager: M,
    cfg: PoolConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<M::Conn>>,
    available: Condvar,
}

impl<M: Manager> Pool<M> {
    pub fn new(manager: M, cfg: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            manager,
            cfg,
            clock,
            inner: Mutex::new(Inner {
                idle: Vec::new(),
                in_use: 0,
                total: 0,
                closed: false,
                next_id: 0,
                next_ticket: 0,
                waiters: VecDeque::new(),
                total_created: 0,
                total_returned: 0,
                total_failed: 0,
                acquire_timeouts: 0,
                total_queries: 0,
                total_query_ms: 0.0,
                slow_queries: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.cfg
    }

    /// Eagerly create sessions up to `min_conn`. Returns how many were
    /// actually created; creation errors stop the warm-up and are logged.
    pub fn warm_up(&self) -> usize {
        let mut created = 0;
        loop {
            {
                let inner = self.inner.lock().unwrap();
                if inner.closed || inner.total >= self.cfg.min_conn {
                    return created;
                }
            }
            match self.manager.connect() {
                Ok(conn) => {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.closed {
                        return created;
                    }
                    let id = inner.next_id;
                    inner.next_id += 1;
                    inner.total += 1;
                    inner.total_created += 1;
                    inner.idle.push(Entry {
                        id,
                        conn,
                        last_used_ms: self.clock.epoch_ms(),
                        usage_count: 0,
                        error_flag: false,
                    });
                    created += 1;
                    self.available.notify_all();
                }
                Err(e) => {
                    warn!(error = %e, created, "pool warm-up stopped");
                    let mut inner = self.inner.lock().unwrap();
                    inner.total_failed += 1;
                    return created;
                }
            }
        }
    }

    /// Acquire a healthy session, blocking up to `timeout`.
    ///
    /// With `timeout = 0` this returns immediately: success if an idle
    /// session or free capacity is available, otherwise `Exhausted`.
    pub fn acquire(&self, timeout: Duration) -> Result<PooledConn<'_, M>, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        let mut my_ticket: Option<u64> = None;

        loop {
            if inner.closed {
                Self::forget_ticket(&mut inner, my_ticket);
                return Err(PoolError::Closed);
            }

            let first_in_line = match my_ticket {
                Some(t) => inner.waiters.front() == Some(&t),
                None => inner.waiters.is_empty(),
            };

            let action = if first_in_line {
                if !inner.idle.is_empty() {
                    Take::Idle
                } else if inner.total < self.cfg.max_conn {
                    Take::Connect
                } else {
                    Take::Wait
                }
            } else {
                Take::Wait
            };

            match action {
                Take::Idle => {
                    let mut entry = inner.idle.pop().expect("idle checked non-empty");
                    inner.in_use += 1;
                    Self::forget_ticket(&mut inner, my_ticket.take());
                    drop(inner);

                    if self.manager.is_valid(&mut entry.conn) {
                        return Ok(PooledConn {
                            pool: self,
                            entry: Some(entry),
                            discard: false,
                        });
                    }

                    // Stale idle session: close it and retry.
                    debug!(session = entry.id, "invalid idle session closed");
                    drop(entry);
                    inner = self.inner.lock().unwrap();
                    inner.in_use -= 1;
                    inner.total -= 1;
                    self.available.notify_all();
                }
                Take::Connect => {
                    inner.total += 1;
                    inner.in_use += 1;
                    Self::forget_ticket(&mut inner, my_ticket.take());
                    drop(inner);

                    match self.manager.connect() {
                        Ok(conn) => {
                            let mut guard = self.inner.lock().unwrap();
                            guard.total_created += 1;
                            let id = guard.next_id;
                            guard.next_id += 1;
                            drop(guard);
                            return Ok(PooledConn {
                                pool: self,
                                entry: Some(Entry {
                                    id,
                                    conn,
                                    last_used_ms: self.clock.epoch_ms(),
                                    usage_count: 0,
                                    error_flag: false,
                                }),
                                discard: false,
                            });
                        }
                        Err(e) => {
                            let mut guard = self.inner.lock().unwrap();
                            guard.total -= 1;
                            guard.in_use -= 1;
                            guard.total_failed += 1;
                            self.available.notify_all();
                            return Err(PoolError::Driver(e));
                        }
                    }
                }
                Take::Wait => {
                    if my_ticket.is_none() {
                        let t = inner.next_ticket;
                        inner.next_ticket += 1;
                        inner.waiters.push_back(t);
                        my_ticket = Some(t);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        Self::forget_ticket(&mut inner, my_ticket);
                        inner.acquire_timeouts += 1;
                        self.available.notify_all();
                        return Err(PoolError::Exhausted {
                            waited_ms: timeout.as_millis() as u64,
                        });
                    }
                    let (guard, _) = self
                        .available
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    inner = guard;
                }
            }
        }
    }

    fn forget_ticket(inner: &mut MutexGuard<'_, Inner<M::Conn>>, ticket: Option<u64>) {
        if let Some(t) = ticket {
            if let Some(pos) = inner.waiters.iter().position(|&w| w == t) {
                inner.waiters.remove(pos);
            }
        }
    }

    fn release(&self, mut entry: Entry<M::Conn>, ok: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_use -= 1;
        if ok && !inner.closed && !entry.error_flag {
            entry.last_used_ms = self.clock.epoch_ms();
            inner.total_returned += 1;
            inner.idle.push(entry);
        } else {
            inner.total -= 1;
        }
        self.available.notify_all();
    }

    pub(crate) fn record_query(&self, elapsed_ms: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_queries += 1;
        inner.total_query_ms += elapsed_ms;
        if elapsed_ms > self.cfg.slow_query_ms as f64 {
            inner.slow_queries += 1;
        }
    }

    /// Close idle sessions older than `max_idle_age_s` or flagged with an
    /// error, without dropping below `min_conn` total sessions.
    pub fn sweep(&self) {
        let now = self.clock.epoch_ms();
        let max_age_ms = self.cfg.max_idle_age_s as i64 * 1000;
        let mut inner = self.inner.lock().unwrap();

        let mut removable = inner.total.saturating_sub(self.cfg.min_conn);
        let before = inner.idle.len();
        let mut kept = Vec::with_capacity(before);
        for entry in inner.idle.drain(..) {
            let expired = now.saturating_sub(entry.last_used_ms) >= max_age_ms;
            if removable > 0 && (expired || entry.error_flag) {
                removable -= 1;
            } else {
                kept.push(entry);
            }
        }
        let removed = before - kept.len();
        inner.idle = kept;
        inner.total -= removed;
        if removed > 0 {
            debug!(removed, "health sweep closed idle sessions");
            self.available.notify_all();
        }
    }

    /// Drain idle sessions and refuse further acquires. Sessions currently
    /// in use are closed when released.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        let drained = inner.idle.len();
        inner.idle.clear();
        inner.total -= drained;
        self.available.notify_all();
        debug!(drained, "pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            min_size: self.cfg.min_conn,
            max_size: self.cfg.max_conn,
            in_use: inner.in_use,
            idle: inner.idle.len(),
            total_created: inner.total_created,
            total_returned: inner.total_returned,
            total_failed: inner.total_failed,
            acquire_timeouts: inner.acquire_timeouts,
            total_queries: inner.total_queries,
            avg_query_ms: if inner.total_queries > 0 {
                inner.total_query_ms / inner.total_queries as f64
            } else {
                0.0
            },
            slow_queries: inner.slow_queries,
        }
    }
}

/// Exclusively owned session handle; released back to the pool on drop.
///
/// Dropping the guard performs the release exactly once: back to the idle
/// list normally, or closed when the session was flagged or discarded.
pub struct PooledConn<'a, M: Manager> {
    pool: &'a Pool<M>,
    entry: Option<Entry<M::Conn>>,
    discard: bool,
}

impl<M: Manager> std::fmt::Debug for PooledConn<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("id", &self.entry.as_ref().map(|e| e.id))
            .field("discard", &self.discard)
            .finish()
    }
}

impl<M: Manager> PooledConn<'_, M> {
    pub fn id(&self) -> u64 {
        self.entry.as_ref().expect("live entry").id
    }

    pub fn usage_count(&self) -> u64 {
        self.entry.as_ref().expect("live entry").usage_count
    }

    /// Mark the session as broken; it will be closed instead of returned.
    pub fn flag_error(&mut self) {
        if let Some(e) = self.entry.as_mut() {
            e.error_flag = true;
        }
    }

    /// Release the session without returning it to the idle list.
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl<M: Manager> Deref for PooledConn<'_, M> {
    type Target = M::Conn;

    fn deref(&self) -> &M::Conn {
        &self.entry.as_ref().expect("live entry").conn
    }
}

impl<M: Manager> DerefMut for PooledConn<'_, M> {
    fn deref_mut(&mut self) -> &mut M::Conn {
        &mut self.entry.as_mut().expect("live entry").conn
    }
}

impl<M: Manager> Drop for PooledConn<'_, M> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            entry.usage_count += 1;
            let ok = !self.discard && !entry.error_flag;
            self.pool.release(entry, ok);
        }
    }
}

impl<M: Manager<Conn = PgConn>> PooledConn<'_, M> {
    /// Execute with query-time accounting; connection-level failures flag
    /// the session for disposal on release.
    pub fn exec(
        &mut self,
        sql: &str,
        params: &[&(dyn postgres::types::ToSql + Sync)],
        opts: &ExecOptions,
    ) -> Result<u64, DbError> {
        let t0 = Instant::now();
        let result = self.deref_mut().exec(sql, params, opts);
        self.pool.record_query(t0.elapsed().as_secs_f64() * 1000.0);
        self.flag_on_connection_error(&result);
        result
    }

    /// Query with query-time accounting, same disposal rules as `exec`.
    pub fn query(
        &mut self,
        sql: &str,
        params: &[&(dyn postgres::types::ToSql + Sync)],
        opts: &ExecOptions,
    ) -> Result<Vec<postgres::Row>, DbError> {
        let t0 = Instant::now();
        let result = self.deref_mut().query(sql, params, opts);
        self.pool.record_query(t0.elapsed().as_secs_f64() * 1000.0);
        self.flag_on_connection_error(&result);
        result
    }

    fn flag_on_connection_error<T>(&mut self, result: &Result<T, DbError>) {
        if let Err(e) = result {
            if e.kind() == DbErrorKind::Connection {
                self.flag_error();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TestConn(#[allow(dead_code)] usize);

    struct TestManager {
        connects: AtomicUsize,
        fail_connect: AtomicBool,
        valid: AtomicBool,
    }

    impl TestManager {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                fail_connect: AtomicBool::new(false),
                valid: AtomicBool::new(true),
            }
        }
    }

    impl Manager for TestManager {
        type Conn = TestConn;

        fn connect(&self) -> Result<TestConn, DbError> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(DbError::new(DbErrorKind::Connection, "connection refused"));
            }
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(TestConn(n))
        }

        fn is_valid(&self, _conn: &mut TestConn) -> bool {
            self.valid.load(Ordering::SeqCst)
        }
    }

    fn pool_with(max_conn: usize, min_conn: usize) -> Pool<TestManager> {
        let cfg = PoolConfig {
            min_conn,
            max_conn,
            ..PoolConfig::default()
        };
        Pool::new(TestManager::new(), cfg, Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn acquire_creates_up_to_max_and_reuses_idle() {
        let pool = pool_with(2, 0);
        let a = pool.acquire(Duration::from_millis(10)).unwrap();
        let b = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(pool.stats().in_use, 2);
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.total_returned, 2);

        // Reuse does not create new sessions.
        let _c = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(pool.stats().total_created, 2);
    }

    #[test]
    fn zero_timeout_returns_immediately() {
        let pool = pool_with(1, 0);
        let held = pool.acquire(Duration::ZERO).unwrap();
        let err = pool.acquire(Duration::ZERO).unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        drop(held);
        assert!(pool.acquire(Duration::ZERO).is_ok());
    }

    #[test]
    fn blocked_acquirer_wakes_on_release() {
        let pool = Arc::new(pool_with(1, 0));
        let held = pool.acquire(Duration::from_millis(10)).unwrap();

        let p = pool.clone();
        let waiter = std::thread::spawn(move || {
            let t0 = Instant::now();
            let conn = p.acquire(Duration::from_millis(1_000));
            (conn.is_ok(), t0.elapsed())
        });

        std::thread::sleep(Duration::from_millis(100));
        drop(held);
        let (ok, waited) = waiter.join().unwrap();
        assert!(ok);
        assert!(waited >= Duration::from_millis(80));
        assert!(waited < Duration::from_millis(900));
    }

    #[test]
    fn contended_waiters_are_served_fifo_and_excess_times_out() {
        let pool = Arc::new(pool_with(2, 0));
        let a = pool.acquire(Duration::from_millis(50)).unwrap();
        let b = pool.acquire(Duration::from_millis(50)).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let p = pool.clone();
            let order = order.clone();
            handles.push(std::thread::spawn(move || {
                // Stagger arrivals so the FIFO line is deterministic.
                std::thread::sleep(Duration::from_millis(30 * i as u64));
                match p.acquire(Duration::from_millis(1_000)) {
                    Ok(conn) => {
                        order.lock().unwrap().push(i);
                        std::thread::sleep(Duration::from_millis(1_200));
                        drop(conn);
                        true
                    }
                    Err(PoolError::Exhausted { .. }) => false,
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }));
        }

        std::thread::sleep(Duration::from_millis(300));
        drop(a);
        std::thread::sleep(Duration::from_millis(200));
        drop(b);

        let outcomes: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(outcomes, vec![true, true, false, false, false]);
        assert_eq!(*order.lock().unwrap(), vec![0, 1]);

        let stats = pool.stats();
        assert!(stats.total_created <= 2);
        assert_eq!(stats.acquire_timeouts, 3);
        assert_eq!(stats.total_failed, 0);
    }

    #[test]
    fn invalid_idle_sessions_are_replaced() {
        let pool = pool_with(2, 0);
        let a = pool.acquire(Duration::from_millis(10)).unwrap();
        drop(a);
        assert_eq!(pool.stats().idle, 1);

        pool.manager.valid.store(false, Ordering::SeqCst);
        let b = pool.acquire(Duration::from_millis(10)).unwrap();
        drop(b);
        // The stale idle session was closed and a fresh one created.
        assert_eq!(pool.stats().total_created, 2);
    }

    #[test]
    fn driver_error_surfaces_and_frees_capacity() {
        let pool = pool_with(1, 0);
        pool.manager.fail_connect.store(true, Ordering::SeqCst);
        let err = pool.acquire(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, PoolError::Driver(_)));
        assert_eq!(pool.stats().total_failed, 1);

        // Capacity was not leaked by the failed attempt.
        pool.manager.fail_connect.store(false, Ordering::SeqCst);
        assert!(pool.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn flagged_sessions_are_closed_on_release() {
        let pool = pool_with(2, 0);
        let mut a = pool.acquire(Duration::from_millis(10)).unwrap();
        a.flag_error();
        drop(a);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.total_returned, 0);
    }

    #[test]
    fn discard_skips_idle_list() {
        let pool = pool_with(2, 0);
        let a = pool.acquire(Duration::from_millis(10)).unwrap();
        a.discard();
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn close_all_rejects_new_acquires_and_drains_idle() {
        let pool = pool_with(2, 0);
        let held = pool.acquire(Duration::from_millis(10)).unwrap();
        let b = pool.acquire(Duration::from_millis(10)).unwrap();
        drop(b);
        assert_eq!(pool.stats().idle, 1);

        pool.close_all();
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)).unwrap_err(),
            PoolError::Closed
        ));
        assert_eq!(pool.stats().idle, 0);

        // In-use session is closed on release, not returned.
        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 0);
    }

    #[test]
    fn sweep_closes_aged_idle_sessions_but_keeps_min() {
        let clock = Arc::new(ManualClock::new(0));
        let cfg = PoolConfig {
            min_conn: 1,
            max_conn: 4,
            max_idle_age_s: 300,
            ..PoolConfig::default()
        };
        let pool = Pool::new(TestManager::new(), cfg, clock.clone());

        let a = pool.acquire(Duration::from_millis(10)).unwrap();
        let b = pool.acquire(Duration::from_millis(10)).unwrap();
        let c = pool.acquire(Duration::from_millis(10)).unwrap();
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.stats().idle, 3);

        clock.advance_ms(301 * 1000);
        pool.sweep();
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);

        // Fresh sessions survive the sweep.
        let d = pool.acquire(Duration::from_millis(10)).unwrap();
        drop(d);
        pool.sweep();
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn stats_track_query_timing() {
        let pool = pool_with(1, 0);
        pool.record_query(50.0);
        pool.record_query(250.0);
        let stats = pool.stats();
        assert_eq!(stats.total_queries, 2);
        assert_eq!(stats.slow_queries, 1);
        assert!((stats.avg_query_ms - 150.0).abs() < f64::EPSILON);
    }
}
