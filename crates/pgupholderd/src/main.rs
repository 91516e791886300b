//! pgupholderd - PostgreSQL auto-upholder daemon.
//!
//! Runs the audit loop against a live instance: pool, query analyzer, index
//! auditor, cache monitor, and sinks, with graceful shutdown on Ctrl-C.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgupholder_core::sink::{FileSink, HttpSink, LogSink};
use pgupholder_core::{Config, PgManager, Pool, SystemClock, Upholder};

/// PostgreSQL auto-upholder daemon.
#[derive(Parser)]
#[command(name = "pgupholderd", about = "PostgreSQL auto-upholder daemon", version)]
struct Args {
    /// libpq-style connection string. Defaults to PGHOST/PGPORT/PGUSER/
    /// PGPASSWORD/PGDATABASE environment variables.
    #[arg(long)]
    conn: Option<String>,

    /// Configuration overrides as section.key=value (repeatable),
    /// e.g. --set analyzer.slow_mean_ms=250 --set pool.max_conn=16.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// Dry-run mode: findings stay advisory, no DDL is ever executed.
    /// Disable with --dry-run=false.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    dry_run: bool,

    /// Allow the safe optimization set (ANALYZE, plain index creation).
    /// Only effective together with --dry-run=false.
    #[arg(long)]
    auto_apply_safe: bool,

    /// Append alerts and reports as JSON lines to this file.
    #[arg(long, value_name = "PATH")]
    report_file: Option<String>,

    /// POST alerts as JSON to this URL.
    #[arg(long, value_name = "URL")]
    alert_url: Option<String>,

    /// Seconds between status log lines.
    #[arg(long, default_value = "60")]
    status_interval: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("pgupholderd={}", level).parse().unwrap())
        .add_directive(format!("pgupholder_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Prints actionable hints for common connection failures.
fn print_pg_warning(error: &str) {
    eprintln!("warning: could not reach PostgreSQL: {}", error);
    if error.contains("connection refused") {
        eprintln!("  is the server running, and PGHOST/PGPORT correct?");
    } else if error.contains("password authentication failed") {
        eprintln!("  check PGUSER/PGPASSWORD or your pg_hba.conf rules");
    }
    eprintln!("  the upholder will keep retrying in the background");
}

fn format_epoch_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("pgupholderd {} starting", env!("CARGO_PKG_VERSION"));

    // Assemble configuration: defaults, then --set overrides, then flags.
    let mut cfg = Config::default();
    for pair in &args.set {
        let Some((key, value)) = pair.split_once('=') else {
            error!("--set expects KEY=VALUE, got '{}'", pair);
            std::process::exit(2);
        };
        if let Err(e) = cfg.apply_kv(key.trim(), value.trim()) {
            error!("{}", e);
            std::process::exit(2);
        }
    }
    cfg.upholder.dry_run = args.dry_run;
    cfg.upholder.auto_apply_safe = args.auto_apply_safe;
    if let Err(e) = cfg.validate() {
        error!("{}", e);
        std::process::exit(2);
    }

    if cfg.upholder.auto_apply_safe && cfg.upholder.dry_run {
        warn!("--auto-apply-safe has no effect while dry-run is enabled");
    }
    info!(
        dry_run = cfg.upholder.dry_run,
        auto_apply_safe = cfg.upholder.auto_apply_safe,
        analyzer_interval_min = cfg.analyzer.interval_min,
        auditor_interval_min = cfg.auditor.interval_min,
        cache_interval_s = cfg.cache.interval_s,
        "configuration loaded"
    );

    // Connection manager from --conn or the standard PG* environment.
    let manager = match &args.conn {
        Some(conn) => PgManager::new(conn.clone()),
        None => match PgManager::from_env() {
            Ok(m) => m,
            Err(e) => {
                error!("cannot build connection settings: {}", e);
                std::process::exit(2);
            }
        },
    }
    .with_statement_cache_cap(cfg.statements.cache_cap_per_session);

    let clock = Arc::new(SystemClock::new());
    let pool = Arc::new(Pool::new(manager, cfg.pool.clone(), clock.clone()));

    // Startup probe; a failure is a warning, not a fatal error.
    match pool.acquire(Duration::from_secs(3)) {
        Ok(conn) => {
            info!(
                server_version_num = conn.server_version_num(),
                "connected to PostgreSQL"
            );
            drop(conn);
            let warmed = pool.warm_up();
            info!(sessions = warmed, "pool warmed up");
        }
        Err(e) => {
            warn!("startup probe failed: {}", e);
            print_pg_warning(&e.to_string());
        }
    }

    let sink_budget = Duration::from_millis(cfg.upholder.sink_budget_ms);
    let upholder = match Upholder::new(pool.clone(), clock, cfg) {
        Ok(u) => u,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    upholder.register_alert_sink(Box::new(LogSink));
    upholder.register_report_sink(Box::new(LogSink));
    if let Some(path) = &args.report_file {
        upholder.register_alert_sink(Box::new(FileSink::new(path)));
        upholder.register_report_sink(Box::new(FileSink::new(path)));
        info!(path = %path, "file sink attached");
    }
    if let Some(url) = &args.alert_url {
        match HttpSink::new(url.clone(), sink_budget) {
            Ok(sink) => {
                upholder.register_alert_sink(Box::new(sink));
                info!(url = %url, "http alert sink attached");
            }
            Err(e) => warn!(url = %url, "http sink not attached: {}", e),
        }
    }

    if let Err(e) = upholder.start() {
        error!("failed to start: {}", e);
        std::process::exit(1);
    }

    // Graceful shutdown on Ctrl-C.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("failed to set Ctrl-C handler: {}", e);
    }

    let mut last_status = std::time::Instant::now();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
        if last_status.elapsed() >= Duration::from_secs(args.status_interval.max(1)) {
            last_status = std::time::Instant::now();
            let status = upholder.status();
            let last_cycle = status
                .last_cycle
                .map(|c| format!("{} ok={}", format_epoch_ms(c.finished_at_ms), c.ok))
                .unwrap_or_else(|| "never".to_string());
            info!(
                state = ?status.state,
                in_use = status.pool.in_use,
                idle = status.pool.idle,
                queries = status.pool.total_queries,
                failures = status.consecutive_failures,
                last_cycle = %last_cycle,
                "status"
            );
        }
    }

    match upholder.stop(Duration::from_secs(10)) {
        Ok(true) => info!("all workers drained"),
        Ok(false) => warn!("stop timed out, workers abandoned"),
        Err(e) => warn!("stop failed: {}", e),
    }
    pool.close_all();
    info!("pgupholderd exited");
}
