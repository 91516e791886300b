//! pgupholder-core — self-driving PostgreSQL performance upholder.
//!
//! Provides:
//! - `pool` — bounded session pool with lifecycle metrics
//! - `db` — driver integration, error classification, statement cache
//! - `scheduler` — jittered repeating tasks with cancellation
//! - `analyzer` — pg_stat_statements analysis and plan classification
//! - `auditor` — missing / unused / redundant / bloated index findings
//! - `cache` — buffer cache sampling and alerting
//! - `bulk` — method-selecting bulk loader
//! - `upholder` — the orchestrator composing the above into audit cycles
//! - `sink` — pluggable alert/report receivers
//! - `report`, `config`, `clock`, `fmt` — shared types and helpers
//!
//! The orchestrator consumes a [`pool::Pool`] and a [`clock::Clock`] and
//! emits [`report::Report`] and [`report::Alert`] values to registered
//! sinks. Everything is advisory by default (`dry_run = true`); only the
//! closed safe set (ANALYZE, non-unique plain index creation) is ever
//! executed, and only when explicitly enabled.

pub mod analyzer;
pub mod auditor;
pub mod bulk;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod fmt;
pub mod pool;
pub mod report;
pub mod scheduler;
pub mod sink;
pub mod upholder;

pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use db::PgManager;
pub use pool::{Pool, PoolStats};
pub use upholder::Upholder;
