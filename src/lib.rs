//! Ephemeral database server fixtures for integration tests.
//!
//! Each supported engine (PostgreSQL, MySQL, Redis) gets a fixture pair: a
//! process controller that starts a throwaway server subprocess on a free
//! port and tears it down afterwards, and (for the SQL engines) a connection
//! factory that creates a uniquely named logical database per test and drops
//! it on teardown.
//!
//! The moving parts are deliberately small:
//!
//! - [`ports::PortAllocator`] resolves port specifications (`"?"`, exact,
//!   ranges, comma lists) against the ports already claimed in this session.
//! - [`executor::TcpExecutor`] spawns the server subprocess, redirects its
//!   output to a log file, and polls TCP connectability (plus an optional
//!   log marker) until the server is ready or the startup timeout fires.
//! - The per-engine modules ([`postgres`], [`mysql`], [`redis`]) wire
//!   discovery, version detection, data directory initialization, and the
//!   engine's start command into that executor.
//!
//! Defaults come from [`config::Settings`], loadable from `dbfixtures.toml`
//! and `DBFIXTURES_`-prefixed environment variables.
//!
//! ```no_run
//! use db_fixtures::{config::Settings, ports::PortAllocator, postgres::PostgresProc};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! let ports = PortAllocator::default();
//! let pg = PostgresProc::new(settings.postgresql);
//!
//! let db = pg.database(&ports).await?;
//! // run the test against `db` (it derefs to a `PgConnection`) ...
//! db.teardown().await;
//! pg.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod executor;
pub mod mysql;
pub mod ports;
pub mod postgres;
pub mod redis;

pub use config::{ConfigError, Settings};
pub use executor::{ExecError, ExecStatus, ProcessSpec, TcpExecutor};
pub use mysql::{MysqlError, MysqlProc, MysqlServer};
pub use ports::{PortAllocator, PortError, PortSpec};
pub use postgres::{PostgresError, PostgresProc, PostgresServer};
pub use redis::{RedisError, RedisProc, RedisServer};

#[cfg(feature = "mysql")]
pub use mysql::MysqlDatabase;
#[cfg(feature = "postgres")]
pub use postgres::PostgresDatabase;

/// Produces a database name unique within this process.
///
/// The process id keeps concurrently running test binaries on a shared
/// server from colliding.
#[cfg(any(feature = "postgres", feature = "mysql"))]
pub(crate) fn unique_db_name(prefix: &str) -> String {
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{pid}_{n}", pid = std::process::id())
}

#[cfg(all(test, any(feature = "postgres", feature = "mysql")))]
mod tests {
    use super::*;

    #[test]
    fn db_names_are_distinct_and_prefixed() {
        let a = unique_db_name("tests");
        let b = unique_db_name("tests");
        assert_ne!(a, b);
        assert!(a.starts_with("tests_"));
    }
}
