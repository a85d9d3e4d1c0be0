//! Configuration surface for the engine fixtures.
//!
//! Settings come from three layers, later layers winning: built-in defaults,
//! an optional TOML file, and `DBFIXTURES_`-prefixed environment variables
//! (nested keys split on `__`, e.g. `DBFIXTURES_POSTGRESQL__PORT=5433`).
//! Explicit arguments passed to a fixture declaration override all of them.

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format as _, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Default config file name, looked up relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "dbfixtures.toml";

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "DBFIXTURES_";

/// Per-engine settings bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// PostgreSQL fixture defaults.
    #[serde(default)]
    pub postgresql: PostgresSettings,
    /// MySQL fixture defaults.
    #[serde(default)]
    pub mysql: MysqlSettings,
    /// Redis fixture defaults.
    #[serde(default)]
    pub redis: RedisSettings,
}

impl Settings {
    /// Loads settings from defaults, `dbfixtures.toml` (if present), and the
    /// environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Loads settings with an explicit config file path.
    ///
    /// A missing file is not an error; figment's `Toml::file` provider
    /// simply contributes nothing, leaving defaults and environment in
    /// force.
    pub fn load_from(file: &Path) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Settings::default()))
                .merge(Toml::file(file))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Extracts settings from a prepared figment, for tests that inject
    /// literal TOML.
    pub(crate) fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        figment.extract().map_err(ConfigError::from)
    }
}

/// PostgreSQL fixture defaults.
///
/// Mirrors the knobs of the original fixture surface: control binary, host,
/// port specification, superuser, logical-database name prefix, socket
/// directory, and extra server start parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSettings {
    /// Path to `pg_ctl`. When unset (or nonexistent), the binary is
    /// discovered via `pg_config --bindir`, falling back to `PATH`.
    pub ctl_path: Option<PathBuf>,
    /// Host the server listens on.
    pub host: String,
    /// Port specification string (`"?"` for any free port).
    pub port: String,
    /// Superuser created by initdb and used for administrative DDL.
    pub user: String,
    /// Prefix for generated logical database names.
    pub db_prefix: String,
    /// Directory for the server's Unix socket.
    pub unixsocketdir: PathBuf,
    /// Extra parameters appended verbatim to the server command line.
    pub startparams: String,
    /// Readiness budget in seconds.
    pub startup_timeout_secs: u64,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            ctl_path: None,
            host: "127.0.0.1".to_owned(),
            port: "?".to_owned(),
            user: "postgres".to_owned(),
            db_prefix: "tests".to_owned(),
            unixsocketdir: PathBuf::from("/tmp"),
            startparams: String::new(),
            startup_timeout_secs: 60,
        }
    }
}

/// MySQL fixture defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlSettings {
    /// Path to `mysqld`. When unset, discovered via `PATH`.
    pub mysqld_path: Option<PathBuf>,
    /// Host the server listens on.
    pub host: String,
    /// Port specification string (`"?"` for any free port).
    pub port: String,
    /// Administrative user (created passwordless by the insecure init).
    pub user: String,
    /// Prefix for generated logical database names.
    pub db_prefix: String,
    /// Extra parameters appended verbatim to the server command line.
    pub startparams: String,
    /// Readiness budget in seconds.
    pub startup_timeout_secs: u64,
}

impl Default for MysqlSettings {
    fn default() -> Self {
        Self {
            mysqld_path: None,
            host: "127.0.0.1".to_owned(),
            port: "?".to_owned(),
            user: "root".to_owned(),
            db_prefix: "tests".to_owned(),
            startparams: String::new(),
            startup_timeout_secs: 60,
        }
    }
}

/// Redis fixture defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Path to `redis-server`. When unset, discovered via `PATH`.
    pub server_path: Option<PathBuf>,
    /// Host the server listens on.
    pub host: String,
    /// Port specification string (`"?"` for any free port).
    pub port: String,
    /// Working directory for the server's dump file.
    pub dir: PathBuf,
    /// Readiness budget in seconds.
    pub startup_timeout_secs: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            server_path: None,
            host: "127.0.0.1".to_owned(),
            port: "?".to_owned(),
            dir: PathBuf::from("/tmp"),
            startup_timeout_secs: 30,
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A config source could not be read or deserialized.
    #[error("failed to load fixture configuration")]
    Extract(#[from] figment::Error),
}

#[cfg(test)]
mod tests {
    use figment::providers::{Format as _, Toml};

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.postgresql.host, "127.0.0.1");
        assert_eq!(settings.postgresql.port, "?");
        assert_eq!(settings.postgresql.user, "postgres");
        assert_eq!(settings.mysql.user, "root");
        assert_eq!(settings.redis.port, "?");
    }

    #[test]
    fn toml_overrides_defaults() {
        let figment = Figment::from(Serialized::defaults(Settings::default())).merge(
            Toml::string(
                r#"
                [postgresql]
                port = "5433"
                user = "tester"

                [redis]
                port = "6380-6390"
                "#,
            ),
        );
        let settings = Settings::from_figment(figment).expect("settings should extract");

        assert_eq!(settings.postgresql.port, "5433");
        assert_eq!(settings.postgresql.user, "tester");
        // Untouched keys keep their defaults.
        assert_eq!(settings.postgresql.host, "127.0.0.1");
        assert_eq!(settings.redis.port, "6380-6390");
        assert_eq!(settings.mysql.port, "?");
    }

    #[test]
    fn environment_overrides_toml_which_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                [postgresql]
                port = "5433"
                user = "tester"
                "#,
            )?;
            jail.set_env("DBFIXTURES_POSTGRESQL__PORT", "6000-6010");
            jail.set_env("DBFIXTURES_MYSQL__STARTUP_TIMEOUT_SECS", "90");

            let settings = Settings::load().expect("settings should extract");

            // Env beats the file, the file beats the defaults.
            assert_eq!(settings.postgresql.port, "6000-6010");
            assert_eq!(settings.postgresql.user, "tester");
            // Nested keys split on the double underscore.
            assert_eq!(settings.mysql.startup_timeout_secs, 90);
            assert_eq!(settings.redis.port, "?");
            Ok(())
        });
    }

    #[test]
    fn partial_engine_tables_are_filled_with_defaults() {
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string("[mysql]\nstartparams = \"--skip-sync-frm\"\n"));
        let settings = Settings::from_figment(figment).expect("settings should extract");

        assert_eq!(settings.mysql.startparams, "--skip-sync-frm");
        assert_eq!(settings.mysql.host, "127.0.0.1");
    }
}
