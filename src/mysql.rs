//! MySQL server fixture.
//!
//! Same lifecycle protocol as the PostgreSQL fixture: a clean-slate data
//! directory per run, a version-keyed initialization command (the init
//! mechanism changed between 5.6 and 5.7), TCP + log-marker readiness, and
//! a connection factory producing ephemeral logical databases.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use regex::Regex;
use tokio::{
    process::Command,
    sync::{Mutex, OnceCell},
};

use crate::{
    config::MysqlSettings,
    executor::{ExecError, ProcessSpec, TcpExecutor},
    ports::{PortAllocator, PortError, PortSpec},
};

/// Log line mysqld prints once it accepts connections.
const READY_MARKER: &str = "ready for connections";

/// A MySQL fixture declaration.
///
/// Explicit builder overrides take precedence over the configured defaults;
/// one declaration starts at most one server per session.
pub struct MysqlProc {
    settings: MysqlSettings,
    mysqld_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<PortSpec>,
    startparams: Option<String>,
    server: OnceCell<MysqlServer>,
}

impl MysqlProc {
    /// Creates a declaration over the given settings with no overrides.
    pub fn new(settings: MysqlSettings) -> Self {
        Self {
            settings,
            mysqld_path: None,
            host: None,
            port: None,
            startparams: None,
            server: OnceCell::new(),
        }
    }

    /// Overrides the `mysqld` path, bypassing discovery.
    #[must_use]
    pub fn mysqld_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mysqld_path = Some(path.into());
        self
    }

    /// Overrides the listen host.
    #[must_use]
    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_owned());
        self
    }

    /// Overrides the port specification.
    #[must_use]
    pub fn port(mut self, spec: impl Into<PortSpec>) -> Self {
        self.port = Some(spec.into());
        self
    }

    /// Overrides the extra server start parameters.
    #[must_use]
    pub fn startparams(mut self, params: &str) -> Self {
        self.startparams = Some(params.to_owned());
        self
    }

    /// Returns the running server for this declaration, starting it on
    /// first use.
    pub async fn server(&self, ports: &PortAllocator) -> Result<&MysqlServer, MysqlError> {
        self.server
            .get_or_try_init(|| self.start_server(ports))
            .await
    }

    /// Stops the cached server, if one was ever started. Defensive no-op
    /// otherwise.
    pub async fn stop(&self) {
        if let Some(server) = self.server.get() {
            server.stop().await;
        }
    }

    async fn start_server(&self, ports: &PortAllocator) -> Result<MysqlServer, MysqlError> {
        let mysqld = self.resolve_mysqld()?;

        let version = detect_version(&mysqld).await?;
        let init = init_command(&version)?;

        let host = self
            .host
            .clone()
            .unwrap_or_else(|| self.settings.host.clone());
        let port_spec = match &self.port {
            Some(spec) => spec.clone(),
            None => self.settings.port.parse()?,
        };
        let port = ports.resolve(&port_spec)?;

        let data_dir = PathBuf::from(format!("/tmp/mysqldata.{port}"));
        let log_file = PathBuf::from(format!("/tmp/mysql.{port}.log"));
        let socket = PathBuf::from(format!("/tmp/mysql.{port}.sock"));
        let pid_file = PathBuf::from(format!("/tmp/mysql.{port}.pid"));

        init_data_dir(&mysqld, init, &data_dir).await?;

        let startparams = self
            .startparams
            .as_deref()
            .unwrap_or(&self.settings.startparams);
        let command = format!(
            "{mysqld} --no-defaults --datadir={datadir} --bind-address={host} --port={port} \
             --socket={socket} --pid-file={pid_file} {startparams}",
            mysqld = mysqld.display(),
            datadir = data_dir.display(),
            socket = socket.display(),
            pid_file = pid_file.display(),
        );

        let spec = ProcessSpec::shell(command.trim_end(), &host, port)
            .ready_marker(READY_MARKER)
            .log_file(&log_file)
            .startup_timeout(Duration::from_secs(self.settings.startup_timeout_secs));

        tracing::info!(
            version = %version,
            port = port,
            data_dir = %data_dir.display(),
            "starting MySQL server"
        );

        let mut executor = TcpExecutor::new(spec);
        executor.start().await?;

        Ok(MysqlServer {
            executor: Mutex::new(executor),
            host,
            port,
            user: self.settings.user.clone(),
            db_prefix: self.settings.db_prefix.clone(),
            data_dir,
            log_file,
        })
    }

    fn resolve_mysqld(&self) -> Result<PathBuf, MysqlError> {
        if let Some(path) = &self.mysqld_path {
            return Ok(path.clone());
        }
        if let Some(path) = &self.settings.mysqld_path
            && path.exists()
        {
            return Ok(path.clone());
        }
        which::which("mysqld").map_err(|_| MysqlError::BinaryNotFound {
            name: "mysqld".to_owned(),
        })
    }
}

/// A running MySQL server instance.
pub struct MysqlServer {
    executor: Mutex<TcpExecutor>,
    host: String,
    port: u16,
    user: String,
    db_prefix: String,
    data_dir: PathBuf,
    log_file: PathBuf,
}

impl MysqlServer {
    /// Host the server listens on.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolved port the server is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The server's data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The log file the server's output is redirected to.
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Whether the underlying executor is in the running state.
    pub async fn running(&self) -> bool {
        self.executor.lock().await.running()
    }

    /// TCP connection URI for `db`.
    pub fn connection_url(&self, db: &str) -> String {
        format!(
            "mysql://{user}@{host}:{port}/{db}",
            user = self.user,
            host = self.host,
            port = self.port,
        )
    }

    /// Stops the server and removes its data directory. Never raises.
    pub async fn stop(&self) {
        let mut executor = self.executor.lock().await;
        if let Err(err) = executor.stop().await {
            tracing::warn!(port = self.port, error = %err, "failed to stop MySQL server");
        }
        if let Err(err) = fs_err::tokio::remove_dir_all(&self.data_dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                data_dir = %self.data_dir.display(),
                error = %err,
                "failed to remove MySQL data directory"
            );
        }
    }
}

/// Installed server version, `major.minor` from `mysqld --version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MysqlVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
}

impl std::fmt::Display for MysqlVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// How a fresh data directory is produced for this server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitCommand {
    /// `mysql_install_db --datadir=...` (5.6 and earlier 5.x).
    InstallDb,
    /// `mysqld --initialize-insecure --datadir=...` (5.7 onward).
    InitializeInsecure,
}

/// Runs `mysqld --version` and extracts the `Ver major.minor` token.
async fn detect_version(mysqld: &Path) -> Result<MysqlVersion, MysqlError> {
    let output = Command::new(mysqld)
        .arg("--version")
        .output()
        .await
        .map_err(|err| MysqlError::VersionProbeFailed { source: err })?;
    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    parse_version(&text).ok_or(MysqlError::VersionUnparseable { output: text })
}

fn parse_version(text: &str) -> Option<MysqlVersion> {
    let pattern = Regex::new(r"Ver (\d+)\.(\d+)").expect("valid regex");
    let captures = pattern.captures(text)?;
    Some(MysqlVersion {
        major: captures[1].parse().ok()?,
        minor: captures[2].parse().ok()?,
    })
}

/// Version-keyed lookup of the initialization mechanism.
///
/// Closed map with an explicit unsupported branch: an unknown version is a
/// fatal configuration error, not a best guess.
fn init_command(version: &MysqlVersion) -> Result<InitCommand, MysqlError> {
    match (version.major, version.minor) {
        (5, 0..=6) => Ok(InitCommand::InstallDb),
        (5, 7) => Ok(InitCommand::InitializeInsecure),
        (8, _) => Ok(InitCommand::InitializeInsecure),
        _ => Err(MysqlError::UnsupportedVersion {
            version: version.to_string(),
        }),
    }
}

/// Produces a clean-slate data directory using the version's init command.
async fn init_data_dir(
    mysqld: &Path,
    init: InitCommand,
    data_dir: &Path,
) -> Result<(), MysqlError> {
    if let Err(err) = fs_err::tokio::remove_dir_all(data_dir).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        return Err(MysqlError::InitFailed {
            status: -1,
            stderr: err.to_string(),
        });
    }

    tracing::info!(data_dir = %data_dir.display(), init = ?init, "initializing MySQL data directory");

    let mut cmd = match init {
        InitCommand::InstallDb => {
            let install_db =
                which::which("mysql_install_db").map_err(|_| MysqlError::BinaryNotFound {
                    name: "mysql_install_db".to_owned(),
                })?;
            let mut cmd = Command::new(install_db);
            cmd.arg(format!("--datadir={}", data_dir.display()));
            cmd
        }
        InitCommand::InitializeInsecure => {
            let mut cmd = Command::new(mysqld);
            cmd.arg("--no-defaults")
                .arg("--initialize-insecure")
                .arg(format!("--datadir={}", data_dir.display()));
            cmd
        }
    };

    let output = cmd.output().await.map_err(|err| MysqlError::InitFailed {
        status: -1,
        stderr: err.to_string(),
    })?;

    if !output.status.success() {
        return Err(MysqlError::InitFailed {
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// Errors raised while managing a MySQL fixture.
#[derive(Debug, thiserror::Error)]
pub enum MysqlError {
    /// A required binary could not be located.
    #[error("MySQL binary '{name}' not found")]
    BinaryNotFound {
        /// Name of the missing binary.
        name: String,
    },

    /// `mysqld --version` could not be invoked.
    #[error("failed to probe MySQL version")]
    VersionProbeFailed {
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The version output carried no `Ver major.minor` token.
    #[error("could not parse MySQL version from: {output:?}")]
    VersionUnparseable {
        /// Raw `--version` output.
        output: String,
    },

    /// The installed server version has no known init command.
    #[error("unsupported MySQL version {version}")]
    UnsupportedVersion {
        /// Detected `major.minor` version.
        version: String,
    },

    /// Data directory initialization failed.
    #[error("MySQL data directory initialization exited with status {status}: {stderr}")]
    InitFailed {
        /// Exit status code, `-1` when the process could not run.
        status: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// Port specification or allocation failure.
    #[error(transparent)]
    Ports(#[from] PortError),

    /// Subprocess start/stop failure.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Client connection failure.
    #[cfg(feature = "mysql")]
    #[error("failed to connect to MySQL")]
    Connect {
        /// The underlying driver error.
        #[source]
        source: sqlx::Error,
    },

    /// Administrative DDL failure.
    #[cfg(feature = "mysql")]
    #[error("administrative statement failed")]
    Ddl {
        /// The underlying driver error.
        #[source]
        source: sqlx::Error,
    },
}

#[cfg(feature = "mysql")]
mod factory {
    use sqlx::{Connection as _, MySqlConnection};

    use super::{MysqlError, MysqlProc, MysqlServer};
    use crate::ports::PortAllocator;

    impl MysqlProc {
        /// Returns a client connection scoped to a fresh logical database,
        /// starting the server fixture on first use.
        pub async fn database(
            &self,
            ports: &PortAllocator,
        ) -> Result<MysqlDatabase, MysqlError> {
            let server = self.server(ports).await?;
            server.create_database(None).await
        }
    }

    impl MysqlServer {
        /// Creates a logical database and returns a connection scoped to it.
        pub async fn create_database(
            &self,
            name: Option<&str>,
        ) -> Result<MysqlDatabase, MysqlError> {
            let name = match name {
                Some(name) => name.to_owned(),
                None => crate::unique_db_name(&self.db_prefix),
            };
            let admin_url = self.connection_url("");

            let mut admin = MySqlConnection::connect(&admin_url)
                .await
                .map_err(|err| MysqlError::Connect { source: err })?;
            sqlx::raw_sql(&format!("CREATE DATABASE `{name}`"))
                .execute(&mut admin)
                .await
                .map_err(|err| MysqlError::Ddl { source: err })?;
            let _ = admin.close().await;

            let conn = MySqlConnection::connect(&self.connection_url(&name))
                .await
                .map_err(|err| MysqlError::Connect { source: err })?;

            tracing::info!(database = %name, port = self.port(), "created logical database");

            Ok(MysqlDatabase {
                conn,
                name,
                admin_url,
            })
        }
    }

    /// An ephemeral logical database plus a connection scoped to it.
    pub struct MysqlDatabase {
        conn: MySqlConnection,
        name: String,
        admin_url: String,
    }

    impl MysqlDatabase {
        /// Name of the logical database.
        pub fn name(&self) -> &str {
            &self.name
        }

        /// Closes the scoped connection and drops the database. Never
        /// raises; already-gone conditions are logged and swallowed.
        pub async fn teardown(self) {
            let Self {
                conn,
                name,
                admin_url,
            } = self;

            if let Err(err) = conn.close().await {
                tracing::debug!(database = %name, error = %err, "scoped connection close failed");
            }

            match MySqlConnection::connect(&admin_url).await {
                Ok(mut admin) => {
                    if let Err(err) = sqlx::raw_sql(&format!("DROP DATABASE IF EXISTS `{name}`"))
                        .execute(&mut admin)
                        .await
                    {
                        tracing::warn!(database = %name, error = %err, "failed to drop logical database");
                    }
                    let _ = admin.close().await;
                }
                Err(err) => {
                    tracing::warn!(database = %name, error = %err, "failed to reconnect for database drop");
                }
            }
        }
    }

    impl std::ops::Deref for MysqlDatabase {
        type Target = MySqlConnection;

        fn deref(&self) -> &Self::Target {
            &self.conn
        }
    }

    impl std::ops::DerefMut for MysqlDatabase {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.conn
        }
    }
}

#[cfg(feature = "mysql")]
pub use factory::MysqlDatabase;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_version_banner() {
        let version =
            parse_version("/usr/sbin/mysqld  Ver 8.0.39-0ubuntu0.24.04.2 for Linux on x86_64")
                .expect("should parse");
        assert_eq!(version, MysqlVersion { major: 8, minor: 0 });
    }

    #[test]
    fn rejects_output_without_version_token() {
        assert!(parse_version("mysqld: unknown option").is_none());
    }

    #[test]
    fn init_mechanism_changed_in_5_7() {
        let cmd = |major, minor| init_command(&MysqlVersion { major, minor });
        assert_eq!(cmd(5, 6).expect("known"), InitCommand::InstallDb);
        assert_eq!(cmd(5, 7).expect("known"), InitCommand::InitializeInsecure);
        assert_eq!(cmd(8, 0).expect("known"), InitCommand::InitializeInsecure);
    }

    #[test]
    fn unknown_version_is_a_fatal_configuration_error() {
        let err = init_command(&MysqlVersion { major: 42, minor: 1 })
            .expect_err("unknown major must not produce a guessed command");
        assert!(matches!(err, MysqlError::UnsupportedVersion { .. }));
    }
}
