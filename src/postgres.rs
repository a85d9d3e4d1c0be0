//! PostgreSQL server fixture.
//!
//! [`PostgresProc`] is a fixture declaration: explicit overrides layered on
//! [`PostgresSettings`] defaults. Its first `server()` call initializes a
//! clean-slate data directory, detects the installed server version to pick
//! the matching command template, starts the server through [`TcpExecutor`],
//! and caches the running instance for the rest of the session. The
//! connection-factory half opens client connections around an ephemeral
//! logical database created per invocation.
//!
//! # PostgreSQL Binaries
//!
//! | Binary      | Role                                      |
//! |-------------|-------------------------------------------|
//! | `pg_ctl`    | initdb wrapper and version introspection  |
//! | `pg_config` | locate the bin directory when no explicit path is given |
//! | `postgres`  | the database server                       |

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use regex::Regex;
use tokio::{
    process::Command,
    sync::{Mutex, OnceCell},
};

use crate::{
    config::PostgresSettings,
    executor::{ExecError, ProcessSpec, TcpExecutor},
    ports::{PortAllocator, PortError, PortSpec},
};

/// Log line PostgreSQL prints once it accepts connections.
const READY_MARKER: &str = "database system is ready to accept connections";

/// A PostgreSQL fixture declaration.
///
/// Explicit builder overrides take precedence over the configured defaults.
/// One declaration starts at most one server per session; repeated
/// `server()` calls return the same cached [`PostgresServer`].
pub struct PostgresProc {
    settings: PostgresSettings,
    ctl_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<PortSpec>,
    startparams: Option<String>,
    server: OnceCell<PostgresServer>,
}

impl PostgresProc {
    /// Creates a declaration over the given settings with no overrides.
    pub fn new(settings: PostgresSettings) -> Self {
        Self {
            settings,
            ctl_path: None,
            host: None,
            port: None,
            startparams: None,
            server: OnceCell::new(),
        }
    }

    /// Overrides the `pg_ctl` path, bypassing discovery.
    #[must_use]
    pub fn ctl_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ctl_path = Some(path.into());
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
    ///
    /// Startup is performed at most once; concurrent callers all wait on
    /// the same initialization and observe the same instance.
    pub async fn server(&self, ports: &PortAllocator) -> Result<&PostgresServer, PostgresError> {
        self.server
            .get_or_try_init(|| self.start_server(ports))
            .await
    }

    /// Stops the cached server, if one was ever started.
    ///
    /// Safe to call from session teardown regardless of how far setup got:
    /// a declaration that never started, or whose server already stopped,
    /// is a no-op.
    pub async fn stop(&self) {
        if let Some(server) = self.server.get() {
            server.stop().await;
        }
    }

    async fn start_server(&self, ports: &PortAllocator) -> Result<PostgresServer, PostgresError> {
        let ctl = self.resolve_ctl().await?;
        let bindir = ctl
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        // Fail fast on an unrecognized server version, before any port is
        // claimed or directory touched.
        let version = detect_version(&ctl).await?;
        let socket_flag = unix_socket_flag(&version)?;

        let host = self
            .host
            .clone()
            .unwrap_or_else(|| self.settings.host.clone());
        let port_spec = match &self.port {
            Some(spec) => spec.clone(),
            None => self.settings.port.parse()?,
        };
        let port = ports.resolve(&port_spec)?;

        let data_dir = PathBuf::from(format!("/tmp/postgresqldata.{port}"));
        let log_file = PathBuf::from(format!("/tmp/postgresql.{port}.log"));

        init_data_dir(&ctl, &self.settings.user, &data_dir).await?;

        let startparams = self
            .startparams
            .as_deref()
            .unwrap_or(&self.settings.startparams);
        let command = format!(
            "{bindir}/postgres -D {datadir} -F -p {port} -c {socket_flag}='{sockdir}' {startparams}",
            bindir = bindir.display(),
            datadir = data_dir.display(),
            sockdir = self.settings.unixsocketdir.display(),
        );

        let spec = ProcessSpec::shell(command.trim_end(), &host, port)
            .ready_marker(READY_MARKER)
            .log_file(&log_file)
            .startup_timeout(Duration::from_secs(self.settings.startup_timeout_secs));

        tracing::info!(
            version = %version,
            port = port,
            data_dir = %data_dir.display(),
            "starting PostgreSQL server"
        );

        let mut executor = TcpExecutor::new(spec);
        executor.start().await?;

        Ok(PostgresServer {
            executor: Mutex::new(executor),
            host,
            port,
            user: self.settings.user.clone(),
            db_prefix: self.settings.db_prefix.clone(),
            unixsocketdir: self.settings.unixsocketdir.clone(),
            data_dir,
            log_file,
        })
    }

    /// Resolves the `pg_ctl` binary.
    ///
    /// Explicit override first, then the configured path when it exists,
    /// then `pg_config --bindir`, then plain `PATH` discovery.
    async fn resolve_ctl(&self) -> Result<PathBuf, PostgresError> {
        if let Some(path) = &self.ctl_path {
            return Ok(path.clone());
        }
        if let Some(path) = &self.settings.ctl_path
            && path.exists()
        {
            return Ok(path.clone());
        }

        if let Ok(pg_config) = which::which("pg_config") {
            let output = Command::new(&pg_config)
                .arg("--bindir")
                .output()
                .await
                .map_err(|err| PostgresError::VersionProbeFailed { source: err })?;
            if output.status.success() {
                let bindir = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                let ctl = Path::new(&bindir).join("pg_ctl");
                if ctl.exists() {
                    return Ok(ctl);
                }
            }
        }

        which::which("pg_ctl").map_err(|_| PostgresError::BinaryNotFound {
            name: "pg_ctl".to_owned(),
        })
    }
}

/// A running PostgreSQL server instance.
pub struct PostgresServer {
    executor: Mutex<TcpExecutor>,
    host: String,
    port: u16,
    user: String,
    db_prefix: String,
    unixsocketdir: PathBuf,
    data_dir: PathBuf,
    log_file: PathBuf,
}

impl PostgresServer {
    /// Host the server listens on.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolved port the server is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Superuser for administrative DDL.
    pub fn user(&self) -> &str {
        &self.user
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

    /// Connection URI for `db`, going through the Unix socket directory.
    ///
    /// The empty host before the first `/` means "use Unix socket"; the
    /// `host` query parameter points at the socket directory.
    pub fn connection_url(&self, db: &str) -> String {
        let host_path = self.unixsocketdir.to_string_lossy();
        let encoded = utf8_percent_encode(&host_path, QUERY_VALUE_ENCODE_SET);
        format!(
            "postgresql:///{db}?host={encoded}&port={port}&user={user}",
            port = self.port,
            user = self.user,
        )
    }

    /// Stops the server and removes its data directory.
    ///
    /// Never raises: teardown tolerates a server that already exited and a
    /// data directory that is already gone.
    pub async fn stop(&self) {
        let mut executor = self.executor.lock().await;
        if let Err(err) = executor.stop().await {
            tracing::warn!(port = self.port, error = %err, "failed to stop PostgreSQL server");
        }
        if let Err(err) = fs_err::tokio::remove_dir_all(&self.data_dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                data_dir = %self.data_dir.display(),
                error = %err,
                "failed to remove PostgreSQL data directory"
            );
        }
    }
}

/// Installed server version, `major.minor` as reported by `pg_ctl --version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgVersion {
    /// Major version (`9`, `16`, ...).
    pub major: u32,
    /// Minor component of the version token (`9.3` -> `3`).
    pub minor: u32,
}

impl std::fmt::Display for PgVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Runs `pg_ctl --version` and extracts the `major.minor` token.
async fn detect_version(ctl: &Path) -> Result<PgVersion, PostgresError> {
    let output = Command::new(ctl)
        .arg("--version")
        .output()
        .await
        .map_err(|err| PostgresError::VersionProbeFailed { source: err })?;
    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    parse_version(&text).ok_or(PostgresError::VersionUnparseable { output: text })
}

fn parse_version(text: &str) -> Option<PgVersion> {
    let pattern = Regex::new(r"(\d+)\.(\d+)").expect("valid regex");
    let captures = pattern.captures(text)?;
    Some(PgVersion {
        major: captures[1].parse().ok()?,
        minor: captures[2].parse().ok()?,
    })
}

/// Selects the socket-directory flag for the installed version.
///
/// The flag was renamed in 9.3 (`unix_socket_directory` became
/// `unix_socket_directories`). The lookup is closed: a version outside the
/// known set is a fatal configuration error, never a guessed command line.
fn unix_socket_flag(version: &PgVersion) -> Result<&'static str, PostgresError> {
    match (version.major, version.minor) {
        (8, 4) => Ok("unix_socket_directory"),
        (9, 0..=2) => Ok("unix_socket_directory"),
        (9, _) => Ok("unix_socket_directories"),
        (10..=18, _) => Ok("unix_socket_directories"),
        _ => Err(PostgresError::UnsupportedVersion {
            version: version.to_string(),
        }),
    }
}

/// Initializes a clean-slate data directory.
///
/// Removes any prior directory at the deterministic per-port path, then
/// runs `pg_ctl initdb -o "--auth=trust --username=<user>" -D <datadir>`,
/// so a session reusing a port never sees state from an earlier run.
async fn init_data_dir(ctl: &Path, user: &str, data_dir: &Path) -> Result<(), PostgresError> {
    if let Err(err) = fs_err::tokio::remove_dir_all(data_dir).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        return Err(PostgresError::InitDbFailed {
            status: -1,
            stderr: err.to_string(),
        });
    }

    tracing::info!(data_dir = %data_dir.display(), "initializing PostgreSQL data directory");

    let output = Command::new(ctl)
        .arg("initdb")
        .arg("-o")
        .arg(format!("--auth=trust --username={user}"))
        .arg("-D")
        .arg(data_dir)
        .output()
        .await
        .map_err(|err| PostgresError::InitDbFailed {
            status: -1,
            stderr: err.to_string(),
        })?;

    if !output.status.success() {
        return Err(PostgresError::InitDbFailed {
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// Characters that must be percent-encoded in URI query parameter values.
///
/// Leaves `/` unencoded so socket-directory paths stay readable in logs.
const QUERY_VALUE_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'=')
    .add(b'?');

/// Errors raised while managing a PostgreSQL fixture.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// A required binary could not be located.
    #[error("PostgreSQL binary '{name}' not found")]
    BinaryNotFound {
        /// Name of the missing binary.
        name: String,
    },

    /// `pg_ctl --version` (or `pg_config`) could not be invoked.
    #[error("failed to probe PostgreSQL version")]
    VersionProbeFailed {
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The version output carried no `major.minor` token.
    #[error("could not parse PostgreSQL version from: {output:?}")]
    VersionUnparseable {
        /// Raw `--version` output.
        output: String,
    },

    /// The installed server version has no known command template.
    #[error("unsupported PostgreSQL version {version}")]
    UnsupportedVersion {
        /// Detected `major.minor` version.
        version: String,
    },

    /// `initdb` failed to produce a fresh data directory.
    #[error("initdb exited with status {status}: {stderr}")]
    InitDbFailed {
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
    #[cfg(feature = "postgres")]
    #[error("failed to connect to PostgreSQL")]
    Connect {
        /// The underlying driver error.
        #[source]
        source: sqlx::Error,
    },

    /// Administrative DDL failure.
    #[cfg(feature = "postgres")]
    #[error("administrative statement failed")]
    Ddl {
        /// The underlying driver error.
        #[source]
        source: sqlx::Error,
    },
}

#[cfg(feature = "postgres")]
mod factory {
    use sqlx::{Connection as _, PgConnection};

    use super::{PostgresError, PostgresProc, PostgresServer};
    use crate::ports::PortAllocator;

    impl PostgresProc {
        /// Returns a client connection scoped to a fresh logical database,
        /// starting the server fixture on first use.
        pub async fn database(
            &self,
            ports: &PortAllocator,
        ) -> Result<PostgresDatabase, PostgresError> {
            let server = self.server(ports).await?;
            server.create_database(None).await
        }
    }

    impl PostgresServer {
        /// Creates a logical database and returns a connection scoped to it.
        ///
        /// With `name = None` a process-unique name is generated, so
        /// concurrent invocations against the same server never collide.
        /// The administrative connection runs each statement standalone
        /// (no transaction wrapping) and is closed before the scoped
        /// connection is opened.
        pub async fn create_database(
            &self,
            name: Option<&str>,
        ) -> Result<PostgresDatabase, PostgresError> {
            let name = match name {
                Some(name) => name.to_owned(),
                None => crate::unique_db_name(&self.db_prefix),
            };
            let admin_url = self.connection_url("postgres");

            let mut admin = PgConnection::connect(&admin_url)
                .await
                .map_err(|err| PostgresError::Connect { source: err })?;
            // CREATE DATABASE refuses to run inside a transaction block,
            // so it goes through the simple query protocol.
            sqlx::raw_sql(&format!("CREATE DATABASE \"{name}\""))
                .execute(&mut admin)
                .await
                .map_err(|err| PostgresError::Ddl { source: err })?;
            let _ = admin.close().await;

            let conn = PgConnection::connect(&self.connection_url(&name))
                .await
                .map_err(|err| PostgresError::Connect { source: err })?;

            tracing::info!(database = %name, port = self.port(), "created logical database");

            Ok(PostgresDatabase {
                conn,
                name,
                admin_url,
            })
        }
    }

    /// An ephemeral logical database plus a connection scoped to it.
    ///
    /// Owned by one test invocation; call [`teardown`](Self::teardown) when
    /// the test is done. The database never outlives the invocation that
    /// created it.
    pub struct PostgresDatabase {
        conn: PgConnection,
        name: String,
        admin_url: String,
    }

    impl PostgresDatabase {
        /// Name of the logical database.
        pub fn name(&self) -> &str {
            &self.name
        }

        /// Closes the scoped connection and drops the database.
        ///
        /// Never raises: a database already removed by the test itself, or
        /// an admin connection that cannot be reopened, is logged and
        /// swallowed so teardown always completes.
        pub async fn teardown(self) {
            let Self {
                conn,
                name,
                admin_url,
            } = self;

            if let Err(err) = conn.close().await {
                tracing::debug!(database = %name, error = %err, "scoped connection close failed");
            }

            match PgConnection::connect(&admin_url).await {
                Ok(mut admin) => {
                    if let Err(err) = sqlx::raw_sql(&format!("DROP DATABASE IF EXISTS \"{name}\""))
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

    impl std::ops::Deref for PostgresDatabase {
        type Target = PgConnection;

        fn deref(&self) -> &Self::Target {
            &self.conn
        }
    }

    impl std::ops::DerefMut for PostgresDatabase {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.conn
        }
    }
}

#[cfg(feature = "postgres")]
pub use factory::PostgresDatabase;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modern_version_token() {
        let version = parse_version("pg_ctl (PostgreSQL) 16.4").expect("should parse");
        assert_eq!(version, PgVersion { major: 16, minor: 4 });
    }

    #[test]
    fn parses_legacy_three_part_version() {
        let version = parse_version("pg_ctl (PostgreSQL) 9.3.5").expect("should parse");
        assert_eq!(version, PgVersion { major: 9, minor: 3 });
    }

    #[test]
    fn rejects_output_without_version_token() {
        assert!(parse_version("pg_ctl: no database cluster").is_none());
    }

    #[test]
    fn socket_flag_renamed_in_9_3() {
        let flag = |major, minor| unix_socket_flag(&PgVersion { major, minor });
        assert_eq!(flag(8, 4).expect("known"), "unix_socket_directory");
        assert_eq!(flag(9, 1).expect("known"), "unix_socket_directory");
        assert_eq!(flag(9, 2).expect("known"), "unix_socket_directory");
        assert_eq!(flag(9, 3).expect("known"), "unix_socket_directories");
        assert_eq!(flag(16, 4).expect("known"), "unix_socket_directories");
    }

    #[test]
    fn unknown_version_is_a_fatal_configuration_error() {
        let err = unix_socket_flag(&PgVersion { major: 42, minor: 0 })
            .expect_err("unknown major must not produce a guessed command");
        assert!(matches!(err, PostgresError::UnsupportedVersion { .. }));
        assert!(err.to_string().contains("42.0"));
    }

    fn stub_server(unixsocketdir: &str) -> PostgresServer {
        PostgresServer {
            executor: Mutex::new(TcpExecutor::new(ProcessSpec::argv(
                ["sleep", "1"],
                "127.0.0.1",
                5433,
            ))),
            host: "127.0.0.1".to_owned(),
            port: 5433,
            user: "postgres".to_owned(),
            db_prefix: "tests".to_owned(),
            unixsocketdir: PathBuf::from(unixsocketdir),
            data_dir: PathBuf::from("/tmp/postgresqldata.5433"),
            log_file: PathBuf::from("/tmp/postgresql.5433.log"),
        }
    }

    #[test]
    fn connection_url_uses_socket_directory() {
        assert_eq!(
            stub_server("/tmp").connection_url("postgres"),
            "postgresql:///postgres?host=/tmp&port=5433&user=postgres"
        );
    }

    #[test]
    fn connection_url_percent_encodes_socket_path() {
        assert!(
            stub_server("/tmp/socket dir")
                .connection_url("postgres")
                .contains("host=/tmp/socket%20dir")
        );
    }
}
