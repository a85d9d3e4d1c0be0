//! Redis server fixture.
//!
//! The simplest fixture variant: no data directory initialization step and
//! no log marker, so readiness is a plain TCP probe. There is also no
//! logical-database factory; clients select numeric databases themselves.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::sync::{Mutex, OnceCell};

use crate::{
    config::RedisSettings,
    executor::{ExecError, ProcessSpec, TcpExecutor},
    ports::{PortAllocator, PortError, PortSpec},
};

/// A Redis fixture declaration.
pub struct RedisProc {
    settings: RedisSettings,
    server_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<PortSpec>,
    server: OnceCell<RedisServer>,
}

impl RedisProc {
    /// Creates a declaration over the given settings with no overrides.
    pub fn new(settings: RedisSettings) -> Self {
        Self {
            settings,
            server_path: None,
            host: None,
            port: None,
            server: OnceCell::new(),
        }
    }

    /// Overrides the `redis-server` path, bypassing discovery.
    #[must_use]
    pub fn server_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_path = Some(path.into());
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

    /// Returns the running server for this declaration, starting it on
    /// first use.
    pub async fn server(&self, ports: &PortAllocator) -> Result<&RedisServer, RedisError> {
        self.server
            .get_or_try_init(|| self.start_server(ports))
            .await
    }

    /// Stops the cached server, if one was ever started.
    pub async fn stop(&self) {
        if let Some(server) = self.server.get() {
            server.stop().await;
        }
    }

    async fn start_server(&self, ports: &PortAllocator) -> Result<RedisServer, RedisError> {
        let redis_server = self.resolve_server_binary()?;

        let host = self
            .host
            .clone()
            .unwrap_or_else(|| self.settings.host.clone());
        let port_spec = match &self.port {
            Some(spec) => spec.clone(),
            None => self.settings.port.parse()?,
        };
        let port = ports.resolve(&port_spec)?;

        let log_file = PathBuf::from(format!("/tmp/redis.{port}.log"));
        let dump_file = format!("dump.{port}.rdb");

        let command = vec![
            redis_server.display().to_string(),
            "--bind".to_owned(),
            host.clone(),
            "--port".to_owned(),
            port.to_string(),
            "--dir".to_owned(),
            self.settings.dir.display().to_string(),
            "--dbfilename".to_owned(),
            dump_file.clone(),
            "--save".to_owned(),
            String::new(),
        ];

        let spec = ProcessSpec::argv(command, &host, port)
            .log_file(&log_file)
            .startup_timeout(Duration::from_secs(self.settings.startup_timeout_secs));

        tracing::info!(port = port, "starting Redis server");

        let mut executor = TcpExecutor::new(spec);
        executor.start().await?;

        Ok(RedisServer {
            executor: Mutex::new(executor),
            host,
            port,
            dump_path: self.settings.dir.join(dump_file),
            log_file,
        })
    }

    fn resolve_server_binary(&self) -> Result<PathBuf, RedisError> {
        if let Some(path) = &self.server_path {
            return Ok(path.clone());
        }
        if let Some(path) = &self.settings.server_path
            && path.exists()
        {
            return Ok(path.clone());
        }
        which::which("redis-server").map_err(|_| RedisError::BinaryNotFound {
            name: "redis-server".to_owned(),
        })
    }
}

/// A running Redis server instance.
#[derive(Debug)]
pub struct RedisServer {
    executor: Mutex<TcpExecutor>,
    host: String,
    port: u16,
    dump_path: PathBuf,
    log_file: PathBuf,
}

impl RedisServer {
    /// Host the server listens on.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolved port the server is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The log file the server's output is redirected to.
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Whether the underlying executor is in the running state.
    pub async fn running(&self) -> bool {
        self.executor.lock().await.running()
    }

    /// Connection URI for the given numeric database.
    pub fn connection_url(&self, db: u8) -> String {
        format!("redis://{host}:{port}/{db}", host = self.host, port = self.port)
    }

    /// Stops the server and removes its dump file. Never raises.
    pub async fn stop(&self) {
        let mut executor = self.executor.lock().await;
        if let Err(err) = executor.stop().await {
            tracing::warn!(port = self.port, error = %err, "failed to stop Redis server");
        }
        if let Err(err) = fs_err::tokio::remove_file(&self.dump_path).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                dump = %self.dump_path.display(),
                error = %err,
                "failed to remove Redis dump file"
            );
        }
    }
}

/// Errors raised while managing a Redis fixture.
#[derive(Debug, thiserror::Error)]
pub enum RedisError {
    /// The `redis-server` binary could not be located.
    #[error("Redis binary '{name}' not found")]
    BinaryNotFound {
        /// Name of the missing binary.
        name: String,
    },

    /// Port specification or allocation failure.
    #[error(transparent)]
    Ports(#[from] PortError),

    /// Subprocess start/stop failure.
    #[error(transparent)]
    Exec(#[from] ExecError),
}
