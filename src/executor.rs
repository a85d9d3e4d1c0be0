//! Subprocess execution with TCP readiness coordination.
//!
//! [`TcpExecutor`] owns one server subprocess and answers the question the
//! engine controllers actually care about: "is this server accepting
//! connections yet?". `start()` spawns the process and polls until both a
//! TCP connect to the declared host:port succeeds and the engine's readiness
//! marker (when one exists) has appeared in the log file. `stop()` sends
//! SIGTERM, waits briefly, and escalates to SIGKILL; a blocking `Drop`
//! safety net covers tests that panic before teardown runs.

use std::{path::PathBuf, process::Stdio, time::Duration};

use backon::{ConstantBuilder, Retryable as _};
use tokio::process::{Child, Command};

/// Interval between readiness probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Default overall readiness budget.
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `stop()` waits after SIGTERM before escalating to SIGKILL.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Immutable description of one server subprocess.
///
/// Created once per fixture declaration. The command is either an argument
/// vector spawned directly, or a single string handed to `sh -c` when the
/// engine's launch line needs shell word splitting (PostgreSQL's
/// `startparams` passthrough, for example).
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    command: Vec<String>,
    shell: bool,
    host: String,
    port: u16,
    ready_marker: Option<String>,
    log_file: Option<PathBuf>,
    startup_timeout: Duration,
}

impl ProcessSpec {
    /// Describes a process spawned directly from an argument vector.
    pub fn argv<I, S>(command: I, host: &str, port: u16) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            shell: false,
            host: host.to_owned(),
            port,
            ready_marker: None,
            log_file: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Describes a process spawned via `sh -c <command>`.
    pub fn shell(command: impl Into<String>, host: &str, port: u16) -> Self {
        Self {
            command: vec![command.into()],
            shell: true,
            host: host.to_owned(),
            port,
            ready_marker: None,
            log_file: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Sets the substring that must appear in the log file before the
    /// server counts as ready. Engines without a marker rely on the TCP
    /// connect check alone.
    #[must_use]
    pub fn ready_marker(mut self, marker: &str) -> Self {
        self.ready_marker = Some(marker.to_owned());
        self
    }

    /// Redirects the subprocess's stdout and stderr to this file.
    ///
    /// Required when a readiness marker is set, since the marker is scanned
    /// for in the log file.
    #[must_use]
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Overrides the overall readiness budget.
    #[must_use]
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Host the server is expected to listen on.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port the server is expected to listen on.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Executor lifecycle states.
///
/// `stopped → starting → running → stopping → stopped`. A readiness timeout
/// while `starting` falls back to `stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// No live subprocess.
    Stopped,
    /// Subprocess spawned, readiness not yet confirmed.
    Starting,
    /// Both the TCP check and the marker check have passed.
    Running,
    /// Termination in progress.
    Stopping,
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
        }
    }
}

/// A server subprocess plus the readiness state machine around it.
#[derive(Debug)]
pub struct TcpExecutor {
    spec: ProcessSpec,
    child: Option<Child>,
    status: ExecStatus,
}

impl TcpExecutor {
    /// Wraps a process descriptor. No process is spawned until `start()`.
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            child: None,
            status: ExecStatus::Stopped,
        }
    }

    /// Current state, for diagnostics.
    pub fn status(&self) -> ExecStatus {
        self.status
    }

    /// True only when readiness has been confirmed and the process has not
    /// been stopped since.
    pub fn running(&self) -> bool {
        self.status == ExecStatus::Running
    }

    /// The port this executor's server listens on.
    pub fn port(&self) -> u16 {
        self.spec.port
    }

    /// Spawns the subprocess and waits until it accepts connections.
    ///
    /// Readiness requires a successful TCP connect to host:port and, when a
    /// marker is configured, that marker appearing in the log file. Probes
    /// run at a fixed short interval under an overall wall-clock budget.
    /// Exceeding the budget kills the subprocess and returns
    /// [`ExecError::StartTimeout`]; a child that exited on its own is
    /// reported as [`ExecError::UnexpectedExit`] instead. Neither case is
    /// retried automatically.
    ///
    /// Calling `start()` on an already-running executor is a no-op.
    pub async fn start(&mut self) -> Result<(), ExecError> {
        if self.status == ExecStatus::Running {
            return Ok(());
        }
        self.status = ExecStatus::Starting;

        let child = match self.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.status = ExecStatus::Stopped;
                return Err(err);
            }
        };
        self.child = Some(child);

        tracing::debug!(
            host = %self.spec.host,
            port = self.spec.port,
            timeout_secs = self.spec.startup_timeout.as_secs(),
            "waiting for server readiness"
        );

        match self.wait_for_ready().await {
            Ok(()) => {
                self.status = ExecStatus::Running;
                tracing::info!(
                    host = %self.spec.host,
                    port = self.spec.port,
                    "server ready"
                );
                Ok(())
            }
            Err(err) => {
                // Reap whatever is left so a failed setup never leaks a
                // zombie; teardown hooks may still call stop() afterwards.
                if let Some(mut child) = self.child.take() {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                self.status = ExecStatus::Stopped;
                Err(err)
            }
        }
    }

    /// Terminates the subprocess: SIGTERM, a bounded wait, then SIGKILL.
    ///
    /// Idempotent: stopping an executor with no live child is a no-op, so
    /// teardown hooks can run unconditionally even when setup failed
    /// partway through.
    pub async fn stop(&mut self) -> Result<(), ExecError> {
        let Some(mut child) = self.child.take() else {
            self.status = ExecStatus::Stopped;
            return Ok(());
        };
        self.status = ExecStatus::Stopping;

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // PID limits are well under i32::MAX on all supported platforms.
            let nix_pid = i32::try_from(pid)
                .map(nix::unistd::Pid::from_raw)
                .expect("PID exceeds i32::MAX");
            if let Err(err) = nix::sys::signal::kill(nix_pid, nix::sys::signal::Signal::SIGTERM) {
                tracing::debug!(pid = pid, error = %err, "SIGTERM not delivered (process already gone?)");
            }
        }

        match tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(port = self.spec.port, status = ?status, "server stopped");
            }
            Ok(Err(err)) => {
                self.status = ExecStatus::Stopped;
                return Err(ExecError::StopFailed { source: err });
            }
            Err(_elapsed) => {
                tracing::warn!(
                    port = self.spec.port,
                    "server did not exit after SIGTERM, forcing kill"
                );
                child
                    .kill()
                    .await
                    .map_err(|err| ExecError::StopFailed { source: err })?;
                let _ = child.wait().await;
            }
        }

        self.status = ExecStatus::Stopped;
        Ok(())
    }

    fn spawn(&self) -> Result<Child, ExecError> {
        let mut cmd = if self.spec.shell {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.spec.command[0]);
            cmd
        } else {
            let (program, args) = self
                .spec
                .command
                .split_first()
                .ok_or(ExecError::EmptyCommand)?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        };

        match &self.spec.log_file {
            Some(path) => {
                let log = fs_err::File::create(path)
                    .map_err(|err| ExecError::LogFile { source: err })?;
                let stderr_log = log
                    .file()
                    .try_clone()
                    .map_err(|err| ExecError::LogFile { source: err })?;
                cmd.stdout(Stdio::from(log.into_parts().0));
                cmd.stderr(Stdio::from(stderr_log));
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }

        tracing::debug!(
            command = ?self.spec.command,
            shell = self.spec.shell,
            "spawning server process"
        );

        cmd.kill_on_drop(false)
            .spawn()
            .map_err(|err| ExecError::StartFailed { source: err })
    }

    /// Polls for readiness under the spec's wall-clock budget.
    ///
    /// The retry closure is a pure probe over cloned spec fields; child
    /// liveness is checked once the budget is spent, mirroring how timeouts
    /// are attributed: a dead child is an unexpected exit, a live child that
    /// never became reachable is a readiness timeout.
    async fn wait_for_ready(&mut self) -> Result<(), ExecError> {
        let host = self.spec.host.clone();
        let port = self.spec.port;
        let marker = self.spec.ready_marker.clone();
        let log_file = self.spec.log_file.clone();
        let timeout = self.spec.startup_timeout;

        let max_probes =
            (timeout.as_millis() / PROBE_INTERVAL.as_millis()).max(1) as usize;

        let probe_result = tokio::time::timeout(timeout, async {
            (|| probe(host.clone(), port, marker.clone(), log_file.clone()))
                .retry(
                    ConstantBuilder::default()
                        .with_delay(PROBE_INTERVAL)
                        .with_max_times(max_probes),
                )
                .sleep(tokio::time::sleep)
                .notify(|err, dur| {
                    tracing::trace!(
                        error = %err,
                        retry_after_ms = dur.as_millis() as u64,
                        "server not ready yet"
                    );
                })
                .await
        })
        .await;

        match probe_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                // Budget exhausted; attribute the failure.
                if let Some(child) = self.child.as_mut()
                    && let Ok(Some(status)) = child.try_wait()
                {
                    return Err(ExecError::UnexpectedExit {
                        status: status.code(),
                    });
                }
                Err(ExecError::StartTimeout {
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    /// Blocking shutdown for the Drop safety net: SIGTERM, a waitpid
    /// polling loop, then SIGKILL. Runs only when the child was never
    /// stopped through the async path.
    #[cfg(unix)]
    fn shutdown_blocking(&mut self) {
        use nix::sys::wait::WaitPidFlag;

        let Some(child) = self.child.as_ref() else {
            return;
        };
        let Some(pid) = child.id() else {
            // Already reaped by the async path.
            return;
        };

        let nix_pid = i32::try_from(pid)
            .map(nix::unistd::Pid::from_raw)
            .expect("PID exceeds i32::MAX");

        if nix::sys::signal::kill(nix_pid, nix::sys::signal::Signal::SIGTERM).is_err() {
            return; // process already gone
        }

        // Poll waitpid(WNOHANG): 50 iterations x 100 ms = 5 s grace.
        for _ in 0..50 {
            match nix::sys::wait::waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(nix::sys::wait::WaitStatus::StillAlive) => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Ok(_) => return,
                Err(_) => return,
            }
        }

        tracing::warn!(
            pid = pid,
            "server did not exit after SIGTERM in Drop, sending SIGKILL"
        );
        let _ = nix::sys::signal::kill(nix_pid, nix::sys::signal::Signal::SIGKILL);
        let _ = nix::sys::wait::waitpid(nix_pid, Some(WaitPidFlag::WNOHANG));
    }
}

impl Drop for TcpExecutor {
    fn drop(&mut self) {
        #[cfg(unix)]
        self.shutdown_blocking();
    }
}

/// One readiness probe: TCP connect, then marker scan when configured.
async fn probe(
    host: String,
    port: u16,
    marker: Option<String>,
    log_file: Option<PathBuf>,
) -> Result<(), ProbeError> {
    tokio::net::TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|_| ProbeError::TcpUnreachable)?;

    let Some(marker) = marker else {
        return Ok(());
    };
    let Some(log_file) = log_file else {
        return Ok(());
    };

    // Server logs are not guaranteed to be valid UTF-8, so scan lossily.
    let bytes = fs_err::tokio::read(&log_file)
        .await
        .map_err(|_| ProbeError::MarkerNotSeen)?;
    if String::from_utf8_lossy(&bytes).contains(&marker) {
        Ok(())
    } else {
        Err(ProbeError::MarkerNotSeen)
    }
}

/// Internal probe outcome, only surfaced through retry notifications.
#[derive(Debug, thiserror::Error)]
enum ProbeError {
    #[error("TCP endpoint not reachable")]
    TcpUnreachable,
    #[error("readiness marker not seen in log")]
    MarkerNotSeen,
}

/// Errors raised while starting or stopping a server subprocess.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The process descriptor has an empty argument vector.
    #[error("process command is empty")]
    EmptyCommand,

    /// The subprocess could not be spawned at all.
    #[error("failed to start server process")]
    StartFailed {
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The log file for output redirection could not be created.
    #[error("failed to create server log file")]
    LogFile {
        /// The underlying IO error (includes path context via `fs_err`).
        #[source]
        source: std::io::Error,
    },

    /// The subprocess spawned but never satisfied both readiness checks
    /// within the retry budget. Fatal to this fixture's setup.
    #[error("server failed to become ready within {timeout_secs} seconds")]
    StartTimeout {
        /// Seconds waited before giving up.
        timeout_secs: u64,
    },

    /// The subprocess exited on its own before becoming ready.
    #[error("server process exited unexpectedly with status {status:?}")]
    UnexpectedExit {
        /// Exit status code, if available.
        status: Option<i32>,
    },

    /// The subprocess could not be terminated.
    #[error("failed to stop server process")]
    StopFailed {
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}
