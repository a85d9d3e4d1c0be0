//! Executor lifecycle tests against dummy subprocesses.
//!
//! Real database servers are exercised in the per-engine test files; here a
//! `sleep`/`sh` child plus a listener held by the test stands in for the
//! server, so the readiness state machine can be driven deterministically.

use std::time::Duration;

use db_fixtures::{ExecError, ExecStatus, ProcessSpec, TcpExecutor};
use tokio::net::TcpListener;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Binds an ephemeral port and keeps the listener alive so readiness probes
/// against it succeed while the dummy child runs.
async fn held_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    (listener, port)
}

#[tokio::test]
async fn tcp_readiness_reaches_running_and_stop_returns_to_stopped() {
    init_tracing();

    //* Given
    let (_listener, port) = held_port().await;
    let spec = ProcessSpec::argv(["sleep", "30"], "127.0.0.1", port)
        .startup_timeout(Duration::from_secs(5));
    let mut exec = TcpExecutor::new(spec);

    //* When
    exec.start().await.expect("should become ready");

    //* Then
    assert!(exec.running());
    assert_eq!(exec.status(), ExecStatus::Running);

    //* When
    exec.stop().await.expect("should stop cleanly");

    //* Then
    assert_eq!(exec.status(), ExecStatus::Stopped);
    assert!(!exec.running());
}

#[tokio::test]
async fn marker_in_log_file_gates_readiness() {
    init_tracing();

    //* Given
    let (_listener, port) = held_port().await;
    let log_dir = tempfile::tempdir().expect("tempdir");
    let log_file = log_dir.path().join("server.log");
    let spec = ProcessSpec::shell(
        "echo 'database system is ready'; exec sleep 30",
        "127.0.0.1",
        port,
    )
    .ready_marker("system is ready")
    .log_file(&log_file)
    .startup_timeout(Duration::from_secs(5));
    let mut exec = TcpExecutor::new(spec);

    //* When
    exec.start().await.expect("should become ready");

    //* Then
    assert!(exec.running());
    let log = std::fs::read_to_string(&log_file).expect("log file exists");
    assert!(log.contains("system is ready"));

    exec.stop().await.expect("should stop cleanly");
}

#[tokio::test]
async fn missing_marker_times_out_even_when_tcp_connects() {
    init_tracing();

    //* Given a reachable port but a child that never prints the marker
    let (_listener, port) = held_port().await;
    let log_dir = tempfile::tempdir().expect("tempdir");
    let log_file = log_dir.path().join("server.log");
    let spec = ProcessSpec::shell("echo 'still starting up'; exec sleep 30", "127.0.0.1", port)
        .ready_marker("never printed")
        .log_file(&log_file)
        .startup_timeout(Duration::from_secs(1));
    let mut exec = TcpExecutor::new(spec);

    //* When
    let err = exec.start().await.expect_err("marker never appears");

    //* Then the failure is fatal and the executor is back at stopped
    assert!(matches!(err, ExecError::StartTimeout { .. }), "got {err:?}");
    assert_eq!(exec.status(), ExecStatus::Stopped);
}

#[tokio::test]
async fn child_that_exits_early_is_reported_as_unexpected_exit() {
    init_tracing();

    //* Given a child that exits immediately and a port nobody listens on
    let (listener, port) = held_port().await;
    drop(listener);
    let spec =
        ProcessSpec::argv(["true"], "127.0.0.1", port).startup_timeout(Duration::from_secs(1));
    let mut exec = TcpExecutor::new(spec);

    //* When
    let err = exec.start().await.expect_err("child exits before ready");

    //* Then
    assert!(matches!(err, ExecError::UnexpectedExit { .. }), "got {err:?}");
    assert_eq!(exec.status(), ExecStatus::Stopped);
}

#[tokio::test]
async fn stop_is_idempotent_and_safe_before_start() {
    init_tracing();

    //* Given an executor that was never started
    let mut exec = TcpExecutor::new(ProcessSpec::argv(["sleep", "30"], "127.0.0.1", 28499));

    //* When / Then both calls are no-ops
    exec.stop().await.expect("stop before start is a no-op");
    exec.stop().await.expect("second stop is a no-op");
    assert_eq!(exec.status(), ExecStatus::Stopped);
}

#[tokio::test]
async fn start_on_a_running_executor_is_a_no_op() {
    init_tracing();

    //* Given
    let (_listener, port) = held_port().await;
    let spec = ProcessSpec::argv(["sleep", "30"], "127.0.0.1", port)
        .startup_timeout(Duration::from_secs(5));
    let mut exec = TcpExecutor::new(spec);
    exec.start().await.expect("should become ready");

    //* When
    exec.start().await.expect("second start is a no-op");

    //* Then
    assert!(exec.running());
    exec.stop().await.expect("should stop cleanly");
}
