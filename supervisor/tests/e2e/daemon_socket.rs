//! E2E test: the control plane served over the daemon's Unix socket

use std::time::{Duration, Instant};

use serde_json::json;

use mcp_supervisor::control::ControlPlane;
use mcp_supervisor::daemon::{DaemonClient, SupervisorDaemon};
use mcp_supervisor::registry::{ProcessOptions, ProcessStatus};

use super::support::{argv, echo_server, plain, supervisor, wait_for_exit};

#[tokio::test]
async fn test_daemon_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("supervisor.sock");

    let daemon = SupervisorDaemon::new(ControlPlane::new(supervisor()), socket.clone());
    let mut shutdown = daemon.shutdown_signal();
    let server = tokio::spawn(daemon.run());

    let client = DaemonClient::with_socket_path(socket.clone());
    let deadline = Instant::now() + Duration::from_secs(5);
    while !client.is_running().await {
        assert!(Instant::now() < deadline, "daemon never came up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let started = client
        .start("sleeper", argv(&["sleep", "30"]), plain())
        .await
        .unwrap();
    assert!(started.success, "{:?}", started.error);
    let pid = started.pid.unwrap();

    let again = client
        .start("sleeper", argv(&["sleep", "30"]), plain())
        .await
        .unwrap();
    assert!(!again.success);
    assert_eq!(again.error_kind.as_deref(), Some("already_running"));

    let echo = client
        .start("echo", echo_server(), ProcessOptions::default())
        .await
        .unwrap();
    assert!(echo.success, "{:?}", echo.error);
    let call = client
        .call_tool("echo", "echo", json!({"k": "v"}))
        .await
        .unwrap();
    assert!(call.success);
    assert_eq!(call.result.unwrap()["structuredContent"], json!({"k": "v"}));

    let list = client.list().await.unwrap();
    assert!(list.success);
    let names: Vec<&str> = list.processes.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["echo", "sleeper"]);

    let status = client.status("sleeper").await.unwrap();
    let report = status.process.unwrap();
    assert_eq!(report.status, ProcessStatus::Running);
    assert_eq!(report.pid, Some(pid));

    let stopped = client.stop("sleeper").await.unwrap();
    assert!(stopped.success);
    wait_for_exit(pid).await;

    let missing = client.status("nobody").await.unwrap();
    assert!(!missing.success);
    assert!(missing.error.is_some());

    client.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("daemon exits after shutdown")
        .unwrap()
        .unwrap();
    assert!(*shutdown.borrow_and_update());
    assert!(!socket.exists());
}
