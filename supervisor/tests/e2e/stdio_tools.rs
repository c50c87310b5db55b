//! E2E test: handshake and tool calls over a persistent stdio connection

use std::time::{Duration, Instant};

use serde_json::json;

use mcp_supervisor::registry::{ProcessOptions, ProcessStatus};
use mcp_supervisor::SupervisorError;

use super::support::{argv, echo_server, supervisor, wait_for_exit};

#[tokio::test]
async fn test_echo_round_trip() {
    let sup = supervisor();
    sup.start("echo", echo_server(), ProcessOptions::default())
        .await
        .expect("start mcp-echo");

    let conn = sup.connection("echo").unwrap();
    assert_eq!(conn.server_info().map(|info| info.name).as_deref(), Some("mcp-echo"));

    let arguments = json!({"text": "héllo\nworld", "nested": {"n": [1, 2, 3]}, "flag": true});
    let result = sup.call_tool("echo", "echo", arguments.clone()).await.unwrap();
    assert_eq!(result["structuredContent"], arguments);
    assert_eq!(conn.pending_count(), 0);

    let tools = sup.list_tools("echo").await.unwrap();
    let names: Vec<&str> = tools["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert_eq!(names, ["echo", "sleep", "crash", "notify"]);

    sup.stop("echo").await.unwrap();
    assert!(matches!(
        sup.call_tool("echo", "echo", json!({})).await,
        Err(SupervisorError::NotRunning(_))
    ));
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() {
    let sup = supervisor();
    sup.start("echo", echo_server(), ProcessOptions::default())
        .await
        .unwrap();

    let slow = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.call_tool("echo", "sleep", json!({"ms": 300})).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = sup
        .call_tool("echo", "echo", json!({"marker": 7}))
        .await
        .unwrap();
    assert_eq!(fast["structuredContent"]["marker"], 7);

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow["content"][0]["text"], "slept 300ms");

    sup.stop("echo").await.unwrap();
}

#[tokio::test]
async fn test_crash_fails_pending_call_fast() {
    let sup = supervisor();
    let pid = sup
        .start("echo", echo_server(), ProcessOptions::default())
        .await
        .unwrap();

    let started = Instant::now();
    let err = sup
        .call_tool("echo", "crash", json!({"code": 2}))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::ProcessDied(_)), "{err}");
    // Far below the 5s request timeout
    assert!(started.elapsed() < Duration::from_secs(3));

    wait_for_exit(pid).await;
    assert!(!sup.is_running("echo").await.unwrap());
    assert_eq!(sup.status("echo").await.unwrap().status, ProcessStatus::Died);
}

#[tokio::test]
async fn test_non_mcp_process_fails_handshake() {
    let sup = supervisor();
    let err = sup
        .start("cat", argv(&["cat"]), ProcessOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::HandshakeFailed { .. }), "{err}");

    let record = sup.status("cat").await.unwrap();
    assert_eq!(record.status, ProcessStatus::Failed);
    assert_eq!(record.pid, None);
}

#[tokio::test]
async fn test_silent_process_times_out_handshake() {
    let sup = supervisor();
    let started = Instant::now();
    let err = sup
        .start("mute", argv(&["sleep", "30"]), ProcessOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::HandshakeFailed { .. }), "{err}");
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(sup.status("mute").await.unwrap().status, ProcessStatus::Failed);
}

#[tokio::test]
async fn test_plain_process_has_no_connection() {
    let sup = supervisor();
    sup.start("plain", argv(&["sleep", "30"]), super::support::plain())
        .await
        .unwrap();
    assert!(matches!(
        sup.call_tool("plain", "echo", json!({})).await,
        Err(SupervisorError::NotConnected(_))
    ));
    sup.stop("plain").await.unwrap();
}
