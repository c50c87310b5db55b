//! E2E test: start, stop and status for processes without a stdio transport

use mcp_supervisor::process::os;
use mcp_supervisor::registry::ProcessStatus;
use mcp_supervisor::SupervisorError;

use super::support::{argv, kill_externally, plain, supervisor, wait_for_exit};

#[tokio::test]
async fn test_start_stop_sleep() {
    let sup = supervisor();
    let pid = sup
        .start("sleeper", argv(&["sleep", "30"]), plain())
        .await
        .expect("start sleep");

    assert!(os::is_alive(pid));
    assert!(sup.is_running("sleeper").await.unwrap());
    let record = sup.status("sleeper").await.unwrap();
    assert_eq!(record.status, ProcessStatus::Running);
    assert_eq!(record.pid, Some(pid));

    sup.stop("sleeper").await.expect("stop sleep");
    wait_for_exit(pid).await;
    let record = sup.status("sleeper").await.unwrap();
    assert_eq!(record.status, ProcessStatus::Stopped);
    assert_eq!(record.pid, None);
    assert!(record.stopped_at.is_some());
    assert!(!sup.is_running("sleeper").await.unwrap());
}

#[tokio::test]
async fn test_double_start_is_rejected() {
    let sup = supervisor();
    let pid = sup
        .start("once", argv(&["sleep", "30"]), plain())
        .await
        .unwrap();

    let err = sup
        .start("once", argv(&["sleep", "30"]), plain())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::AlreadyRunning { pid: Some(p), .. } if p == pid
    ));

    sup.stop("once").await.unwrap();
}

#[tokio::test]
async fn test_external_kill_is_detected() {
    let sup = supervisor();
    let pid = sup
        .start("victim", argv(&["sleep", "30"]), plain())
        .await
        .unwrap();

    kill_externally(pid);
    wait_for_exit(pid).await;

    assert!(!sup.is_running("victim").await.unwrap());
    let record = sup.status("victim").await.unwrap();
    assert_eq!(record.status, ProcessStatus::Died);
    assert!(record.error_log.is_some());

    // Already dead: nothing left to stop
    assert!(matches!(
        sup.stop("victim").await,
        Err(SupervisorError::NotRunning(_))
    ));

    // A fresh start works after the crash
    let pid = sup
        .start("victim", argv(&["sleep", "30"]), plain())
        .await
        .unwrap();
    assert!(os::is_alive(pid));
    sup.stop("victim").await.unwrap();
}

#[tokio::test]
async fn test_stop_after_silent_death_cleans_up() {
    let sup = supervisor();
    let pid = sup
        .start("quiet", argv(&["sleep", "30"]), plain())
        .await
        .unwrap();

    kill_externally(pid);
    wait_for_exit(pid).await;

    // The record still says Running; stop reconciles it
    sup.stop("quiet").await.expect("stop of a dead process succeeds");
    let record = sup.status("quiet").await.unwrap();
    assert_eq!(record.status, ProcessStatus::Stopped);
    assert_eq!(record.pid, None);
}

#[tokio::test]
async fn test_restart_replaces_pid() {
    let sup = supervisor();
    let first = sup
        .start("cycle", argv(&["sleep", "30"]), plain())
        .await
        .unwrap();

    let second = sup.restart("cycle").await.expect("restart");
    assert_ne!(first, second);
    wait_for_exit(first).await;
    assert!(os::is_alive(second));
    assert_eq!(sup.status("cycle").await.unwrap().restart_count, 1);

    sup.stop("cycle").await.unwrap();
}

#[tokio::test]
async fn test_missing_binary_fails_to_spawn() {
    let sup = supervisor();
    let err = sup
        .start("ghost", argv(&["/nonexistent/mcp-server"]), plain())
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::SpawnFailed { .. }), "{err}");

    let record = sup.status("ghost").await.unwrap();
    assert_eq!(record.status, ProcessStatus::Failed);
    assert!(record.error_log.is_some());
}

#[tokio::test]
async fn test_immediate_exit_fails_to_spawn() {
    let sup = supervisor();
    let err = sup
        .start("quitter", argv(&["sh", "-c", "exit 3"]), plain())
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::SpawnFailed { .. }), "{err}");
    assert_eq!(
        sup.status("quitter").await.unwrap().status,
        ProcessStatus::Failed
    );
}

#[tokio::test]
async fn test_stop_all() {
    let sup = supervisor();
    let a = sup.start("a", argv(&["sleep", "30"]), plain()).await.unwrap();
    let b = sup.start("b", argv(&["sleep", "30"]), plain()).await.unwrap();

    sup.stop_all().await;
    wait_for_exit(a).await;
    wait_for_exit(b).await;

    for record in sup.list().await.unwrap() {
        assert_eq!(record.status, ProcessStatus::Stopped, "{}", record.name);
    }
}
