//! Integration tests for the worker supervision loop.
//!
//! These tests drive [`SupervisorHandle`] against small shell scripts that
//! stand in for worker binaries: exiting with the restart code, exiting
//! cleanly, and sleeping through SIGTERM.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use sfu_supervisor::config::SupervisorConfig;
use sfu_supervisor::errors::SupervisorError;
use sfu_supervisor::supervisor::{RunState, SupervisorHandle, SupervisorStatus};
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use tempfile::TempDir;

/// Write an executable worker script and return its path.
fn write_script(dir: &TempDir, name: &str, body: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, body).expect("Failed to write worker script");

    let mut perms = std::fs::metadata(&path)
        .expect("Failed to stat worker script")
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("Failed to set script permissions");

    path.to_string_lossy().into_owned()
}

fn config_for(worker_paths: Vec<String>, worker_grace_ms: u64) -> SupervisorConfig {
    SupervisorConfig {
        worker_paths,
        health_bind_address: "127.0.0.1:0".to_string(),
        worker_grace_ms,
    }
}

/// Poll supervisor status until the predicate holds or the deadline passes.
async fn wait_for_status<F>(
    handle: &SupervisorHandle,
    deadline: Duration,
    mut predicate: F,
) -> SupervisorStatus
where
    F: FnMut(&SupervisorStatus) -> bool,
{
    let end = tokio::time::Instant::now() + deadline;
    let mut last: Option<SupervisorStatus> = None;

    loop {
        match handle.status().await {
            Some(status) => {
                if predicate(&status) {
                    return status;
                }
                last = Some(status);
            }
            None => panic!("Supervisor loop exited while waiting, last status: {last:?}"),
        }

        if tokio::time::Instant::now() >= end {
            panic!("Condition not met before deadline, last status: {last:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_worker_exiting_with_restart_code_is_relaunched() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let script = write_script(&dir, "crasher.sh", "#!/bin/sh\nsleep 0.1\nexit 1\n");

    let (handle, task) = SupervisorHandle::spawn(&config_for(vec![script], 500))
        .await
        .expect("Supervisor should launch");

    let status = wait_for_status(&handle, Duration::from_secs(10), |s| s.restarts >= 2).await;
    assert_eq!(status.state, RunState::Running);
    assert!(status.restarts >= 2, "Worker should be relaunched repeatedly");

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("Supervisor should stop within the grace period")
        .expect("Supervisor task should not panic");
}

#[tokio::test]
async fn test_clean_exit_is_not_relaunched() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let script = write_script(&dir, "oneshot.sh", "#!/bin/sh\nexit 0\n");

    let (handle, task) = SupervisorHandle::spawn(&config_for(vec![script], 500))
        .await
        .expect("Supervisor should launch");

    let status =
        wait_for_status(&handle, Duration::from_secs(10), |s| s.workers.is_empty()).await;
    assert_eq!(status.restarts, 0);

    // Give a mistaken relaunch time to show up before checking again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = handle.status().await.expect("Supervisor should still run");
    assert_eq!(status.restarts, 0, "A clean exit must not trigger a restart");
    assert!(status.workers.is_empty());

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("Supervisor should stop promptly with no workers")
        .expect("Supervisor task should not panic");
}

#[tokio::test]
async fn test_shutdown_drains_sleeping_worker_within_grace() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let script = write_script(&dir, "sleeper.sh", "#!/bin/sh\nexec sleep 30\n");

    let (handle, task) = SupervisorHandle::spawn(&config_for(vec![script.clone()], 2_000))
        .await
        .expect("Supervisor should launch");

    let status = wait_for_status(&handle, Duration::from_secs(10), |s| !s.workers.is_empty()).await;
    assert_eq!(status.workers.len(), 1);
    assert_eq!(status.workers.first().map(|w| w.path.as_str()), Some(script.as_str()));

    let started = tokio::time::Instant::now();
    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("Supervisor should stop within the drain budget")
        .expect("Supervisor task should not panic");

    // SIGTERM alone should have ended the sleeper, well inside the grace.
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "Drain should not have waited out the full grace period"
    );
    assert!(handle.status().await.is_none(), "Loop should be gone");
}

#[tokio::test]
async fn test_shutdown_kills_worker_that_ignores_sigterm() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let script = write_script(
        &dir,
        "stubborn.sh",
        "#!/bin/sh\ntrap '' TERM\nwhile true; do sleep 1; done\n",
    );

    let (handle, task) = SupervisorHandle::spawn(&config_for(vec![script], 300))
        .await
        .expect("Supervisor should launch");

    wait_for_status(&handle, Duration::from_secs(10), |s| !s.workers.is_empty()).await;

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("SIGKILL should end a worker that ignores SIGTERM")
        .expect("Supervisor task should not panic");
}

#[tokio::test]
async fn test_multiple_workers_are_all_tracked() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let first = write_script(&dir, "a.sh", "#!/bin/sh\nexec sleep 30\n");
    let second = write_script(&dir, "b.sh", "#!/bin/sh\nexec sleep 30\n");

    let (handle, task) = SupervisorHandle::spawn(&config_for(vec![first, second], 2_000))
        .await
        .expect("Supervisor should launch");

    let status =
        wait_for_status(&handle, Duration::from_secs(10), |s| s.workers.len() == 2).await;
    assert_eq!(status.state, RunState::Running);

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("Supervisor should stop within the drain budget")
        .expect("Supervisor task should not panic");
}

#[tokio::test]
async fn test_missing_worker_binary_fails_launch() {
    let result = SupervisorHandle::spawn(&config_for(
        vec!["/definitely/not/a/real/worker".to_string()],
        500,
    ))
    .await;

    assert!(matches!(
        result,
        Err(SupervisorError::Spawn { path, .. }) if path == "/definitely/not/a/real/worker"
    ));
}

#[tokio::test]
async fn test_launch_failure_drains_already_started_workers() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let sleeper = write_script(&dir, "sleeper.sh", "#!/bin/sh\nexec sleep 30\n");

    let started = tokio::time::Instant::now();
    let result = SupervisorHandle::spawn(&config_for(
        vec![sleeper, "/definitely/not/a/real/worker".to_string()],
        2_000,
    ))
    .await;

    assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
    // The sleeper got SIGTERM during cleanup rather than the full grace.
    assert!(started.elapsed() < Duration::from_secs(2));
}
