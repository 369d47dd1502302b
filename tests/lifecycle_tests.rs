//! Supervisor lifecycle tests against the in-memory backend.
//!
//! Run with:
//! ```bash
//! cargo test --test lifecycle_tests
//! ```

mod common;

use common::{FakeBackend, WAIT, running_world, spec, supervisor};
use hycore::backend::{BackendStatus, DiscoveredInstance, Handle};
use hycore::error::Error;
use hycore::supervisor::{AUTH_COMMAND, Status};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_twice_fails_already_exists() {
    let supervisor = supervisor(FakeBackend::process());

    let world = supervisor.create(spec("alpha")).await.unwrap();
    assert_eq!(world.status, Status::Created);

    let err = supervisor.create(spec("alpha")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));
    assert_eq!(err.code(), Some("WORLD_ALREADY_EXISTS"));
    assert_eq!(supervisor.list().len(), 1);
}

#[tokio::test]
async fn test_create_rejects_resource_the_backend_already_has() {
    let backend = FakeBackend::process();
    let other = supervisor(Arc::clone(&backend));
    other.create(spec("alpha")).await.unwrap();

    let supervisor = supervisor(backend);
    let err = supervisor.create(spec("alpha")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));
    assert!(supervisor.list().is_empty());
}

#[tokio::test]
async fn test_create_rejects_invalid_id() {
    let supervisor = supervisor(FakeBackend::process());
    let err = supervisor.create(spec("../alpha")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

// =============================================================================
// Start / Stop
// =============================================================================

#[tokio::test]
async fn test_start_unknown_world_fails_not_found() {
    let supervisor = supervisor(FakeBackend::process());
    let err = supervisor.start("nonexistent").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_start_while_running_fails_already_running() {
    let supervisor = supervisor(FakeBackend::process());
    running_world(&supervisor, "alpha").await;

    let err = supervisor.start("alpha").await.unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning { .. }));
}

#[tokio::test]
async fn test_stop_when_not_running_fails_not_running() {
    let supervisor = supervisor(FakeBackend::process());
    supervisor.create(spec("alpha")).await.unwrap();

    let err = supervisor.stop("alpha", false).await.unwrap_err();
    assert!(matches!(err, Error::NotRunning { .. }));

    let err = supervisor.stop("ghost", false).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_start_is_confirmed_by_output() {
    let supervisor = supervisor(FakeBackend::process());
    supervisor.create(spec("alpha")).await.unwrap();

    let started = supervisor.start("alpha").await.unwrap();
    assert!(matches!(started.status, Status::Starting | Status::Running));
    assert!(started.started_at.is_some());

    supervisor
        .wait_for_status("alpha", Status::Running, WAIT)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_container_start_is_confirmed_by_polling() {
    let supervisor = supervisor(FakeBackend::container());
    running_world(&supervisor, "alpha").await;
    assert_eq!(supervisor.status("alpha").unwrap().status, Status::Running);
}

#[tokio::test]
async fn test_authentication_marker_advances_status() {
    let backend = FakeBackend::process();
    let supervisor = supervisor(Arc::clone(&backend));
    running_world(&supervisor, "alpha").await;

    backend.emit("alpha", "Authentication successful");
    supervisor
        .wait_for_status("alpha", Status::Authenticated, WAIT)
        .await
        .unwrap();

    let stopped = supervisor.stop("alpha", false).await.unwrap();
    assert_eq!(stopped.status, Status::Stopped);
}

#[tokio::test]
async fn test_restart_after_stop() {
    let supervisor = supervisor(FakeBackend::process());
    running_world(&supervisor, "alpha").await;

    let stopped = supervisor.stop("alpha", false).await.unwrap();
    assert_eq!(stopped.status, Status::Stopped);
    assert_eq!(stopped.exit_code, Some(0));

    supervisor.start("alpha").await.unwrap();
    supervisor
        .wait_for_status("alpha", Status::Running, WAIT)
        .await
        .unwrap();
    assert_eq!(supervisor.status("alpha").unwrap().exit_code, None);
}

#[tokio::test]
async fn test_stop_falls_back_to_kill_when_graceful_is_ignored() {
    let backend = FakeBackend::process();
    backend.ignore_graceful.store(true, Ordering::SeqCst);
    let supervisor = supervisor(Arc::clone(&backend));
    running_world(&supervisor, "alpha").await;

    let begin = Instant::now();
    let stopped = supervisor.stop("alpha", false).await.unwrap();

    assert_eq!(stopped.status, Status::Stopped);
    assert_eq!(stopped.exit_code, Some(137));
    // stop timeout (300ms) plus epsilon, well below the kill grace ceiling
    assert!(begin.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_forced_stop() {
    let supervisor = supervisor(FakeBackend::process());
    running_world(&supervisor, "alpha").await;

    let stopped = supervisor.stop("alpha", true).await.unwrap();
    assert_eq!(stopped.status, Status::Stopped);
    assert_eq!(stopped.exit_code, Some(137));
}

#[tokio::test]
async fn test_unexpected_exit_marks_error_and_allows_restart() {
    let backend = FakeBackend::process();
    let supervisor = supervisor(Arc::clone(&backend));
    running_world(&supervisor, "alpha").await;

    backend.crash("alpha", 1);
    supervisor
        .wait_for_status("alpha", Status::Error, WAIT)
        .await
        .unwrap();
    assert_eq!(supervisor.status("alpha").unwrap().exit_code, Some(1));

    let err = supervisor.send_command("alpha", "say hi").await.unwrap_err();
    assert!(matches!(err, Error::NotRunning { .. }));

    supervisor.start("alpha").await.unwrap();
    supervisor
        .wait_for_status("alpha", Status::Running, WAIT)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_start_marks_error() {
    let backend = FakeBackend::process();
    backend.fail_start.store(true, Ordering::SeqCst);
    let supervisor = supervisor(Arc::clone(&backend));
    supervisor.create(spec("alpha")).await.unwrap();

    let err = supervisor.start("alpha").await.unwrap_err();
    assert!(matches!(err, Error::Backend { .. }));
    assert_eq!(err.diagnostics(), Some("port is already allocated"));
    assert_eq!(supervisor.status("alpha").unwrap().status, Status::Error);
}

// =============================================================================
// Commands and Logs
// =============================================================================

#[tokio::test]
async fn test_send_command_reaches_console() {
    let backend = FakeBackend::process();
    let supervisor = supervisor(Arc::clone(&backend));
    running_world(&supervisor, "alpha").await;

    supervisor.send_command("alpha", "  say hello ").await.unwrap();
    assert_eq!(backend.inputs("alpha"), vec!["say hello".to_string()]);

    let err = supervisor.send_command("alpha", "   ").await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn test_authenticate_starts_device_login() {
    let backend = FakeBackend::process();
    let supervisor = supervisor(Arc::clone(&backend));
    supervisor.create(spec("alpha")).await.unwrap();

    let err = supervisor.authenticate("alpha").await.unwrap_err();
    assert!(matches!(err, Error::NotRunning { .. }));
    assert!(matches!(
        supervisor.authenticate("ghost").await,
        Err(Error::NotFound { .. })
    ));

    supervisor.start("alpha").await.unwrap();
    supervisor
        .wait_for_status("alpha", Status::Running, WAIT)
        .await
        .unwrap();
    supervisor.authenticate("alpha").await.unwrap();
    assert_eq!(backend.inputs("alpha"), vec![AUTH_COMMAND.to_string()]);

    backend.emit("alpha", "Authentication successful");
    supervisor
        .wait_for_status("alpha", Status::Authenticated, WAIT)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_logs_line_bounds() {
    let backend = FakeBackend::process();
    let supervisor = supervisor(Arc::clone(&backend));
    running_world(&supervisor, "alpha").await;
    for i in 0..80 {
        backend.emit("alpha", &format!("line {i}"));
    }

    assert!(matches!(
        supervisor.logs("alpha", 0).await,
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        supervisor.logs("alpha", 2000).await,
        Err(Error::InvalidRequest(_))
    ));

    let logs = supervisor.logs("alpha", 50).await.unwrap();
    assert_eq!(logs.len(), 50);
    assert_eq!(logs.last().map(String::as_str), Some("line 79"));

    let err = supervisor.logs("ghost", 10).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

// =============================================================================
// Delete
// =============================================================================

#[tokio::test]
async fn test_delete_running_world_stops_then_removes() {
    let backend = FakeBackend::process();
    let supervisor = supervisor(Arc::clone(&backend));
    running_world(&supervisor, "alpha").await;
    let mut status = supervisor.watch_status("alpha").unwrap();

    supervisor.delete("alpha").await.unwrap();

    assert!(matches!(
        supervisor.status("alpha"),
        Err(Error::NotFound { .. })
    ));
    assert!(!backend.has("alpha"));
    status
        .wait_for(|s| *s == Status::Absent)
        .await
        .unwrap();

    let err = supervisor.delete("alpha").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_scenario_alpha() {
    let backend = FakeBackend::process();
    let supervisor = supervisor(Arc::clone(&backend));

    let created = supervisor.create(spec("alpha")).await.unwrap();
    assert_eq!(created.status, Status::Created);
    assert_eq!(created.spec.memory.to_string(), "4G");

    supervisor.start("alpha").await.unwrap();
    supervisor
        .wait_for_status("alpha", Status::Running, WAIT)
        .await
        .unwrap();

    let logs = supervisor.logs("alpha", 50).await.unwrap();
    assert!(logs.len() <= 50);
    assert!(logs.iter().any(|l| l == "Server started"));

    let stopped = supervisor.stop("alpha", false).await.unwrap();
    assert_eq!(stopped.status, Status::Stopped);

    supervisor.delete("alpha").await.unwrap();
    assert!(supervisor.list().iter().all(|w| w.id != "alpha"));
}

#[tokio::test]
async fn test_concurrent_create_delete_never_duplicates() {
    let supervisor = supervisor(FakeBackend::process());

    let mut tasks = Vec::new();
    for i in 0..40 {
        let supervisor = Arc::clone(&supervisor);
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let _ = supervisor.create(spec("race")).await;
            } else {
                let _ = supervisor.delete("race").await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let worlds = supervisor.list();
    assert!(worlds.len() <= 1);
    for world in worlds {
        assert_eq!(world.id, "race");
        assert_eq!(world.resource, "fake-race");
    }
}

#[tokio::test]
async fn test_operations_on_different_ids_do_not_block() {
    let backend = FakeBackend::process();
    backend.ignore_graceful.store(true, Ordering::SeqCst);
    let supervisor = supervisor(Arc::clone(&backend));
    running_world(&supervisor, "slow").await;

    let stopping = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.stop("slow", false).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let begin = Instant::now();
    supervisor.create(spec("fast")).await.unwrap();
    assert!(begin.elapsed() < Duration::from_millis(250));
    assert_eq!(supervisor.status("slow").unwrap().status, Status::Stopping);

    stopping.await.unwrap().unwrap();
}

// =============================================================================
// Recovery
// =============================================================================

#[tokio::test]
async fn test_recover_rebuilds_registry() {
    let backend = FakeBackend::container();
    *backend.discovered.lock() = vec![
        DiscoveredInstance {
            spec: spec("live"),
            handle: Handle::new("live", "hycore-world-live"),
            status: BackendStatus::Running,
        },
        DiscoveredInstance {
            spec: spec("idle"),
            handle: Handle::new("idle", "hycore-world-idle"),
            status: BackendStatus::Stopped { exit_code: Some(0) },
        },
        DiscoveredInstance {
            spec: spec("odd"),
            handle: Handle::new("odd", "hycore-world-odd"),
            status: BackendStatus::Other("restarting".into()),
        },
    ];
    let supervisor = supervisor(Arc::clone(&backend));

    assert_eq!(supervisor.recover().await.unwrap(), 3);

    let live = supervisor.status("live").unwrap();
    assert_eq!(live.status, Status::Running);
    assert_eq!(live.resource, "hycore-world-live");
    assert_eq!(supervisor.status("idle").unwrap().status, Status::Stopped);
    assert_eq!(supervisor.status("idle").unwrap().exit_code, Some(0));
    assert_eq!(supervisor.status("odd").unwrap().status, Status::Error);

    // The reattached monitor observes the exit.
    backend.crash("live", 2);
    supervisor
        .wait_for_status("live", Status::Error, WAIT)
        .await
        .unwrap();
}
