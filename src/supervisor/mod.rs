//! Lifecycle supervisor.
//!
//! Owns the registry, dispatches to the runtime backend, and enforces the
//! per-world state machine:
//!
//! - mutating operations (create, start, stop, delete) on one id are
//!   serialized by a keyed lock and never overlap
//! - reads (status, list, logs) take a snapshot and never wait on that lock
//! - asynchronous changes (readiness, exit) come from the world's monitor
//!
//! The supervisor is constructed explicitly and shared behind an `Arc`; there
//! is no global instance.

mod monitor;
mod registry;
mod state;
mod stream;

pub use registry::InstanceSnapshot;
pub use state::Status;
pub use stream::{StreamEvent, StreamPhase};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use self::monitor::Monitor;
use self::registry::{InstanceRecord, LockMap, Registry};
use crate::backend::{BackendKind, BackendStatus, Handle, RuntimeBackend, StopMode};
use crate::broadcast::{LogEvent, LogSubscription, StatusClassifier, SubstringClassifier};
use crate::config::{HycoreConfig, RuntimeSettings};
use crate::error::{Error, Result};
use crate::metrics;
use crate::world::{WorldSpec, validate_id};

/// Largest number of log lines a caller may request.
pub const MAX_LOG_LINES: usize = 1000;

/// Console command that starts the server's device login flow.
pub const AUTH_COMMAND: &str = "/auth login device";

/// Final event of every log stream when the daemon exits.
const SHUTDOWN_REASON: &str = "hycore is shutting down";

/// Timing and sizing knobs for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub stop_timeout: Duration,
    pub kill_grace: Duration,
    pub log_buffer_lines: usize,
    pub readiness_poll: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&RuntimeSettings::default())
    }
}

impl From<&RuntimeSettings> for SupervisorSettings {
    fn from(runtime: &RuntimeSettings) -> Self {
        Self {
            stop_timeout: runtime.stop_timeout(),
            kill_grace: runtime.kill_grace(),
            log_buffer_lines: runtime.log_buffer_lines,
            readiness_poll: runtime.readiness_poll(),
        }
    }
}

/// Enforces world lifecycle invariants on top of a runtime backend.
pub struct Supervisor {
    backend: Arc<dyn RuntimeBackend>,
    classifier: Arc<dyn StatusClassifier>,
    registry: Arc<Registry>,
    locks: LockMap,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        backend: Arc<dyn RuntimeBackend>,
        classifier: Arc<dyn StatusClassifier>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            backend,
            classifier,
            registry: Arc::new(Registry::new()),
            locks: LockMap::new(),
            settings,
        }
    }

    /// Build a supervisor from configuration with the configured backend and
    /// the substring classifier.
    pub fn from_config(config: &HycoreConfig) -> Result<Self> {
        let backend = crate::backend::build(config)?;
        let classifier = Arc::new(SubstringClassifier::new(
            config.process.running_markers.clone(),
            config.process.authenticated_markers.clone(),
        ));
        Ok(Self::new(
            backend,
            classifier,
            SupervisorSettings::from(&config.runtime),
        ))
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Create a world. The new world is `created`, not started.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the id is taken in the registry or the backend.
    pub async fn create(&self, spec: WorldSpec) -> Result<InstanceSnapshot> {
        validate_id(&spec.id).map_err(Error::InvalidRequest)?;
        let id = spec.id.clone();
        let _guard = self.locks.acquire(&id).await;

        let result = self.create_locked(spec).await;
        metrics::record_operation("create", result.is_ok());
        result
    }

    async fn create_locked(&self, spec: WorldSpec) -> Result<InstanceSnapshot> {
        if self.registry.contains(&spec.id) || self.backend.exists(&spec.id).await? {
            return Err(Error::already_exists(&spec.id));
        }

        let handle = self.backend.create(&spec).await?;
        let record = InstanceRecord::new(
            spec,
            self.backend.kind(),
            handle,
            Status::Created,
            self.settings.log_buffer_lines,
        );
        let snapshot = self.registry.insert(record)?;
        tracing::info!(world = %snapshot.id, status = %snapshot.status, "World created");
        Ok(snapshot)
    }

    /// Start a created, stopped or failed world.
    ///
    /// Returns once the backend started it; the world is `starting` and moves
    /// to `running` when the monitor sees confirmation.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `AlreadyRunning` if it is up.
    pub async fn start(&self, id: &str) -> Result<InstanceSnapshot> {
        let _guard = self.locks.acquire(id).await;
        let result = self.start_locked(id).await;
        metrics::record_operation("start", result.is_ok());
        result
    }

    async fn start_locked(&self, id: &str) -> Result<InstanceSnapshot> {
        let (status, handle, hub) = self
            .registry
            .with(id, |r| (r.status, r.handle.clone(), Arc::clone(&r.hub)))
            .ok_or_else(|| Error::not_found(id))?;
        if !status.can_start() {
            return Err(Error::already_running(id));
        }

        self.registry.transition(id, Status::Starting, None);
        hub.open();
        hub.publish(LogEvent::info(format!("Starting world {id}")));

        if let Err(e) = self.backend.start(&handle).await {
            self.fail(id, &e);
            return Err(e);
        }

        let capture = match self.backend.follow_logs(&handle, 0).await {
            Ok(capture) => capture,
            Err(e) => {
                self.fail(id, &e);
                return Err(e);
            },
        };
        self.spawn_monitor(id, handle, capture);

        tracing::info!(world = %id, "World starting");
        self.snapshot(id)
    }

    fn spawn_monitor(&self, id: &str, handle: Handle, capture: crate::backend::OutputCapture) {
        let Some((run, hub)) = self.registry.with(id, |r| (r.run, Arc::clone(&r.hub))) else {
            return;
        };

        let monitor = Monitor {
            id: id.to_string(),
            run,
            handle,
            registry: Arc::clone(&self.registry),
            backend: Arc::clone(&self.backend),
            classifier: Arc::clone(&self.classifier),
            hub,
            readiness_poll: self.settings.readiness_poll,
        };
        let task = tokio::spawn(monitor.run(capture));

        let previous = self
            .registry
            .update(id, |r| r.monitor.replace(task.abort_handle()))
            .flatten();
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Mark a world failed after an operation error.
    fn fail(&self, id: &str, error: &Error) {
        tracing::error!(world = %id, error = %error, "World operation failed");
        self.registry.transition(id, Status::Error, None);
        if let Some(hub) = self.registry.with(id, |r| Arc::clone(&r.hub)) {
            hub.close(format!("World error: {error}"));
        }
    }

    /// Stop a live world.
    ///
    /// A graceful stop asks the server to shut down and waits up to the stop
    /// timeout for the exit; if the server does not comply it is killed. The
    /// world always ends up `stopped`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `NotRunning` if it is not up.
    pub async fn stop(&self, id: &str, force: bool) -> Result<InstanceSnapshot> {
        let _guard = self.locks.acquire(id).await;
        let result = self.stop_locked(id, force).await;
        metrics::record_operation("stop", result.is_ok());
        result
    }

    async fn stop_locked(&self, id: &str, force: bool) -> Result<InstanceSnapshot> {
        let (status, handle) = self
            .registry
            .with(id, |r| (r.status, r.handle.clone()))
            .ok_or_else(|| Error::not_found(id))?;
        if !status.is_live() {
            return Err(Error::not_running(id));
        }

        let mut status_rx = self.registry.watch(id).ok_or_else(|| Error::not_found(id))?;
        self.registry.transition(id, Status::Stopping, None);

        let exited = if force {
            false
        } else {
            self.stop_gracefully(id, &handle, &mut status_rx).await
        };

        if !exited {
            self.kill(id, &handle, &mut status_rx).await;
        }

        // Exit was not confirmed by the monitor; settle it here.
        if self.registry.status(id) == Some(Status::Stopping) {
            self.registry.finish(id, Status::Stopped, None, None);
            let (hub, monitor) = self
                .registry
                .update(id, |r| (Arc::clone(&r.hub), r.monitor.take()))
                .ok_or_else(|| Error::not_found(id))?;
            if let Some(monitor) = monitor {
                monitor.abort();
            }
            hub.close("World stopped");
        }

        tracing::info!(world = %id, force, "World stopped");
        self.snapshot(id)
    }

    /// Returns whether the world exited within the stop timeout.
    async fn stop_gracefully(
        &self,
        id: &str,
        handle: &Handle,
        status_rx: &mut watch::Receiver<Status>,
    ) -> bool {
        let timeout = self.settings.stop_timeout;
        let outcome = {
            let attempt = async {
                self.backend
                    .stop(handle, StopMode::Graceful { timeout })
                    .await?;
                wait_terminal(&mut *status_rx).await;
                Ok::<_, Error>(())
            };
            tokio::time::timeout(timeout, attempt).await
        };

        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(Error::NotRunning { .. })) => {
                // Exited on its own between the check and the request.
                self.wait_briefly(status_rx).await
            },
            Ok(Err(e)) => {
                tracing::warn!(world = %id, error = %e, "Graceful stop failed, killing");
                false
            },
            Err(_) => {
                let err = Error::Timeout {
                    id: id.to_string(),
                    timeout_secs: timeout.as_secs(),
                };
                tracing::warn!(world = %id, error = %err, "Graceful stop timed out, killing");
                false
            },
        }
    }

    async fn kill(&self, id: &str, handle: &Handle, status_rx: &mut watch::Receiver<Status>) {
        match self.backend.stop(handle, StopMode::Forced).await {
            Ok(()) | Err(Error::NotRunning { .. }) => {},
            Err(e) => tracing::warn!(world = %id, error = %e, "Forced stop failed"),
        }
        if !self.wait_briefly(status_rx).await {
            tracing::warn!(
                world = %id,
                grace_secs = self.settings.kill_grace.as_secs(),
                "Exit not confirmed after forced stop"
            );
        }
    }

    async fn wait_briefly(&self, status_rx: &mut watch::Receiver<Status>) -> bool {
        tokio::time::timeout(self.settings.kill_grace, wait_terminal(status_rx))
            .await
            .is_ok()
    }

    /// Delete a world in any state, stopping it first if it is up.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id; backend failures leave the record.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        let result = self.delete_locked(id).await;
        metrics::record_operation("delete", result.is_ok());
        result
    }

    async fn delete_locked(&self, id: &str) -> Result<()> {
        let (status, handle) = self
            .registry
            .with(id, |r| (r.status, r.handle.clone()))
            .ok_or_else(|| Error::not_found(id))?;

        if status.is_live() {
            self.stop_locked(id, false).await?;
        }

        match self.backend.remove(&handle).await {
            Ok(()) => {},
            Err(Error::NotFound { .. }) => {
                tracing::warn!(world = %id, "Backend resource already gone");
            },
            Err(e) => return Err(e),
        }

        if let Some(record) = self.registry.remove(id) {
            if let Some(monitor) = record.monitor {
                monitor.abort();
            }
            record.hub.close("World deleted");
        }
        tracing::info!(world = %id, "World deleted");
        Ok(())
    }

    /// Forward a console line to a running world.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `NotRunning` if it is not running.
    pub async fn send_command(&self, id: &str, command: &str) -> Result<()> {
        let command = command.trim();
        if command.is_empty() {
            return Err(Error::InvalidRequest("command must not be empty".to_string()));
        }
        let (status, handle) = self
            .registry
            .with(id, |r| (r.status, r.handle.clone()))
            .ok_or_else(|| Error::not_found(id))?;
        if !status.accepts_commands() {
            return Err(Error::not_running(id));
        }

        let result = self.backend.send_input(&handle, command).await;
        metrics::record_operation("command", result.is_ok());
        result
    }

    /// Start the server's device login flow. The login URL and code appear
    /// in the world's output, and the status moves to `authenticated` once
    /// the server reports success.
    ///
    /// # Errors
    ///
    /// Same as [`Supervisor::send_command`].
    pub async fn authenticate(&self, id: &str) -> Result<()> {
        tracing::info!(world = %id, "Requesting server authentication");
        self.send_command(id, AUTH_COMMAND).await
    }

    /// Snapshot of one world.
    pub fn status(&self, id: &str) -> Result<InstanceSnapshot> {
        self.snapshot(id)
    }

    fn snapshot(&self, id: &str) -> Result<InstanceSnapshot> {
        self.registry.snapshot(id).ok_or_else(|| Error::not_found(id))
    }

    /// Snapshot of every world, ordered by id.
    pub fn list(&self) -> Vec<InstanceSnapshot> {
        self.registry.list()
    }

    /// The last `lines` lines of a world's output, most recent last.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` unless `1 <= lines <= 1000`; `NotFound` for an
    /// unknown id.
    pub async fn logs(&self, id: &str, lines: usize) -> Result<Vec<String>> {
        validate_lines(lines)?;
        let handle = self
            .registry
            .with(id, |r| r.handle.clone())
            .ok_or_else(|| Error::not_found(id))?;

        let text = self.backend.tail_logs(&handle, lines).await?;
        let all: Vec<&str> = text.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].iter().map(|l| (*l).to_string()).collect())
    }

    /// Subscribe to a world's live output, starting `tail` lines back.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `InvalidRequest` for `tail > 1000`.
    pub fn follow(&self, id: &str, tail: usize) -> Result<LogSubscription> {
        if tail > MAX_LOG_LINES {
            return Err(Error::InvalidRequest(format!(
                "tail must be at most {MAX_LOG_LINES}"
            )));
        }
        self.registry
            .with(id, |r| r.hub.subscribe(tail))
            .ok_or_else(|| Error::not_found(id))
    }

    /// Observe status changes of one world. Sends `absent` on deletion.
    pub fn watch_status(&self, id: &str) -> Result<watch::Receiver<Status>> {
        self.registry.watch(id).ok_or_else(|| Error::not_found(id))
    }

    /// Wait until a world reaches `target`, up to `timeout`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the world does not exist or disappears, `Timeout` if
    /// the status was not reached in time.
    pub async fn wait_for_status(
        &self,
        id: &str,
        target: Status,
        timeout: Duration,
    ) -> Result<Status> {
        let mut rx = self.watch_status(id)?;
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| *s == target || (*s == Status::Absent && target != Status::Absent)),
        )
        .await;

        match waited {
            Ok(Ok(status)) if *status == target => Ok(target),
            Ok(_) => Err(Error::not_found(id)),
            Err(_) => Err(Error::Timeout {
                id: id.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Rebuild the registry from resources the backend still holds.
    ///
    /// Running resources get a monitor so their output and exit are
    /// observed again. Returns the number of recovered worlds.
    pub async fn recover(&self) -> Result<usize> {
        let discovered = self.backend.discover().await?;
        let mut recovered = 0;

        for found in discovered {
            let id = found.spec.id.clone();
            let _guard = self.locks.acquire(&id).await;
            if self.registry.contains(&id) {
                continue;
            }

            let (status, exit_code) = match &found.status {
                BackendStatus::Created => (Status::Created, None),
                BackendStatus::Running => (Status::Running, None),
                BackendStatus::Stopped { exit_code } => (Status::Stopped, *exit_code),
                BackendStatus::NotFound => continue,
                BackendStatus::Other(state) if state == "dead" => (Status::Stopped, None),
                BackendStatus::Other(state) => {
                    tracing::warn!(world = %id, state = %state, "Recovered world in unexpected state");
                    (Status::Error, None)
                },
            };

            let mut record = InstanceRecord::new(
                found.spec,
                self.backend.kind(),
                found.handle.clone(),
                status,
                self.settings.log_buffer_lines,
            );
            record.exit_code = exit_code;
            if status == Status::Running {
                record.run = 1;
                record.hub.open();
            }
            self.registry.insert(record)?;

            if status == Status::Running {
                match self.backend.follow_logs(&found.handle, 0).await {
                    Ok(capture) => self.spawn_monitor(&id, found.handle, capture),
                    Err(e) => {
                        tracing::warn!(world = %id, error = %e, "Could not reattach to world output");
                    },
                }
            }

            tracing::info!(world = %id, status = %status, "Recovered world");
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Stop worlds that cannot outlive the daemon, then end every log
    /// stream.
    ///
    /// Child processes die with the daemon, so they are stopped gracefully
    /// first. Containers keep running and are recovered on the next start.
    pub async fn shutdown(&self) {
        if self.backend.kind().infers_status_from_output() {
            let live: Vec<String> = self
                .list()
                .into_iter()
                .filter(|w| w.status.is_live())
                .map(|w| w.id)
                .collect();

            let stops = live.iter().map(|id| async move {
                if let Err(e) = self.stop(id, false).await {
                    tracing::warn!(world = %id, error = %e, "Failed to stop world on shutdown");
                }
            });
            futures::future::join_all(stops).await;
        }

        let hubs = self.registry.hubs();
        tracing::debug!(worlds = hubs.len(), "Releasing log subscribers");
        for hub in hubs {
            hub.release(SHUTDOWN_REASON);
        }
    }
}

async fn wait_terminal(status_rx: &mut watch::Receiver<Status>) {
    // A closed channel means the record is gone, which also ends the wait.
    let _ = status_rx.wait_for(|s| s.is_terminal() || *s == Status::Absent).await;
}

/// Check a requested line count against `1..=1000`.
pub fn validate_lines(lines: usize) -> Result<()> {
    if (1..=MAX_LOG_LINES).contains(&lines) {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!(
            "lines must be between 1 and {MAX_LOG_LINES}"
        )))
    }
}
