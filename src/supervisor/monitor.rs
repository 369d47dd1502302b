//! Per-world control loop.
//!
//! One monitor runs for each started world. It is the only task that turns
//! backend output and exit signals into log events and status changes, so
//! the log buffer and asynchronous transitions have a single writer.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use super::registry::Registry;
use super::state::Status;
use crate::backend::{BackendSignal, BackendStatus, Handle, OutputCapture, RuntimeBackend};
use crate::broadcast::{LogEvent, LogHub, Milestone, StatusClassifier};

pub(super) struct Monitor {
    pub id: String,
    pub run: u64,
    pub handle: Handle,
    pub registry: Arc<Registry>,
    pub backend: Arc<dyn RuntimeBackend>,
    pub classifier: Arc<dyn StatusClassifier>,
    pub hub: Arc<LogHub>,
    pub readiness_poll: Duration,
}

impl Monitor {
    pub async fn run(self, mut capture: OutputCapture) {
        let infer = self.backend.kind().infers_status_from_output();
        let mut poll = tokio::time::interval(self.readiness_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(world = %self.id, run = self.run, "Monitor started");

        loop {
            let polling = !infer && self.status() == Some(Status::Starting);
            tokio::select! {
                signal = capture.recv() => match signal {
                    Some(BackendSignal::Output { stream, line }) => {
                        let milestone = if infer { self.classifier.classify(&line) } else { None };
                        self.hub.publish(LogEvent::new(stream, line));
                        if let Some(milestone) = milestone {
                            self.advance(milestone);
                        }
                    },
                    Some(BackendSignal::Exited { code }) => {
                        self.on_exit(code);
                        break;
                    },
                    None => {
                        self.on_exit(None);
                        break;
                    },
                },
                _ = poll.tick(), if polling => self.poll_readiness().await,
            }
        }

        tracing::debug!(world = %self.id, run = self.run, "Monitor finished");
    }

    fn status(&self) -> Option<Status> {
        self.registry.status(&self.id)
    }

    fn transition(&self, next: Status) -> bool {
        self.registry.transition(&self.id, next, Some(self.run))
    }

    fn advance(&self, milestone: Milestone) {
        match (milestone, self.status()) {
            (Milestone::Started, Some(Status::Starting)) => {
                self.transition(Status::Running);
            },
            (Milestone::Authenticated, Some(Status::Starting)) => {
                if self.transition(Status::Running) {
                    self.transition(Status::Authenticated);
                }
            },
            (Milestone::Authenticated, Some(Status::Running)) => {
                self.transition(Status::Authenticated);
            },
            _ => {},
        }
    }

    /// Ask the engine whether the world finished starting.
    async fn poll_readiness(&self) {
        match self.backend.status_of(self.handle.world()).await {
            Ok(BackendStatus::Running) => {
                if self.transition(Status::Running) {
                    self.hub.publish(LogEvent::info("World is running"));
                }
            },
            Ok(status) => {
                tracing::trace!(world = %self.id, ?status, "World not running yet");
            },
            Err(e) => {
                tracing::warn!(world = %self.id, error = %e, "Readiness check failed");
            },
        }
    }

    fn on_exit(&self, code: Option<i32>) {
        let next = match self.status() {
            None => return,
            Some(Status::Stopping) => Status::Stopped,
            Some(status) if status.is_live() => {
                if code == Some(0) {
                    Status::Stopped
                } else {
                    tracing::warn!(world = %self.id, exit_code = ?code, "World exited unexpectedly");
                    Status::Error
                }
            },
            Some(_) => {
                // Already settled by the supervisor; keep the exit code.
                if code.is_some() {
                    let run = self.run;
                    self.registry.update(&self.id, |r| {
                        if r.run == run && r.exit_code.is_none() {
                            r.exit_code = code;
                        }
                    });
                }
                return;
            },
        };

        if self.registry.finish(&self.id, next, Some(self.run), code) {
            let reason = code.map_or_else(
                || format!("World {next}"),
                |code| format!("World {next} (exit code {code})"),
            );
            self.hub.close(reason);
        }
    }
}
