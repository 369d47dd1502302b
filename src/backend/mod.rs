//! Runtime backends that actually host worlds.
//!
//! Two implementations sit behind [`RuntimeBackend`]:
//!
//! - [`ContainerBackend`] drives a container engine CLI (`docker` by default).
//! - [`ProcessBackend`] spawns the server jar directly with `java`.
//!
//! The supervisor picks one at startup from `runtime.backend` and never
//! branches on the variant afterwards, except through
//! [`BackendKind::infers_status_from_output`].

mod capture;
mod container;
mod process;

pub use container::{CommandRunner, ContainerBackend, EngineCli, EngineOutput};
pub use process::ProcessBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broadcast::StreamTag;
use crate::config::HycoreConfig;
use crate::error::Result;
use crate::world::WorldSpec;

/// Which backend variant hosts worlds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Container,
    Process,
}

impl BackendKind {
    /// Whether readiness must be inferred from output lines because the
    /// backend has no state query of its own.
    pub const fn infers_status_from_output(self) -> bool {
        matches!(self, Self::Process)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Container => "container",
            Self::Process => "process",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" | "docker" => Ok(Self::Container),
            "process" | "direct" => Ok(Self::Process),
            other => Err(format!("unknown backend '{other}' (expected container or process)")),
        }
    }
}

/// Opaque reference to a live backend resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    world: String,
    resource: String,
}

impl Handle {
    pub fn new(world: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            world: world.into(),
            resource: resource.into(),
        }
    }

    /// World id this handle belongs to.
    pub fn world(&self) -> &str {
        &self.world
    }

    /// Backend-specific resource name (container name, process slot).
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource)
    }
}

/// Live state as reported by the backend itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    NotFound,
    Created,
    Running,
    Stopped { exit_code: Option<i32> },
    /// Any other engine state (`paused`, `restarting`, `dead`, ...).
    Other(String),
}

/// How to stop a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Ask the server to shut down, allowing it `timeout` to comply.
    Graceful { timeout: Duration },
    /// Terminate immediately.
    Forced,
}

/// Message from a backend about a live resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSignal {
    Output { stream: StreamTag, line: String },
    Exited { code: Option<i32> },
}

/// Cancellable stream of backend signals for one resource.
///
/// Dropping the capture aborts its reader tasks, which releases any child
/// processes they own.
#[derive(Debug)]
pub struct OutputCapture {
    receiver: mpsc::Receiver<BackendSignal>,
    tasks: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    pub fn new(receiver: mpsc::Receiver<BackendSignal>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { receiver, tasks }
    }

    /// Next signal, or `None` when the resource produces no more.
    pub async fn recv(&mut self) -> Option<BackendSignal> {
        self.receiver.recv().await
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A resource found by [`RuntimeBackend::discover`].
#[derive(Debug, Clone)]
pub struct DiscoveredInstance {
    pub spec: WorldSpec,
    pub handle: Handle,
    pub status: BackendStatus,
}

/// Capability interface over the hosting mechanism.
///
/// Implementations must be thread-safe; the supervisor guarantees that
/// mutating calls for one world never overlap.
#[async_trait]
pub trait RuntimeBackend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Whether the backend holds a resource for this world id.
    async fn exists(&self, id: &str) -> Result<bool>;

    /// Query live backend state, independent of the supervisor's registry.
    async fn status_of(&self, id: &str) -> Result<BackendStatus>;

    /// Create the resource.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the backend already has a resource for `spec.id`.
    async fn create(&self, spec: &WorldSpec) -> Result<Handle>;

    /// # Errors
    ///
    /// `NotFound` or `AlreadyRunning`.
    async fn start(&self, handle: &Handle) -> Result<()>;

    /// Request a stop. Returns once the request was issued; exit is observed
    /// through [`BackendSignal::Exited`] or [`RuntimeBackend::status_of`].
    ///
    /// # Errors
    ///
    /// `NotFound` or `NotRunning`.
    async fn stop(&self, handle: &Handle, mode: StopMode) -> Result<()>;

    /// Remove the resource, stopping it first if it still runs.
    async fn remove(&self, handle: &Handle) -> Result<()>;

    /// Last `lines` lines of output.
    async fn tail_logs(&self, handle: &Handle, lines: usize) -> Result<String>;

    /// Follow output starting `tail` lines back, until exit.
    async fn follow_logs(&self, handle: &Handle, tail: usize) -> Result<OutputCapture>;

    /// Write one line to the server console.
    ///
    /// # Errors
    ///
    /// `NotRunning` if the resource is not running.
    async fn send_input(&self, handle: &Handle, line: &str) -> Result<()>;

    /// Enumerate resources this backend owns, for startup recovery.
    async fn discover(&self) -> Result<Vec<DiscoveredInstance>>;
}

/// Build the backend selected in the configuration.
pub fn build(config: &HycoreConfig) -> Result<Arc<dyn RuntimeBackend>> {
    match config.runtime.backend {
        BackendKind::Container => Ok(Arc::new(ContainerBackend::new(
            config.container.clone(),
            Arc::new(EngineCli::new(config.container.engine.clone())),
        )?)),
        BackendKind::Process => Ok(Arc::new(ProcessBackend::new(config.process.clone())?)),
    }
}
