//! Shared fixtures: a scriptable in-memory backend and supervisor helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use hycore::backend::{
    BackendKind, BackendSignal, BackendStatus, DiscoveredInstance, Handle, OutputCapture,
    RuntimeBackend, StopMode,
};
use hycore::broadcast::{StreamTag, SubstringClassifier};
use hycore::error::{Error, Result};
use hycore::supervisor::{Status, Supervisor, SupervisorSettings};
use hycore::world::{MemorySize, WorldSpec};

/// Upper bound for any wait in tests.
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct FakeWorld {
    running: bool,
    log: Vec<String>,
    inputs: Vec<String>,
    tx: Option<mpsc::Sender<BackendSignal>>,
    pending: Option<mpsc::Receiver<BackendSignal>>,
}

/// In-memory backend whose worlds print `Server started` when followed and
/// exit when asked to stop.
pub struct FakeBackend {
    kind: BackendKind,
    worlds: Mutex<HashMap<String, FakeWorld>>,
    /// Pretend the server ignores graceful stop requests.
    pub ignore_graceful: AtomicBool,
    /// Make the next `start` fail with a backend error.
    pub fail_start: AtomicBool,
    /// Resources reported by `discover`.
    pub discovered: Mutex<Vec<DiscoveredInstance>>,
}

impl FakeBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            worlds: Mutex::new(HashMap::new()),
            ignore_graceful: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            discovered: Mutex::new(Vec::new()),
        }
    }

    pub fn process() -> Arc<Self> {
        Arc::new(Self::new(BackendKind::Process))
    }

    pub fn container() -> Arc<Self> {
        Arc::new(Self::new(BackendKind::Container))
    }

    /// Emit an output line from a running world.
    pub fn emit(&self, id: &str, line: &str) {
        let mut worlds = self.worlds.lock();
        if let Some(world) = worlds.get_mut(id) {
            world.log.push(line.to_string());
            if let Some(tx) = &world.tx {
                let _ = tx.try_send(BackendSignal::Output {
                    stream: StreamTag::Stdout,
                    line: line.to_string(),
                });
            }
        }
    }

    /// Make a running world exit on its own.
    pub fn crash(&self, id: &str, code: i32) {
        self.exit(id, Some(code));
    }

    pub fn inputs(&self, id: &str) -> Vec<String> {
        self.worlds
            .lock()
            .get(id)
            .map(|w| w.inputs.clone())
            .unwrap_or_default()
    }

    pub fn has(&self, id: &str) -> bool {
        self.worlds.lock().contains_key(id)
    }

    fn exit(&self, id: &str, code: Option<i32>) {
        let mut worlds = self.worlds.lock();
        if let Some(world) = worlds.get_mut(id) {
            world.running = false;
            if let Some(tx) = world.tx.take() {
                let _ = tx.try_send(BackendSignal::Exited { code });
            }
        }
    }
}

#[async_trait]
impl RuntimeBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.worlds.lock().contains_key(id))
    }

    async fn status_of(&self, id: &str) -> Result<BackendStatus> {
        Ok(match self.worlds.lock().get(id) {
            None => BackendStatus::NotFound,
            Some(world) if world.running => BackendStatus::Running,
            Some(_) => BackendStatus::Created,
        })
    }

    async fn create(&self, spec: &WorldSpec) -> Result<Handle> {
        // Widen the window for racing create/delete calls.
        tokio::task::yield_now().await;
        let mut worlds = self.worlds.lock();
        if worlds.contains_key(&spec.id) {
            return Err(Error::already_exists(&spec.id));
        }
        worlds.insert(spec.id.clone(), FakeWorld::default());
        Ok(Handle::new(&spec.id, format!("fake-{}", spec.id)))
    }

    async fn start(&self, handle: &Handle) -> Result<()> {
        if self.fail_start.swap(false, Ordering::SeqCst) {
            return Err(Error::backend(
                handle.world(),
                hycore::error::Phase::Start,
                "engine exited with 1",
                "port is already allocated",
            ));
        }

        let mut worlds = self.worlds.lock();
        let world = worlds
            .get_mut(handle.world())
            .ok_or_else(|| Error::not_found(handle.world()))?;
        if world.running {
            return Err(Error::already_running(handle.world()));
        }

        let (tx, rx) = mpsc::channel(1024);
        world.running = true;
        world.tx = Some(tx);
        world.pending = Some(rx);
        Ok(())
    }

    async fn stop(&self, handle: &Handle, mode: StopMode) -> Result<()> {
        let id = handle.world();
        {
            let worlds = self.worlds.lock();
            let world = worlds.get(id).ok_or_else(|| Error::not_found(id))?;
            if !world.running {
                return Err(Error::not_running(id));
            }
        }

        match mode {
            StopMode::Graceful { .. } if self.ignore_graceful.load(Ordering::SeqCst) => {},
            StopMode::Graceful { .. } => {
                self.emit(id, "Shutting down");
                self.exit(id, Some(0));
            },
            StopMode::Forced => self.exit(id, Some(137)),
        }
        Ok(())
    }

    async fn remove(&self, handle: &Handle) -> Result<()> {
        let id = handle.world();
        if !self.has(id) {
            return Err(Error::not_found(id));
        }
        self.exit(id, Some(137));
        self.worlds.lock().remove(id);
        Ok(())
    }

    async fn tail_logs(&self, handle: &Handle, lines: usize) -> Result<String> {
        let worlds = self.worlds.lock();
        let world = worlds
            .get(handle.world())
            .ok_or_else(|| Error::not_found(handle.world()))?;
        let start = world.log.len().saturating_sub(lines);
        Ok(world.log[start..]
            .iter()
            .map(|l| format!("{l}\n"))
            .collect())
    }

    async fn follow_logs(&self, handle: &Handle, _tail: usize) -> Result<OutputCapture> {
        let id = handle.world();
        let rx = {
            let mut worlds = self.worlds.lock();
            let world = worlds.get_mut(id).ok_or_else(|| Error::not_found(id))?;
            world
                .pending
                .take()
                .ok_or_else(|| Error::not_running(id))?
        };
        self.emit(id, "Booting world");
        self.emit(id, "Server started");
        Ok(OutputCapture::new(rx, Vec::new()))
    }

    async fn send_input(&self, handle: &Handle, line: &str) -> Result<()> {
        let id = handle.world();
        {
            let mut worlds = self.worlds.lock();
            let world = worlds.get_mut(id).ok_or_else(|| Error::not_found(id))?;
            if !world.running {
                return Err(Error::not_running(id));
            }
            world.inputs.push(line.to_string());
        }
        self.emit(id, &format!("> {line}"));
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<DiscoveredInstance>> {
        let discovered = self.discovered.lock().clone();
        let mut worlds = self.worlds.lock();
        for found in &discovered {
            let running = matches!(found.status, BackendStatus::Running);
            let mut world = FakeWorld {
                running,
                ..FakeWorld::default()
            };
            if running {
                let (tx, rx) = mpsc::channel(1024);
                world.tx = Some(tx);
                world.pending = Some(rx);
            }
            worlds.insert(found.spec.id.clone(), world);
        }
        Ok(discovered)
    }
}

/// Short timeouts so forced fallbacks finish quickly.
pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        stop_timeout: Duration::from_millis(300),
        kill_grace: Duration::from_millis(500),
        log_buffer_lines: 100,
        readiness_poll: Duration::from_millis(20),
    }
}

pub fn supervisor(backend: Arc<FakeBackend>) -> Arc<Supervisor> {
    Arc::new(Supervisor::new(
        backend,
        Arc::new(SubstringClassifier::default()),
        fast_settings(),
    ))
}

pub fn spec(id: &str) -> WorldSpec {
    WorldSpec::new(id, MemorySize::from_gib(4), 2, 25565)
}

/// Create and start a world and wait until it is running.
pub async fn running_world(supervisor: &Supervisor, id: &str) {
    supervisor.create(spec(id)).await.unwrap();
    supervisor.start(id).await.unwrap();
    supervisor
        .wait_for_status(id, Status::Running, WAIT)
        .await
        .unwrap();
}
