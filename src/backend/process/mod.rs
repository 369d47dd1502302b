//! Direct-process backend.
//!
//! `create` only validates the server files and reserves a slot; `start`
//! spawns `java` with piped standard streams. Output goes to a per-world log
//! file and to the capture channel handed out by `follow_logs`. The server
//! has no state query, so readiness is inferred by the supervisor from the
//! output.

mod args;
mod logfile;

pub(super) use logfile::LogWriter;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use self::args::ServerPaths;
use super::capture::{LogSink, forward_lines};
use super::{
    BackendKind, BackendSignal, BackendStatus, DiscoveredInstance, Handle, OutputCapture,
    RuntimeBackend, StopMode,
};
use crate::broadcast::StreamTag;
use crate::config::ProcessSettings;
use crate::error::{Error, Phase, Result};
use crate::world::WorldSpec;

/// How long readers may drain after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// How long `remove` waits for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend that runs each world as a child process.
pub struct ProcessBackend {
    settings: ProcessSettings,
    logs_dir: PathBuf,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

struct Slot {
    spec: WorldSpec,
    paths: ServerPaths,
    run: Option<Run>,
    generation: u64,
    started_once: bool,
    exit_code: Option<i32>,
}

/// A live child process.
struct Run {
    pid: Option<u32>,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
    /// Taken by the first `follow_logs`.
    capture: Option<mpsc::Receiver<BackendSignal>>,
    sink: LogSink,
}

impl ProcessBackend {
    /// # Errors
    ///
    /// Returns a configuration error if the log directory cannot be resolved.
    pub fn new(settings: ProcessSettings) -> Result<Self> {
        let logs_dir = settings
            .resolved_logs_dir()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            settings,
            logs_dir,
            slots: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn log_path(&self, id: &str) -> PathBuf {
        self.logs_dir.join(format!("{id}.log"))
    }

    fn resolve_paths(&self, spec: &WorldSpec) -> Result<ServerPaths> {
        let server_dir = spec
            .process
            .server_path
            .clone()
            .or_else(|| self.settings.server_path.clone())
            .ok_or_else(|| Error::InvalidRequest("server_path is required".to_string()))?;
        let assets = spec
            .process
            .assets_path
            .clone()
            .or_else(|| self.settings.assets_path.clone())
            .ok_or_else(|| Error::InvalidRequest("assets_path is required".to_string()))?;

        let paths = ServerPaths { server_dir, assets };
        let jar = paths.jar();
        if !jar.is_file() {
            return Err(Error::backend(
                &spec.id,
                Phase::Create,
                format!("server jar not found at {}", jar.display()),
                "",
            ));
        }
        if !paths.assets.exists() {
            return Err(Error::backend(
                &spec.id,
                Phase::Create,
                format!("assets not found at {}", paths.assets.display()),
                "",
            ));
        }
        Ok(paths)
    }

    async fn open_log(&self, id: &str) -> Result<LogSink> {
        tokio::fs::create_dir_all(&self.logs_dir)
            .await
            .map_err(|e| Error::io(format!("creating {}", self.logs_dir.display()), e))?;

        let writer = LogWriter::open(self.log_path(id)).await?;
        Ok(Arc::new(tokio::sync::Mutex::new(writer)))
    }

    /// Spawn the waiter that owns the child until it exits or is killed.
    ///
    /// The waiter is detached from any capture so a dropped follower never
    /// leaves the slot marked running.
    #[allow(clippy::too_many_arguments)]
    fn spawn_waiter(
        &self,
        id: String,
        generation: u64,
        mut child: tokio::process::Child,
        readers: Vec<JoinHandle<()>>,
        tx: mpsc::Sender<BackendSignal>,
        kill_rx: oneshot::Receiver<()>,
        exited_tx: watch::Sender<bool>,
    ) {
        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    tracing::info!(world = %id, "Killing server process");
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(world = %id, error = %e, "Failed to kill server process");
                    }
                    child.wait().await
                },
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(world = %id, error = %e, "Failed to reap server process");
                    None
                },
            };

            for reader in readers {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
            }

            {
                let mut slots = slots.lock();
                if let Some(slot) = slots.get_mut(&id)
                    && slot.generation == generation
                {
                    slot.run = None;
                    slot.exit_code = code;
                }
            }
            let _ = exited_tx.send(true);
            tracing::info!(world = %id, exit_code = ?code, "Server process exited");
            let _ = tx.send(BackendSignal::Exited { code }).await;
        });
    }
}

/// Write `line` and a newline to the server console.
async fn write_line(stdin: &tokio::sync::Mutex<ChildStdin>, line: &str) -> std::io::Result<()> {
    let mut stdin = stdin.lock().await;
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

#[async_trait]
impl RuntimeBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.slots.lock().contains_key(id))
    }

    async fn status_of(&self, id: &str) -> Result<BackendStatus> {
        let slots = self.slots.lock();
        Ok(match slots.get(id) {
            None => BackendStatus::NotFound,
            Some(slot) if slot.run.is_some() => BackendStatus::Running,
            Some(slot) if slot.started_once => BackendStatus::Stopped {
                exit_code: slot.exit_code,
            },
            Some(_) => BackendStatus::Created,
        })
    }

    async fn create(&self, spec: &WorldSpec) -> Result<Handle> {
        if self.slots.lock().contains_key(&spec.id) {
            return Err(Error::already_exists(&spec.id));
        }
        let paths = self.resolve_paths(spec)?;

        let mut slots = self.slots.lock();
        if slots.contains_key(&spec.id) {
            return Err(Error::already_exists(&spec.id));
        }
        tracing::info!(
            world = %spec.id,
            server_dir = %paths.server_dir.display(),
            "Prepared server slot"
        );
        slots.insert(
            spec.id.clone(),
            Slot {
                spec: spec.clone(),
                paths,
                run: None,
                generation: 0,
                started_once: false,
                exit_code: None,
            },
        );
        Ok(Handle::new(&spec.id, &spec.id))
    }

    async fn start(&self, handle: &Handle) -> Result<()> {
        let id = handle.world();
        let (spec, paths) = {
            let slots = self.slots.lock();
            let slot = slots.get(id).ok_or_else(|| Error::not_found(id))?;
            if slot.run.is_some() {
                return Err(Error::already_running(id));
            }
            (slot.spec.clone(), slot.paths.clone())
        };

        let sink = self.open_log(id).await?;
        let args = args::server_args(&spec, &paths, &self.settings.bind_host);

        let mut child = Command::new(&self.settings.java)
            .args(&args)
            .current_dir(&paths.server_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::backend(
                    id,
                    Phase::Start,
                    format!("failed to spawn {}: {e}", self.settings.java.display()),
                    "",
                )
            })?;

        let pid = child.id();
        let stdin = child.stdin.take().ok_or_else(|| {
            Error::backend(id, Phase::Start, "server stdin was not captured", "")
        })?;

        let (tx, rx) = mpsc::channel(256);
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(forward_lines(
                out,
                StreamTag::Stdout,
                tx.clone(),
                Some(Arc::clone(&sink)),
            ));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(forward_lines(
                err,
                StreamTag::Stderr,
                tx.clone(),
                Some(Arc::clone(&sink)),
            ));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        let mut slots = self.slots.lock();
        let slot = slots.get_mut(id).ok_or_else(|| Error::not_found(id))?;
        slot.generation += 1;
        slot.started_once = true;
        slot.exit_code = None;
        self.spawn_waiter(
            id.to_string(),
            slot.generation,
            child,
            readers,
            tx,
            kill_rx,
            exited_tx,
        );
        slot.run = Some(Run {
            pid,
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            kill: Some(kill_tx),
            exited: exited_rx,
            capture: Some(rx),
            sink,
        });

        tracing::info!(world = %id, pid = ?pid, port = spec.port, "Spawned server process");
        Ok(())
    }

    async fn stop(&self, handle: &Handle, mode: StopMode) -> Result<()> {
        let id = handle.world();
        let stdin = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(id).ok_or_else(|| Error::not_found(id))?;
            let run = slot.run.as_mut().ok_or_else(|| Error::not_running(id))?;

            match mode {
                StopMode::Forced => {
                    if let Some(kill) = run.kill.take() {
                        let _ = kill.send(());
                    }
                    tracing::info!(world = %id, pid = ?run.pid, "Forced stop requested");
                    return Ok(());
                },
                StopMode::Graceful { .. } => Arc::clone(&run.stdin),
            }
        };

        write_line(&stdin, &self.settings.stop_command)
            .await
            .map_err(|e| {
                Error::backend(id, Phase::Stop, format!("failed to send stop command: {e}"), "")
            })?;
        tracing::info!(world = %id, command = %self.settings.stop_command, "Graceful stop requested");
        Ok(())
    }

    async fn remove(&self, handle: &Handle) -> Result<()> {
        let id = handle.world();
        let exited = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(id).ok_or_else(|| Error::not_found(id))?;
            slot.run.as_mut().map(|run| {
                if let Some(kill) = run.kill.take() {
                    let _ = kill.send(());
                }
                run.exited.clone()
            })
        };

        if let Some(mut exited) = exited
            && tokio::time::timeout(REAP_TIMEOUT, exited.wait_for(|done| *done))
                .await
                .is_err()
        {
            tracing::warn!(world = %id, "Server process did not exit before removal");
        }

        self.slots.lock().remove(id);

        let path = self.log_path(id);
        if let Err(e) = tokio::task::spawn_blocking(move || logfile::remove_all(&path)).await {
            tracing::warn!(world = %id, error = %e, "Failed to delete world logs");
        }

        tracing::info!(world = %id, "Server slot removed");
        Ok(())
    }

    async fn tail_logs(&self, handle: &Handle, lines: usize) -> Result<String> {
        let id = handle.world();
        if !self.slots.lock().contains_key(id) {
            return Err(Error::not_found(id));
        }

        let path = self.log_path(id);
        let entries = tokio::task::spawn_blocking(move || logfile::tail_log(&path, lines))
            .await
            .map_err(|e| Error::Internal(format!("log reader panicked: {e}")))??;

        let mut text = String::new();
        for entry in &entries {
            text.push_str(logfile::parse_entry(entry).1);
            text.push('\n');
        }
        Ok(text)
    }

    /// The live capture holds every line since the process was spawned, so
    /// `tail` only replays lines written by earlier runs.
    async fn follow_logs(&self, handle: &Handle, tail: usize) -> Result<OutputCapture> {
        let id = handle.world();
        let (mut live, sink) = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(id).ok_or_else(|| Error::not_found(id))?;
            let run = slot.run.as_mut().ok_or_else(|| Error::not_running(id))?;
            let live = run.capture.take().ok_or_else(|| {
                Error::backend(id, Phase::Logs, "output is already being followed", "")
            })?;
            (live, Arc::clone(&run.sink))
        };

        if tail == 0 {
            return Ok(OutputCapture::new(live, Vec::new()));
        }

        let end = sink.lock().await.history_end();
        let path = self.log_path(id);
        // The live capture is already taken; a failed read only loses history.
        let history =
            tokio::task::spawn_blocking(move || logfile::tail_log_before(&path, end, tail))
                .await
                .map_err(|e| Error::Internal(format!("log reader panicked: {e}")))
                .and_then(std::convert::identity)
                .unwrap_or_else(|e| {
                    tracing::warn!(world = %id, error = %e, "Failed to read log history");
                    Vec::new()
                });

        let (tx, rx) = mpsc::channel(256);
        let relay = tokio::spawn(async move {
            for entry in history {
                let (stream, line) = logfile::parse_entry(&entry);
                let signal = BackendSignal::Output {
                    stream,
                    line: line.to_string(),
                };
                if tx.send(signal).await.is_err() {
                    return;
                }
            }
            while let Some(signal) = live.recv().await {
                if tx.send(signal).await.is_err() {
                    return;
                }
            }
        });

        Ok(OutputCapture::new(rx, vec![relay]))
    }

    async fn send_input(&self, handle: &Handle, line: &str) -> Result<()> {
        let id = handle.world();
        let stdin = {
            let slots = self.slots.lock();
            let slot = slots.get(id).ok_or_else(|| Error::not_found(id))?;
            let run = slot.run.as_ref().ok_or_else(|| Error::not_running(id))?;
            Arc::clone(&run.stdin)
        };

        write_line(&stdin, line).await.map_err(|e| {
            Error::backend(id, Phase::Input, format!("failed to write to console: {e}"), "")
        })?;
        tracing::debug!(world = %id, command = %line, "Sent console command");
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<DiscoveredInstance>> {
        // Children are killed with the daemon, nothing survives a restart.
        Ok(Vec::new())
    }
}
