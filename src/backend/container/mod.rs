//! Container engine backend.
//!
//! Each world is one container named `{prefix}-{id}`, created with resource
//! limits, a port mapping and a data volume under `worlds_path`. Labels on
//! the container record the spec so the registry can be rebuilt after a
//! daemon restart.

mod args;
mod runner;

pub use runner::{CommandRunner, EngineCli, EngineOutput};

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::capture::forward_lines;
use super::{
    BackendKind, BackendSignal, BackendStatus, DiscoveredInstance, Handle, OutputCapture,
    RuntimeBackend, StopMode,
};
use crate::broadcast::StreamTag;
use crate::config::{ContainerSettings, HycoreConfig};
use crate::error::{Error, Phase, Result};
use crate::world::WorldSpec;

/// How long to wait for the log follower to drain after the container exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Backend that hosts each world in a container.
pub struct ContainerBackend {
    settings: ContainerSettings,
    image: String,
    worlds_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl ContainerBackend {
    /// # Errors
    ///
    /// Returns a configuration error if no image is configured or no worlds
    /// directory can be determined.
    pub fn new(settings: ContainerSettings, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let image = settings.image.clone().ok_or_else(|| {
            Error::Config("container.image (or DOCKER_IMAGE) must be set".to_string())
        })?;
        let worlds_path = match &settings.worlds_path {
            Some(path) => path.clone(),
            None => HycoreConfig::home_dir()
                .map_err(|e| Error::Config(e.to_string()))?
                .join("worlds"),
        };

        Ok(Self {
            settings,
            image,
            worlds_path,
            runner,
        })
    }

    fn name(&self, id: &str) -> String {
        args::container_name(&self.settings.name_prefix, id)
    }

    /// Run an engine command, mapping failure to a backend error.
    async fn exec(&self, id: &str, phase: Phase, args: Vec<String>) -> Result<String> {
        let output = self.invoke(id, phase, &args, None).await?;
        if !output.success() {
            return Err(self.failure(id, phase, &output));
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn invoke(
        &self,
        id: &str,
        phase: Phase,
        args: &[String],
        input: Option<&str>,
    ) -> Result<EngineOutput> {
        tracing::debug!(
            world = %id,
            %phase,
            command = %args.first().map_or("", String::as_str),
            "Running engine command"
        );

        self.runner.run(args, input).await.map_err(|e| {
            Error::backend(
                id,
                phase,
                format!("failed to run {}: {e}", self.runner.program()),
                "",
            )
        })
    }

    fn failure(&self, id: &str, phase: Phase, output: &EngineOutput) -> Error {
        let code = output
            .code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        tracing::warn!(
            world = %id,
            %phase,
            exit_code = %code,
            stderr = %output.stderr.trim(),
            "Engine command failed"
        );
        Error::backend(
            id,
            phase,
            format!("{} exited with {code}", self.runner.program()),
            output.stderr.trim(),
        )
    }

    /// Current engine status; a missing container is an error.
    async fn require(&self, id: &str) -> Result<BackendStatus> {
        match self.status_of(id).await? {
            BackendStatus::NotFound => Err(Error::not_found(id)),
            status => Ok(status),
        }
    }
}

#[async_trait]
impl RuntimeBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let name = self.name(id);
        let stdout = self
            .exec(
                id,
                Phase::Inspect,
                vec![
                    "ps".into(),
                    "-a".into(),
                    "--filter".into(),
                    format!("name=^{name}$"),
                    "--format".into(),
                    "{{.Names}}".into(),
                ],
            )
            .await?;
        Ok(stdout.lines().any(|line| line.trim() == name))
    }

    async fn status_of(&self, id: &str) -> Result<BackendStatus> {
        let args = vec![
            "inspect".into(),
            "--format".into(),
            args::INSPECT_FORMAT.into(),
            self.name(id),
        ];
        let output = self.invoke(id, Phase::Inspect, &args, None).await?;
        if !output.success() {
            return Ok(BackendStatus::NotFound);
        }
        Ok(args::parse_inspect(&output.stdout))
    }

    async fn create(&self, spec: &WorldSpec) -> Result<Handle> {
        if self.exists(&spec.id).await? {
            return Err(Error::already_exists(&spec.id));
        }

        let args = args::create_args(&self.settings, &self.image, &self.worlds_path, spec);
        let container_id = self.exec(&spec.id, Phase::Create, args).await?;

        tracing::info!(
            world = %spec.id,
            container = %container_id.chars().take(12).collect::<String>(),
            image = %self.image,
            "Container created"
        );
        Ok(Handle::new(&spec.id, self.name(&spec.id)))
    }

    async fn start(&self, handle: &Handle) -> Result<()> {
        let id = handle.world();
        if self.require(id).await? == BackendStatus::Running {
            return Err(Error::already_running(id));
        }

        self.exec(id, Phase::Start, vec!["start".into(), handle.resource().into()])
            .await?;
        tracing::info!(world = %id, "Container started");
        Ok(())
    }

    async fn stop(&self, handle: &Handle, mode: StopMode) -> Result<()> {
        let id = handle.world();
        if self.require(id).await? != BackendStatus::Running {
            return Err(Error::not_running(id));
        }

        let args = match mode {
            StopMode::Graceful { timeout } => vec![
                "stop".into(),
                "--time".into(),
                timeout.as_secs().to_string(),
                handle.resource().into(),
            ],
            StopMode::Forced => vec!["kill".into(), handle.resource().into()],
        };
        self.exec(id, Phase::Stop, args).await?;
        tracing::info!(world = %id, ?mode, "Container stop issued");
        Ok(())
    }

    async fn remove(&self, handle: &Handle) -> Result<()> {
        let id = handle.world();
        if self.require(id).await? == BackendStatus::Running {
            self.exec(id, Phase::Remove, vec!["stop".into(), handle.resource().into()])
                .await?;
        }

        self.exec(id, Phase::Remove, vec!["rm".into(), handle.resource().into()])
            .await?;
        tracing::info!(world = %id, "Container removed");
        Ok(())
    }

    async fn tail_logs(&self, handle: &Handle, lines: usize) -> Result<String> {
        let id = handle.world();
        self.require(id).await?;

        let args = args::tail_args(handle.resource(), lines);
        let output = self.invoke(id, Phase::Logs, &args, None).await?;
        if !output.success() {
            return Err(self.failure(id, Phase::Logs, &output));
        }

        // The engine replays the container's stderr on its own stderr.
        Ok(args::merge_timestamped(&output.stdout, &output.stderr, lines))
    }

    async fn follow_logs(&self, handle: &Handle, tail: usize) -> Result<OutputCapture> {
        let id = handle.world().to_string();
        let name = handle.resource().to_string();

        let mut child = self
            .runner
            .spawn(&[
                "logs".into(),
                "--follow".into(),
                "--tail".into(),
                tail.to_string(),
                name.clone(),
            ])
            .map_err(|e| {
                Error::backend(&id, Phase::Logs, format!("failed to follow logs: {e}"), "")
            })?;

        let (tx, rx) = mpsc::channel(256);
        let stdout = child
            .stdout
            .take()
            .map(|out| forward_lines(out, StreamTag::Stdout, tx.clone(), None));
        let stderr = child
            .stderr
            .take()
            .map(|err| forward_lines(err, StreamTag::Stderr, tx.clone(), None));

        let runner = Arc::clone(&self.runner);
        let watcher = tokio::spawn(async move {
            // Owns the follower so aborting this task kills it.
            let _child = child;

            let code = match runner.run(&["wait".into(), name], None).await {
                Ok(output) if output.success() => args::parse_exit_code(&output.stdout),
                Ok(output) => {
                    tracing::warn!(world = %id, stderr = %output.stderr.trim(), "Engine wait failed");
                    None
                },
                Err(e) => {
                    tracing::warn!(world = %id, error = %e, "Engine wait failed");
                    None
                },
            };

            for reader in [stdout, stderr].into_iter().flatten() {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
            }
            let _ = tx.send(BackendSignal::Exited { code }).await;
        });

        Ok(OutputCapture::new(rx, vec![watcher]))
    }

    async fn send_input(&self, handle: &Handle, line: &str) -> Result<()> {
        let id = handle.world();
        if self.require(id).await? != BackendStatus::Running {
            return Err(Error::not_running(id));
        }

        // Write to the console of the container's main process.
        let args = vec![
            "exec".into(),
            "-i".into(),
            handle.resource().into(),
            "sh".into(),
            "-c".into(),
            "cat > /proc/1/fd/0".into(),
        ];
        let input = format!("{line}\n");
        let output = self.invoke(id, Phase::Input, &args, Some(&input)).await?;
        if !output.success() {
            return Err(self.failure(id, Phase::Input, &output));
        }
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<DiscoveredInstance>> {
        let stdout = self.exec("*", Phase::Discover, args::discover_args()).await?;

        let mut found = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let Some(spec) = args::parse_discovered(line) else {
                tracing::warn!(line = %line, "Skipping container with unreadable labels");
                continue;
            };
            let status = self.status_of(&spec.id).await?;
            let handle = Handle::new(&spec.id, self.name(&spec.id));
            found.push(DiscoveredInstance {
                spec,
                handle,
                status,
            });
        }
        Ok(found)
    }
}
