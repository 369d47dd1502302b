//! Global hycore configuration.
//!
//! Loads settings from `~/.hycore/config.toml` (or an explicit path) and then
//! applies environment overrides, so container deployments can be configured
//! without a file.
//!
//! # Example Configuration
//!
//! ```toml
//! environment = "production"
//!
//! [server]
//! port = 3000
//!
//! [runtime]
//! backend = "container"
//! stop_timeout_secs = 30
//!
//! [container]
//! image = "hytale/server:latest"
//! worlds_path = "/srv/worlds"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::BackendKind;
use crate::logging::LogFormat;

/// Deployment environment. Controls how much diagnostic detail leaks into
/// API error responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    /// Parse an environment name, accepting the common short forms.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }

    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HycoreConfig {
    /// HTTP API settings.
    pub server: ServerSettings,
    /// Supervisor settings shared by both backends.
    pub runtime: RuntimeSettings,
    /// Container engine backend settings.
    pub container: ContainerSettings,
    /// Direct-process backend settings.
    pub process: ProcessSettings,
    /// Deployment environment.
    pub environment: Environment,
    /// Logging output.
    pub logging: LoggingSettings,
}

/// HTTP API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Supervisor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Which backend hosts worlds.
    pub backend: BackendKind,
    /// Deadline for a graceful stop before forced termination.
    pub stop_timeout_secs: u64,
    /// How long to wait for exit confirmation after a forced termination.
    pub kill_grace_secs: u64,
    /// Lines kept per world in the in-memory log buffer.
    pub log_buffer_lines: usize,
    /// Engine state polling interval while a container is starting.
    pub readiness_poll_millis: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Container,
            stop_timeout_secs: 30,
            kill_grace_secs: 5,
            log_buffer_lines: 1000,
            readiness_poll_millis: 1000,
        }
    }
}

impl RuntimeSettings {
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub const fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub const fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_millis)
    }
}

/// Container engine backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Engine CLI executable.
    pub engine: String,
    /// Image every world container runs.
    pub image: Option<String>,
    /// Host directory holding one data directory per world.
    pub worlds_path: Option<PathBuf>,
    /// Port the game server listens on inside the container.
    pub container_port: u16,
    pub restart_policy: String,
    pub name_prefix: String,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            engine: "docker".to_string(),
            image: None,
            worlds_path: None,
            container_port: 25565,
            restart_policy: "unless-stopped".to_string(),
            name_prefix: "hycore-world".to_string(),
        }
    }
}

/// Direct-process backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Java executable used to launch the server jar.
    pub java: PathBuf,
    /// Default directory containing `HytaleServer.jar`.
    pub server_path: Option<PathBuf>,
    /// Default assets path.
    pub assets_path: Option<PathBuf>,
    pub bind_host: String,
    /// Directory for per-world output logs. Defaults to `~/.hycore/logs`.
    pub logs_dir: Option<PathBuf>,
    /// Console command that asks the server to shut down.
    pub stop_command: String,
    /// Output substrings that confirm the server finished starting.
    pub running_markers: Vec<String>,
    /// Output substrings that confirm the server authenticated.
    pub authenticated_markers: Vec<String>,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            java: PathBuf::from("java"),
            server_path: None,
            assets_path: None,
            bind_host: "0.0.0.0".to_string(),
            logs_dir: None,
            stop_command: "/stop".to_string(),
            running_markers: vec!["Server started".to_string(), "Done".to_string()],
            authenticated_markers: vec!["Authentication successful".to_string()],
        }
    }
}

impl ProcessSettings {
    /// Resolve the log directory, falling back to `~/.hycore/logs`.
    pub fn resolved_logs_dir(&self) -> Result<PathBuf> {
        match &self.logs_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(HycoreConfig::home_dir()?.join("logs")),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl HycoreConfig {
    /// Load configuration from `path`, or from `~/.hycore/config.toml` when
    /// no path is given, then apply environment overrides.
    ///
    /// A missing default file yields defaults. A missing explicit file or an
    /// invalid file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::config_path()?;
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    tracing::debug!(
                        path = %default_path.display(),
                        "Config file not found, using defaults"
                    );
                    Self::default()
                }
            },
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;

        tracing::info!(
            backend = %config.runtime.backend,
            port = config.server.port,
            environment = ?config.environment,
            "Loaded configuration"
        );

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Apply environment overrides. `lookup` is injectable for tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let port = lookup("HYCORE_PORT").or_else(|| lookup("PORT"));
        if let Some(port) = port.and_then(|p| p.trim().parse().ok()) {
            self.server.port = port;
        }
        if let Some(path) = lookup("WORLDS_PATH").filter(|p| !p.is_empty()) {
            self.container.worlds_path = Some(PathBuf::from(path));
        }
        if let Some(image) = lookup("DOCKER_IMAGE").filter(|i| !i.is_empty()) {
            self.container.image = Some(image);
        }
        let env = lookup("HYCORE_ENV").or_else(|| lookup("NODE_ENV"));
        if let Some(env) = env.as_deref().and_then(Environment::parse) {
            self.environment = env;
        }
        if let Some(level) = lookup("LOG_LEVEL").filter(|l| !l.is_empty()) {
            self.logging.level = level;
        }
        if let Some(kind) = lookup("HYCORE_BACKEND").and_then(|b| b.parse().ok()) {
            self.runtime.backend = kind;
        }
    }

    /// Check cross-field requirements for the selected backend.
    pub fn validate(&self) -> Result<()> {
        if self.runtime.log_buffer_lines == 0 {
            anyhow::bail!("runtime.log_buffer_lines must be at least 1");
        }

        match self.runtime.backend {
            BackendKind::Container => {
                if self.environment.is_production() {
                    let mut missing = Vec::new();
                    if self.container.worlds_path.is_none() {
                        missing.push("WORLDS_PATH");
                    }
                    if self.container.image.is_none() {
                        missing.push("DOCKER_IMAGE");
                    }
                    if !missing.is_empty() {
                        anyhow::bail!(
                            "Missing required settings for production: {}",
                            missing.join(", ")
                        );
                    }
                }
            },
            BackendKind::Process => {
                if self.process.server_path.is_none() || self.process.assets_path.is_none() {
                    anyhow::bail!(
                        "process backend requires process.server_path and process.assets_path"
                    );
                }
            },
        }

        Ok(())
    }

    /// `~/.hycore`
    pub fn home_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".hycore"))
    }

    /// Get the path to the default configuration file.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("config.toml"))
    }
}
