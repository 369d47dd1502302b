//! hycore - World instance supervisor.
//!
//! Runs the REST API that creates, starts, stops and deletes game-server
//! worlds, backed by a container engine or by direct child processes.
//!
//! See `hycore --help` for usage information.

// Use mimalloc for better multi-core performance (especially important for musl builds)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Generator, Shell};
use std::path::PathBuf;
use std::sync::Arc;

use hycore::backend::BackendKind;
use hycore::config::HycoreConfig;
use hycore::logging::{LogConfig, init_logging};
use hycore::supervisor::Supervisor;

const AFTER_HELP: &str = "\
EXAMPLES:
  hycore serve                          Serve on port 3000 with ~/.hycore/config.toml
  hycore serve --backend process        Run worlds as local java processes
  hycore serve --config ./hycore.toml   Use an explicit config file
  hycore check-config                   Validate configuration and exit

ENVIRONMENT:
  HYCORE_PORT / PORT, WORLDS_PATH, DOCKER_IMAGE, HYCORE_ENV / NODE_ENV,
  LOG_LEVEL, HYCORE_BACKEND, RUST_LOG";

#[derive(Parser)]
#[command(name = "hycore")]
#[command(version)]
#[command(about = "hycore - lifecycle supervisor for game-server worlds")]
#[command(after_help = AFTER_HELP)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    ///
    /// Recovers worlds the backend still holds, then serves until Ctrl+C or
    /// SIGTERM.
    Serve {
        /// Config file (default: ~/.hycore/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Port for the HTTP API (overrides config and environment)
        #[arg(short, long)]
        port: Option<u16>,
        /// Runtime backend: container or process
        #[arg(short, long)]
        backend: Option<BackendKind>,
    },
    /// Load and validate configuration, then print it
    CheckConfig {
        /// Config file (default: ~/.hycore/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Generate shell completions
    ///
    /// Examples:
    ///   hycore completions bash > ~/.bash_completion.d/hycore
    ///   hycore completions zsh > ~/.zfunc/_hycore
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            backend,
        } => serve(config, port, backend).await,
        Commands::CheckConfig { config } => {
            let config = HycoreConfig::load(config.as_deref())?;
            println!("{config:#?}");
            Ok(())
        },
        Commands::Completions { shell } => {
            print_completions(shell, &mut Cli::command());
            Ok(())
        },
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    backend: Option<BackendKind>,
) -> Result<()> {
    let mut config = HycoreConfig::load(config_path.as_deref())?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(backend) = backend {
        config.runtime.backend = backend;
    }
    config.validate()?;

    init_logging(&LogConfig::from_settings(
        &config.logging.level,
        config.logging.format,
    ));
    hycore::metrics::init_metrics().context("Failed to install metrics recorder")?;

    let supervisor =
        Arc::new(Supervisor::from_config(&config).context("Failed to initialize runtime backend")?);

    match supervisor.recover().await {
        Ok(0) => tracing::debug!("No existing worlds to recover"),
        Ok(count) => tracing::info!(count, "Recovered existing worlds"),
        Err(e) => tracing::warn!(error = %e, "World recovery failed, starting empty"),
    }

    hycore::http::serve(&config, supervisor).await
}

fn print_completions<G: Generator>(generator: G, cmd: &mut clap::Command) {
    clap_complete::generate(
        generator,
        cmd,
        cmd.get_name().to_string(),
        &mut std::io::stdout(),
    );
}
