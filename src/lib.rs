// =============================================================================
// Lint Configuration
// =============================================================================

#![deny(unsafe_code)]
// Correctness: Must handle all fallible operations
#![deny(unused_must_use)]
// Quality: Pedantic but pragmatic
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(rust_2018_idioms)]
#![allow(missing_debug_implementations)] // Supervisor holds trait objects without Debug

// Allowed with documented reasons
#![allow(clippy::missing_errors_doc)] // Error returns self-documenting via type
#![allow(clippy::missing_panics_doc)] // Panics documented in main entry points
#![allow(clippy::module_name_repetitions)] // e.g., backend::BackendKind is clearer
#![allow(clippy::doc_markdown)] // Too many false positives in code docs
#![allow(clippy::must_use_candidate)] // Not all returned values need annotation

//! hycore - lifecycle supervisor for game-server worlds.
//!
//! A world is one game-server instance. hycore creates, starts, stops and
//! deletes worlds on behalf of a REST API and streams their console output.
//! Each world runs either in a container (driven through the `docker` CLI)
//! or as a directly spawned `java -jar HytaleServer.jar` process.
//!
//! # Example
//!
//! ```no_run
//! use hycore::config::HycoreConfig;
//! use hycore::supervisor::Supervisor;
//! use hycore::world::{MemorySize, WorldSpec};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = HycoreConfig::load(None)?;
//! let supervisor = Arc::new(Supervisor::from_config(&config)?);
//!
//! supervisor
//!     .create(WorldSpec::new("alpha", MemorySize::from_gib(4), 2, 25565))
//!     .await?;
//! supervisor.start("alpha").await?;
//! # Ok(())
//! # }
//! ```

/// Runtime backends: the container engine CLI and direct child processes.
pub mod backend;

/// Per-world log buffer and subscriber fan-out.
pub mod broadcast;

/// Configuration file and environment overrides.
pub mod config;

/// Error taxonomy with symbolic API codes.
pub mod error;

/// REST API and server-sent event streams.
pub mod http;

/// Tracing subscriber setup.
pub mod logging;

/// Prometheus metrics.
pub mod metrics;

/// Lifecycle state machine, registry and per-id serialization.
pub mod supervisor;

/// World specifications.
pub mod world;

pub use error::{Error, Result};
