//! Error types for world lifecycle operations.
//!
//! Conflicts and not-found conditions are expected outcomes that callers
//! recover from; they carry a stable symbolic code that the HTTP layer
//! surfaces verbatim. Backend failures keep the instance id, the lifecycle
//! phase and whatever diagnostic output the engine or process produced.

use std::fmt;

/// Result type for supervisor and backend operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle phase a backend failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
    Logs,
    Input,
    Discover,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Remove => "remove",
            Self::Inspect => "inspect",
            Self::Logs => "logs",
            Self::Input => "input",
            Self::Discover => "discover",
        };
        f.write_str(name)
    }
}

/// World lifecycle errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No world with this id is known.
    #[error("World '{id}' does not exist")]
    NotFound { id: String },

    /// A world with this id already exists.
    #[error("World '{id}' already exists")]
    AlreadyExists { id: String },

    /// The world is already running (or on its way up).
    #[error("World '{id}' is already running")]
    AlreadyRunning { id: String },

    /// The world is not running.
    #[error("World '{id}' is not running")]
    NotRunning { id: String },

    /// Request failed validation.
    #[error("{0}")]
    InvalidRequest(String),

    /// Backend command or process failed.
    #[error("{phase} failed for world '{id}': {message}")]
    Backend {
        id: String,
        phase: Phase,
        message: String,
        /// Captured stderr or other diagnostic output.
        output: String,
    },

    /// Graceful stop exceeded its deadline.
    #[error("world '{id}' did not stop within {timeout_secs}s")]
    Timeout { id: String, timeout_secs: u64 },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error with context.
    #[error("IO error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create an already exists error.
    pub fn already_exists(id: impl Into<String>) -> Self {
        Self::AlreadyExists { id: id.into() }
    }

    /// Create an already running error.
    pub fn already_running(id: impl Into<String>) -> Self {
        Self::AlreadyRunning { id: id.into() }
    }

    /// Create a not running error.
    pub fn not_running(id: impl Into<String>) -> Self {
        Self::NotRunning { id: id.into() }
    }

    /// Create a backend execution failure.
    pub fn backend(
        id: impl Into<String>,
        phase: Phase,
        message: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::Backend {
            id: id.into(),
            phase,
            message: message.into(),
            output: output.into(),
        }
    }

    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Symbolic code surfaced to API callers, if this error has one.
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::NotFound { .. } => Some("WORLD_NOT_FOUND"),
            Self::AlreadyExists { .. } => Some("WORLD_ALREADY_EXISTS"),
            Self::AlreadyRunning { .. } => Some("WORLD_ALREADY_RUNNING"),
            Self::NotRunning { .. } => Some("WORLD_NOT_RUNNING"),
            Self::InvalidRequest(_) => Some("INVALID_REQUEST"),
            _ => None,
        }
    }

    /// Get the appropriate HTTP status code for this error.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::AlreadyExists { .. } | Self::AlreadyRunning { .. } | Self::NotRunning { .. } => {
                409
            },
            Self::InvalidRequest(_) => 400,
            Self::Backend { .. }
            | Self::Timeout { .. }
            | Self::Config(_)
            | Self::Io { .. }
            | Self::Internal(_) => 500,
        }
    }

    /// Diagnostic output attached to the error, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Backend { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }

    /// Whether the caller can recover by changing its request.
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists { .. } | Self::AlreadyRunning { .. } | Self::NotRunning { .. }
        )
    }
}
