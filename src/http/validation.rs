//! Request validation, run before anything reaches the supervisor.

use serde_json::Value;

use super::types::CreateWorldRequest;
use crate::supervisor::MAX_LOG_LINES;
use crate::world::{MemorySize, WorldSpec, validate_id};

/// Lines returned by `GET /worlds/{id}/logs` when none are requested.
pub const DEFAULT_LOG_LINES: usize = 100;

const MIN_PORT: u64 = 1024;
const MAX_PORT: u64 = 65535;

/// Why a request was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
    /// Required fields absent from the request, all of them.
    pub missing: Vec<&'static str>,
}

impl ValidationError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            missing: Vec::new(),
        }
    }
}

fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Validate a create request and build the world spec from it.
pub fn create_request(req: CreateWorldRequest) -> Result<WorldSpec, ValidationError> {
    let missing: Vec<&'static str> = [
        ("id", &req.id),
        ("memory", &req.memory),
        ("cpus", &req.cpus),
        ("port", &req.port),
    ]
    .into_iter()
    .filter(|(_, value)| is_missing(value.as_ref()))
    .map(|(name, _)| name)
    .collect();

    if !missing.is_empty() {
        return Err(ValidationError {
            message: format!("Missing required fields: {}", missing.join(", ")),
            missing,
        });
    }

    let id = match &req.id {
        Some(Value::String(id)) => id.trim().to_string(),
        _ => return Err(ValidationError::invalid("Invalid id: must be a non-empty string")),
    };
    validate_id(&id).map_err(|e| ValidationError::invalid(format!("Invalid id: {e}")))?;

    let port = req
        .port
        .as_ref()
        .and_then(Value::as_u64)
        .filter(|port| (MIN_PORT..=MAX_PORT).contains(port))
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| {
            ValidationError::invalid(format!(
                "Invalid port: must be an integer between {MIN_PORT} and {MAX_PORT}"
            ))
        })?;

    let cpus = req
        .cpus
        .as_ref()
        .and_then(Value::as_u64)
        .filter(|cpus| *cpus >= 1)
        .and_then(|cpus| u32::try_from(cpus).ok())
        .ok_or_else(|| ValidationError::invalid("Invalid cpus: must be a positive integer"))?;

    let memory = match &req.memory {
        Some(Value::String(raw)) => raw.parse::<MemorySize>(),
        Some(Value::Number(n)) => n.to_string().parse::<MemorySize>(),
        _ => Err("expected a size such as 4G or 512M".to_string()),
    }
    .map_err(|e| ValidationError::invalid(format!("Invalid memory: {e}")))?;

    let mut spec = WorldSpec::new(id, memory, cpus, port);
    if let Some(process) = req.process {
        spec.process = process.into();
    }
    Ok(spec)
}

/// Check a world id taken from the path.
pub fn world_id(id: &str) -> Result<&str, ValidationError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ValidationError::invalid("World id is required"));
    }
    Ok(id)
}

/// Parse the `lines` query parameter, defaulting to 100.
pub fn log_lines(raw: Option<&str>) -> Result<usize, ValidationError> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_LOG_LINES);
    };
    raw.trim()
        .parse::<usize>()
        .ok()
        .filter(|lines| (1..=MAX_LOG_LINES).contains(lines))
        .ok_or_else(|| {
            ValidationError::invalid(format!(
                "Invalid lines: must be between 1 and {MAX_LOG_LINES}"
            ))
        })
}

/// Check a console command.
pub fn command(command: &str) -> Result<&str, ValidationError> {
    let command = command.trim();
    if command.is_empty() {
        return Err(ValidationError::invalid("Command is required"));
    }
    Ok(command)
}
