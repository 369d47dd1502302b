//! Request and response types for the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::supervisor::{InstanceSnapshot, Status};
use crate::world::{AuthMode, BackupOptions, MemorySize, ProcessOptions};

// =============================================================================
// Envelope
// =============================================================================

/// Body shape shared by every JSON response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(rename = "missingFields", skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<&'static str>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
            code: None,
            detail: None,
            missing_fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl ApiResponse<()> {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
            code: None,
            detail: None,
            missing_fields: Vec::new(),
        }
    }
}

// =============================================================================
// World Types
// =============================================================================

/// Request to create a world.
///
/// Fields stay loosely typed so validation can report every missing or
/// malformed field instead of failing on the first one.
#[derive(Debug, Default, Deserialize)]
pub struct CreateWorldRequest {
    pub id: Option<serde_json::Value>,
    pub memory: Option<serde_json::Value>,
    pub cpus: Option<serde_json::Value>,
    pub port: Option<serde_json::Value>,
    /// Direct-process options; ignored by the container backend.
    #[serde(default)]
    pub process: Option<ProcessRequest>,
}

/// Direct-process options a client may set.
///
/// Host paths (`server_path`, `assets_path`, `backup.dir`) come from the
/// `[process]` configuration only; requests naming them are rejected.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessRequest {
    pub auth_mode: AuthMode,
    pub aot_cache: bool,
    pub disable_sentry: bool,
    pub backup: Option<BackupRequest>,
}

impl Default for ProcessRequest {
    fn default() -> Self {
        let defaults = ProcessOptions::default();
        Self {
            auth_mode: defaults.auth_mode,
            aot_cache: defaults.aot_cache,
            disable_sentry: defaults.disable_sentry,
            backup: None,
        }
    }
}

/// Backup schedule a client may request.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupRequest {
    pub frequency_minutes: u32,
}

impl Default for BackupRequest {
    fn default() -> Self {
        Self {
            frequency_minutes: BackupOptions::default().frequency_minutes,
        }
    }
}

impl From<ProcessRequest> for ProcessOptions {
    fn from(req: ProcessRequest) -> Self {
        Self {
            auth_mode: req.auth_mode,
            aot_cache: req.aot_cache,
            disable_sentry: req.disable_sentry,
            backup: req.backup.map(|backup| BackupOptions {
                dir: None,
                frequency_minutes: backup.frequency_minutes,
            }),
            ..Self::default()
        }
    }
}

/// A world as returned by the API.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldResponse {
    pub id: String,
    pub status: Status,
    pub backend: BackendKind,
    pub memory: MemorySize,
    pub cpus: u32,
    pub port: u16,
    pub resource: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub subscribers: usize,
}

impl From<InstanceSnapshot> for WorldResponse {
    fn from(world: InstanceSnapshot) -> Self {
        let uptime = world
            .started_at
            .filter(|_| world.status.is_live())
            .map(|started| format_uptime(Utc::now().signed_duration_since(started)));

        Self {
            id: world.id,
            status: world.status,
            backend: world.kind,
            memory: world.spec.memory,
            cpus: world.spec.cpus,
            port: world.spec.port,
            resource: world.resource,
            created_at: world.created_at,
            started_at: world.started_at,
            uptime,
            exit_code: world.exit_code,
            subscribers: world.subscribers,
        }
    }
}

/// Query parameters for `POST /worlds/{id}/stop`.
#[derive(Debug, Default, Deserialize)]
pub struct StopQuery {
    #[serde(default)]
    pub force: bool,
}

/// Request to send a console command.
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub command: String,
}

/// Query parameters for `GET /worlds/{id}/logs`.
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Raw value; parsed by validation so junk yields a 400.
    pub lines: Option<String>,
}

/// Query parameters for the live log stream.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub tail: Option<usize>,
}

/// Logs response.
#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub id: String,
    pub lines: usize,
    pub logs: Vec<String>,
}

/// Identifies the world an operation acted on.
#[derive(Debug, Serialize)]
pub struct WorldRef {
    pub id: String,
}

// =============================================================================
// Common Types
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub agent: &'static str,
    pub version: &'static str,
    pub backend: BackendKind,
    pub environment: &'static str,
    pub uptime: String,
    pub worlds: usize,
}

/// Format a duration as a short human-readable string (`1h 5m`).
pub fn format_uptime(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(chrono::Duration::seconds(30)), "30s");
        assert_eq!(format_uptime(chrono::Duration::seconds(90)), "1m 30s");
        assert_eq!(format_uptime(chrono::Duration::seconds(3660)), "1h 1m");
        assert_eq!(format_uptime(chrono::Duration::seconds(90000)), "1d 1h");
        assert_eq!(format_uptime(chrono::Duration::seconds(-5)), "0s");
    }

    #[test]
    fn test_envelope_omits_empty_fields() {
        let body = serde_json::to_value(ApiResponse::ok(WorldRef { id: "alpha".into() }))
            .unwrap();
        assert_eq!(body, serde_json::json!({ "success": true, "data": { "id": "alpha" } }));

        let body = serde_json::to_value(ApiResponse::failure("nope")).unwrap();
        assert_eq!(body, serde_json::json!({ "success": false, "message": "nope" }));
    }
}
