//! World definitions: the immutable configuration snapshot a world is created
//! with.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Memory amount, stored in mebibytes.
///
/// Parses `512M`, `4G`, `4g`, `2048` (bare numbers are mebibytes) and
/// displays in the largest whole unit, which both `docker --memory` and the
/// JVM heap flags accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib)
    }

    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * 1024)
    }

    pub const fn as_mib(self) -> u64 {
        self.0
    }

    /// Half of this amount, never below 1 MiB. Used for the initial heap.
    #[must_use]
    pub const fn half(self) -> Self {
        if self.0 < 2 { Self(1) } else { Self(self.0 / 2) }
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{}G", self.0 / 1024)
        } else {
            write!(f, "{}M", self.0)
        }
    }
}

impl FromStr for MemorySize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("memory must not be empty".to_string());
        }

        let (digits, multiplier) = match s.as_bytes()[s.len() - 1].to_ascii_uppercase() {
            b'G' => (&s[..s.len() - 1], 1024),
            b'M' => (&s[..s.len() - 1], 1),
            _ => (s, 1),
        };

        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid memory size '{s}' (expected e.g. 512M or 4G)"))?;
        if value == 0 {
            return Err("memory must be greater than zero".to_string());
        }

        value
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| format!("memory size '{s}' is too large"))
    }
}

impl Serialize for MemorySize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MemorySize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Server authentication mode passed as `--auth-mode`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Authenticated,
    Offline,
}

impl AuthMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authenticated => "authenticated",
            Self::Offline => "offline",
        }
    }
}

/// Automatic world backups performed by the server itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_backup_frequency")]
    pub frequency_minutes: u32,
}

const fn default_backup_frequency() -> u32 {
    30
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            dir: None,
            frequency_minutes: default_backup_frequency(),
        }
    }
}

/// Options only the direct-process backend reads. Paths fall back to the
/// `[process]` configuration when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets_path: Option<PathBuf>,
    pub auth_mode: AuthMode,
    /// Use `HytaleServer.aot` when it exists next to the jar.
    pub aot_cache: bool,
    pub disable_sentry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupOptions>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            server_path: None,
            assets_path: None,
            auth_mode: AuthMode::Authenticated,
            aot_cache: true,
            disable_sentry: false,
            backup: None,
        }
    }
}

/// Configuration snapshot taken when a world is created. Immutable; changing
/// it means delete and recreate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSpec {
    pub id: String,
    pub memory: MemorySize,
    pub cpus: u32,
    pub port: u16,
    #[serde(default)]
    pub process: ProcessOptions,
}

impl WorldSpec {
    pub fn new(id: impl Into<String>, memory: MemorySize, cpus: u32, port: u16) -> Self {
        Self {
            id: id.into(),
            memory,
            cpus,
            port,
            process: ProcessOptions::default(),
        }
    }
}

/// Check that an id is usable as part of a container name and a file name.
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.trim().is_empty() {
        return Err("id must be a non-empty string".to_string());
    }
    if id.len() > 64 {
        return Err("id must be at most 64 characters".to_string());
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("id may only contain letters, digits, '-', '_' and '.'".to_string());
    }
    if id.starts_with('.') || id.starts_with('-') {
        return Err("id must start with a letter, digit or '_'".to_string());
    }
    Ok(())
}
