//! Log events delivered to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which stream a line came from. `Info` marks lines hycore itself emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTag {
    Stdout,
    Stderr,
    Info,
}

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Info => "info",
        })
    }
}

/// One captured output line. Serialized as `{timestamp, type, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub stream: StreamTag,
    #[serde(rename = "message")]
    pub text: String,
}

impl LogEvent {
    pub fn new(stream: StreamTag, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            text: text.into(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(StreamTag::Info, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let event = LogEvent::new(StreamTag::Stderr, "boom");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stderr");
        assert_eq!(json["message"], "boom");
        assert!(json["timestamp"].is_string());
    }
}
