use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Lifecycle status shared by the in-memory registry, the persisted tool record, and
/// published `tool_status` events. `Compiling` and `Active` only ever appear on the
/// persisted record; registry entries use the remaining variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Compiling,
    Active,
    Starting,
    Running,
    Stopped,
    Error,
    Crashed,
}

impl ToolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compiling => "compiling",
            Self::Active => "active",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Crashed => "crashed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "compiling" => Some(Self::Compiling),
            "active" => Some(Self::Active),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            "crashed" => Some(Self::Crashed),
            _ => None,
        }
    }

    /// A live status owns an OS process (or is about to).
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one registry entry, safe to hand out to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolRuntimeStatus {
    pub tool_id: String,
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolRuntimeStatus {
    pub fn stopped(tool_id: &str) -> Self {
        Self {
            tool_id: tool_id.to_owned(),
            status: ToolStatus::Stopped,
            port: None,
            pid: None,
            started_at_ms: None,
            restarts: 0,
            error: None,
        }
    }
}

/// Outcome of [`crate::supervisor::ToolManager::start_all`].
#[derive(Debug, Default, Clone)]
pub struct StartAllReport {
    /// Tools that were compiled because no binary was present
    pub compiled: Vec<String>,
    /// Tools that were started
    pub started: Vec<String>,
    /// Tools that failed to build or start, with the failure message
    pub failed: Vec<(String, String)>,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_round_trips_through_as_str() {
        for status in [
            ToolStatus::Compiling,
            ToolStatus::Active,
            ToolStatus::Starting,
            ToolStatus::Running,
            ToolStatus::Stopped,
            ToolStatus::Error,
            ToolStatus::Crashed,
        ] {
            assert_eq!(ToolStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ToolStatus::parse(" RUNNING "), Some(ToolStatus::Running));
        assert_eq!(ToolStatus::parse("paused"), None);
    }

    #[test]
    fn stopped_snapshot_serializes_without_runtime_fields() {
        let value = serde_json::to_value(ToolRuntimeStatus::stopped("weather")).expect("json");
        assert_eq!(
            value,
            serde_json::json!({"tool_id": "weather", "status": "stopped", "restarts": 0})
        );
    }
}
