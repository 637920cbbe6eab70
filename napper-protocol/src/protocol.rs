use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Service name reported by the health-probe endpoints.
pub const SERVICE_NAME: &str = "kamal-napper";

/// Action requested through the control endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Bring a stopped application back up
    Wake,
    /// Force an active application down the stop path
    Sleep,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wake => "wake",
            Self::Sleep => "sleep",
        }
    }
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request body for `POST /control`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub host: String,
    pub action: ControlAction,
}

/// Response body for `POST /control`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub hostname: String,
    pub action: ControlAction,
    pub message: String,
}

/// Per-application summary inside a status snapshot.
///
/// `state` is the lifecycle tag as a lowercase string; clients treat it as
/// opaque beyond the five known values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSummary {
    pub state: String,
    pub state_changed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_started_at: Option<DateTime<Utc>>,
    /// Seconds elapsed since the last transition
    pub seconds_in_state: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_reason: Option<String>,
}

/// Snapshot returned by `GET /status`.
///
/// This is a deep copy taken under the supervisor's lock; it never aliases
/// live daemon state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub app_count: usize,
    /// Control-loop tick interval in seconds
    pub poll_interval: u64,
    pub apps: HashMap<String, AppSummary>,
}

/// Response body for `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn ok(version: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            status: "ok".to_string(),
            service: SERVICE_NAME.to_string(),
            version: version.to_string(),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests;
