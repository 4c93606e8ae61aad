// Egress Model
// Process lifecycle state and the status/outcome types returned to the API layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the managed egress process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EgressState {
    Stopped,
    Starting,
    Running,
}

/// Transient record of the most recent spawn
///
/// Created on spawn, invalidated when the exit monitor observes the process
/// die. Never persisted; a supervisor restart loses it unless liveness is
/// re-derived from the pid file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHandle {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Snapshot of the controller state for the status endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressStatus {
    pub state: EgressState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub alive: bool,
}

/// What apply() did to the process after a successful render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyAction {
    Reloaded,
    Spawned,
}

/// Result of a successful apply, with the rendered text echoed back
/// for operator visibility
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub success: bool,
    pub action: ApplyAction,
    pub config: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}
