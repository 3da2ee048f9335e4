//! Wire protocol between workers and the control plane.
//!
//! Messages are newline-free JSON objects, one per WebSocket text frame,
//! discriminated by a top-level `type` tag. Unknown tags and malformed
//! frames are dropped silently by both peers; the wire is untrusted
//! against bugs, not against adversaries beyond the auth boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manifest::{Goal, InlineDocument};
use crate::types::{ActionLogEntry, ApprovalRequest, StatusReport};

/// Close code sent to a session displaced by a newer connection.
pub const CLOSE_REPLACED: u16 = 4000;
/// Reason string accompanying [`CLOSE_REPLACED`].
pub const CLOSE_REPLACED_REASON: &str = "Replaced by new connection";
/// Close code sent to every session on server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Frames sent by a worker to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Heartbeat {
        #[serde(rename = "agentId")]
        agent_id: String,
        timestamp: DateTime<Utc>,
        #[serde(rename = "uptimeSecs")]
        uptime_secs: u64,
    },
    Status {
        #[serde(rename = "agentId")]
        agent_id: String,
        report: StatusReport,
    },
    Action {
        #[serde(rename = "agentId")]
        agent_id: String,
        entry: ActionLogEntry,
    },
    ApprovalRequest {
        #[serde(rename = "agentId")]
        agent_id: String,
        request: ApprovalRequest,
    },
    Error {
        #[serde(rename = "agentId")]
        agent_id: String,
        message: String,
    },
}

/// Frames sent by the control plane to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlaneMessage {
    /// Partial manifest overlay; the worker merges what it understands.
    UpdateConfig { config: Value },
    UpdateGoals { goals: Vec<Goal> },
    InjectKnowledge { documents: Vec<InlineDocument> },
    SendMessage {
        content: String,
        #[serde(default)]
        channel: Option<String>,
    },
    ApprovalResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        approved: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    Restart,
    Shutdown,
    Ping,
}

impl WorkerMessage {
    /// Decode a text frame; `None` means "drop silently".
    #[must_use]
    pub fn from_frame(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Encode into a single text frame.
    #[must_use]
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// The agent id every worker frame carries.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        match self {
            Self::Heartbeat { agent_id, .. }
            | Self::Status { agent_id, .. }
            | Self::Action { agent_id, .. }
            | Self::ApprovalRequest { agent_id, .. }
            | Self::Error { agent_id, .. } => agent_id,
        }
    }
}

impl PlaneMessage {
    /// Decode a text frame; `None` means "drop silently".
    #[must_use]
    pub fn from_frame(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Encode into a single text frame.
    #[must_use]
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
