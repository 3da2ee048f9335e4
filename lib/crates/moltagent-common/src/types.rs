//! Runtime types shared between the control plane, the bridge, and the CLI.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ── VPS instances ─────────────────────────────────────────────────────────────

/// Common lifecycle states every provider maps its own states into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// A provider's view of a provisioned machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpsInstance {
    pub id: String,
    pub provider: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
    #[serde(rename = "serverType")]
    pub server_type: String,
    pub region: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    /// Opaque provider-specific extras (e.g. the docker host port).
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

// ── Status reports ────────────────────────────────────────────────────────────

/// Coarse worker lifecycle state as self-reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Busy,
    Idle,
    Error,
    ShuttingDown,
}

/// Worker-produced snapshot sent on the status interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: WorkerState,
    #[serde(rename = "activeTask", default)]
    pub active_task: Option<String>,
    #[serde(rename = "connectedChannels", default)]
    pub connected_channels: Vec<String>,
    #[serde(rename = "uptimeSecs", default)]
    pub uptime_secs: u64,
    #[serde(rename = "memoryMb", default)]
    pub memory_mb: f64,
    #[serde(rename = "cpuPercent", default)]
    pub cpu_percent: f64,
    #[serde(rename = "actionsToday", default)]
    pub actions_today: u64,
    #[serde(rename = "spendToday", default)]
    pub spend_today: f64,
    /// Progress fraction (0..=1) keyed by goal description.
    #[serde(rename = "goalProgress", default)]
    pub goal_progress: BTreeMap<String, f64>,
}

// ── Action log ────────────────────────────────────────────────────────────────

/// Category of a logged worker action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Browse,
    Execute,
    Message,
    ApiCall,
    Spend,
    File,
    Other,
}

/// One logged, categorized unit of work performed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    #[serde(default = "new_entry_id")]
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub category: ActionCategory,
    pub summary: String,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(rename = "durationMs", default)]
    pub duration_ms: Option<u64>,
}

fn new_entry_id() -> String {
    Uuid::new_v4().to_string()
}

impl ActionLogEntry {
    /// The USD amount of a spend entry, when present and numeric.
    #[must_use]
    pub fn spend_amount(&self) -> Option<f64> {
        if self.category != ActionCategory::Spend {
            return None;
        }
        self.details
            .as_ref()
            .and_then(|d| d.get("amount"))
            .and_then(Value::as_f64)
    }
}

// ── Approvals ─────────────────────────────────────────────────────────────────

/// What kind of permission the worker is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalCategory {
    Spend,
    Action,
    Access,
}

/// Lifecycle of an approval. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// The worker-side request carried inside an `approval_request` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    #[serde(default = "new_entry_id")]
    pub id: String,
    pub category: ApprovalCategory,
    pub description: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    /// When absent the control plane applies its default window.
    #[serde(rename = "expiresAt", default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A queued (or historical) human-gated request as the control plane sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: String,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub category: ApprovalCategory,
    pub description: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    pub state: ApprovalState,
    #[serde(rename = "respondedBy", default)]
    pub responded_by: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(rename = "respondedAt", default)]
    pub responded_at: Option<DateTime<Utc>>,
}

// ── Connection state ──────────────────────────────────────────────────────────

/// Last-known link state between the control plane and a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentConnection {
    Online,
    Offline,
    Unknown,
}
