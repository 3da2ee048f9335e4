//! Agent manifest (`manifest.json`).
//!
//! The manifest is the immutable root document describing a deployable
//! worker. Every field has a default so partial inputs still yield a
//! complete manifest; unknown top-level keys are preserved in `metadata`.
//! Validation here is purely structural — semantic coherence (e.g. a
//! wallet being present when crypto channels are enabled) is a documented
//! precondition of the consumers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Current manifest schema version. Readers reject anything else.
pub const SCHEMA_VERSION: u32 = 1;

/// Top-level manifest keys. Anything else is folded into `metadata`.
const KNOWN_KEYS: &[&str] = &[
    "schemaVersion",
    "identity",
    "agentConfig",
    "capabilities",
    "channels",
    "resources",
    "financialControls",
    "controlPlane",
    "retention",
    "goals",
    "knowledge",
    "metadata",
];

/// Declarative description of a deployable worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion", default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub identity: Identity,
    #[serde(rename = "agentConfig", default)]
    pub agent_config: AgentConfig,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(rename = "financialControls", default)]
    pub financial_controls: FinancialControls,
    #[serde(rename = "controlPlane", default)]
    pub control_plane: ControlPlane,
    #[serde(default)]
    pub retention: Retention,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default)]
    pub knowledge: Knowledge,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Who the agent is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(rename = "ownerId", default)]
    pub owner_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_agent_name() -> String {
    "agent".to_string()
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: default_agent_name(),
            owner_id: String::new(),
            tags: Vec::new(),
            avatar: None,
            description: None,
        }
    }
}

/// Model and prompt configuration for the worker's reasoning runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(rename = "systemPrompt", default)]
    pub system_prompt: String,
    #[serde(default = "default_model_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(rename = "maxTokens", default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

fn default_model_provider() -> String {
    "anthropic".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            provider: default_model_provider(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            skills: Vec::new(),
            tools: Vec::new(),
        }
    }
}

/// Inline tool descriptor passed through to the reasoning runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Feature flags plus the software the bootstrap script must install.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(rename = "webBrowsing", default)]
    pub web_browsing: bool,
    #[serde(rename = "codeExecution", default)]
    pub code_execution: bool,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub filesystem: bool,
    #[serde(rename = "gitRepos", default)]
    pub git_repos: Vec<GitRepo>,
    #[serde(rename = "aptPackages", default)]
    pub apt_packages: Vec<String>,
    #[serde(rename = "npmPackages", default)]
    pub npm_packages: Vec<String>,
    #[serde(rename = "pipPackages", default)]
    pub pip_packages: Vec<String>,
}

/// A repository cloned onto the worker at first boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitRepo {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub path: String,
    /// Optional command run inside the clone after checkout.
    #[serde(default)]
    pub setup: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// A typed credential bag for one messaging channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

/// VPS sizing and placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(rename = "serverType", default = "default_server_type")]
    pub server_type: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(rename = "diskGb", default = "default_disk_gb")]
    pub disk_gb: u32,
    #[serde(rename = "dockerImage", default = "default_docker_image")]
    pub docker_image: String,
    /// Provider override; empty means "use the orchestrator default".
    #[serde(default)]
    pub provider: String,
}

fn default_server_type() -> String {
    "cx22".to_string()
}

fn default_region() -> String {
    "fsn1".to_string()
}

fn default_disk_gb() -> u32 {
    40
}

fn default_docker_image() -> String {
    "moltagent/worker:latest".to_string()
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            server_type: default_server_type(),
            region: default_region(),
            disk_gb: default_disk_gb(),
            docker_image: default_docker_image(),
            provider: String::new(),
        }
    }
}

/// USD spend caps enforced through the approval flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialControls {
    #[serde(rename = "maxPerTransaction", default = "default_max_per_transaction")]
    pub max_per_transaction: f64,
    #[serde(rename = "maxPerDay", default = "default_max_per_day")]
    pub max_per_day: f64,
    #[serde(rename = "maxPerMonth", default = "default_max_per_month")]
    pub max_per_month: f64,
    #[serde(rename = "requireApprovalForAll", default)]
    pub require_approval_for_all: bool,
    #[serde(default)]
    pub wallet: Option<String>,
}

fn default_max_per_transaction() -> f64 {
    10.0
}

fn default_max_per_day() -> f64 {
    50.0
}

fn default_max_per_month() -> f64 {
    500.0
}

impl Default for FinancialControls {
    fn default() -> Self {
        Self {
            max_per_transaction: default_max_per_transaction(),
            max_per_day: default_max_per_day(),
            max_per_month: default_max_per_month(),
            require_approval_for_all: false,
            wallet: None,
        }
    }
}

/// How the worker dials home.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlane {
    #[serde(default = "default_control_plane_url")]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(rename = "heartbeatIntervalSecs", default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(
        rename = "statusReportIntervalSecs",
        default = "default_status_report_interval"
    )]
    pub status_report_interval_secs: u64,
}

fn default_control_plane_url() -> String {
    "ws://localhost:18790".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_status_report_interval() -> u64 {
    300
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self {
            url: default_control_plane_url(),
            token: String::new(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            status_report_interval_secs: default_status_report_interval(),
        }
    }
}

/// Log and recording retention windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retention {
    #[serde(rename = "actionLogDays", default = "default_action_log_days")]
    pub action_log_days: u32,
    #[serde(rename = "recordingDays", default = "default_recording_days")]
    pub recording_days: u32,
    #[serde(rename = "liveStream", default)]
    pub live_stream: bool,
}

fn default_action_log_days() -> u32 {
    30
}

fn default_recording_days() -> u32 {
    7
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            action_log_days: default_action_log_days(),
            recording_days: default_recording_days(),
            live_stream: false,
        }
    }
}

/// An ordered objective with measurable key results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub description: String,
    /// 1 (highest) through 5 (lowest).
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(rename = "dueDate", default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(rename = "keyResults", default)]
    pub key_results: Vec<String>,
}

fn default_priority() -> u8 {
    3
}

/// Seed knowledge made available to the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Knowledge {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub documents: Vec<InlineDocument>,
}

/// An inline knowledge document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineDocument {
    pub title: String,
    pub content: String,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            identity: Identity::default(),
            agent_config: AgentConfig::default(),
            capabilities: Capabilities::default(),
            channels: Vec::new(),
            resources: Resources::default(),
            financial_controls: FinancialControls::default(),
            control_plane: ControlPlane::default(),
            retention: Retention::default(),
            goals: Vec::new(),
            knowledge: Knowledge::default(),
            metadata: Map::new(),
        }
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

/// One structural problem found while parsing a manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    /// JSON-path-ish location, e.g. `goals[2].priority`.
    pub path: String,
    pub message: String,
}

/// The full list of issues for a rejected manifest.
#[derive(Debug, Clone)]
pub struct ValidationErrors {
    pub issues: Vec<ValidationIssue>,
}

impl std::error::Error for ValidationErrors {}

impl ValidationErrors {
    fn single(path: &str, message: impl Into<String>) -> Self {
        Self {
            issues: vec![ValidationIssue {
                path: path.to_string(),
                message: message.into(),
            }],
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}: {}", issue.path, issue.message)?;
        }
        Ok(())
    }
}

/// Discriminated outcome of [`Manifest::safe_parse`].
#[derive(Debug)]
pub enum ParseOutcome {
    Valid(Box<Manifest>),
    Invalid(ValidationErrors),
}

impl Manifest {
    /// Parse a manifest from JSON bytes, filling defaults and collecting
    /// every structural issue instead of stopping at the first.
    ///
    /// # Errors
    ///
    /// Returns the full list of validation issues when the document is not
    /// a valid manifest.
    pub fn parse(bytes: &[u8]) -> Result<Self, ValidationErrors> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ValidationErrors::single("$", format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Like [`Manifest::parse`] but returns a discriminated outcome instead
    /// of a `Result`, for callers that treat rejection as data.
    #[must_use]
    pub fn safe_parse(bytes: &[u8]) -> ParseOutcome {
        match Self::parse(bytes) {
            Ok(m) => ParseOutcome::Valid(Box::new(m)),
            Err(e) => ParseOutcome::Invalid(e),
        }
    }

    /// Parse a manifest from an already-decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns the full list of validation issues when the document is not
    /// a valid manifest.
    pub fn from_value(mut value: Value) -> Result<Self, ValidationErrors> {
        let Some(obj) = value.as_object_mut() else {
            return Err(ValidationErrors::single("$", "manifest must be a JSON object"));
        };

        // Unknown top-level keys are accepted and preserved in `metadata`.
        // Keys already present in `metadata` win over relocated ones.
        let unknown: Vec<String> = obj
            .keys()
            .filter(|k| !KNOWN_KEYS.contains(&k.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            let mut relocated = Map::new();
            for key in unknown {
                if let Some(v) = obj.remove(&key) {
                    relocated.insert(key, v);
                }
            }
            let metadata = obj.entry("metadata").or_insert_with(|| Value::Object(Map::new()));
            if let Some(meta) = metadata.as_object_mut() {
                for (key, v) in relocated {
                    meta.entry(key).or_insert(v);
                }
            }
        }

        let manifest: Manifest = serde_json::from_value(value)
            .map_err(|e| ValidationErrors::single("$", e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural validation of an already-deserialized manifest.
    ///
    /// # Errors
    ///
    /// Returns every issue found; an empty issue list never escapes as `Err`.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut issues = Vec::new();

        if self.schema_version != SCHEMA_VERSION {
            issues.push(ValidationIssue {
                path: "schemaVersion".to_string(),
                message: format!(
                    "unsupported schema version {} (expected {SCHEMA_VERSION})",
                    self.schema_version
                ),
            });
        }

        if self.identity.name.trim().is_empty() {
            issues.push(ValidationIssue {
                path: "identity.name".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        if url::Url::parse(&self.control_plane.url).is_err() {
            issues.push(ValidationIssue {
                path: "controlPlane.url".to_string(),
                message: format!("not a valid URL: {}", self.control_plane.url),
            });
        }

        for (i, goal) in self.goals.iter().enumerate() {
            if !(1..=5).contains(&goal.priority) {
                issues.push(ValidationIssue {
                    path: format!("goals[{i}].priority"),
                    message: format!("must be between 1 and 5, got {}", goal.priority),
                });
            }
        }

        for (i, u) in self.knowledge.urls.iter().enumerate() {
            if url::Url::parse(u).is_err() {
                issues.push(ValidationIssue {
                    path: format!("knowledge.urls[{i}]"),
                    message: format!("not a valid URL: {u}"),
                });
            }
        }

        for (i, repo) in self.capabilities.git_repos.iter().enumerate() {
            if url::Url::parse(&repo.url).is_err() {
                issues.push(ValidationIssue {
                    path: format!("capabilities.gitRepos[{i}].url"),
                    message: format!("not a valid URL: {}", repo.url),
                });
            }
        }

        let caps = [
            ("financialControls.maxPerTransaction", self.financial_controls.max_per_transaction),
            ("financialControls.maxPerDay", self.financial_controls.max_per_day),
            ("financialControls.maxPerMonth", self.financial_controls.max_per_month),
        ];
        for (path, cap) in caps {
            if !cap.is_finite() || cap < 0.0 {
                issues.push(ValidationIssue {
                    path: path.to_string(),
                    message: format!("must be a non-negative number, got {cap}"),
                });
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors { issues })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "identity": {
            "id": "6f2b8a9e-0c1d-4e5f-8a7b-112233445566",
            "name": "a1",
            "ownerId": "owner-1"
        },
        "controlPlane": {"url": "ws://localhost:18790", "token": "T"},
        "resources": {"provider": "docker-local"},
        "financialControls": {"maxPerDay": 10}
    }"#;

    #[test]
    fn minimal_manifest_fills_defaults() {
        let m = Manifest::parse(MINIMAL.as_bytes()).expect("minimal manifest should parse");
        assert_eq!(m.schema_version, SCHEMA_VERSION);
        assert_eq!(m.identity.name, "a1");
        assert_eq!(m.agent_config.provider, "anthropic");
        assert_eq!(m.agent_config.max_tokens, 4096);
        assert_eq!(m.resources.server_type, "cx22");
        assert_eq!(m.resources.provider, "docker-local");
        assert_eq!(m.financial_controls.max_per_day, 10.0);
        assert_eq!(m.financial_controls.max_per_month, 500.0);
        assert_eq!(m.control_plane.heartbeat_interval_secs, 30);
        assert!(m.goals.is_empty());
    }

    #[test]
    fn empty_object_yields_complete_manifest() {
        let m = Manifest::parse(b"{}").expect("empty object should parse");
        assert_eq!(m.identity.name, "agent");
        assert_eq!(m.retention.action_log_days, 30);
    }

    #[test]
    fn unknown_top_level_keys_move_into_metadata() {
        let m = Manifest::parse(br#"{"identity": {"name": "a1"}, "futureSection": {"x": 1}}"#)
            .expect("should parse");
        assert_eq!(
            m.metadata.get("futureSection"),
            Some(&serde_json::json!({"x": 1}))
        );
    }

    #[test]
    fn explicit_metadata_wins_over_relocated_key() {
        let m = Manifest::parse(br#"{"metadata": {"extra": "kept"}, "extra": "relocated"}"#)
            .expect("should parse");
        assert_eq!(m.metadata.get("extra"), Some(&serde_json::json!("kept")));
    }

    #[test]
    fn reparse_is_idempotent() {
        let first = Manifest::parse(MINIMAL.as_bytes()).unwrap();
        let bytes = serde_json::to_vec(&first).unwrap();
        let second = Manifest::parse(&bytes).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn priority_out_of_range_rejects() {
        let doc = r#"{"goals": [{"description": "g", "priority": 0}, {"description": "h", "priority": 6}]}"#;
        let err = Manifest::parse(doc.as_bytes()).unwrap_err();
        assert_eq!(err.issues.len(), 2);
        assert!(err.issues[0].path.contains("goals[0]"));
        assert!(err.issues[1].path.contains("goals[1]"));
    }

    #[test]
    fn non_url_knowledge_entry_rejects() {
        let doc = r#"{"knowledge": {"urls": ["not a url"]}}"#;
        let err = Manifest::parse(doc.as_bytes()).unwrap_err();
        assert_eq!(err.issues[0].path, "knowledge.urls[0]");
    }

    #[test]
    fn negative_spend_cap_rejects() {
        let doc = r#"{"financialControls": {"maxPerDay": -1}}"#;
        let err = Manifest::parse(doc.as_bytes()).unwrap_err();
        assert!(err.issues[0].path.contains("maxPerDay"));
    }

    #[test]
    fn bad_uuid_rejects() {
        let doc = r#"{"identity": {"id": "not-a-uuid"}}"#;
        assert!(Manifest::parse(doc.as_bytes()).is_err());
    }

    #[test]
    fn unsupported_schema_version_rejects() {
        let doc = r#"{"schemaVersion": 2}"#;
        let err = Manifest::parse(doc.as_bytes()).unwrap_err();
        assert!(err.issues[0].message.contains("unsupported"));
    }

    #[test]
    fn safe_parse_returns_discriminated_outcome() {
        match Manifest::safe_parse(MINIMAL.as_bytes()) {
            ParseOutcome::Valid(m) => assert_eq!(m.identity.name, "a1"),
            ParseOutcome::Invalid(e) => panic!("expected valid, got {e}"),
        }
        match Manifest::safe_parse(b"[]") {
            ParseOutcome::Invalid(_) => {}
            ParseOutcome::Valid(_) => panic!("array is not a manifest"),
        }
    }

    use proptest::prelude::*;

    proptest! {
        /// Any parsed manifest survives a serialize/parse roundtrip unchanged.
        #[test]
        fn prop_parse_serialize_roundtrip(
            name in "[a-z][a-z0-9-]{0,20}",
            priority in 1u8..=5,
            max_per_day in 0.0f64..10_000.0,
        ) {
            let doc = serde_json::json!({
                "identity": {"name": name},
                "goals": [{"description": "g", "priority": priority}],
                "financialControls": {"maxPerDay": max_per_day},
            });
            let first = Manifest::from_value(doc).expect("valid input");
            let bytes = serde_json::to_vec(&first).expect("serialize");
            let second = Manifest::parse(&bytes).expect("reparse");
            prop_assert_eq!(first, second);
        }

        /// Validation never panics on arbitrary priorities and caps.
        #[test]
        fn prop_validate_never_panics(priority in any::<u8>(), cap in any::<f64>()) {
            let doc = serde_json::json!({
                "goals": [{"description": "g", "priority": priority}],
                "financialControls": {"maxPerTransaction": if cap.is_finite() { cap } else { 0.0 }},
            });
            let _ = Manifest::from_value(doc);
        }
    }
}
