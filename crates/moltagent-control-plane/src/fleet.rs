//! Durable fleet registry.
//!
//! The fleet manager exclusively owns persistence of agent records. State
//! lives in memory and is flushed to a single JSON file: a dirty flag is
//! set on every mutation and a background task persists every 30 seconds,
//! with atomic write (temp file + rename) to prevent corruption.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use moltagent_common::manifest::Manifest;
use moltagent_common::types::{
    ActionLogEntry, AgentConnection, StatusReport, VpsInstance,
};

/// On-disk format version; anything else starts empty.
const FILE_VERSION: u32 = 1;
/// Newest-first ring capacity for recent actions.
pub const ACTION_RING_CAP: usize = 200;
/// Newest-first ring capacity for recent errors.
pub const ERROR_RING_CAP: usize = 50;
/// How often the dirty flag is checked and flushed.
const SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// One entry in the recent-errors ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Everything the control plane knows about one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub manifest: Manifest,
    #[serde(default)]
    pub instance: Option<VpsInstance>,
    pub connection: AgentConnection,
    #[serde(rename = "remoteAddr", default)]
    pub remote_addr: Option<String>,
    #[serde(rename = "lastStatus", default)]
    pub last_status: Option<StatusReport>,
    #[serde(rename = "deployedAt")]
    pub deployed_at: DateTime<Utc>,
    #[serde(rename = "lastHeartbeat", default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(rename = "uptimeSecs", default)]
    pub uptime_secs: u64,
    #[serde(rename = "recentActions", default)]
    pub recent_actions: VecDeque<ActionLogEntry>,
    #[serde(rename = "recentErrors", default)]
    pub recent_errors: VecDeque<ErrorEntry>,
    #[serde(rename = "totalActions", default)]
    pub total_actions: u64,
    #[serde(rename = "totalSpend", default)]
    pub total_spend: f64,
}

/// Aggregate counters across the whole fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSummary {
    #[serde(rename = "totalAgents")]
    pub total_agents: usize,
    pub online: usize,
    pub offline: usize,
    #[serde(rename = "totalActions")]
    pub total_actions: u64,
    #[serde(rename = "totalSpend")]
    pub total_spend: f64,
}

#[derive(Serialize, Deserialize)]
struct FleetFile {
    version: u32,
    #[serde(rename = "updatedAt")]
    updated_at: DateTime<Utc>,
    agents: HashMap<String, AgentRecord>,
}

/// Durable registry of agent records, keyed by agent id.
pub struct FleetManager {
    path: PathBuf,
    agents: RwLock<HashMap<String, AgentRecord>>,
    dirty: AtomicBool,
    save_task: Mutex<Option<JoinHandle<()>>>,
}

impl FleetManager {
    /// Open the registry at `path`, hydrating from disk when a readable
    /// version-1 file is present. A missing or corrupt file starts empty.
    /// Loaded records are forced offline — authoritative live state comes
    /// from the control-plane server once workers re-announce.
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let agents = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<FleetFile>(&content) {
                Ok(file) if file.version == FILE_VERSION => {
                    let mut agents = file.agents;
                    for record in agents.values_mut() {
                        record.connection = AgentConnection::Offline;
                    }
                    debug!(path = %path.display(), agents = agents.len(), "fleet state loaded");
                    agents
                }
                Ok(file) => {
                    warn!(
                        path = %path.display(),
                        version = file.version,
                        "unknown fleet file version, starting empty"
                    );
                    HashMap::new()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt fleet file, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            agents: RwLock::new(agents),
            dirty: AtomicBool::new(false),
            save_task: Mutex::new(None),
        }
    }

    // ── Mutators ──────────────────────────────────────────────────────────────

    /// Register (or re-register) an agent. Re-registration preserves the
    /// prior counters, ring contents, and deploy timestamp.
    pub fn register_agent(&self, manifest: Manifest, instance: Option<VpsInstance>) {
        let agent_id = manifest.identity.id.to_string();
        let mut agents = self.agents.write().expect("fleet lock poisoned");
        match agents.get_mut(&agent_id) {
            Some(record) => {
                record.manifest = manifest;
                if instance.is_some() {
                    record.instance = instance;
                }
            }
            None => {
                agents.insert(
                    agent_id,
                    AgentRecord {
                        manifest,
                        instance,
                        connection: AgentConnection::Unknown,
                        remote_addr: None,
                        last_status: None,
                        deployed_at: Utc::now(),
                        last_heartbeat: None,
                        uptime_secs: 0,
                        recent_actions: VecDeque::new(),
                        recent_errors: VecDeque::new(),
                        total_actions: 0,
                        total_spend: 0.0,
                    },
                );
            }
        }
        drop(agents);
        self.mark_dirty();
    }

    /// Update the live connection state. Returns `false` for unknown agents.
    pub fn update_agent_connection(
        &self,
        agent_id: &str,
        connection: AgentConnection,
        remote_addr: Option<String>,
    ) -> bool {
        self.with_record(agent_id, |record| {
            record.connection = connection;
            if remote_addr.is_some() {
                record.remote_addr = remote_addr;
            }
        })
    }

    /// Record a heartbeat. Returns `false` for unknown agents.
    pub fn update_heartbeat(
        &self,
        agent_id: &str,
        timestamp: DateTime<Utc>,
        uptime_secs: u64,
    ) -> bool {
        self.with_record(agent_id, |record| {
            record.last_heartbeat = Some(timestamp);
            record.uptime_secs = uptime_secs;
        })
    }

    /// Store the latest full status report. Returns `false` for unknown agents.
    pub fn update_agent_status(&self, agent_id: &str, report: StatusReport) -> bool {
        self.with_record(agent_id, |record| {
            record.uptime_secs = report.uptime_secs;
            record.last_status = Some(report);
        })
    }

    /// Append an action newest-first, bumping the cumulative counters.
    /// Returns `false` for unknown agents.
    pub fn record_action(&self, agent_id: &str, entry: ActionLogEntry) -> bool {
        self.with_record(agent_id, |record| {
            if let Some(amount) = entry.spend_amount() {
                record.total_spend += amount;
            }
            record.recent_actions.push_front(entry);
            record.recent_actions.truncate(ACTION_RING_CAP);
            record.total_actions += 1;
        })
    }

    /// Append to the recent-errors ring. Returns `false` for unknown agents.
    pub fn record_error(&self, agent_id: &str, message: String) -> bool {
        self.with_record(agent_id, |record| {
            record.recent_errors.push_front(ErrorEntry {
                timestamp: Utc::now(),
                message,
            });
            record.recent_errors.truncate(ERROR_RING_CAP);
        })
    }

    /// Remove an agent record entirely. Returns `false` when absent.
    pub fn remove_agent(&self, agent_id: &str) -> bool {
        let removed = self
            .agents
            .write()
            .expect("fleet lock poisoned")
            .remove(agent_id)
            .is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    fn with_record(&self, agent_id: &str, f: impl FnOnce(&mut AgentRecord)) -> bool {
        let mut agents = self.agents.write().expect("fleet lock poisoned");
        let Some(record) = agents.get_mut(agent_id) else {
            return false;
        };
        f(record);
        drop(agents);
        self.mark_dirty();
        true
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents
            .read()
            .expect("fleet lock poisoned")
            .get(agent_id)
            .cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<(String, AgentRecord)> {
        let mut list: Vec<_> = self
            .agents
            .read()
            .expect("fleet lock poisoned")
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// Ids of every agent currently marked online.
    #[must_use]
    pub fn online_agents(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .agents
            .read()
            .expect("fleet lock poisoned")
            .iter()
            .filter(|(_, r)| r.connection == AgentConnection::Online)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn summary(&self) -> FleetSummary {
        let agents = self.agents.read().expect("fleet lock poisoned");
        let online = agents
            .values()
            .filter(|r| r.connection == AgentConnection::Online)
            .count();
        FleetSummary {
            total_agents: agents.len(),
            online,
            offline: agents.len() - online,
            total_actions: agents.values().map(|r| r.total_actions).sum(),
            total_spend: agents.values().map(|r| r.total_spend).sum(),
        }
    }

    /// Paginated slice of the recent-actions ring, newest first.
    /// `None` for unknown agents.
    #[must_use]
    pub fn actions(&self, agent_id: &str, limit: usize, offset: usize) -> Option<Vec<ActionLogEntry>> {
        let agents = self.agents.read().expect("fleet lock poisoned");
        let record = agents.get(agent_id)?;
        Some(
            record
                .recent_actions
                .iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect(),
        )
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Serialize and flush the registry to disk synchronously.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save_sync(&self) -> Result<()> {
        let content = {
            let agents = self.agents.read().expect("fleet lock poisoned");
            serde_json::to_string_pretty(&FleetFile {
                version: FILE_VERSION,
                updated_at: Utc::now(),
                agents: agents.clone(),
            })
            .context("serializing fleet state")?
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }

        // Atomic write via temp file then rename.
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content)
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("setting permissions on {}", temp_path.display()))?;
        }

        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("finalizing fleet file {}", self.path.display()))?;

        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Start the background save loop. Idempotent per manager.
    pub fn start_autosave(self: &std::sync::Arc<Self>) {
        let mut guard = self.save_task.lock().expect("fleet lock poisoned");
        if guard.is_some() {
            return;
        }
        let manager = std::sync::Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(SAVE_INTERVAL);
            tick.tick().await; // immediate first tick carries nothing new
            loop {
                tick.tick().await;
                if manager.dirty.load(Ordering::Acquire) {
                    let m = std::sync::Arc::clone(&manager);
                    let result = tokio::task::spawn_blocking(move || m.save_sync()).await;
                    match result {
                        Ok(Ok(())) => debug!("fleet state persisted"),
                        Ok(Err(e)) => warn!(error = %e, "fleet save failed"),
                        Err(e) => warn!(error = %e, "fleet save task panicked"),
                    }
                }
            }
        }));
    }

    /// Stop the save loop and flush once.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn close(&self) -> Result<()> {
        if let Some(task) = self.save_task.lock().expect("fleet lock poisoned").take() {
            task.abort();
        }
        if self.dirty.load(Ordering::Acquire) {
            self.save_sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use moltagent_common::types::ActionCategory;

    fn manifest_with_id(id: &str) -> Manifest {
        Manifest::from_value(serde_json::json!({
            "identity": {"id": id, "name": "a1", "ownerId": "o1"},
        }))
        .expect("test manifest")
    }

    fn spend_entry(amount: f64) -> ActionLogEntry {
        ActionLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            category: ActionCategory::Spend,
            summary: "spend".to_string(),
            details: Some(serde_json::json!({"amount": amount})),
            duration_ms: None,
        }
    }

    fn plain_entry(summary: &str) -> ActionLogEntry {
        ActionLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            category: ActionCategory::Execute,
            summary: summary.to_string(),
            details: None,
            duration_ms: Some(10),
        }
    }

    const U1: &str = "11111111-1111-4111-8111-111111111111";
    const U2: &str = "22222222-2222-4222-8222-222222222222";

    fn temp_fleet() -> (tempfile::TempDir, FleetManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let fleet = FleetManager::load(dir.path().join("fleet.json"));
        (dir, fleet)
    }

    #[test]
    fn register_sets_unknown_connection_and_deploy_time() {
        let (_dir, fleet) = temp_fleet();
        fleet.register_agent(manifest_with_id(U1), None);
        let record = fleet.get(U1).expect("registered");
        assert_eq!(record.connection, AgentConnection::Unknown);
        assert_eq!(record.total_actions, 0);
    }

    #[test]
    fn reregister_preserves_counters_rings_and_deploy_time() {
        let (_dir, fleet) = temp_fleet();
        fleet.register_agent(manifest_with_id(U1), None);
        fleet.record_action(U1, spend_entry(3.0));
        fleet.record_action(U1, plain_entry("one"));
        let before = fleet.get(U1).unwrap();

        fleet.register_agent(manifest_with_id(U1), None);
        let after = fleet.get(U1).unwrap();
        assert_eq!(after.deployed_at, before.deployed_at);
        assert_eq!(after.total_actions, 2);
        assert_eq!(after.total_spend, 3.0);
        assert_eq!(after.recent_actions.len(), 2);
    }

    #[test]
    fn action_ring_never_exceeds_capacity_and_is_newest_first() {
        let (_dir, fleet) = temp_fleet();
        fleet.register_agent(manifest_with_id(U1), None);
        for i in 0..(ACTION_RING_CAP + 25) {
            fleet.record_action(U1, plain_entry(&format!("a{i}")));
        }
        let record = fleet.get(U1).unwrap();
        assert_eq!(record.recent_actions.len(), ACTION_RING_CAP);
        assert_eq!(record.total_actions, (ACTION_RING_CAP + 25) as u64);
        assert_eq!(record.recent_actions[0].summary, format!("a{}", ACTION_RING_CAP + 24));
    }

    #[test]
    fn error_ring_never_exceeds_capacity() {
        let (_dir, fleet) = temp_fleet();
        fleet.register_agent(manifest_with_id(U1), None);
        for i in 0..(ERROR_RING_CAP * 2) {
            fleet.record_error(U1, format!("e{i}"));
        }
        assert_eq!(fleet.get(U1).unwrap().recent_errors.len(), ERROR_RING_CAP);
    }

    #[test]
    fn spend_actions_accumulate_total_spend() {
        let (_dir, fleet) = temp_fleet();
        fleet.register_agent(manifest_with_id(U1), None);
        fleet.record_action(U1, spend_entry(1.25));
        fleet.record_action(U1, spend_entry(2.75));
        fleet.record_action(U1, plain_entry("free"));
        let record = fleet.get(U1).unwrap();
        assert_eq!(record.total_spend, 4.0);
        assert_eq!(record.total_actions, 3);
    }

    #[test]
    fn mutators_return_false_for_unknown_agent() {
        let (_dir, fleet) = temp_fleet();
        assert!(!fleet.record_action(U1, plain_entry("x")));
        assert!(!fleet.update_heartbeat(U1, Utc::now(), 1));
        assert!(!fleet.update_agent_connection(U1, AgentConnection::Online, None));
        assert!(!fleet.remove_agent(U1));
    }

    #[test]
    fn restart_survival_preserves_records_and_forces_offline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fleet.json");
        {
            let fleet = FleetManager::load(path.clone());
            for id in [U1, U2] {
                fleet.register_agent(manifest_with_id(id), None);
                for i in 0..4 {
                    fleet.record_action(id, plain_entry(&format!("a{i}")));
                }
                fleet.record_action(id, spend_entry(3.0));
                fleet.update_agent_connection(id, AgentConnection::Online, None);
            }
            fleet.save_sync().expect("save");
        }

        let reloaded = FleetManager::load(path);
        for id in [U1, U2] {
            let record = reloaded.get(id).expect("survived restart");
            assert_eq!(record.connection, AgentConnection::Offline);
            assert_eq!(record.total_actions, 5);
            assert_eq!(record.total_spend, 3.0);
            assert_eq!(record.recent_actions.len(), 5);
        }
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fleet.json");
        std::fs::write(&path, "{ this is not json").unwrap();
        let fleet = FleetManager::load(path);
        assert!(fleet.list().is_empty());
    }

    #[test]
    fn unknown_version_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fleet.json");
        std::fs::write(
            &path,
            serde_json::json!({"version": 99, "updatedAt": Utc::now(), "agents": {}}).to_string(),
        )
        .unwrap();
        let fleet = FleetManager::load(path);
        assert!(fleet.list().is_empty());
    }

    #[test]
    fn summary_aggregates_across_agents() {
        let (_dir, fleet) = temp_fleet();
        fleet.register_agent(manifest_with_id(U1), None);
        fleet.register_agent(manifest_with_id(U2), None);
        fleet.record_action(U1, spend_entry(1.0));
        fleet.record_action(U2, spend_entry(2.0));
        fleet.update_agent_connection(U1, AgentConnection::Online, None);

        let summary = fleet.summary();
        assert_eq!(summary.total_agents, 2);
        assert_eq!(summary.online, 1);
        assert_eq!(summary.offline, 1);
        assert_eq!(summary.total_actions, 2);
        assert_eq!(summary.total_spend, 3.0);
    }

    #[test]
    fn actions_paginate_newest_first() {
        let (_dir, fleet) = temp_fleet();
        fleet.register_agent(manifest_with_id(U1), None);
        for i in 0..10 {
            fleet.record_action(U1, plain_entry(&format!("a{i}")));
        }
        let page = fleet.actions(U1, 3, 2).expect("known agent");
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].summary, "a7");
        assert!(fleet.actions(U2, 3, 0).is_none());
    }
}
