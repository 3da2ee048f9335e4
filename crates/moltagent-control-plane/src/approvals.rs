//! Human-in-the-loop approval queue.
//!
//! Pending requests live only in memory: they are intentionally not
//! persisted, so a control-plane restart drops them and the worker-side
//! 5-minute timeout denies by default — the safer failure mode. Resolved
//! and expired entries move into a bounded newest-first history.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use moltagent_common::types::{ApprovalRequest, ApprovalState, PendingApproval};

/// Newest-first history capacity.
pub const HISTORY_CAP: usize = 1000;
/// Expiry window applied when a request names none.
pub const DEFAULT_EXPIRY: chrono::Duration = chrono::Duration::minutes(5);
/// How often the expiry sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Callback fired with the affected entry; wired by the orchestrator after
/// construction so the manager never references the server directly.
pub type ApprovalCallback = Box<dyn Fn(&PendingApproval) + Send + Sync>;

/// Today's queue activity, for the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalSummary {
    pub pending: usize,
    #[serde(rename = "approvedToday")]
    pub approved_today: usize,
    #[serde(rename = "deniedToday")]
    pub denied_today: usize,
    #[serde(rename = "expiredToday")]
    pub expired_today: usize,
    #[serde(rename = "approvedSpendToday")]
    pub approved_spend_today: f64,
}

struct Inner {
    pending: HashMap<String, PendingApproval>,
    history: std::collections::VecDeque<PendingApproval>,
}

/// Owner of the pending queue and the resolution history.
pub struct ApprovalManager {
    inner: RwLock<Inner>,
    on_new: Mutex<Option<ApprovalCallback>>,
    on_resolved: Mutex<Option<ApprovalCallback>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ApprovalManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                pending: HashMap::new(),
                history: std::collections::VecDeque::new(),
            }),
            on_new: Mutex::new(None),
            on_resolved: Mutex::new(None),
            sweep_task: Mutex::new(None),
        }
    }

    /// Install the callback fired when a new request is queued.
    pub fn set_on_new_approval(&self, callback: ApprovalCallback) {
        *self.on_new.lock().expect("approval lock poisoned") = Some(callback);
    }

    /// Install the callback fired when an entry leaves the queue
    /// (approved, denied, or expired).
    pub fn set_on_resolved(&self, callback: ApprovalCallback) {
        *self.on_resolved.lock().expect("approval lock poisoned") = Some(callback);
    }

    /// Queue a worker request as `pending`. Replays of an id already in the
    /// queue are ignored and the existing entry is returned.
    pub fn add_request(&self, agent_id: &str, request: ApprovalRequest) -> PendingApproval {
        let now = Utc::now();
        let entry = PendingApproval {
            id: request.id,
            agent_id: agent_id.to_string(),
            category: request.category,
            description: request.description,
            amount: request.amount,
            currency: request.currency,
            created_at: now,
            expires_at: request.expires_at.unwrap_or(now + DEFAULT_EXPIRY),
            state: ApprovalState::Pending,
            responded_by: None,
            reason: None,
            responded_at: None,
        };

        let stored = {
            let mut inner = self.inner.write().expect("approval lock poisoned");
            inner
                .pending
                .entry(entry.id.clone())
                .or_insert(entry)
                .clone()
        };
        self.fire(&self.on_new, &stored);
        stored
    }

    /// Resolve a pending entry. Returns `None` when the id is unknown or
    /// already resolved; the transition out of `pending` happens exactly once.
    pub fn resolve(
        &self,
        id: &str,
        approved: bool,
        responded_by: &str,
        reason: Option<String>,
    ) -> Option<PendingApproval> {
        let resolved = {
            let mut inner = self.inner.write().expect("approval lock poisoned");
            let mut entry = inner.pending.remove(id)?;
            entry.state = if approved {
                ApprovalState::Approved
            } else {
                ApprovalState::Denied
            };
            entry.responded_by = Some(responded_by.to_string());
            entry.reason = reason;
            entry.responded_at = Some(Utc::now());
            inner.history.push_front(entry.clone());
            inner.history.truncate(HISTORY_CAP);
            entry
        };
        self.fire(&self.on_resolved, &resolved);
        Some(resolved)
    }

    /// Move every pending entry past its deadline into history as `expired`.
    /// Called by the background sweep; exposed for deterministic tests.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Vec<PendingApproval> {
        let expired = {
            let mut inner = self.inner.write().expect("approval lock poisoned");
            let ids: Vec<String> = inner
                .pending
                .values()
                .filter(|e| e.expires_at <= now)
                .map(|e| e.id.clone())
                .collect();
            let mut expired = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(mut entry) = inner.pending.remove(&id) {
                    entry.state = ApprovalState::Expired;
                    entry.responded_at = Some(now);
                    inner.history.push_front(entry.clone());
                    inner.history.truncate(HISTORY_CAP);
                    expired.push(entry);
                }
            }
            expired
        };
        for entry in &expired {
            debug!(id = %entry.id, agent_id = %entry.agent_id, "approval expired");
            self.fire(&self.on_resolved, entry);
        }
        expired
    }

    /// Start the background expiry sweep. Idempotent per manager.
    pub fn start_expiry_sweep(self: &Arc<Self>) {
        let mut guard = self.sweep_task.lock().expect("approval lock poisoned");
        if guard.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                manager.sweep_once(Utc::now());
            }
        }));
    }

    /// Stop the expiry sweep. Pending entries are left in place; they are
    /// in-memory only and will not survive the process anyway.
    pub fn close(&self) {
        if let Some(task) = self
            .sweep_task
            .lock()
            .expect("approval lock poisoned")
            .take()
        {
            task.abort();
        }
    }

    fn fire(&self, slot: &Mutex<Option<ApprovalCallback>>, entry: &PendingApproval) {
        if let Some(callback) = slot.lock().expect("approval lock poisoned").as_ref() {
            callback(entry);
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Pending entries, oldest first, optionally filtered by agent.
    #[must_use]
    pub fn pending(&self, agent_id: Option<&str>) -> Vec<PendingApproval> {
        let inner = self.inner.read().expect("approval lock poisoned");
        let mut entries: Vec<_> = inner
            .pending
            .values()
            .filter(|e| agent_id.is_none_or(|id| e.agent_id == id))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    /// Paginated history, newest first.
    #[must_use]
    pub fn history(&self, limit: usize, offset: usize) -> Vec<PendingApproval> {
        let inner = self.inner.read().expect("approval lock poisoned");
        inner
            .history
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn summary(&self) -> ApprovalSummary {
        let inner = self.inner.read().expect("approval lock poisoned");
        let today = Utc::now().date_naive();
        let same_day =
            |e: &&PendingApproval| e.responded_at.is_some_and(|t| t.date_naive() == today);
        let resolved_today: Vec<_> = inner.history.iter().filter(same_day).collect();

        ApprovalSummary {
            pending: inner.pending.len(),
            approved_today: resolved_today
                .iter()
                .filter(|e| e.state == ApprovalState::Approved)
                .count(),
            denied_today: resolved_today
                .iter()
                .filter(|e| e.state == ApprovalState::Denied)
                .count(),
            expired_today: resolved_today
                .iter()
                .filter(|e| e.state == ApprovalState::Expired)
                .count(),
            approved_spend_today: resolved_today
                .iter()
                .filter(|e| e.state == ApprovalState::Approved)
                .filter_map(|e| e.amount)
                .sum(),
        }
    }
}
