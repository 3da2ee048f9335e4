//! Shared types for the MoltAgent control plane and agent bridge.
//!
//! Three concerns live here so every workspace member speaks the same
//! language: the declarative agent [`manifest`], the worker↔plane wire
//! [`protocol`], and the runtime [`types`] (instances, status reports,
//! actions, approvals).

pub mod manifest;
pub mod protocol;
pub mod types;

pub use manifest::{Manifest, ParseOutcome, ValidationErrors, ValidationIssue};
pub use protocol::{PlaneMessage, WorkerMessage};
pub use types::{
    ActionCategory, ActionLogEntry, AgentConnection, ApprovalCategory, ApprovalRequest,
    ApprovalState, InstanceStatus, PendingApproval, StatusReport, VpsInstance, WorkerState,
};
