//! Provider abstraction over heterogeneous VPS backends.
//!
//! Every backend exposes the same four operations. `create` is initiation:
//! an `Ok` means the provider accepted the request and assigned an id (and
//! usually an IP) — it does not guarantee the worker is reachable yet.
//! Failures surface the upstream status and body and are never retried
//! here; callers decide policy.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use moltagent_common::manifest::Manifest;
use moltagent_common::types::VpsInstance;

mod docker;
mod hetzner;

pub use docker::{DockerProvider, PROVIDER_NAME as DOCKER_PROVIDER_NAME};
pub use hetzner::HetznerProvider;

/// Label applied to every instance this system creates; `list` filters on it.
pub const FLEET_LABEL: &str = "moltagent";
/// Fixed port the worker's gateway listens on inside the instance.
pub const GATEWAY_PORT: u16 = 18789;

/// Errors surfaced by a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The upstream API rejected the call; status and body pass through.
    #[error("provider API error (status {status}): {body}")]
    Api { status: u16, body: String },

    /// A backend CLI command failed; exit status and stderr pass through.
    #[error("provider command failed (exit {status}): {stderr}")]
    Command { status: i32, stderr: String },

    #[error("instance {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Parameters for [`VpsProvider::create`].
pub struct CreateRequest<'a> {
    pub manifest: &'a Manifest,
    pub bootstrap_script: &'a str,
    pub ssh_key_ids: &'a [String],
}

/// Uniform lifecycle over one VPS backend.
#[async_trait]
pub trait VpsProvider: Send + Sync {
    /// The registry key for this backend, e.g. `"hetzner"`.
    fn name(&self) -> &'static str;

    /// Initiate creation of an instance for the manifest's agent.
    async fn create(&self, req: CreateRequest<'_>) -> Result<VpsInstance, ProviderError>;

    /// Tear the instance down.
    async fn destroy(&self, instance_id: &str) -> Result<(), ProviderError>;

    /// Current provider-side view; `None` when the instance no longer exists.
    async fn status(&self, instance_id: &str) -> Result<Option<VpsInstance>, ProviderError>;

    /// Every instance carrying the fleet label.
    async fn list(&self) -> Result<Vec<VpsInstance>, ProviderError>;
}

/// Dependency-injected registry mapping provider name to implementation;
/// owned by the orchestrator and handed to the provisioner.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn VpsProvider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn VpsProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn VpsProvider>> {
        self.providers.get(name).cloned()
    }

    /// Registered provider names, sorted for stable error messages.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Instance name derived from the agent id: `moltagent-<first-8-of-id>`.
#[must_use]
pub fn instance_name(agent_id: &str) -> String {
    let prefix: String = agent_id.chars().take(8).collect();
    format!("moltagent-{prefix}")
}
