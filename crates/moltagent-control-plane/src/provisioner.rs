//! Lifecycle orchestration over the provider registry.
//!
//! The provisioner exclusively owns the live-instance index, keyed by
//! agent id. Providers own no long-lived state beyond what their remote
//! API stores.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{info, warn};

use moltagent_common::manifest::Manifest;
use moltagent_common::types::VpsInstance;

use crate::providers::{CreateRequest, ProviderError, ProviderRegistry};

/// Errors from provisioning operations.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("unknown provider '{name}' (available: {available})")]
    UnknownProvider { name: String, available: String },

    #[error("no instance for agent {0}")]
    NotFound(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Orchestrates instance lifecycle and indexes live instances by agent id.
pub struct Provisioner {
    registry: Arc<ProviderRegistry>,
    default_provider: String,
    instances: RwLock<HashMap<String, VpsInstance>>,
}

impl Provisioner {
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>, default_provider: String) -> Self {
        Self {
            registry,
            default_provider,
            instances: RwLock::new(HashMap::new()),
        }
    }

    fn provider_for(&self, name: &str) -> Result<Arc<dyn crate::providers::VpsProvider>, ProvisionError> {
        self.registry
            .get(name)
            .ok_or_else(|| ProvisionError::UnknownProvider {
                name: name.to_string(),
                available: self.registry.names().join(", "),
            })
    }

    /// Create an instance for the manifest, using its provider override
    /// when set and the orchestrator default otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error naming the available providers for an unknown
    /// provider, or the provider's own failure.
    pub async fn provision(
        &self,
        manifest: &Manifest,
        bootstrap_script: &str,
    ) -> Result<VpsInstance, ProvisionError> {
        let name = if manifest.resources.provider.is_empty() {
            self.default_provider.as_str()
        } else {
            manifest.resources.provider.as_str()
        };
        let provider = self.provider_for(name)?;

        let instance = provider
            .create(CreateRequest {
                manifest,
                bootstrap_script,
                ssh_key_ids: &[],
            })
            .await?;

        let agent_id = manifest.identity.id.to_string();
        info!(agent_id = %agent_id, provider = name, instance_id = %instance.id, "instance provisioned");
        self.instances
            .write()
            .expect("instance index poisoned")
            .insert(agent_id, instance.clone());
        Ok(instance)
    }

    /// Destroy the indexed instance for an agent.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when nothing is indexed for the agent, or the
    /// owning provider's failure; the index entry is kept on failure.
    pub async fn destroy(&self, agent_id: &str) -> Result<(), ProvisionError> {
        let instance = self
            .instances
            .read()
            .expect("instance index poisoned")
            .get(agent_id)
            .cloned()
            .ok_or_else(|| ProvisionError::NotFound(agent_id.to_string()))?;

        let provider = self.provider_for(&instance.provider)?;
        provider.destroy(&instance.id).await?;

        self.instances
            .write()
            .expect("instance index poisoned")
            .remove(agent_id);
        info!(agent_id = %agent_id, instance_id = %instance.id, "instance destroyed");
        Ok(())
    }

    /// Live provider status for an agent's instance, falling back to the
    /// last-known value when the provider is unreachable. `None` when no
    /// instance is indexed.
    pub async fn get_status(&self, agent_id: &str) -> Option<VpsInstance> {
        let cached = self
            .instances
            .read()
            .expect("instance index poisoned")
            .get(agent_id)
            .cloned()?;

        let provider = self.registry.get(&cached.provider)?;
        match provider.status(&cached.id).await {
            Ok(Some(fresh)) => {
                self.instances
                    .write()
                    .expect("instance index poisoned")
                    .insert(agent_id.to_string(), fresh.clone());
                Some(fresh)
            }
            Ok(None) => Some(cached),
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "provider unreachable, returning last-known status");
                Some(cached)
            }
        }
    }

    /// Snapshot of the index; does not hit providers.
    #[must_use]
    pub fn list_instances(&self) -> Vec<VpsInstance> {
        let mut list: Vec<_> = self
            .instances
            .read()
            .expect("instance index poisoned")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        list
    }
}
