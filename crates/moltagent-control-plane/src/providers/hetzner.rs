//! Hetzner-style cloud backend.
//!
//! Bearer-token authenticated JSON REST API. The bootstrap script rides in
//! as user-data and the instance starts immediately after creation.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::debug;

use moltagent_common::types::{InstanceStatus, VpsInstance};

use super::{CreateRequest, FLEET_LABEL, ProviderError, VpsProvider, instance_name};

const DEFAULT_BASE_URL: &str = "https://api.hetzner.cloud/v1";
/// Base OS image for worker nodes; the worker itself runs from the
/// manifest's docker image on top of it.
const BASE_IMAGE: &str = "ubuntu-24.04";

/// Cloud VPS backend speaking the Hetzner REST dialect.
pub struct HetznerProvider {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl HetznerProvider {
    #[must_use]
    pub fn new(token: String) -> Self {
        Self::with_base_url(token, DEFAULT_BASE_URL.to_string())
    }

    /// Point the provider at a different API root (used in tests).
    #[must_use]
    pub fn with_base_url(token: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            base_url,
        }
    }

    async fn read_error(resp: reqwest::Response) -> ProviderError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        ProviderError::Api { status, body }
    }
}

#[async_trait]
impl VpsProvider for HetznerProvider {
    fn name(&self) -> &'static str {
        "hetzner"
    }

    async fn create(&self, req: CreateRequest<'_>) -> Result<VpsInstance, ProviderError> {
        let manifest = req.manifest;
        let agent_id = manifest.identity.id.to_string();
        let mut body = json!({
            "name": instance_name(&agent_id),
            "server_type": manifest.resources.server_type,
            "image": BASE_IMAGE,
            "location": manifest.resources.region,
            "start_after_create": true,
            "user_data": req.bootstrap_script,
            "labels": {
                "moltagent": "true",
                "agent-id": agent_id,
                "owner-id": manifest.identity.owner_id,
            },
        });
        if !req.ssh_key_ids.is_empty() {
            body["ssh_keys"] = json!(req.ssh_key_ids);
        }

        let resp = self
            .http
            .post(format!("{}/servers", self.base_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .context("sending server create request")?;
        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }

        let payload: Value = resp.json().await.context("decoding server create response")?;
        let instance = parse_server(&payload["server"], &agent_id)?;
        debug!(instance_id = %instance.id, agent_id = %agent_id, "cloud server created");
        Ok(instance)
    }

    async fn destroy(&self, instance_id: &str) -> Result<(), ProviderError> {
        let resp = self
            .http
            .delete(format!("{}/servers/{instance_id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("sending server delete request")?;
        if resp.status().as_u16() == 404 {
            return Err(ProviderError::NotFound(instance_id.to_string()));
        }
        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }
        Ok(())
    }

    async fn status(&self, instance_id: &str) -> Result<Option<VpsInstance>, ProviderError> {
        let resp = self
            .http
            .get(format!("{}/servers/{instance_id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("sending server status request")?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }
        let payload: Value = resp.json().await.context("decoding server status response")?;
        let server = &payload["server"];
        let agent_id = server["labels"]["agent-id"].as_str().unwrap_or_default();
        Ok(Some(parse_server(server, agent_id)?))
    }

    async fn list(&self) -> Result<Vec<VpsInstance>, ProviderError> {
        let resp = self
            .http
            .get(format!("{}/servers", self.base_url))
            .query(&[("label_selector", format!("{FLEET_LABEL}=true"))])
            .bearer_auth(&self.token)
            .send()
            .await
            .context("sending server list request")?;
        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }
        let payload: Value = resp.json().await.context("decoding server list response")?;
        let mut instances = Vec::new();
        for server in payload["servers"].as_array().into_iter().flatten() {
            let agent_id = server["labels"]["agent-id"].as_str().unwrap_or_default();
            instances.push(parse_server(server, agent_id)?);
        }
        Ok(instances)
    }
}

/// Map a provider lifecycle string into the common status variant.
fn map_status(raw: &str) -> InstanceStatus {
    match raw {
        "initializing" | "starting" => InstanceStatus::Creating,
        "running" => InstanceStatus::Running,
        "stopping" | "deleting" => InstanceStatus::Stopping,
        "off" => InstanceStatus::Stopped,
        _ => InstanceStatus::Error,
    }
}

fn parse_server(server: &Value, agent_id: &str) -> Result<VpsInstance, ProviderError> {
    let id = server["id"]
        .as_u64()
        .map(|n| n.to_string())
        .or_else(|| server["id"].as_str().map(str::to_string))
        .ok_or_else(|| ProviderError::Other(anyhow::anyhow!("server response missing id")))?;

    let created_at = server["created"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |t| t.with_timezone(&Utc));

    let mut metadata = serde_json::Map::new();
    if let Some(labels) = server["labels"].as_object() {
        metadata.insert("labels".to_string(), Value::Object(labels.clone()));
    }

    Ok(VpsInstance {
        id,
        provider: "hetzner".to_string(),
        status: map_status(server["status"].as_str().unwrap_or_default()),
        ipv4: server["public_net"]["ipv4"]["ip"].as_str().map(str::to_string),
        ipv6: server["public_net"]["ipv6"]["ip"].as_str().map(str::to_string),
        server_type: server["server_type"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        region: server["datacenter"]["location"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        created_at,
        agent_id: agent_id.to_string(),
        metadata,
    })
}
