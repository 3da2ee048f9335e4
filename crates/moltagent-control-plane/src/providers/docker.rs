//! Local-container backend.
//!
//! Drives the host `docker` CLI through a [`CommandRunner`] so tests can
//! inject canned output. The worker's gateway port is published on an
//! ephemeral loopback port and the manifest travels in an environment
//! variable (base64 JSON) instead of user-data.

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::debug;

use moltagent_common::types::{InstanceStatus, VpsInstance};

use crate::command_runner::{CommandRunner, TokioCommandRunner};

use super::{CreateRequest, FLEET_LABEL, GATEWAY_PORT, ProviderError, VpsProvider, instance_name};

/// Registry name of this backend.
pub const PROVIDER_NAME: &str = "docker-local";

/// Container-runtime backend for local development fleets.
pub struct DockerProvider<R: CommandRunner = TokioCommandRunner> {
    runner: R,
}

impl Default for DockerProvider<TokioCommandRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerProvider<TokioCommandRunner> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            runner: TokioCommandRunner::default(),
        }
    }
}

impl<R: CommandRunner> DockerProvider<R> {
    /// Build with an explicit runner (used in tests).
    #[must_use]
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    /// Run one docker invocation, surfacing exit status and stderr on failure.
    async fn docker(&self, args: &[&str]) -> Result<String, ProviderError> {
        let output = self
            .runner
            .run("docker", args)
            .await
            .context("running docker")?;
        if !output.status.success() {
            return Err(ProviderError::Command {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl<R: CommandRunner> VpsProvider for DockerProvider<R> {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn create(&self, req: CreateRequest<'_>) -> Result<VpsInstance, ProviderError> {
        let manifest = req.manifest;
        let agent_id = manifest.identity.id.to_string();
        let manifest_b64 = BASE64.encode(
            serde_json::to_vec(manifest).context("serializing manifest for container env")?,
        );

        let name = instance_name(&agent_id);
        let fleet_label = format!("{FLEET_LABEL}=true");
        let agent_label = format!("agent-id={agent_id}");
        let owner_label = format!("owner-id={}", manifest.identity.owner_id);
        let manifest_env = format!("MOLTAGENT_MANIFEST_B64={manifest_b64}");
        let id_env = format!("MOLTAGENT_ID={agent_id}");
        let publish = format!("127.0.0.1::{GATEWAY_PORT}");

        let container_id = self
            .docker(&[
                "run",
                "-d",
                "--restart",
                "always",
                "--name",
                &name,
                "--label",
                &fleet_label,
                "--label",
                &agent_label,
                "--label",
                &owner_label,
                "-p",
                &publish,
                "-e",
                &manifest_env,
                "-e",
                &id_env,
                &manifest.resources.docker_image,
            ])
            .await?;

        // The runtime assigns the ephemeral host port; record it so callers
        // can reach the gateway without another inspect.
        let mut metadata = serde_json::Map::new();
        metadata.insert("containerName".to_string(), json!(name));
        if let Ok(mapping) = self
            .docker(&["port", &container_id, &format!("{GATEWAY_PORT}/tcp")])
            .await
        {
            if let Some(port) = mapping.rsplit(':').next().and_then(|p| p.trim().parse::<u16>().ok())
            {
                metadata.insert("hostPort".to_string(), json!(port));
            }
        }

        debug!(container_id = %container_id, agent_id = %agent_id, "container created");
        Ok(VpsInstance {
            id: container_id,
            provider: PROVIDER_NAME.to_string(),
            status: InstanceStatus::Running,
            ipv4: Some("127.0.0.1".to_string()),
            ipv6: None,
            server_type: "container".to_string(),
            region: "local".to_string(),
            created_at: Utc::now(),
            agent_id,
            metadata,
        })
    }

    async fn destroy(&self, instance_id: &str) -> Result<(), ProviderError> {
        match self.docker(&["rm", "-f", instance_id]).await {
            Ok(_) => Ok(()),
            Err(ProviderError::Command { stderr, .. }) if stderr.contains("No such container") => {
                Err(ProviderError::NotFound(instance_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn status(&self, instance_id: &str) -> Result<Option<VpsInstance>, ProviderError> {
        let raw = match self.docker(&["inspect", instance_id]).await {
            Ok(raw) => raw,
            Err(ProviderError::Command { stderr, .. }) if stderr.contains("No such object") => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let parsed: Value = serde_json::from_str(&raw).context("decoding docker inspect output")?;
        let Some(detail) = parsed.as_array().and_then(|a| a.first()) else {
            return Ok(None);
        };
        Ok(Some(instance_from_inspect(instance_id, detail)))
    }

    async fn list(&self) -> Result<Vec<VpsInstance>, ProviderError> {
        let raw = self
            .docker(&[
                "ps",
                "-a",
                "--filter",
                &format!("label={FLEET_LABEL}=true"),
                "--format",
                "{{json .}}",
            ])
            .await?;
        let mut instances = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(row) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            let id = row["ID"].as_str().unwrap_or_default().to_string();
            let labels = row["Labels"].as_str().unwrap_or_default();
            let agent_id = labels
                .split(',')
                .find_map(|kv| kv.strip_prefix("agent-id="))
                .unwrap_or_default()
                .to_string();
            instances.push(VpsInstance {
                id,
                provider: PROVIDER_NAME.to_string(),
                status: map_container_state(row["State"].as_str().unwrap_or_default()),
                ipv4: Some("127.0.0.1".to_string()),
                ipv6: None,
                server_type: "container".to_string(),
                region: "local".to_string(),
                created_at: Utc::now(),
                agent_id,
                metadata: serde_json::Map::new(),
            });
        }
        Ok(instances)
    }
}

/// Map a container runtime state into the common status variant.
fn map_container_state(raw: &str) -> InstanceStatus {
    match raw {
        "created" | "restarting" => InstanceStatus::Creating,
        "running" => InstanceStatus::Running,
        "removing" => InstanceStatus::Stopping,
        "exited" | "dead" => InstanceStatus::Stopped,
        _ => InstanceStatus::Error,
    }
}

fn instance_from_inspect(instance_id: &str, detail: &Value) -> VpsInstance {
    let agent_id = detail["Config"]["Labels"]["agent-id"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let created_at = detail["Created"]
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |t| t.with_timezone(&Utc));
    VpsInstance {
        id: instance_id.to_string(),
        provider: PROVIDER_NAME.to_string(),
        status: map_container_state(detail["State"]["Status"].as_str().unwrap_or_default()),
        ipv4: Some("127.0.0.1".to_string()),
        ipv6: None,
        server_type: "container".to_string(),
        region: "local".to_string(),
        created_at,
        agent_id,
        metadata: serde_json::Map::new(),
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Canned-output runner; pops one response per invocation and records
    /// the argv it was called with.
    struct MockRunner {
        responses: Mutex<std::collections::VecDeque<Output>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl MockRunner {
        fn new(responses: Vec<Output>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    fn ok_output(stdout: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    fn err_output(stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(256), // exit code 1
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(&self, _program: &str, args: &[&str]) -> Result<Output> {
            self.calls
                .lock()
                .unwrap()
                .push(args.iter().map(ToString::to_string).collect());
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected docker invocation"))
        }

        async fn run_with_timeout(
            &self,
            program: &str,
            args: &[&str],
            _timeout: Duration,
        ) -> Result<Output> {
            self.run(program, args).await
        }
    }

    fn test_manifest() -> moltagent_common::Manifest {
        moltagent_common::Manifest::from_value(serde_json::json!({
            "identity": {
                "id": "6f2b8a9e-0c1d-4e5f-8a7b-112233445566",
                "name": "a1",
                "ownerId": "o1",
            },
        }))
        .expect("test manifest")
    }

    #[tokio::test]
    async fn create_runs_container_and_records_host_port() {
        let runner = MockRunner::new(vec![
            ok_output("abc123\n"),
            ok_output("127.0.0.1:49153\n"),
        ]);
        let provider = DockerProvider::with_runner(runner);
        let manifest = test_manifest();
        let instance = provider
            .create(CreateRequest {
                manifest: &manifest,
                bootstrap_script: "",
                ssh_key_ids: &[],
            })
            .await
            .expect("create");

        assert_eq!(instance.id, "abc123");
        assert_eq!(instance.ipv4.as_deref(), Some("127.0.0.1"));
        assert_eq!(instance.metadata["hostPort"], serde_json::json!(49153));

        let calls = provider.runner.calls.lock().unwrap();
        let run_args = &calls[0];
        assert_eq!(run_args[0], "run");
        assert!(run_args.contains(&"moltagent=true".to_string()));
        assert!(run_args.iter().any(|a| a.starts_with("MOLTAGENT_MANIFEST_B64=")));
        assert!(run_args.contains(&"moltagent/worker:latest".to_string()));
    }

    #[tokio::test]
    async fn status_maps_container_states() {
        let inspect = serde_json::json!([{
            "Created": "2026-01-15T10:00:00Z",
            "State": {"Status": "exited"},
            "Config": {"Labels": {"agent-id": "U1"}},
        }]);
        let runner = MockRunner::new(vec![ok_output(&inspect.to_string())]);
        let provider = DockerProvider::with_runner(runner);
        let instance = provider.status("abc123").await.expect("status").expect("present");
        assert_eq!(instance.status, InstanceStatus::Stopped);
        assert_eq!(instance.agent_id, "U1");
    }

    #[tokio::test]
    async fn status_missing_container_is_none() {
        let runner = MockRunner::new(vec![err_output("Error: No such object: abc123")]);
        let provider = DockerProvider::with_runner(runner);
        assert!(provider.status("abc123").await.expect("status").is_none());
    }

    #[tokio::test]
    async fn destroy_missing_container_is_not_found() {
        let runner = MockRunner::new(vec![err_output("Error: No such container: abc123")]);
        let provider = DockerProvider::with_runner(runner);
        match provider.destroy("abc123").await {
            Err(ProviderError::NotFound(id)) => assert_eq!(id, "abc123"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_parses_labelled_rows() {
        let rows = concat!(
            r#"{"ID":"c1","State":"running","Labels":"moltagent=true,agent-id=U1"}"#,
            "\n",
            r#"{"ID":"c2","State":"exited","Labels":"moltagent=true,agent-id=U2"}"#,
        );
        let runner = MockRunner::new(vec![ok_output(rows)]);
        let provider = DockerProvider::with_runner(runner);
        let instances = provider.list().await.expect("list");
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].agent_id, "U1");
        assert_eq!(instances[1].status, InstanceStatus::Stopped);
    }
}
