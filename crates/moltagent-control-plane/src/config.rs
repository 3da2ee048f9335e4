//! Orchestrator configuration loaded from `MOLTAGENT_*` environment
//! variables via `envy`, with sensible defaults for everything optional.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default standalone WebSocket/API port.
pub const DEFAULT_CP_PORT: u16 = 18790;

/// Environment-derived settings. Each field maps to `MOLTAGENT_<FIELD>`:
///   - `MOLTAGENT_CONTROL_PLANE` — `1` forces orchestrator mode
///   - `MOLTAGENT_API_TOKEN`     — shared bearer token (presence also
///     enables orchestrator mode; empty disables auth for local dev)
///   - `MOLTAGENT_CP_PORT`       — listen port (default 18790)
///   - `MOLTAGENT_DATA_DIR`      — overrides the fleet-file directory
///   - `MOLTAGENT_MANIFEST`      — worker-mode manifest path
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub control_plane: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_cp_port")]
    pub cp_port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub manifest: Option<PathBuf>,
}

fn default_cp_port() -> u16 {
    DEFAULT_CP_PORT
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            control_plane: None,
            api_token: None,
            cp_port: DEFAULT_CP_PORT,
            data_dir: None,
            manifest: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error when a variable is present but unparseable
    /// (e.g. a non-numeric `MOLTAGENT_CP_PORT`).
    pub fn from_env() -> Result<Self> {
        envy::prefixed("MOLTAGENT_")
            .from_env()
            .context("failed to load config from MOLTAGENT_* env vars")
    }

    /// Orchestrator mode is on when explicitly requested or when an API
    /// token is configured.
    #[must_use]
    pub fn orchestrator_enabled(&self) -> bool {
        self.control_plane.as_deref() == Some("1")
            || self.api_token.as_ref().is_some_and(|t| !t.is_empty())
    }

    /// Worker mode is on when a manifest path is set.
    #[must_use]
    pub fn worker_enabled(&self) -> bool {
        self.manifest.is_some()
    }

    /// Shared bearer token; empty means auth is disabled (local dev).
    #[must_use]
    pub fn token(&self) -> String {
        self.api_token.clone().unwrap_or_default()
    }

    /// Directory holding durable state, `~/.moltagent` unless overridden.
    ///
    /// # Errors
    ///
    /// Returns an error if no override is set and the home directory
    /// cannot be determined.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        Ok(home.join(".moltagent"))
    }

    /// Path of the fleet registry file.
    ///
    /// # Errors
    ///
    /// See [`OrchestratorConfig::data_dir`].
    pub fn fleet_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("fleet.json"))
    }
}
