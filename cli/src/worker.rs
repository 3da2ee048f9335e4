//! Worker mode: run the bridge against the manifest's control plane.
//!
//! The reasoning runtime (LLM calls, tool dispatch, skills) lives in a
//! separate process started by the supervisor unit; this mode owns only
//! the control link — heartbeats, periodic status reports, and approval
//! correlation for whatever embeds it.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;

use moltagent_bridge::{Bridge, BridgeConfig};
use moltagent_common::types::{StatusReport, WorkerState};
use moltagent_control_plane::config::OrchestratorConfig;

use crate::commands::load_manifest;

/// Run the bridge until the control plane shuts us down.
///
/// # Errors
///
/// Returns an error when `MOLTAGENT_MANIFEST` is unset or the manifest
/// does not validate.
pub async fn run(config: &OrchestratorConfig) -> Result<()> {
    let path = config
        .manifest
        .as_ref()
        .context("worker mode requires MOLTAGENT_MANIFEST")?;
    let manifest = load_manifest(path)?;
    info!(
        agent_id = %manifest.identity.id,
        name = %manifest.identity.name,
        control_plane = %manifest.control_plane.url,
        "starting worker bridge"
    );

    let bridge = Bridge::new(BridgeConfig::from_manifest(&manifest));

    let report_interval = Duration::from_secs(manifest.control_plane.status_report_interval_secs);
    let goal_descriptions: Vec<String> =
        manifest.goals.iter().map(|g| g.description.clone()).collect();
    let status_bridge = bridge.clone();
    let started = Instant::now();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(report_interval);
        loop {
            tick.tick().await;
            status_bridge.send_status(build_report(started, &goal_descriptions));
        }
    });

    bridge.run().await;
    Ok(())
}

fn build_report(started: Instant, goals: &[String]) -> StatusReport {
    StatusReport {
        state: WorkerState::Idle,
        active_task: None,
        connected_channels: Vec::new(),
        uptime_secs: started.elapsed().as_secs(),
        memory_mb: rss_mb(),
        cpu_percent: 0.0,
        actions_today: 0,
        spend_today: 0.0,
        goal_progress: goals.iter().map(|g| (g.clone(), 0.0)).collect(),
    }
}

/// Resident set size of this process in megabytes; 0 where unavailable.
#[cfg(target_os = "linux")]
fn rss_mb() -> f64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0.0;
    };
    status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<f64>().ok())
        .map_or(0.0, |kb| kb / 1024.0)
}

#[cfg(not(target_os = "linux"))]
fn rss_mb() -> f64 {
    0.0
}
