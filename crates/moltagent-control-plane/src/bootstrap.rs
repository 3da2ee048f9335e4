//! Bootstrap-script generation.
//!
//! `generate` is a pure, deterministic function from a manifest to the
//! first-boot shell script a fresh node runs as root. Every value
//! substituted into the script is either single-quoted or base64-encoded,
//! so manifest content can never break out of the shell.

use std::fmt::Write as _;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use moltagent_common::manifest::Manifest;

use crate::providers::GATEWAY_PORT;

/// Canonical manifest location on the worker node.
pub const MANIFEST_PATH: &str = "/opt/moltagent/manifest.json";
/// Pinned Node.js major used by the worker runtime.
const NODE_MAJOR: u8 = 22;
/// Packages installed on every node regardless of capabilities.
const BASE_PACKAGES: &str = "curl git ca-certificates gnupg jq unzip";
/// Headless browser stack, installed only for web-browsing workers.
const BROWSER_PACKAGES: &str =
    "chromium-browser fonts-liberation libnss3 libatk-bridge2.0-0 libgtk-3-0 libgbm1";

/// Single-quote a value for safe interpolation into shell.
fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Rewrite the control-plane WS URL into the HTTP readiness endpoint.
/// `None` when the URL does not parse (the ping is best-effort anyway).
fn readiness_url(control_plane_url: &str) -> Option<String> {
    let mut url = url::Url::parse(control_plane_url).ok()?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;
    url.set_path("/moltagent/ready");
    url.set_query(None);
    Some(url.to_string())
}

/// Generate the first-boot script for a manifest.
#[must_use]
pub fn generate(manifest: &Manifest) -> String {
    let agent_id = manifest.identity.id.to_string();
    let manifest_b64 = BASE64.encode(serde_json::to_vec(manifest).unwrap_or_default());

    let mut script = String::new();
    let s = &mut script;

    let _ = writeln!(s, "#!/bin/bash");
    let _ = writeln!(s, "# MoltAgent worker bootstrap, generated from the agent manifest.");
    let _ = writeln!(s, "set -euo pipefail");
    let _ = writeln!(s, "export DEBIAN_FRONTEND=noninteractive");
    let _ = writeln!(s);
    let _ = writeln!(s, "apt-get update");
    let _ = writeln!(s, "apt-get install -y {BASE_PACKAGES}");
    let _ = writeln!(s);
    let _ = writeln!(s, "curl -fsSL https://deb.nodesource.com/setup_{NODE_MAJOR}.x | bash -");
    let _ = writeln!(s, "apt-get install -y nodejs");

    if manifest.capabilities.web_browsing {
        let _ = writeln!(s);
        let _ = writeln!(s, "apt-get install -y {BROWSER_PACKAGES}");
    }
    if !manifest.capabilities.pip_packages.is_empty() {
        let _ = writeln!(s);
        let _ = writeln!(s, "apt-get install -y python3 python3-pip python3-venv");
    }
    if !manifest.capabilities.apt_packages.is_empty() {
        let packages: Vec<String> = manifest
            .capabilities
            .apt_packages
            .iter()
            .map(|p| sh_quote(p))
            .collect();
        let _ = writeln!(s, "apt-get install -y {}", packages.join(" "));
    }
    if !manifest.capabilities.npm_packages.is_empty() {
        let packages: Vec<String> = manifest
            .capabilities
            .npm_packages
            .iter()
            .map(|p| sh_quote(p))
            .collect();
        let _ = writeln!(s, "npm install -g {}", packages.join(" "));
    }
    if !manifest.capabilities.pip_packages.is_empty() {
        let packages: Vec<String> = manifest
            .capabilities
            .pip_packages
            .iter()
            .map(|p| sh_quote(p))
            .collect();
        let _ = writeln!(s, "pip3 install --break-system-packages {}", packages.join(" "));
    }

    let _ = writeln!(s);
    let _ = writeln!(s, "install -d -m 0755 /opt/moltagent");
    let _ = writeln!(s, "echo '{manifest_b64}' | base64 -d > {MANIFEST_PATH}");
    let _ = writeln!(s, "chmod 0600 {MANIFEST_PATH}");

    for repo in &manifest.capabilities.git_repos {
        let _ = writeln!(s);
        let _ = writeln!(
            s,
            "git clone --branch {} {} {}",
            sh_quote(&repo.branch),
            sh_quote(&repo.url),
            sh_quote(&repo.path),
        );
        if let Some(setup) = &repo.setup {
            let _ = writeln!(s, "(cd {} && bash -c {})", sh_quote(&repo.path), sh_quote(setup));
        }
    }

    let _ = writeln!(s);
    let _ = writeln!(s, "npm install -g moltagent-worker");
    let _ = writeln!(s);
    let _ = writeln!(s, "cat > /etc/systemd/system/moltagent-worker.service <<UNIT");
    let _ = writeln!(s, "[Unit]");
    let _ = writeln!(s, "Description=MoltAgent worker");
    let _ = writeln!(s, "After=network-online.target");
    let _ = writeln!(s, "Wants=network-online.target");
    let _ = writeln!(s);
    let _ = writeln!(s, "[Service]");
    let _ = writeln!(s, "Environment=MOLTAGENT_MANIFEST={MANIFEST_PATH}");
    let _ = writeln!(s, "Environment=MOLTAGENT_ID={agent_id}");
    let _ = writeln!(s, "Environment=MOLTAGENT_GATEWAY_PORT={GATEWAY_PORT}");
    let _ = writeln!(s, "ExecStart=/usr/bin/moltagent-worker");
    let _ = writeln!(s, "Restart=always");
    let _ = writeln!(s, "RestartSec=5");
    let _ = writeln!(s);
    let _ = writeln!(s, "[Install]");
    let _ = writeln!(s, "WantedBy=multi-user.target");
    let _ = writeln!(s, "UNIT");
    let _ = writeln!(s);
    let _ = writeln!(s, "systemctl daemon-reload");
    let _ = writeln!(s, "systemctl enable --now moltagent-worker");

    if let Some(ready) = readiness_url(&manifest.control_plane.url) {
        let _ = writeln!(s);
        let _ = writeln!(
            s,
            "curl -fsS -m 10 -X POST {} \\",
            sh_quote(&ready),
        );
        let _ = writeln!(
            s,
            "  -H {} \\",
            sh_quote(&format!("Authorization: Bearer {}", manifest.control_plane.token)),
        );
        let _ = writeln!(s, "  -H 'Content-Type: application/json' \\");
        let _ = writeln!(
            s,
            "  -d {} || true",
            sh_quote(&format!("{{\"agentId\":\"{agent_id}\"}}")),
        );
    }

    script
}
