//! Command implementations

pub mod approve;
pub mod destroy;
pub mod list;
pub mod provision;
pub mod status;
pub mod validate;

use std::path::Path;

use anyhow::{Context, Result};

use moltagent_common::Manifest;

/// Read and validate a manifest file. JSON by default; `.yaml`/`.yml`
/// files are accepted too.
///
/// # Errors
///
/// Returns an error listing every validation issue when the document is
/// rejected, or an I/O error when the file cannot be read.
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read manifest {}", path.display()))?;

    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

    let result = if is_yaml {
        let value: serde_json::Value = serde_yaml::from_str(&content)
            .with_context(|| format!("cannot parse YAML in {}", path.display()))?;
        Manifest::from_value(value)
    } else {
        Manifest::parse(content.as_bytes())
    };

    result.map_err(|e| anyhow::anyhow!("manifest validation failed:\n{e}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn load_manifest_accepts_json_and_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");

        let json_path = dir.path().join("agent.json");
        std::fs::write(&json_path, r#"{"identity": {"name": "a1"}}"#).unwrap();
        assert_eq!(load_manifest(&json_path).expect("json").identity.name, "a1");

        let yaml_path = dir.path().join("agent.yaml");
        std::fs::write(&yaml_path, "identity:\n  name: a2\n").unwrap();
        assert_eq!(load_manifest(&yaml_path).expect("yaml").identity.name, "a2");
    }

    #[test]
    fn load_manifest_surfaces_validation_issues() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"goals": [{"description": "g", "priority": 9}]}"#).unwrap();
        let err = load_manifest(&path).expect_err("invalid priority");
        assert!(err.to_string().contains("goals[0].priority"));
    }

    #[test]
    fn load_manifest_missing_file_errors() {
        assert!(load_manifest(Path::new("/nonexistent/agent.json")).is_err());
    }
}
