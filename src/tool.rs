// src/tool.rs

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const MANIFEST_FILE: &str = "tool.json";

/// On-disk manifest, as authored in `tool.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ToolManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Worker executable, relative to the tool directory.
    pub entry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An installed tool. Immutable once loaded; a new version means unload and
/// load again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tool {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Absolute path of the worker executable.
    pub entry: PathBuf,
    /// Directory the tool was installed into; the worker's working directory.
    pub root: PathBuf,
    pub icon: Option<String>,
    pub description: Option<String>,
}

impl ToolManifest {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("id", &self.id),
            ("name", &self.name),
            ("version", &self.version),
            ("entry", &self.entry),
        ] {
            if value.trim().is_empty() {
                bail!("manifest field `{field}` must not be empty");
            }
        }
        Ok(())
    }
}

impl Tool {
    pub fn new(id: impl Into<String>, entry: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: "0.0.0".to_string(),
            entry: entry.into(),
            root: root.into(),
            icon: None,
            description: None,
        }
    }

    /// Load `<dir>/tool.json` and resolve its entry against `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let manifest: ToolManifest =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        manifest.validate().with_context(|| format!("validating {}", path.display()))?;
        Ok(Self::from_manifest(manifest, dir))
    }

    pub fn from_manifest(manifest: ToolManifest, dir: &Path) -> Self {
        let root = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let entry = Path::new(&manifest.entry);
        let entry = if entry.is_absolute() { entry.to_path_buf() } else { root.join(entry) };
        Self {
            id: manifest.id,
            name: manifest.name,
            version: manifest.version,
            entry,
            root,
            icon: manifest.icon,
            description: manifest.description,
        }
    }
}

/// Every tool found one level below `dir`. Directories without a manifest are
/// ignored and broken manifests are logged and skipped.
pub fn discover_tools(dir: &Path) -> Result<Vec<Tool>> {
    let mut tools = vec![];
    let entries = fs::read_dir(dir).with_context(|| format!("reading tools dir {}", dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || !path.join(MANIFEST_FILE).exists() {
            continue;
        }
        match Tool::from_dir(&path) {
            Ok(tool) => {
                debug!(tool_id = %tool.id, "discovered tool at {}", path.display());
                tools.push(tool);
            }
            Err(err) => warn!("Skipping tool at {}: {err:#}", path.display()),
        }
    }
    tools.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(tools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_manifest(root: &Path, dir: &str, body: &str) {
        let dir = root.join(dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), body).unwrap();
    }

    #[test]
    fn discovers_valid_tools_and_skips_broken_ones() {
        let tmp = TempDir::new().unwrap();
        write_manifest(
            tmp.path(),
            "b",
            r#"{"id":"beta","name":"Beta","version":"1.0.0","entry":"bin/beta","description":"second"}"#,
        );
        write_manifest(tmp.path(), "a", r#"{"id":"alpha","name":"Alpha","version":"0.1.0","entry":"run"}"#);
        write_manifest(tmp.path(), "broken", "{ not json");
        write_manifest(tmp.path(), "empty", r#"{"id":"","name":"x","version":"1","entry":"run"}"#);
        fs::create_dir_all(tmp.path().join("no_manifest")).unwrap();
        fs::write(tmp.path().join("stray.txt"), "ignored").unwrap();

        let tools = discover_tools(tmp.path()).unwrap();
        let ids: Vec<_> = tools.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);

        let beta = &tools[1];
        assert!(beta.entry.ends_with("bin/beta"));
        assert!(beta.entry.starts_with(&beta.root));
        assert_eq!(beta.description.as_deref(), Some("second"));
    }

    #[test]
    fn validate_rejects_blank_fields() {
        let manifest = ToolManifest {
            id: "t".into(),
            name: "T".into(),
            version: " ".into(),
            entry: "run".into(),
            icon: None,
            description: None,
        };
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn missing_tools_dir_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(discover_tools(&tmp.path().join("nope")).is_err());
    }
}
