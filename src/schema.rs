// src/schema.rs

use std::{fs, path::Path};

use anyhow::Result;
use schemars::schema_for;
use tool_plugin::{Message, NotificationOptions};

use crate::config::ToolHostConfig;
use crate::tool::ToolManifest;

/// Write the JSON Schemas tool authors and integrators need into `out_dir`.
/// Returns the files written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>> {
    fs::create_dir_all(out_dir)?;

    let schemas = [
        ("tool.schema.json", serde_json::to_string_pretty(&schema_for!(ToolManifest))?),
        ("message.schema.json", serde_json::to_string_pretty(&schema_for!(Message))?),
        ("notification.schema.json", serde_json::to_string_pretty(&schema_for!(NotificationOptions))?),
        ("config.schema.json", serde_json::to_string_pretty(&schema_for!(ToolHostConfig))?),
    ];

    let mut written = vec![];
    for (name, body) in schemas {
        fs::write(out_dir.join(name), body)?;
        written.push(name.to_string());
    }
    Ok(written)
}
