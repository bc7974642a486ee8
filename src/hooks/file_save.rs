use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{HookContext, OutputHook};
use crate::utils::canonical::sha256_hex;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct FileSaveSettings {
    temp_dir: Option<PathBuf>,
    file_prefix: String,
    include_metadata: bool,
    /// Files older than this many hours are removed before each save.
    cleanup_max_age_hours: Option<u64>,
}

impl Default for FileSaveSettings {
    fn default() -> Self {
        Self {
            temp_dir: None,
            file_prefix: "tool_output".to_string(),
            include_metadata: true,
            cleanup_max_age_hours: None,
        }
    }
}

/// Offloads bulky outputs to disk, replacing the payload with a small
/// descriptor `{file_path, data_format, file_size, data_structure}`.
/// Structured results are written as pretty JSON, strings as plain text.
pub struct FileSaveHook {
    settings: FileSaveSettings,
}

impl FileSaveHook {
    pub fn from_value(config: &Value) -> Result<Self> {
        let settings = if config.is_null() {
            FileSaveSettings::default()
        } else {
            serde_json::from_value(config.clone())?
        };
        Ok(Self { settings })
    }

    fn directory(&self) -> PathBuf {
        self.settings
            .temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("tooluniverse_outputs"))
    }

    /// Remove files under the output directory older than the configured
    /// age. Best-effort: failures only log.
    fn cleanup_old_files(&self, max_age_hours: u64) {
        let dir = self.directory();
        let cutoff = Duration::from_secs(max_age_hours * 3600);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .is_some_and(|age| age > cutoff);
            if expired {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("file-save cleanup failed for {}: {}", path.display(), e);
                } else {
                    debug!("file-save cleanup removed {}", path.display());
                }
            }
        }
    }
}

#[async_trait]
impl OutputHook for FileSaveHook {
    fn name(&self) -> &str {
        "file_save"
    }

    async fn apply(&self, output: &Value, ctx: &HookContext<'_>) -> Result<Value> {
        if let Some(max_age) = self.settings.cleanup_max_age_hours {
            self.cleanup_old_files(max_age);
        }

        let (payload, data_format, data_structure) = match output {
            Value::String(s) => (s.clone(), "txt", "text"),
            Value::Array(_) => (serde_json::to_string_pretty(output)?, "json", "array"),
            Value::Object(_) => (serde_json::to_string_pretty(output)?, "json", "object"),
            other => (serde_json::to_string_pretty(other)?, "json", "scalar"),
        };

        let dir = self.directory();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let short_hash = &sha256_hex(&payload)[..8];
        let file_name = format!(
            "{}_{}_{}.{}",
            self.settings.file_prefix, timestamp, short_hash, data_format
        );
        let path = dir.join(file_name);
        tokio::fs::write(&path, payload.as_bytes())
            .await
            .with_context(|| format!("Failed to write output file: {}", path.display()))?;
        debug!(
            "file-save wrote {} bytes of '{}' output to {}",
            payload.len(),
            ctx.tool_name,
            path.display()
        );

        let mut descriptor = json!({
            "file_path": path.to_string_lossy(),
            "data_format": data_format,
            "file_size": payload.len(),
            "data_structure": data_structure,
        });
        if self.settings.include_metadata {
            descriptor["metadata"] = json!({
                "tool_name": ctx.tool_name,
                "arguments": ctx.arguments,
                "saved_at": Utc::now().to_rfc3339(),
            });
        }
        Ok(descriptor)
    }
}
