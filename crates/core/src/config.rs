use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CLI_PATH: &str = "SKETCHFORGE_CLI";
pub const ENV_BUILD_ROOT: &str = "SKETCHFORGE_BUILD_ROOT";
pub const ENV_SIGNATURES: &str = "SKETCHFORGE_SIGNATURES";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub cli_path: String,
    pub build_root: PathBuf,
    pub signature_table: Option<PathBuf>,
    pub compile_timeout_ms: u64,
    pub upload_timeout_ms: u64,
    pub max_fix_attempts: u32,
    pub max_upload_attempts: u32,
    pub hotplug_interval_ms: u64,
    pub flush_interval_ms: u64,
    pub bootloader_timeout_ms: u64,
    pub patch_confidence_threshold: f32,
    pub default_baud: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            cli_path: "arduino-cli".to_string(),
            build_root: std::env::temp_dir().join("sketchforge-build"),
            signature_table: None,
            compile_timeout_ms: 300_000,
            upload_timeout_ms: 120_000,
            max_fix_attempts: 3,
            max_upload_attempts: 2,
            hotplug_interval_ms: 2_000,
            flush_interval_ms: 1_000,
            bootloader_timeout_ms: 10_000,
            patch_confidence_threshold: 0.75,
            default_baud: 115_200,
            retry_base_delay_ms: 500,
        }
    }
}

impl ToolConfig {
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn hotplug_interval(&self) -> Duration {
        Duration::from_millis(self.hotplug_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn bootloader_timeout(&self) -> Duration {
        Duration::from_millis(self.bootloader_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cli) = lookup(ENV_CLI_PATH) {
            self.cli_path = cli;
        }
        if let Some(root) = lookup(ENV_BUILD_ROOT) {
            self.build_root = PathBuf::from(root);
        }
        if let Some(table) = lookup(ENV_SIGNATURES) {
            self.signature_table = Some(PathBuf::from(table));
        }
    }
}

/// Reads the optional JSON config file, then lets environment variables win.
pub fn load_config(path: Option<&Path>) -> Result<ToolConfig> {
    let mut config = match path {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str::<ToolConfig>(&data)
                .with_context(|| format!("parse config {}", path.display()))?
        }
        None => ToolConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok().filter(|value| !value.is_empty()));
    log::debug!("tool config: cli={} build_root={}", config.cli_path, config.build_root.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sketchforge.json");
        std::fs::write(&path, r#"{"cli_path": "/opt/arduino-cli", "max_fix_attempts": 5}"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.max_fix_attempts, 5);
        assert_eq!(config.default_baud, 115_200);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = ToolConfig::default();
        config.apply_env(|key| match key {
            ENV_CLI_PATH => Some("/usr/local/bin/arduino-cli".to_string()),
            ENV_SIGNATURES => Some("/etc/boards.json".to_string()),
            _ => None,
        });
        assert_eq!(config.cli_path, "/usr/local/bin/arduino-cli");
        assert_eq!(config.signature_table, Some(PathBuf::from("/etc/boards.json")));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
