use crate::core::executor::ScriptMode;
use crate::elevation::ElevationMethod;
use crate::utils::{config_path, ensure_dirs};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Upper bound for the bulk runner's per-command timeout
pub const MAX_BULK_TIMEOUT_SECS: u64 = 3600;

/// Complete runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// iptables binary (name in PATH or absolute path)
    #[serde(default = "default_iptables_command")]
    pub iptables_command: String,
    /// Interface matched when a source address is the "any" wildcard
    #[serde(default = "default_lan_interface")]
    pub lan_interface: String,
    #[serde(default)]
    pub elevation: ElevationMethod,
    /// How check/act scripts are executed
    #[serde(default)]
    pub script_mode: ScriptMode,
    /// Per-command timeout for bulk runs (default: 10s, max: 3600s)
    #[serde(default = "default_bulk_timeout")]
    pub bulk_timeout_secs: u64,
    /// Local port the diagnostic HTTP redirect points at
    #[serde(default = "default_diag_redirect_port")]
    pub diag_redirect_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            iptables_command: default_iptables_command(),
            lan_interface: default_lan_interface(),
            elevation: ElevationMethod::default(),
            script_mode: ScriptMode::default(),
            bulk_timeout_secs: default_bulk_timeout(),
            diag_redirect_port: default_diag_redirect_port(),
        }
    }
}

fn default_iptables_command() -> String {
    "iptables".to_string()
}

fn default_lan_interface() -> String {
    "eth0".to_string()
}

fn default_bulk_timeout() -> u64 {
    10
}

fn default_diag_redirect_port() -> u16 {
    8835
}

impl AppConfig {
    /// Bulk runner timeout, clamped to 1..=3600 seconds
    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_timeout_secs.clamp(1, MAX_BULK_TIMEOUT_SECS))
    }

    /// Applies `FWQ_IPTABLES_COMMAND` on top of the loaded values
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(command) = std::env::var("FWQ_IPTABLES_COMMAND")
            && !command.is_empty()
        {
            self.iptables_command = command;
        }
        self
    }

    /// Checks values that end up on iptables command lines.
    ///
    /// # Errors
    ///
    /// Returns `Err` describing the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.iptables_command.is_empty()
            || self.iptables_command.chars().any(char::is_whitespace)
        {
            return Err("iptables_command must be a single path without spaces".to_string());
        }
        crate::validators::validate_interface(&self.lan_interface)
            .map_err(|e| format!("lan_interface: {e}"))?;
        crate::validators::validate_port(self.diag_redirect_port)
            .map_err(|e| format!("diag_redirect_port: {e}"))?;
        Ok(())
    }
}

/// Saves the config to `path` using an atomic write pattern.
/// 1. Writes to a temporary file in the same directory (created 0o600).
/// 2. Flushes it to disk.
/// 3. Atomically renames it over the target path.
///
/// # Errors
///
/// Returns `Err` if the directory is not writable or the disk is full.
pub fn save_config_to(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(json.as_bytes())?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e.error
        }
    })?;
    Ok(())
}

/// Saves the config to the default location in the data directory.
///
/// # Errors
///
/// Returns `Err` if the data directory cannot be created or written.
pub fn save_config(config: &AppConfig) -> std::io::Result<()> {
    ensure_dirs()?;
    match config_path() {
        Some(path) => save_config_to(config, &path),
        None => Ok(()),
    }
}

/// Loads config from an explicit path.
///
/// # Errors
///
/// Returns `Err` if the file cannot be read or is not valid config JSON.
pub async fn load_config_from(path: &Path) -> crate::Result<AppConfig> {
    let json = tokio::fs::read_to_string(path).await?;
    let config = serde_json::from_str::<AppConfig>(&json)?;
    Ok(config.with_env_overrides())
}

/// Loads the config from the data directory, or returns defaults if not found.
pub async fn load_config() -> AppConfig {
    if let Some(path) = config_path()
        && let Ok(config) = load_config_from(&path).await
    {
        return config;
    }
    AppConfig::default().with_env_overrides()
}
