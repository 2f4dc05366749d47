use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::ConvergeError;
use crate::paths;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub vmrun: VmrunConfig,
    #[facet(default)]
    pub ovftool: OvftoolConfig,
    #[facet(default)]
    pub paths: PathsConfig,
    #[facet(default)]
    pub settle: SettleConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct VmrunConfig {
    #[facet(default = "vmrun")]
    pub path: String,
    /// `-T` host type: ws, fusion or player.
    #[facet(default = "ws")]
    pub host_type: String,
    /// Start VMs with a console window instead of `nogui`.
    #[facet(default)]
    pub gui: bool,
}

impl Default for VmrunConfig {
    fn default() -> Self {
        Self {
            path: "vmrun".into(),
            host_type: "ws".into(),
            gui: false,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct OvftoolConfig {
    #[facet(default = "ovftool")]
    pub path: String,
}

impl Default for OvftoolConfig {
    fn default() -> Self {
        Self {
            path: "ovftool".into(),
        }
    }
}

/// Empty strings fall back to the per-user defaults in [`paths`].
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct PathsConfig {
    #[facet(default)]
    pub vm_root: String,
    #[facet(default)]
    pub inventory: String,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SettleConfig {
    #[facet(default = 60)]
    pub timeout_s: u64,
    #[facet(default = 1000)]
    pub poll_interval_ms: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            timeout_s: 60,
            poll_interval_ms: 1000,
        }
    }
}

// ── Settings ──────────────────────────────────────────────

/// Resolved runtime settings: config values with paths and durations filled in.
#[derive(Debug, Clone)]
pub struct Settings {
    pub vmrun: String,
    pub host_type: String,
    pub gui: bool,
    pub ovftool: String,
    pub vm_root: PathBuf,
    pub inventory: PathBuf,
    pub settle_timeout: Duration,
    pub poll_interval: Duration,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            vmrun: config.vmrun.path.clone(),
            host_type: config.vmrun.host_type.clone(),
            gui: config.vmrun.gui,
            ovftool: config.ovftool.path.clone(),
            vm_root: resolve_path(&config.paths.vm_root, paths::default_vm_root),
            inventory: resolve_path(&config.paths.inventory, paths::default_inventory),
            settle_timeout: Duration::from_secs(config.settle.timeout_s),
            poll_interval: Duration::from_millis(config.settle.poll_interval_ms),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

fn resolve_path(value: &str, default: fn() -> PathBuf) -> PathBuf {
    if value.is_empty() {
        return default();
    }
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(rest),
        None => PathBuf::from(value),
    }
}

// ── validation ────────────────────────────────────────────

const HOST_TYPES: &[&str] = &["ws", "fusion", "player"];

fn validate_config(config: &Config) -> Result<(), ConvergeError> {
    if config.vmrun.path.trim().is_empty() {
        return Err(ConvergeError::Validation {
            message: "vmrun.path must not be empty".into(),
        });
    }
    if config.ovftool.path.trim().is_empty() {
        return Err(ConvergeError::Validation {
            message: "ovftool.path must not be empty".into(),
        });
    }
    if !HOST_TYPES.contains(&config.vmrun.host_type.as_str()) {
        return Err(ConvergeError::Validation {
            message: format!(
                "vmrun.host_type must be one of {} (got '{}')",
                HOST_TYPES.join(", "),
                config.vmrun.host_type
            ),
        });
    }
    if config.settle.poll_interval_ms == 0 {
        return Err(ConvergeError::Validation {
            message: "settle.poll_interval_ms must be at least 1".into(),
        });
    }
    if config.settle.poll_interval_ms > config.settle.timeout_s.saturating_mul(1000) {
        return Err(ConvergeError::Validation {
            message: "settle.poll_interval_ms must not exceed settle.timeout_s".into(),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn parse_config(contents: &str, path: &Path) -> Result<Config, ConvergeError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| ConvergeError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Load settings from `path`, or from the default location when `path` is
/// `None`. A missing default file yields the built-in defaults; a missing
/// explicit file is an error.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConvergeError> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (paths::default_config_file(), false),
    };

    if !explicit && !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(Settings::default());
    }

    let contents = std::fs::read_to_string(&path).map_err(|source| ConvergeError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    let config = parse_config(&contents, &path)?;
    Ok(Settings::from_config(&config))
}
