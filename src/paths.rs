use std::path::PathBuf;

use crate::error::ConvergeError;

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Default per-user VM root: `~/vmware/`
pub fn default_vm_root() -> PathBuf {
    home().join("vmware")
}

/// Default Workstation inventory: `~/.vmware/inventory.vmls`
pub fn default_inventory() -> PathBuf {
    home().join(".vmware").join("inventory.vmls")
}

/// Default config file: `~/.config/vmconverge/config.toml`
pub fn default_config_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home().join(".config"))
        .join("vmconverge")
        .join("config.toml")
}

/// Log directory: `~/.local/share/vmconverge/logs/`
pub fn logs_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vmconverge")
        .join("logs")
}

/// Directory a new VM named `name` is cloned into.
pub fn vm_dir(vm_root: &std::path::Path, name: &str) -> PathBuf {
    vm_root.join(name)
}

/// Descriptor path for a new VM named `name`: `<vm_root>/<name>/<name>.vmx`
pub fn vmx_path(vm_root: &std::path::Path, name: &str) -> PathBuf {
    vm_dir(vm_root, name).join(format!("{name}.vmx"))
}

/// A VM name becomes a directory under the VM root, so it must be a single
/// plain path component.
pub fn validate_vm_name(name: &str) -> Result<(), ConvergeError> {
    let invalid = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(ConvergeError::Validation {
            message: format!("invalid VM name '{name}': must be a single directory name"),
        });
    }
    Ok(())
}
