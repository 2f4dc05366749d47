#[cfg(test)]
pub mod mock;
pub mod vmrun;

use std::path::Path;

use serde::Serialize;

use crate::config::Settings;
use crate::error::ConvergeError;
use crate::vm_state::VmDescriptor;

/// Outcome of one external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub command: String,
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ActionResult {
    pub fn success(&self) -> bool {
        self.rc == 0
    }
}

/// `hard` powers off / resets immediately; `soft` asks the guest tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Hard,
    Soft,
}

impl PowerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerMode::Hard => "hard",
            PowerMode::Soft => "soft",
        }
    }
}

/// The VM registry and actuator the controller drives.
///
/// Mutating operations return the command that ran with its exit code and
/// captured output; a non-zero exit is *not* an `Err`, the caller decides.
/// `Err` is reserved for failing to run the tool at all.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Hypervisor {
    /// Look up a VM by display name. Unknown entries (unregistered, or
    /// registered with a missing descriptor) only match with `include_unknown`.
    async fn lookup(
        &self,
        name: &str,
        include_unknown: bool,
    ) -> Result<Option<VmDescriptor>, ConvergeError>;

    /// All VMs the registry can see, including unknown ones.
    async fn list(&self) -> Result<Vec<VmDescriptor>, ConvergeError>;

    async fn start(&self, vmx: &Path) -> Result<ActionResult, ConvergeError>;
    async fn stop(&self, vmx: &Path, mode: PowerMode) -> Result<ActionResult, ConvergeError>;
    async fn reset(&self, vmx: &Path, mode: PowerMode) -> Result<ActionResult, ConvergeError>;
    async fn suspend(&self, vmx: &Path) -> Result<ActionResult, ConvergeError>;
    async fn delete(&self, vmx: &Path) -> Result<ActionResult, ConvergeError>;

    /// Full clone of `template` into `target`, named `name`.
    async fn clone_vm(
        &self,
        name: &str,
        target: &Path,
        template: &Path,
    ) -> Result<ActionResult, ConvergeError>;

    /// Import an OVA package into `dest_dir`.
    async fn import_ova(
        &self,
        ova: &Path,
        dest_dir: &Path,
        accept_eula: bool,
    ) -> Result<ActionResult, ConvergeError>;

    /// The display name a VM imported from `ova` will get.
    async fn ova_display_name(&self, ova: &Path) -> Result<String, ConvergeError>;
}

pub fn create_backend(settings: &Settings) -> vmrun::VmrunBackend {
    vmrun::VmrunBackend::new(settings)
}
