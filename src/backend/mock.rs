//! In-memory hypervisor for testing.
//!
//! Records every action and keeps a small VM table that the actions mutate,
//! so convergence can be driven end to end without `vmrun`. Clones and
//! imports write real descriptor files, which lets tests point the VM root
//! at a temp dir and exercise the filesystem checks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::ConvergeError;
use crate::vm_state::VmDescriptor;

use super::{ActionResult, Hypervisor, PowerMode};

#[derive(Default)]
struct State {
    vms: Vec<VmDescriptor>,
    actions: Vec<String>,
    failures: HashMap<&'static str, i32>,
    ova_names: HashMap<PathBuf, String>,
    /// Lookups that still return the pre-mutation view.
    stale_lookups: usize,
}

#[derive(Default)]
pub struct MockHypervisor {
    state: Mutex<State>,
    skip_clone_file: bool,
    settle_lag: usize,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vms(vms: Vec<VmDescriptor>) -> Self {
        let mock = Self::new();
        mock.state().vms = vms;
        mock
    }

    /// Clone reports success without writing the descriptor.
    pub fn skipping_clone_file(mut self) -> Self {
        self.skip_clone_file = true;
        self
    }

    /// Serve `lag` stale lookups after each mutation.
    pub fn with_settle_lag(mut self, lag: usize) -> Self {
        self.settle_lag = lag;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Make every future `action` exit with `rc`.
    pub fn fail(&self, action: &'static str, rc: i32) {
        self.state().failures.insert(action, rc);
    }

    pub fn set_ova_name(&self, ova: &Path, name: &str) {
        self.state().ova_names.insert(ova.to_path_buf(), name.to_string());
    }

    /// Action labels in execution order, e.g. `["stop", "delete"]`.
    pub fn actions(&self) -> Vec<String> {
        self.state().actions.clone()
    }

    pub fn vms(&self) -> Vec<VmDescriptor> {
        self.state().vms.clone()
    }

    /// Record `action`, and apply `mutate` unless the action is set to fail.
    fn act(
        &self,
        action: &'static str,
        detail: String,
        mutate: impl FnOnce(&mut Vec<VmDescriptor>),
    ) -> ActionResult {
        let mut state = self.state();
        state.actions.push(action.to_string());
        let rc = state.failures.get(action).copied().unwrap_or(0);
        if rc == 0 {
            mutate(&mut state.vms);
            state.stale_lookups = self.settle_lag;
        }
        ActionResult {
            command: format!("mock {action} {detail}"),
            rc,
            stdout: String::new(),
            stderr: if rc == 0 {
                String::new()
            } else {
                format!("{action} failed")
            },
        }
    }
}

/// VM with the given descriptor path, for building fixtures.
pub fn vm(name: &str, config: impl Into<PathBuf>) -> VmDescriptor {
    VmDescriptor {
        name: name.to_string(),
        config: config.into(),
        exists: true,
        registered: true,
        running: false,
    }
}

fn set_running(vms: &mut [VmDescriptor], vmx: &Path, running: bool) {
    for vm in vms.iter_mut().filter(|vm| vm.config == vmx) {
        vm.running = running;
    }
}

impl Hypervisor for MockHypervisor {
    async fn lookup(
        &self,
        name: &str,
        include_unknown: bool,
    ) -> Result<Option<VmDescriptor>, ConvergeError> {
        let mut state = self.state();
        if state.stale_lookups > 0 {
            state.stale_lookups -= 1;
            return Ok(None);
        }
        Ok(crate::inventory::find(&state.vms, name, include_unknown))
    }

    async fn list(&self) -> Result<Vec<VmDescriptor>, ConvergeError> {
        Ok(self.vms())
    }

    async fn start(&self, vmx: &Path) -> Result<ActionResult, ConvergeError> {
        Ok(self.act("start", vmx.display().to_string(), |vms| {
            set_running(vms, vmx, true)
        }))
    }

    async fn stop(&self, vmx: &Path, mode: PowerMode) -> Result<ActionResult, ConvergeError> {
        let detail = format!("{} {}", vmx.display(), mode.as_str());
        Ok(self.act("stop", detail, |vms| set_running(vms, vmx, false)))
    }

    async fn reset(&self, vmx: &Path, mode: PowerMode) -> Result<ActionResult, ConvergeError> {
        let detail = format!("{} {}", vmx.display(), mode.as_str());
        Ok(self.act("reset", detail, |vms| set_running(vms, vmx, true)))
    }

    async fn suspend(&self, vmx: &Path) -> Result<ActionResult, ConvergeError> {
        Ok(self.act("suspend", vmx.display().to_string(), |vms| {
            set_running(vms, vmx, false)
        }))
    }

    async fn delete(&self, vmx: &Path) -> Result<ActionResult, ConvergeError> {
        Ok(self.act("delete", vmx.display().to_string(), |vms| {
            vms.retain(|vm| vm.config != vmx)
        }))
    }

    async fn clone_vm(
        &self,
        name: &str,
        target: &Path,
        template: &Path,
    ) -> Result<ActionResult, ConvergeError> {
        let detail = format!("{} {} {name}", template.display(), target.display());
        let write_file = !self.skip_clone_file;
        Ok(self.act("clone", detail, |vms| {
            if write_file {
                std::fs::write(target, format!("displayName = \"{name}\"\n")).unwrap();
            }
            vms.push(VmDescriptor {
                name: name.to_string(),
                config: target.to_path_buf(),
                exists: write_file,
                registered: false,
                running: false,
            });
        }))
    }

    async fn import_ova(
        &self,
        ova: &Path,
        dest_dir: &Path,
        _accept_eula: bool,
    ) -> Result<ActionResult, ConvergeError> {
        let name = self.ova_display_name(ova).await?;
        let detail = format!("{} {}", ova.display(), dest_dir.display());
        Ok(self.act("import", detail, |vms| {
            let dir = dest_dir.join(&name);
            std::fs::create_dir_all(&dir).unwrap();
            let config = dir.join(format!("{name}.vmx"));
            std::fs::write(&config, format!("displayName = \"{name}\"\n")).unwrap();
            vms.push(VmDescriptor {
                name: name.clone(),
                config,
                exists: true,
                registered: false,
                running: false,
            });
        }))
    }

    async fn ova_display_name(&self, ova: &Path) -> Result<String, ConvergeError> {
        self.state()
            .ova_names
            .get(ova)
            .cloned()
            .ok_or_else(|| ConvergeError::OutputParse {
                tool: "ovftool".into(),
                message: format!("no Name: line in probe output for {}", ova.display()),
            })
    }
}
