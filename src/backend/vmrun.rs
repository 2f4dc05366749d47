//! `vmrun` / `ovftool` backed hypervisor.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::error::ConvergeError;
use crate::inventory;
use crate::vm_state::VmDescriptor;

use super::{ActionResult, Hypervisor, PowerMode};

pub struct VmrunBackend {
    vmrun: String,
    host_type: String,
    gui: bool,
    ovftool: String,
    inventory: PathBuf,
    vm_root: PathBuf,
}

impl VmrunBackend {
    pub fn new(settings: &Settings) -> Self {
        Self {
            vmrun: settings.vmrun.clone(),
            host_type: settings.host_type.clone(),
            gui: settings.gui,
            ovftool: settings.ovftool.clone(),
            inventory: settings.inventory.clone(),
            vm_root: settings.vm_root.clone(),
        }
    }

    fn vmrun_args<I, S>(&self, args: I) -> Vec<OsString>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut v: Vec<OsString> = vec!["-T".into(), self.host_type.clone().into()];
        v.extend(args.into_iter().map(Into::into));
        v
    }

    async fn vmrun(&self, args: Vec<OsString>) -> Result<ActionResult, ConvergeError> {
        run(&self.vmrun, &args).await
    }

    async fn running(&self) -> Result<Vec<PathBuf>, ConvergeError> {
        let result = self.vmrun(self.vmrun_args(["list"])).await?;
        if !result.success() {
            tracing::warn!(rc = result.rc, stderr = %result.stderr.trim(), "vmrun list failed, assuming no VM is running");
            return Ok(Vec::new());
        }
        match parse_running(&result.stdout) {
            Ok(paths) => Ok(paths),
            Err(e) => {
                tracing::warn!(error = %e, "unreadable vmrun list output, assuming no VM is running");
                Ok(Vec::new())
            }
        }
    }
}

impl Hypervisor for VmrunBackend {
    async fn lookup(
        &self,
        name: &str,
        include_unknown: bool,
    ) -> Result<Option<VmDescriptor>, ConvergeError> {
        let vms = self.list().await?;
        let found = inventory::find(&vms, name, include_unknown);
        tracing::debug!(name, include_unknown, found = found.is_some(), "lookup");
        Ok(found)
    }

    async fn list(&self) -> Result<Vec<VmDescriptor>, ConvergeError> {
        let mut vms = inventory::load(&self.inventory, &self.vm_root).await?;
        let running = self.running().await?;
        for vm in &mut vms {
            vm.running = running.iter().any(|p| same_path(p, &vm.config));
        }
        Ok(vms)
    }

    async fn start(&self, vmx: &Path) -> Result<ActionResult, ConvergeError> {
        let display = if self.gui { "gui" } else { "nogui" };
        let args = self.vmrun_args([OsString::from("start"), vmx.into(), display.into()]);
        self.vmrun(args).await
    }

    async fn stop(&self, vmx: &Path, mode: PowerMode) -> Result<ActionResult, ConvergeError> {
        let args = self.vmrun_args([OsString::from("stop"), vmx.into(), mode.as_str().into()]);
        self.vmrun(args).await
    }

    async fn reset(&self, vmx: &Path, mode: PowerMode) -> Result<ActionResult, ConvergeError> {
        let args = self.vmrun_args([OsString::from("reset"), vmx.into(), mode.as_str().into()]);
        self.vmrun(args).await
    }

    async fn suspend(&self, vmx: &Path) -> Result<ActionResult, ConvergeError> {
        let args = self.vmrun_args([OsString::from("suspend"), vmx.into(), "hard".into()]);
        self.vmrun(args).await
    }

    async fn delete(&self, vmx: &Path) -> Result<ActionResult, ConvergeError> {
        let args = self.vmrun_args([OsString::from("deleteVM"), vmx.into()]);
        self.vmrun(args).await
    }

    async fn clone_vm(
        &self,
        name: &str,
        target: &Path,
        template: &Path,
    ) -> Result<ActionResult, ConvergeError> {
        let args = self.vmrun_args([
            OsString::from("clone"),
            template.into(),
            target.into(),
            "full".into(),
            format!("-cloneName={name}").into(),
        ]);
        self.vmrun(args).await
    }

    async fn import_ova(
        &self,
        ova: &Path,
        dest_dir: &Path,
        accept_eula: bool,
    ) -> Result<ActionResult, ConvergeError> {
        let mut args: Vec<OsString> = Vec::new();
        if accept_eula {
            args.push("--acceptAllEulas".into());
        }
        args.push(ova.into());
        args.push(dest_dir.into());
        run(&self.ovftool, &args).await
    }

    async fn ova_display_name(&self, ova: &Path) -> Result<String, ConvergeError> {
        let result = run(&self.ovftool, &[OsString::from(ova)]).await?;
        if !result.success() {
            return Err(ConvergeError::ActionFailed {
                message: format!("probing {} failed", ova.display()),
                code: result.rc,
                stderr: result.stderr,
            });
        }
        parse_ova_name(&result.stdout).ok_or_else(|| ConvergeError::OutputParse {
            tool: "ovftool".into(),
            message: format!("no Name: line in probe output for {}", ova.display()),
        })
    }
}

/// Run `program` and capture its output. Only a spawn failure is an error.
async fn run(program: &str, args: &[OsString]) -> Result<ActionResult, ConvergeError> {
    let command = format_command(program, args);
    tracing::info!(%command, "running");

    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| ConvergeError::Spawn {
            program: program.to_string(),
            hint: format!("make sure `{program}` is installed or set its path in the config"),
            source,
        })?;

    let result = ActionResult {
        command,
        rc: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    tracing::debug!(rc = result.rc, stdout = %result.stdout.trim(), stderr = %result.stderr.trim(), "finished");
    Ok(result)
}

/// Render a command line for the report, quoting arguments with whitespace.
pub fn format_command(program: &str, args: &[OsString]) -> String {
    let mut parts = vec![quote(program)];
    parts.extend(args.iter().map(|a| quote(&a.to_string_lossy())));
    parts.join(" ")
}

fn quote(s: &str) -> String {
    if s.is_empty() || s.chars().any(char::is_whitespace) {
        format!("\"{s}\"")
    } else {
        s.to_string()
    }
}

/// Parse `vmrun list` output: a `Total running VMs: N` header followed by
/// one descriptor path per line.
pub fn parse_running(stdout: &str) -> Result<Vec<PathBuf>, ConvergeError> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let header = lines.next().unwrap_or_default();
    let count = header
        .strip_prefix("Total running VMs:")
        .and_then(|n| n.trim().parse::<usize>().ok())
        .ok_or_else(|| ConvergeError::OutputParse {
            tool: "vmrun list".into(),
            message: format!("unexpected header '{header}'"),
        })?;

    let paths: Vec<PathBuf> = lines.map(PathBuf::from).collect();
    if paths.len() != count {
        tracing::warn!(count, listed = paths.len(), "vmrun list count mismatch");
    }
    Ok(paths)
}

/// The `Name:` field of `ovftool <package>` probe output.
pub fn parse_ova_name(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|l| l.trim().strip_prefix("Name:"))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn parse_running_lists_paths() {
        let out = "Total running VMs: 2\n/home/u/vmware/a/a.vmx\n/home/u/vmware/b b/b.vmx\n";
        let paths = parse_running(out).unwrap();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/home/u/vmware/a/a.vmx"),
                PathBuf::from("/home/u/vmware/b b/b.vmx"),
            ]
        );
    }

    #[test]
    fn parse_running_none() {
        assert!(parse_running("Total running VMs: 0\n").unwrap().is_empty());
    }

    #[test]
    fn parse_running_rejects_garbage() {
        assert!(parse_running("Error: Unable to connect to host\n").is_err());
    }

    #[test]
    fn parse_ova_name_from_probe() {
        let out = "OVA version:   1.0\nVirtualApp:    false\nName:          ubuntu-server\n\nDownload Size:  1.2 GB\n";
        assert_eq!(parse_ova_name(out).as_deref(), Some("ubuntu-server"));
    }

    #[test]
    fn parse_ova_name_missing() {
        assert_eq!(parse_ova_name("Error: failed to open file\n"), None);
    }

    #[test]
    fn format_command_quotes_spaces() {
        let args: Vec<OsString> = vec!["-T".into(), "ws".into(), "start".into(), "/vms/my vm/x.vmx".into()];
        assert_eq!(
            format_command("vmrun", &args),
            "vmrun -T ws start \"/vms/my vm/x.vmx\""
        );
    }

    #[test]
    fn clone_args_use_full_clone_and_name() {
        let backend = VmrunBackend::new(&Settings::default());
        let args = backend.vmrun_args([
            OsString::from("clone"),
            "/t.vmx".into(),
            "/n.vmx".into(),
            "full".into(),
            "-cloneName=n".into(),
        ]);
        assert_eq!(
            format_command("vmrun", &args),
            "vmrun -T ws clone /t.vmx /n.vmx full -cloneName=n"
        );
    }

    #[tokio::test]
    async fn unreadable_list_output_means_nothing_running() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("vmrun");
        std::fs::write(&script, "#!/bin/sh\necho 'Error: Unable to connect to host'\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let settings = Settings {
            vmrun: script.display().to_string(),
            ..Settings::default()
        };

        let backend = VmrunBackend::new(&settings);
        assert!(backend.running().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let err = run("/nonexistent/vmrun", &[]).await.unwrap_err();
        assert!(matches!(err, ConvergeError::Spawn { .. }));
    }
}
