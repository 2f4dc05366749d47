//! Shared vocabulary for VM lifecycle state.
//!
//! `DesiredState` is what the caller asks for; `VmDescriptor` is what the
//! registry reports. Both are reconstructed on every invocation.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// The state the caller wants the VM to end up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DesiredState {
    /// The VM exists. Created from a template or OVA if missing.
    #[default]
    Present,
    /// The VM is stopped, deleted, and its directory removed.
    Absent,
    #[value(name = "poweredon")]
    PoweredOn,
    #[value(name = "poweredoff")]
    PoweredOff,
    Restarted,
    Suspended,
    #[value(name = "shutdownguest")]
    ShutdownGuest,
    #[value(name = "rebootguest")]
    RebootGuest,
}

impl DesiredState {
    /// States that create the VM when it does not exist yet.
    pub fn creates(self) -> bool {
        matches!(
            self,
            DesiredState::Present
                | DesiredState::PoweredOn
                | DesiredState::PoweredOff
                | DesiredState::Restarted
                | DesiredState::Suspended
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DesiredState::Present => "present",
            DesiredState::Absent => "absent",
            DesiredState::PoweredOn => "poweredon",
            DesiredState::PoweredOff => "poweredoff",
            DesiredState::Restarted => "restarted",
            DesiredState::Suspended => "suspended",
            DesiredState::ShutdownGuest => "shutdownguest",
            DesiredState::RebootGuest => "rebootguest",
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A VM as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmDescriptor {
    pub name: String,
    /// Path to the `.vmx` descriptor file.
    pub config: PathBuf,
    /// Whether the descriptor file exists on disk.
    pub exists: bool,
    /// Whether the VM is listed in the hypervisor inventory.
    pub registered: bool,
    pub running: bool,
}

impl VmDescriptor {
    /// Known entries are registered and backed by a descriptor on disk.
    pub fn is_known(&self) -> bool {
        self.registered && self.exists
    }

    /// Directory holding the descriptor and its disks.
    pub fn dir(&self) -> Option<&Path> {
        self.config.parent().filter(|p| !p.as_os_str().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn create_options_exclude_guest_ops_and_absent() {
        assert!(DesiredState::Present.creates());
        assert!(DesiredState::Suspended.creates());
        assert!(!DesiredState::Absent.creates());
        assert!(!DesiredState::ShutdownGuest.creates());
        assert!(!DesiredState::RebootGuest.creates());
    }

    #[test]
    fn state_names_round_trip_through_clap() {
        for state in DesiredState::value_variants() {
            let parsed = DesiredState::from_str(state.as_str(), false).unwrap();
            assert_eq!(parsed, *state);
        }
    }

    #[test]
    fn default_state_is_present() {
        assert_eq!(DesiredState::default(), DesiredState::Present);
    }

    #[test]
    fn dir_of_bare_file_is_none() {
        let vm = VmDescriptor {
            name: "x".into(),
            config: PathBuf::from("x.vmx"),
            exists: true,
            registered: true,
            running: false,
        };
        assert!(vm.dir().is_none());
    }
}
