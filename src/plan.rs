//! Convergence planning.
//!
//! `plan()` is a pure function from what the registry reported (`Facts`) and
//! what the caller asked for (`Request`) to an ordered list of `Step`s plus
//! how to find the VM to report afterwards. Nothing here touches the
//! hypervisor or the filesystem, so every branch of the transition table is
//! unit-testable and check mode can show a plan without running it.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::backend::PowerMode;
use crate::error::ConvergeError;
use crate::paths;
use crate::vm_state::{DesiredState, VmDescriptor};

// ── Inputs ──────────────────────────────────────────────────────────

/// One invocation's parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub name: String,
    pub state: DesiredState,
    pub template: Option<String>,
    pub ova: Option<PathBuf>,
    pub check_mode: bool,
}

impl Request {
    pub fn new(name: impl Into<String>, state: DesiredState) -> Self {
        Self {
            name: name.into(),
            state,
            template: None,
            ova: None,
            check_mode: false,
        }
    }
}

/// Where a missing VM would be created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Neither template nor OVA was given.
    None,
    Template(VmDescriptor),
    TemplateNotFound(String),
    Ova {
        path: PathBuf,
        display_name: String,
        /// A VM already carrying the OVA's display name.
        existing: Option<VmDescriptor>,
    },
}

/// What the registry reported before anything ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Facts {
    pub current: Option<VmDescriptor>,
    pub source: Source,
}

// ── Steps ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Power off. A best-effort stop records its result but never fails.
    Stop {
        vmx: PathBuf,
        mode: PowerMode,
        best_effort: bool,
    },
    Delete { vmx: PathBuf },
    /// Poll until the registry stops resolving `name`.
    AwaitGone { name: String },
    RemoveDir { dir: PathBuf },
    /// Remove leftovers of a VM whose descriptor is already gone. Not a change.
    Prune { dir: PathBuf },
    CreateDir { dir: PathBuf },
    Clone {
        name: String,
        template: PathBuf,
        target: PathBuf,
    },
    /// Import `ova` into `dest`; the VM lands in `dest/<name>/`.
    Import {
        ova: PathBuf,
        dest: PathBuf,
        name: String,
    },
    Start { vmx: PathBuf },
    Reset { vmx: PathBuf, mode: PowerMode },
    Suspend { vmx: PathBuf },
}

impl Step {
    /// Report key suffix for steps that run an external command
    /// (`rc_<label>`, `so_<label>`, `se_<label>`).
    pub fn label(&self) -> Option<&'static str> {
        match self {
            Step::Stop { .. } => Some("stop"),
            Step::Delete { .. } => Some("delete"),
            Step::Clone { .. } => Some("clone"),
            Step::Import { .. } => Some("import"),
            Step::Start { .. } => Some("poweron"),
            Step::Reset { .. } => Some("reset"),
            Step::Suspend { .. } => Some("suspend"),
            Step::AwaitGone { .. }
            | Step::RemoveDir { .. }
            | Step::Prune { .. }
            | Step::CreateDir { .. } => None,
        }
    }

    /// Whether the step changes anything.
    pub fn mutates(&self) -> bool {
        !matches!(self, Step::AwaitGone { .. } | Step::Prune { .. })
    }

    /// Message for a non-zero exit of this step.
    pub fn failure_message(&self) -> &'static str {
        match self {
            Step::Stop { .. } => "Stopping the VM failed",
            Step::Delete { .. } => "Destroying the VM failed",
            Step::Clone { .. } => "Cloning the VM failed",
            Step::Import { .. } => "Importing the OVA failed",
            Step::Start { .. } => "Powering on the VM failed",
            Step::Reset { .. } => "Resetting the VM failed",
            Step::Suspend { .. } => "Suspending the VM failed",
            Step::AwaitGone { .. }
            | Step::RemoveDir { .. }
            | Step::Prune { .. }
            | Step::CreateDir { .. } => "Filesystem operation failed",
        }
    }

    /// The step that would undo this one, if any. Deletions are final.
    pub fn compensation(&self) -> Option<Step> {
        match self {
            Step::CreateDir { dir } => Some(Step::RemoveDir { dir: dir.clone() }),
            Step::Clone { target, .. } => Some(Step::Delete {
                vmx: target.clone(),
            }),
            Step::Start { vmx } => Some(Step::Stop {
                vmx: vmx.clone(),
                mode: PowerMode::Hard,
                best_effort: false,
            }),
            Step::Stop { vmx, .. } | Step::Suspend { vmx } => {
                Some(Step::Start { vmx: vmx.clone() })
            }
            Step::Import { dest, name, .. } => Some(Step::RemoveDir {
                dir: paths::vm_dir(dest, name),
            }),
            Step::Delete { .. }
            | Step::RemoveDir { .. }
            | Step::Prune { .. }
            | Step::AwaitGone { .. }
            | Step::Reset { .. } => None,
        }
    }

    pub fn is_reversible(&self) -> bool {
        self.compensation().is_some()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Stop { vmx, mode, .. } => write!(f, "stop {} {}", vmx.display(), mode.as_str()),
            Step::Delete { vmx } => write!(f, "delete {}", vmx.display()),
            Step::AwaitGone { name } => write!(f, "wait until '{name}' is unregistered"),
            Step::RemoveDir { dir } => write!(f, "remove {}", dir.display()),
            Step::Prune { dir } => write!(f, "remove {} if present", dir.display()),
            Step::CreateDir { dir } => write!(f, "create {}", dir.display()),
            Step::Clone {
                name,
                template,
                target,
            } => write!(
                f,
                "clone {} to {} as '{name}'",
                template.display(),
                target.display()
            ),
            Step::Import { ova, dest, .. } => {
                write!(f, "import {} into {}", ova.display(), dest.display())
            }
            Step::Start { vmx } => write!(f, "start {}", vmx.display()),
            Step::Reset { vmx, mode } => write!(f, "reset {} {}", vmx.display(), mode.as_str()),
            Step::Suspend { vmx } => write!(f, "suspend {}", vmx.display()),
        }
    }
}

// ── Plan ────────────────────────────────────────────────────────────

/// How to find the VM to report once the steps have run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to report.
    Nothing,
    /// Report this descriptor as-is.
    Existing(VmDescriptor),
    /// Look the name up once.
    Resolve(String),
    /// Poll until the name resolves to an existing descriptor.
    Await(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub outcome: Outcome,
}

impl Plan {
    fn new(steps: Vec<Step>, outcome: Outcome) -> Self {
        Self { steps, outcome }
    }

    pub fn changes(&self) -> bool {
        self.steps.iter().any(Step::mutates)
    }
}

/// Compute the steps that take the VM from `facts` to `request.state`.
pub fn plan(request: &Request, facts: &Facts, vm_root: &Path) -> Result<Plan, ConvergeError> {
    match &facts.current {
        Some(vm) => plan_existing(request, vm),
        None => plan_missing(request, &facts.source, vm_root),
    }
}

fn plan_existing(request: &Request, vm: &VmDescriptor) -> Result<Plan, ConvergeError> {
    let vmx = vm.config.clone();
    let resolve = Outcome::Resolve(request.name.clone());

    let steps = match request.state {
        DesiredState::Absent if !vm.exists => {
            let steps = vm
                .dir()
                .map(|dir| Step::Prune {
                    dir: dir.to_path_buf(),
                })
                .into_iter()
                .collect();
            return Ok(Plan::new(steps, Outcome::Nothing));
        }
        DesiredState::Absent => {
            let mut steps = vec![
                Step::Stop {
                    vmx: vmx.clone(),
                    mode: PowerMode::Hard,
                    best_effort: true,
                },
                Step::Delete { vmx },
                Step::AwaitGone {
                    name: request.name.clone(),
                },
            ];
            if let Some(dir) = vm.dir() {
                steps.push(Step::RemoveDir {
                    dir: dir.to_path_buf(),
                });
            }
            return Ok(Plan::new(steps, Outcome::Nothing));
        }
        DesiredState::Present => {
            return Ok(Plan::new(Vec::new(), Outcome::Existing(vm.clone())));
        }
        DesiredState::PoweredOn => {
            require_descriptor(vm, "poweron")?;
            if vm.running {
                vec![]
            } else {
                vec![Step::Start { vmx }]
            }
        }
        DesiredState::Restarted => {
            if vm.running {
                vec![Step::Reset {
                    vmx,
                    mode: PowerMode::Hard,
                }]
            } else {
                vec![Step::Start { vmx }]
            }
        }
        DesiredState::PoweredOff if vm.running => vec![Step::Stop {
            vmx,
            mode: PowerMode::Hard,
            best_effort: false,
        }],
        DesiredState::ShutdownGuest if vm.running => vec![Step::Stop {
            vmx,
            mode: PowerMode::Soft,
            best_effort: false,
        }],
        DesiredState::RebootGuest if vm.running => vec![Step::Reset {
            vmx,
            mode: PowerMode::Soft,
        }],
        DesiredState::Suspended if vm.running => vec![Step::Suspend { vmx }],
        DesiredState::PoweredOff
        | DesiredState::ShutdownGuest
        | DesiredState::RebootGuest
        | DesiredState::Suspended => vec![],
    };

    if !steps.is_empty() {
        require_descriptor(vm, request.state.as_str())?;
    }
    Ok(Plan::new(steps, resolve))
}

fn require_descriptor(vm: &VmDescriptor, action: &str) -> Result<(), ConvergeError> {
    if vm.exists {
        Ok(())
    } else {
        Err(ConvergeError::Precondition {
            message: format!(
                "VMX({}) does not exist, {action} will fail",
                vm.config.display()
            ),
        })
    }
}

fn plan_missing(request: &Request, source: &Source, vm_root: &Path) -> Result<Plan, ConvergeError> {
    if !request.state.creates() {
        return Ok(Plan::new(Vec::new(), Outcome::Nothing));
    }
    paths::validate_vm_name(&request.name)?;
    let power_on = request.state == DesiredState::PoweredOn;

    match source {
        Source::Template(template) => {
            if !template.exists {
                return Err(ConvergeError::Precondition {
                    message: format!(
                        "template {} has no descriptor at {}",
                        template.name,
                        template.config.display()
                    ),
                });
            }
            let target = paths::vmx_path(vm_root, &request.name);
            let mut steps = vec![
                Step::CreateDir {
                    dir: paths::vm_dir(vm_root, &request.name),
                },
                Step::Clone {
                    name: request.name.clone(),
                    template: template.config.clone(),
                    target: target.clone(),
                },
            ];
            if power_on {
                steps.push(Step::Start { vmx: target });
            }
            Ok(Plan::new(steps, Outcome::Await(request.name.clone())))
        }
        Source::TemplateNotFound(name) => Err(ConvergeError::Precondition {
            message: format!("template {name} was not found"),
        }),
        Source::Ova {
            path,
            display_name,
            existing: Some(vm),
        } => {
            let steps = if power_on && !vm.running {
                require_descriptor(vm, "poweron")?;
                vec![Step::Start {
                    vmx: vm.config.clone(),
                }]
            } else {
                vec![]
            };
            tracing::debug!(ova = %path.display(), display_name, "OVA already imported");
            Ok(Plan::new(steps, Outcome::Resolve(display_name.clone())))
        }
        Source::Ova {
            path,
            display_name,
            existing: None,
        } => {
            paths::validate_vm_name(display_name)?;
            let mut steps = vec![Step::Import {
                ova: path.clone(),
                dest: vm_root.to_path_buf(),
                name: display_name.clone(),
            }];
            if power_on {
                steps.push(Step::Start {
                    vmx: paths::vmx_path(vm_root, display_name),
                });
            }
            Ok(Plan::new(steps, Outcome::Await(display_name.clone())))
        }
        Source::None => Err(ConvergeError::Precondition {
            message: format!(
                "cannot create VM '{}': neither template nor ova was given",
                request.name
            ),
        }),
    }
}
