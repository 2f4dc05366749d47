//! Convergence controller.
//!
//! Gathers facts from the hypervisor, plans, runs the plan step by step and
//! assembles the report. Any non-zero exit of a non-best-effort action ends
//! the run; completed steps are not undone, but the failure report lists
//! their compensations.

use std::path::Path;

use tokio::time::Instant;

use crate::backend::{ActionResult, Hypervisor};
use crate::config::Settings;
use crate::error::ConvergeError;
use crate::plan::{self, Facts, Outcome, Plan, Request, Source, Step};
use crate::report::{Report, StepRecord};
use crate::vm_state::VmDescriptor;

/// A fatal condition, with the report describing how far the run got.
#[derive(Debug)]
pub struct Failure {
    pub error: ConvergeError,
    pub report: Report,
}

impl Failure {
    fn new(error: ConvergeError, records: &[StepRecord]) -> Self {
        let report = Report::failure(error.to_string(), records);
        Self { error, report }
    }
}

/// Drive the VM named in `request` to the requested state.
pub async fn converge<H: Hypervisor>(
    hv: &H,
    settings: &Settings,
    request: &Request,
) -> Result<Report, Failure> {
    tracing::info!(name = %request.name, state = %request.state, check = request.check_mode, "converging");

    let facts = gather_facts(hv, request)
        .await
        .map_err(|e| Failure::new(e, &[]))?;
    let plan = plan::plan(request, &facts, &settings.vm_root).map_err(|e| Failure::new(e, &[]))?;
    tracing::debug!(steps = plan.steps.len(), outcome = ?plan.outcome, "planned");

    if request.check_mode {
        let instance = match &plan.outcome {
            Outcome::Existing(vm) => Some(vm.clone()),
            _ => facts.current.clone(),
        };
        return Ok(Report::planned(&plan, instance));
    }

    let records = execute(hv, settings, &plan).await?;
    let instance = resolve_outcome(hv, settings, &plan.outcome)
        .await
        .map_err(|e| Failure::new(e, &records))?;

    Ok(Report::success(plan.changes(), &records, instance))
}

/// Look up the VM and, if it has to be created, its source.
async fn gather_facts<H: Hypervisor>(hv: &H, request: &Request) -> Result<Facts, ConvergeError> {
    let current = hv.lookup(&request.name, true).await?;
    if current.is_some() || !request.state.creates() {
        return Ok(Facts {
            current,
            source: Source::None,
        });
    }

    let source = if let Some(template) = &request.template {
        match hv.lookup(template, true).await? {
            Some(vm) => Source::Template(vm),
            None => Source::TemplateNotFound(template.clone()),
        }
    } else if let Some(ova) = &request.ova {
        let display_name = hv.ova_display_name(ova).await?;
        let existing = hv.lookup(&display_name, true).await?;
        Source::Ova {
            path: ova.clone(),
            display_name,
            existing,
        }
    } else {
        Source::None
    };

    Ok(Facts { current, source })
}

async fn execute<H: Hypervisor>(
    hv: &H,
    settings: &Settings,
    plan: &Plan,
) -> Result<Vec<StepRecord>, Failure> {
    let mut records = Vec::with_capacity(plan.steps.len());

    for step in &plan.steps {
        let result = match run_step(hv, settings, step).await {
            Ok(result) => result,
            Err(e) => return Err(Failure::new(e, &records)),
        };

        let failed = result.as_ref().is_some_and(|r| !r.success());
        let best_effort = matches!(step, Step::Stop { best_effort: true, .. });
        let record = StepRecord {
            step: step.clone(),
            result,
        };

        if failed && best_effort {
            tracing::warn!(%step, "best-effort step failed, continuing");
        } else if failed {
            let (code, stderr) = record
                .result
                .as_ref()
                .map(|r| (r.rc, r.stderr.trim().to_string()))
                .unwrap_or_default();
            records.push(record);
            let error = ConvergeError::ActionFailed {
                message: step.failure_message().to_string(),
                code,
                stderr,
            };
            return Err(Failure::new(error, &records));
        }
        records.push(record);

        if let Err(e) = check_postcondition(step) {
            return Err(Failure::new(e, &records));
        }
    }

    Ok(records)
}

/// Run one step. Filesystem steps return no action result.
async fn run_step<H: Hypervisor>(
    hv: &H,
    settings: &Settings,
    step: &Step,
) -> Result<Option<ActionResult>, ConvergeError> {
    tracing::info!(%step, "step");
    let result = match step {
        Step::Stop { vmx, mode, .. } => hv.stop(vmx, *mode).await?,
        Step::Delete { vmx } => hv.delete(vmx).await?,
        Step::Start { vmx } => hv.start(vmx).await?,
        Step::Reset { vmx, mode } => hv.reset(vmx, *mode).await?,
        Step::Suspend { vmx } => hv.suspend(vmx).await?,
        Step::Clone {
            name,
            template,
            target,
        } => hv.clone_vm(name, target, template).await?,
        Step::Import { ova, dest, .. } => hv.import_ova(ova, dest, true).await?,
        Step::CreateDir { dir } => {
            create_dir(dir).await?;
            return Ok(None);
        }
        Step::RemoveDir { dir } | Step::Prune { dir } => {
            remove_dir(dir).await?;
            return Ok(None);
        }
        Step::AwaitGone { name } => {
            wait_until_gone(hv, settings, name).await?;
            return Ok(None);
        }
    };
    Ok(Some(result))
}

fn check_postcondition(step: &Step) -> Result<(), ConvergeError> {
    match step {
        Step::Clone { target, .. } if !target.is_file() => Err(ConvergeError::Postcondition {
            message: format!(
                "Cloning the VM failed: {} was not created",
                target.display()
            ),
        }),
        _ => Ok(()),
    }
}

async fn create_dir(dir: &Path) -> Result<(), ConvergeError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ConvergeError::Io {
            context: format!("creating directory {}", dir.display()),
            source: e,
        })
}

async fn remove_dir(dir: &Path) -> Result<(), ConvergeError> {
    if !dir.is_dir() {
        tracing::debug!(path = %dir.display(), "directory already gone");
        return Ok(());
    }
    tokio::fs::remove_dir_all(dir)
        .await
        .map_err(|e| ConvergeError::Io {
            context: format!("removing {}", dir.display()),
            source: e,
        })?;
    tracing::info!(path = %dir.display(), "removed VM directory");
    Ok(())
}

/// Poll until `name` no longer resolves to a descriptor on disk. A timeout
/// is only logged: the delete itself already succeeded.
async fn wait_until_gone<H: Hypervisor>(
    hv: &H,
    settings: &Settings,
    name: &str,
) -> Result<(), ConvergeError> {
    let deadline = Instant::now() + settings.settle_timeout;
    loop {
        // a stale inventory entry outlives its deleted descriptor
        match hv.lookup(name, true).await? {
            None => return Ok(()),
            Some(vm) if !vm.exists => return Ok(()),
            Some(_) => {}
        }
        if Instant::now() >= deadline {
            tracing::warn!(name, "VM still listed after delete, continuing");
            return Ok(());
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
}

/// Poll until `name` resolves to a descriptor that exists on disk.
async fn wait_until_present<H: Hypervisor>(
    hv: &H,
    settings: &Settings,
    name: &str,
) -> Result<VmDescriptor, ConvergeError> {
    let deadline = Instant::now() + settings.settle_timeout;
    loop {
        if let Some(vm) = hv.lookup(name, true).await?
            && vm.exists
        {
            return Ok(vm);
        }
        if Instant::now() >= deadline {
            return Err(ConvergeError::Postcondition {
                message: format!(
                    "VM '{name}' did not appear within {}s",
                    settings.settle_timeout.as_secs()
                ),
            });
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
}

async fn resolve_outcome<H: Hypervisor>(
    hv: &H,
    settings: &Settings,
    outcome: &Outcome,
) -> Result<Option<VmDescriptor>, ConvergeError> {
    match outcome {
        Outcome::Nothing => Ok(None),
        Outcome::Existing(vm) => Ok(Some(vm.clone())),
        Outcome::Resolve(name) => hv.lookup(name, true).await,
        Outcome::Await(name) => wait_until_present(hv, settings, name).await.map(Some),
    }
}
