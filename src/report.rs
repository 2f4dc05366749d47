//! The single structured result of an invocation.
//!
//! Steps produce immutable `StepRecord`s; the report is assembled once from
//! them when the run ends, successfully or not.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::backend::ActionResult;
use crate::plan::{Plan, Step};
use crate::vm_state::VmDescriptor;

/// A step that ran, with its command result if it ran one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: Step,
    pub result: Option<ActionResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub failed: bool,
    pub changed: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub check_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    /// Commands executed, in order. Planned steps in check mode.
    pub operations: Vec<String>,
    pub instances: Vec<VmDescriptor>,
    /// Steps that would undo completed work, newest first. Failure only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rollback: Vec<String>,
    /// `rc_<label>` / `so_<label>` / `se_<label>`, `vmxdir`, `vmxpath`.
    #[serde(flatten)]
    pub results: BTreeMap<String, Value>,
}

impl Report {
    fn from_records(records: &[StepRecord]) -> Self {
        let mut operations = Vec::new();
        let mut results = BTreeMap::new();

        for record in records {
            if let Step::Clone { target, .. } = &record.step {
                if let Some(dir) = target.parent() {
                    results.insert("vmxdir".into(), Value::from(dir.display().to_string()));
                }
                results.insert("vmxpath".into(), Value::from(target.display().to_string()));
            }
            let (Some(label), Some(result)) = (record.step.label(), &record.result) else {
                continue;
            };
            operations.push(result.command.clone());
            results.insert(format!("rc_{label}"), Value::from(result.rc));
            results.insert(format!("so_{label}"), Value::from(result.stdout.clone()));
            results.insert(format!("se_{label}"), Value::from(result.stderr.clone()));
        }

        Self {
            failed: false,
            changed: false,
            check_mode: false,
            msg: None,
            operations,
            instances: Vec::new(),
            rollback: Vec::new(),
            results,
        }
    }

    /// All steps ran.
    pub fn success(changed: bool, records: &[StepRecord], instance: Option<VmDescriptor>) -> Self {
        Self {
            changed,
            instances: instance.into_iter().collect(),
            ..Self::from_records(records)
        }
    }

    /// The run stopped at a fatal condition after `records` completed.
    pub fn failure(msg: impl Into<String>, records: &[StepRecord]) -> Self {
        let rollback = records
            .iter()
            .rev()
            .filter(|r| r.result.as_ref().is_none_or(ActionResult::success))
            .filter_map(|r| r.step.compensation())
            .map(|s| s.to_string())
            .collect();
        Self {
            failed: true,
            msg: Some(msg.into()),
            rollback,
            ..Self::from_records(records)
        }
    }

    /// Check mode: what would run, without running it.
    pub fn planned(plan: &Plan, instance: Option<VmDescriptor>) -> Self {
        Self {
            failed: false,
            changed: plan.changes(),
            check_mode: true,
            msg: None,
            operations: plan.steps.iter().map(|s| s.to_string()).collect(),
            instances: instance.into_iter().collect(),
            rollback: Vec::new(),
            results: BTreeMap::new(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| {
            format!("{{\"failed\": true, \"msg\": \"report serialization failed: {e}\"}}")
        })
    }

    /// Short human-readable rendering.
    pub fn render_plain(&self) -> String {
        let mut out = String::new();
        let status = match (self.failed, self.changed) {
            (true, _) => "failed",
            (false, true) if self.check_mode => "would change",
            (false, true) => "changed",
            (false, false) => "ok",
        };
        out.push_str(status);
        if let Some(msg) = &self.msg {
            out.push_str(&format!(": {msg}"));
        }
        out.push('\n');
        for op in &self.operations {
            out.push_str(&format!("  $ {op}\n"));
        }
        for vm in &self.instances {
            let power = if vm.running { "running" } else { "stopped" };
            out.push_str(&format!("  {} ({power}) {}\n", vm.name, vm.config.display()));
        }
        for step in &self.rollback {
            out.push_str(&format!("  undo: {step}\n"));
        }
        out
    }
}
