use std::io::IsTerminal;

use clap::Parser;

use vmconverge::backend::{self, Hypervisor};
use vmconverge::cli::{Cli, Command, OutputFormat};
use vmconverge::config;
use vmconverge::converge::{Failure, converge};
use vmconverge::error::ConvergeError;
use vmconverge::logging;
use vmconverge::plan::Request;
use vmconverge::report::Report;
use vmconverge::vm_state::VmDescriptor;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let format = resolve_output_format(&cli.output);
    let settings = config::load_settings(cli.config.as_deref())?;
    let hv = backend::create_backend(&settings);

    match cli.command {
        Command::Converge {
            name,
            state,
            template,
            ova,
            check,
        } => {
            if name.trim().is_empty() {
                return Err(ConvergeError::Validation {
                    message: "--name must not be empty".into(),
                }
                .into());
            }
            let request = Request {
                template,
                ova,
                check_mode: check,
                ..Request::new(name, state)
            };
            match converge(&hv, &settings, &request).await {
                Ok(report) => print_report(&report, &format),
                Err(Failure { error, report }) => {
                    print_report(&report, &format);
                    return Err(error.into());
                }
            }
        }
        Command::List { all } => {
            let vms: Vec<VmDescriptor> = hv
                .list()
                .await?
                .into_iter()
                .filter(|vm| all || vm.is_known())
                .collect();
            if format == OutputFormat::Json {
                println!("{}", to_json(&vms));
            } else if vms.is_empty() {
                println!("No VMs found.");
            } else {
                for vm in &vms {
                    println!("{}", describe(vm));
                }
            }
        }
        Command::Status { name } => {
            let Some(vm) = hv.lookup(&name, true).await? else {
                return Err(ConvergeError::Precondition {
                    message: format!("VM '{name}' was not found"),
                }
                .into());
            };
            if format == OutputFormat::Json {
                println!("{}", to_json(&vm));
            } else {
                println!("{}", describe(&vm));
            }
        }
    }

    Ok(())
}

fn print_report(report: &Report, format: &OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", report.to_json()),
        OutputFormat::Plain | OutputFormat::Auto => print!("{}", report.render_plain()),
    }
}

fn describe(vm: &VmDescriptor) -> String {
    let power = if vm.running { "running" } else { "stopped" };
    let mut line = format!("{:<24} {:<8} {}", vm.name, power, vm.config.display());
    if !vm.registered {
        line.push_str("  (unregistered)");
    }
    if !vm.exists {
        line.push_str("  (missing)");
    }
    line
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}"))
}

/// `auto` becomes JSON when stdout is piped.
fn resolve_output_format(format: &OutputFormat) -> OutputFormat {
    match format {
        OutputFormat::Auto => {
            if std::io::stdout().is_terminal() {
                OutputFormat::Plain
            } else {
                OutputFormat::Json
            }
        }
        other => other.clone(),
    }
}
