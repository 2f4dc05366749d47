use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::vm_state::DesiredState;

#[derive(Parser, Debug)]
#[command(
    name = "vmconverge",
    version,
    about = "Converge VMware Workstation VMs to a desired state via vmrun"
)]
pub struct Cli {
    /// Path to config file [default: ~/.config/vmconverge/config.toml]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Auto, global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON when stdout is not a terminal, plain otherwise
    Auto,
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Drive a VM to the requested state
    Converge {
        /// VM display name
        #[arg(short, long)]
        name: String,

        /// Desired state
        #[arg(short, long, value_enum, default_value_t = DesiredState::Present)]
        state: DesiredState,

        /// Display name of the VM to clone from
        #[arg(short, long, alias = "template-src")]
        template: Option<String>,

        /// OVA package to import; ignored when --template is given
        #[arg(long)]
        ova: Option<PathBuf>,

        /// Report what would change without doing it
        #[arg(long)]
        check: bool,
    },

    /// List VMs known to Workstation
    List {
        /// Include unregistered VMs and entries whose .vmx is missing
        #[arg(short, long)]
        all: bool,
    },

    /// Show one VM
    Status {
        /// VM display name
        name: String,
    },
}
