#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod backend;
pub mod cli;
pub mod config;
pub mod converge;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod paths;
pub mod plan;
pub mod report;
pub mod vm_state;
