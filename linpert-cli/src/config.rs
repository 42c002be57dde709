use crate::helpers::{GlobalConfiguration, Subcommand};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// Prints the default precision/physics configuration as YAML, a starting
/// point for a config file to pass to `linpert run --precision`.
#[derive(Parser)]
pub struct Opts {
    /// Write to this file instead of stdout.
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    output: Option<PathBuf>,
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let precision = linpert_core::config::Precision::default();
        let yaml = serde_yaml::to_string(&precision).context("failed to serialize default precision")?;
        match &self.output {
            Some(path) => {
                std::fs::write(path, yaml).context(format!("unable to write '{}'", path.display()))?;
            }
            None => print!("{yaml}"),
        }
        Ok(ExitCode::SUCCESS)
    }
}
