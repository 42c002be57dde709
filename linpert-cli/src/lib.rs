#![allow(missing_docs)]

mod config;
mod grid;
mod helpers;
mod run;

use anyhow::Result;
use clap::Parser;
use enum_dispatch::enum_dispatch;
use std::process::ExitCode;

/// Flags shared by every subcommand.
#[derive(Parser)]
pub struct GlobalConfiguration {
    /// Suppress info-level progress logging.
    #[arg(long)]
    pub quiet: bool,
}

#[enum_dispatch]
pub trait Subcommand {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode>;
}

#[enum_dispatch(Subcommand)]
#[derive(Parser)]
pub enum SubcommandEnum {
    Config(config::Opts),
    Grid(grid::Opts),
    Run(run::Opts),
}

#[derive(Parser)]
#[command(
    arg_required_else_help = true,
    author,
    about,
    disable_help_subcommand = true,
    name = "linpert",
    version
)]
pub struct Opts {
    #[command(flatten)]
    pub configuration: GlobalConfiguration,
    #[command(subcommand)]
    pub subcommand: SubcommandEnum,
}
