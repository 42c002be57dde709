use crate::helpers::{self, CosmologyOpts, GlobalConfiguration, Subcommand};
use anyhow::Result;
use clap::Parser;
use linpert_core::background::BackgroundTable;
use linpert_core::config::Precision;
use linpert_core::grid::build_k_grid;
use linpert_core::mode::Mode;
use std::process::ExitCode;

/// Builds and prints the wavenumber grid for inspection, without running any
/// perturbation task.
#[derive(Parser)]
pub struct Opts {
    #[command(flatten)]
    cosmology: CosmologyOpts,
    /// Recombination conformal time, as a fraction of `τ_today`; stands in
    /// for a real thermodynamics lookup of the visibility-function peak.
    #[arg(default_value_t = 0.015, long)]
    tau_rec_fraction: f64,
    /// Wavenumbers (Mpc⁻¹) to force into the grid, comma-separated.
    #[arg(long, value_delimiter = ',')]
    output_k: Vec<f64>,
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let (background, _) = self.cosmology.build();
        let precision = Precision::default();
        let tau_rec = background.tau_today() * self.tau_rec_fraction;
        let k_grid = build_k_grid(Mode::Scalar, &precision, &background, tau_rec, 1.0, &self.output_k)?;

        let mut table = helpers::create_table();
        table.set_titles(prettytable::row!["index", "k [Mpc^-1]", "region"]);
        for (i, &k) in k_grid.k.iter().enumerate() {
            let region = if i < k_grid.k_size_cmb {
                "cmb"
            } else if i < k_grid.k_size_cl {
                "cmb+lss"
            } else {
                "pk"
            };
            table.add_row(prettytable::row![i, format!("{k:.6e}"), region]);
        }
        table.printstd();
        println!(
            "{} total k values ({} cmb, {} cmb+lss)",
            k_grid.k.len(),
            k_grid.k_size_cmb,
            k_grid.k_size_cl
        );
        Ok(ExitCode::SUCCESS)
    }
}
