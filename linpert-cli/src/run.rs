use crate::helpers::{self, CosmologyOpts, GlobalConfiguration, Subcommand};
use anyhow::{Context, Result};
use clap::Parser;
use linpert_core::background::{BackgroundLevel, BackgroundTable, LastIndex, ThermodynamicsTable};
use linpert_core::config::Precision;
use linpert_core::dispatch::TaskPool;
use linpert_core::grid::{bisect_tau_ini, build_k_grid, build_l_grid, build_tau_grid, TauGrid};
use linpert_core::mode::{InitialCondition, Mode};
use linpert_core::sources::SourceKind;
use linpert_core::transfer::projector::angular_power_spectrum;
use std::path::PathBuf;
use std::process::ExitCode;

/// Runs the full perturbation + transfer pipeline for a flat-ΛCDM toy
/// cosmology and prints the scalar adiabatic temperature `C_l` spectrum.
#[derive(Parser)]
pub struct Opts {
    #[command(flatten)]
    cosmology: CosmologyOpts,
    /// Optional precision/physics config file (YAML); defaults are used if
    /// omitted.
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    precision: Option<PathBuf>,
    /// Primordial scalar amplitude `A_s`.
    #[arg(default_value_t = 2.1e-9, long)]
    a_s: f64,
    /// Primordial scalar spectral index `n_s`.
    #[arg(default_value_t = 0.965, long)]
    n_s: f64,
    /// Pivot scale for the primordial spectrum, Mpc⁻¹.
    #[arg(default_value_t = 0.05, long)]
    k_pivot: f64,
    /// Maximum multipole to compute.
    #[arg(default_value_t = 200, long)]
    l_max: u32,
}

impl Subcommand for Opts {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let (background, thermodynamics) = self.cosmology.build();
        let species = helpers::default_species();
        let precision = match &self.precision {
            Some(path) => helpers::read_precision(path, &species)?,
            None => {
                let mut p = Precision::default();
                p.l_max_scalars = self.l_max;
                p.validate(&species).map_err(anyhow::Error::from)?;
                p
            }
        };

        let tau_rec = background.tau_today() * 0.015;
        let output_k: Vec<f64> = Vec::new();
        let k_grid = build_k_grid(Mode::Scalar, &precision, &background, tau_rec, 1.0, &output_k)
            .context("failed to build wavenumber grid")?;
        let l_grid = build_l_grid(self.l_max, precision.l_logstep, precision.l_linstep, precision.l_rescaling);

        if !cfg.quiet {
            tracing::info!(n_k = k_grid.k.len(), n_l = l_grid.len(), "built grids");
        }

        let tau_ini = bisect_tau_ini(
            &background,
            |tau| kappa_prime_at(&background, &thermodynamics, tau),
            precision.start_sources_at_tau_c_over_tau_h,
        )
        .context("failed to bisect tau_ini")?;

        let pool = TaskPool {
            background: &background,
            thermodynamics: &thermodynamics,
            species: &species,
            precision: &precision,
        };

        let tau_grid_for_k = |_k: f64| -> linpert_core::Result<TauGrid> {
            build_tau_grid(
                &background,
                tau_ini,
                precision.tau_stepsize,
                |tau| kappa_prime_at(&background, &thermodynamics, tau),
                |tau| z_of_tau(&background, tau),
                precision.z_max_pk,
            )
        };

        let by_ic = pool
            .run(Mode::Scalar, &[InitialCondition::Adiabatic], &k_grid, &l_grid, tau_grid_for_k)
            .context("perturbation/transfer dispatch failed")?;
        let transfer = &by_ic[&InitialCondition::Adiabatic];

        let primordial = |k: f64| self.a_s * (k / self.k_pivot).powf(self.n_s - 1.0) * 2.0 * std::f64::consts::PI.powi(2) / k.powi(3);

        let mut table = helpers::create_table();
        table.set_titles(prettytable::row!["l", "l(l+1)Cl/2pi"]);
        for &l in &l_grid {
            let delta = transfer.column(SourceKind::Temperature, l);
            let cl = angular_power_spectrum(transfer.k(), delta, delta, primordial);
            let normalized = f64::from(l) * f64::from(l + 1) * cl / (2.0 * std::f64::consts::PI);
            table.add_row(prettytable::row![l, format!("{normalized:.6e}")]);
        }
        table.printstd();

        Ok(ExitCode::SUCCESS)
    }
}

fn kappa_prime_at(
    background: &dyn BackgroundTable,
    thermodynamics: &dyn ThermodynamicsTable,
    tau: f64,
) -> linpert_core::Result<f64> {
    let mut idx = LastIndex::default();
    let row = background.background_at_tau(tau, BackgroundLevel::Normal, &mut idx)?;
    let z = 1.0 / row.a - 1.0;
    Ok(thermodynamics.thermodynamics_at_z(z, &row, &mut idx)?.kappa_prime)
}

fn z_of_tau(background: &dyn BackgroundTable, tau: f64) -> f64 {
    let mut idx = LastIndex::default();
    background
        .background_at_tau(tau, BackgroundLevel::Short, &mut idx)
        .map_or(0.0, |row| 1.0 / row.a.max(1e-300) - 1.0)
}
