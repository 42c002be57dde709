//! Shared helpers for subcommands: config loading, table formatting, and
//! the toy background/thermodynamics collaborators every subcommand needs
//! since this crate ships no tabulated-background reader of its own.

use anyhow::{Context, Result};
use linpert_core::background::{AnalyticFlatLcdm, ToyRecombination};
use linpert_core::config::Precision;
use prettytable::format::{FormatBuilder, LinePosition, LineSeparator};
use prettytable::Table;
use std::path::Path;

pub use crate::{GlobalConfiguration, Subcommand};

/// Minimal flat-ΛCDM cosmology parameters, enough to drive
/// [`AnalyticFlatLcdm`] + [`ToyRecombination`] end to end from the CLI.
#[derive(clap::Parser, Clone, Copy)]
pub struct CosmologyOpts {
    /// Hubble parameter today, in km/s/Mpc.
    #[arg(default_value_t = 67.4, long)]
    pub h0_km_s_mpc: f64,
    /// Matter density parameter today.
    #[arg(default_value_t = 0.315, long)]
    pub omega_m: f64,
    /// Radiation density parameter today.
    #[arg(default_value_t = 9.2e-5, long)]
    pub omega_r: f64,
    /// Recombination redshift for the toy thermal history.
    #[arg(default_value_t = 1100.0, long)]
    pub z_rec: f64,
    /// Width in redshift of the toy recombination transition.
    #[arg(default_value_t = 80.0, long)]
    pub z_rec_width: f64,
    /// Overall Thomson-opacity scale for the toy thermal history.
    #[arg(default_value_t = 1.0e4, long)]
    pub kappa_prime_scale: f64,
}

impl CosmologyOpts {
    /// Builds the analytic background + toy thermal history for this
    /// cosmology. `H0` is converted from km/s/Mpc to Mpc⁻¹ via `c = 299792.458
    /// km/s`.
    #[must_use]
    pub fn build(self) -> (AnalyticFlatLcdm, ToyRecombination) {
        let h0_inv_mpc = self.h0_km_s_mpc / 299_792.458;
        let background = AnalyticFlatLcdm::new(h0_inv_mpc, self.omega_m, self.omega_r);
        let thermodynamics = ToyRecombination {
            z_rec: self.z_rec,
            width: self.z_rec_width,
            kappa_prime_scale: self.kappa_prime_scale,
        };
        (background, thermodynamics)
    }
}

/// Reads and validates a [`Precision`] configuration from a YAML file.
pub fn read_precision(path: &Path, species: &linpert_core::species::SpeciesList) -> Result<Precision> {
    let text = std::fs::read_to_string(path).context(format!("unable to read '{}'", path.display()))?;
    let precision: Precision =
        serde_yaml::from_str(&text).context(format!("unable to parse '{}' as precision config", path.display()))?;
    precision
        .validate(species)
        .map_err(anyhow::Error::from)
        .context("precision config failed validation")?;
    Ok(precision)
}

/// The default three-species list (photons, baryons, CDM) used whenever a
/// subcommand needs one but the user has not configured a richer sector.
#[must_use]
pub fn default_species() -> linpert_core::species::SpeciesList {
    use linpert_core::species::{Baryons, Cdm, Photons, SpeciesEnum, SpeciesList};
    SpeciesList(vec![
        SpeciesEnum::Photons(Photons {
            l_max: 8,
            l_max_pol: 6,
        }),
        SpeciesEnum::Baryons(Baryons {
            perturbed_recombination: false,
        }),
        SpeciesEnum::Cdm(Cdm),
    ])
}

/// A `prettytable` table preformatted the way every subcommand's tabular
/// output uses.
#[must_use]
pub fn create_table() -> Table {
    let mut table = Table::new();
    table.set_format(
        FormatBuilder::new()
            .column_separator(' ')
            .separator(LinePosition::Title, LineSeparator::new('-', '+', ' ', ' '))
            .build(),
    );
    table
}
