//! Concurrent task dispatch, §5 "dispatch one [`perturbations::PerturbationTask`]
//! per `(mode, initial condition, k)` across a thread pool, then feed each
//! task's source table into [`crate::transfer::project_task`] once every `k`
//! in the grid has converged".
//!
//! Perturbation tasks at different `k` are embarrassingly parallel: each one
//! only reads the shared [`BackgroundTable`]/[`ThermodynamicsTable`]/
//! [`SpeciesList`]/[`Precision`], and writes its own [`TaskOutput`]. We run
//! the `k` loop with `rayon`'s work-stealing pool and merge results back in
//! `k` order afterward, since [`TransferFunctions::push`] requires its
//! columns to be filled in grid order.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::background::BackgroundTable;
use crate::background::ThermodynamicsTable;
use crate::config::Precision;
use crate::error::Result;
use crate::grid::{KGrid, TauGrid};
use crate::mode::{InitialCondition, Mode};
use crate::perturbations::{self, PerturbationTask, TaskOutput};
use crate::species::SpeciesList;
use crate::transfer::{self, projector::TransferFunctions};

/// Shared, read-only context every task in a dispatch run borrows.
pub struct TaskPool<'a> {
    /// Background cosmology collaborator.
    pub background: &'a dyn BackgroundTable,
    /// Thermodynamics collaborator.
    pub thermodynamics: &'a dyn ThermodynamicsTable,
    /// Configured species.
    pub species: &'a SpeciesList,
    /// Precision/physics knobs.
    pub precision: &'a Precision,
}

impl<'a> TaskPool<'a> {
    /// Runs one `(mode, k)` task per grid point for every IC in `ics`,
    /// building each task's own τ grid via `tau_grid_for_k`, then projects
    /// every task's sources into a per-IC [`TransferFunctions`] over
    /// `l_grid`.
    ///
    /// Tasks run concurrently across `k`; the projection merge step runs
    /// single-threaded afterward to preserve grid order.
    pub fn run(
        &self,
        mode: Mode,
        ics: &[InitialCondition],
        k_grid: &KGrid,
        l_grid: &[u32],
        tau_grid_for_k: impl Fn(f64) -> Result<TauGrid> + Sync,
    ) -> Result<HashMap<InitialCondition, TransferFunctions>> {
        tracing::info!(n_k = k_grid.k.len(), n_ic = ics.len(), %mode, "dispatching perturbation tasks");

        let per_k: Vec<HashMap<InitialCondition, TaskOutput>> = k_grid
            .k
            .par_iter()
            .map(|&k| self.run_one_k(mode, ics, k, &tau_grid_for_k))
            .collect::<Result<Vec<_>>>()?;

        let tau_today = self.background.tau_today();
        let curvature = self.background.curvature();
        let mut by_ic: HashMap<InitialCondition, TransferFunctions> = HashMap::new();
        for &ic in ics {
            by_ic.insert(ic, TransferFunctions::new(k_grid.k.clone()));
        }

        for (k_idx, &k) in k_grid.k.iter().enumerate() {
            for &ic in ics {
                let output = &per_k[k_idx][&ic];
                let out = by_ic.get_mut(&ic).expect("pre-populated above");
                transfer::project_task(
                    out,
                    l_grid,
                    mode,
                    k,
                    curvature,
                    tau_today,
                    self.precision,
                    &self.precision.selection_bins,
                    &output.sources,
                )?;
            }
        }
        tracing::info!("perturbation dispatch complete");
        Ok(by_ic)
    }

    fn run_one_k(
        &self,
        mode: Mode,
        ics: &[InitialCondition],
        k: f64,
        tau_grid_for_k: &(impl Fn(f64) -> Result<TauGrid> + Sync),
    ) -> Result<HashMap<InitialCondition, TaskOutput>> {
        let tau_grid = tau_grid_for_k(k)?;
        let mut results = HashMap::with_capacity(ics.len());
        for &ic in ics {
            let task = PerturbationTask {
                mode,
                ic,
                k,
                species: self.species,
                precision: self.precision,
                background: self.background,
                thermodynamics: self.thermodynamics,
                tau_grid: &tau_grid,
            };
            let output = perturbations::run_task(&task)?;
            tracing::debug!(k, ic = %ic, "perturbation task complete");
            results.insert(ic, output);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::{AnalyticFlatLcdm, ToyRecombination};
    use crate::grid::build_tau_grid;
    use crate::sources::SourceKind;
    use crate::species::{Baryons, Cdm, Photons, SpeciesEnum};

    #[test]
    fn dispatch_runs_every_k_and_ic_and_produces_finite_transfer() {
        let background = AnalyticFlatLcdm::new(1.0 / 2997.9, 0.31, 9.2e-5);
        let thermodynamics = ToyRecombination {
            z_rec: 1100.0,
            width: 80.0,
            kappa_prime_scale: 1e4,
        };
        let species = SpeciesList(vec![
            SpeciesEnum::Photons(Photons {
                l_max: 6,
                l_max_pol: 4,
            }),
            SpeciesEnum::Baryons(Baryons {
                perturbed_recombination: false,
            }),
            SpeciesEnum::Cdm(Cdm),
        ]);
        let precision = Precision::default();
        let pool = TaskPool {
            background: &background,
            thermodynamics: &thermodynamics,
            species: &species,
            precision: &precision,
        };

        let k_grid = KGrid {
            k: vec![0.01, 0.02],
            k_size_cmb: 2,
            k_size_cl: 2,
            output_indices: Vec::new(),
        };
        let l_grid = vec![2, 10];
        let tau_today = background.tau_today();
        let tau_grid_for_k = |_k: f64| -> Result<TauGrid> {
            let tau_ini = tau_today * 1e-4;
            let kappa_eff = |tau: f64| -> Result<f64> {
                let mut idx = crate::background::LastIndex::default();
                let row = background.background_at_tau(
                    tau,
                    crate::background::BackgroundLevel::Normal,
                    &mut idx,
                )?;
                let z = 1.0 / row.a - 1.0;
                Ok(thermodynamics
                    .thermodynamics_at_z(z, &row, &mut idx)?
                    .kappa_prime)
            };
            let z_of = |tau: f64| 1.0 / background.background_at_tau(
                    tau,
                    crate::background::BackgroundLevel::Short,
                    &mut crate::background::LastIndex::default(),
                )
                .map(|r| r.a)
                .unwrap_or(1.0)
                - 1.0;
            let grid = build_tau_grid(&background, tau_ini, 2.0, kappa_eff, z_of, 0.0)?;
            let sparse: Vec<f64> = grid
                .tau
                .iter()
                .step_by((grid.tau.len() / 6).max(1))
                .copied()
                .collect();
            Ok(TauGrid {
                tau: sparse,
                late_start: 0,
            })
        };

        let result = pool
            .run(Mode::Scalar, &[InitialCondition::Adiabatic], &k_grid, &l_grid, tau_grid_for_k)
            .unwrap();
        let transfer = &result[&InitialCondition::Adiabatic];
        for &l in &l_grid {
            let column = transfer.column(SourceKind::Temperature, l);
            assert_eq!(column.len(), k_grid.k.len());
            assert!(column.iter().all(|v| v.is_finite()));
        }
    }
}
