//! Per-`(mode, initial condition, k)` perturbation task orchestration, §4.P
//! "Perturbation Integrator".
//!
//! [`run_task`] is the function [`crate::dispatch`] calls once per task: it
//! builds the approximation schedule, seeds the initial condition, drives
//! the evolver across the τ grid handling layout transitions at switch
//! times, and samples [`sources::SourceTable`]/[`sources::SpeciesDiagnosticsTable`]
//! at every grid point.

use crate::approx::{self, ApproxFlags, TriggerInputs};
use crate::background::{BackgroundLevel, BackgroundTable, LastIndex, ThermodynamicsTable};
use crate::config::{EvolverKind, NcdmfaScheme, Precision, RsaScheme, UfaScheme};
use crate::derivs;
use crate::einstein;
use crate::error::{Error, Result};
use crate::grid::TauGrid;
use crate::initial_conditions;
use crate::integrator::{self, Rhs, Tolerance};
use crate::mode::{Gauge, InitialCondition, Mode};
use crate::sources::{SourceKind, SourceTable, SpeciesDiagnosticsTable};
use crate::species::SpeciesEnum;
use crate::species::SpeciesList;
use crate::workspace::Workspace;

/// Everything one perturbation task needs; owns no data itself, only
/// borrows the external collaborators and configuration.
pub struct PerturbationTask<'a> {
    /// Perturbation mode.
    pub mode: Mode,
    /// Initial condition (ignored for non-scalar modes).
    pub ic: InitialCondition,
    /// Wavenumber.
    pub k: f64,
    /// Configured species.
    pub species: &'a SpeciesList,
    /// Precision/physics knobs.
    pub precision: &'a Precision,
    /// Background table.
    pub background: &'a dyn BackgroundTable,
    /// Thermodynamics table.
    pub thermodynamics: &'a dyn ThermodynamicsTable,
    /// The shared τ grid to sample sources on.
    pub tau_grid: &'a TauGrid,
}

/// The result of running one task.
pub struct TaskOutput {
    /// Sampled CMB/LSS source functions.
    pub sources: SourceTable,
    /// Sampled per-species density/velocity diagnostics.
    pub diagnostics: SpeciesDiagnosticsTable,
}

fn z_of_tau(background: &dyn BackgroundTable, tau: f64) -> Result<f64> {
    let mut idx = LastIndex::default();
    let row = background.background_at_tau(tau, BackgroundLevel::Short, &mut idx)?;
    if row.a <= 0.0 {
        return Err(Error::Numerical {
            tau,
            message: "scale factor non-positive".to_string(),
        });
    }
    Ok(1.0 / row.a - 1.0)
}

fn kappa_prime_at(
    background: &dyn BackgroundTable,
    thermodynamics: &dyn ThermodynamicsTable,
    tau: f64,
) -> Result<f64> {
    let mut idx = LastIndex::default();
    let row = background.background_at_tau(tau, BackgroundLevel::Normal, &mut idx)?;
    let z = 1.0 / row.a - 1.0;
    let thermo = thermodynamics.thermodynamics_at_z(z, &row, &mut idx)?;
    Ok(thermo.kappa_prime)
}

/// `κ′_idm_dr(z)` from the configured idm-dr species, or `0` if idm-dr is
/// not present in this run.
fn kappa_prime_idm_dr_at(species: &SpeciesList, z: f64) -> f64 {
    species
        .iter()
        .find_map(|s| match s {
            SpeciesEnum::InteractingDarkMatter(idm) => Some(idm.kappa_prime(z)),
            _ => None,
        })
        .unwrap_or(0.0)
}

fn trigger_inputs(
    task: &PerturbationTask,
    tau: f64,
) -> Result<TriggerInputs> {
    let mut idx = LastIndex::default();
    let row = task
        .background
        .background_at_tau(tau, BackgroundLevel::Short, &mut idx)?;
    if row.a_h == 0.0 {
        return Err(Error::Numerical {
            tau,
            message: "aH vanished while evaluating triggers".to_string(),
        });
    }
    let kappa_prime = kappa_prime_at(task.background, task.thermodynamics, tau)?;
    let z = 1.0 / row.a - 1.0;
    let kappa_prime_idm_dr = kappa_prime_idm_dr_at(task.species, z);
    let has_ncdm = task
        .species
        .iter()
        .any(|s| matches!(s, SpeciesEnum::Ncdm(_)));
    Ok(TriggerInputs {
        tau_h: 1.0 / row.a_h,
        tau_k: 1.0 / task.k,
        tau_c: if kappa_prime > 0.0 {
            1.0 / kappa_prime
        } else {
            f64::INFINITY
        },
        tau_c_idm_dr: if kappa_prime_idm_dr > 0.0 {
            1.0 / kappa_prime_idm_dr
        } else {
            f64::INFINITY
        },
        past_tau_free_streaming: kappa_prime < 1e-3 * row.a_h,
        has_ncdm,
    })
}

fn enabled_flags(task: &PerturbationTask) -> ApproxFlags {
    let mut flags = ApproxFlags::TCA;
    if !matches!(task.precision.rsa_scheme, RsaScheme::None)
        && task
            .species
            .iter()
            .any(|s| matches!(s, SpeciesEnum::UltraRelativisticNeutrinos(_)))
    {
        flags |= ApproxFlags::RSA;
    }
    if !matches!(task.precision.ufa_scheme, UfaScheme::None) {
        flags |= ApproxFlags::UFA;
    }
    if !matches!(task.precision.ncdmfa_scheme, NcdmfaScheme::None)
        && task.species.iter().any(|s| matches!(s, SpeciesEnum::Ncdm(_)))
    {
        flags |= ApproxFlags::NCDMFA;
    }
    let has_idm = task
        .species
        .iter()
        .any(|s| matches!(s, SpeciesEnum::InteractingDarkMatter(_)));
    if has_idm {
        flags |= ApproxFlags::TCA_IDM_DR;
        if !matches!(task.precision.rsa_scheme, RsaScheme::None) {
            flags |= ApproxFlags::RSA_IDR;
        }
    }
    flags
}

fn trigger_value(task: &PerturbationTask, flag: ApproxFlags, tau: f64) -> Result<f64> {
    let inputs = trigger_inputs(task, tau)?;
    Ok(match flag {
        ApproxFlags::TCA => task.precision.tca_trigger_tau_c_over_tau_h - inputs.tau_c / inputs.tau_h,
        ApproxFlags::RSA => tau / inputs.tau_k - task.precision.rsa_trigger,
        ApproxFlags::UFA => tau / inputs.tau_k - task.precision.ufa_trigger,
        ApproxFlags::NCDMFA => tau / inputs.tau_k - task.precision.ufa_trigger * 2.0,
        // idm-dr/idr reuse the ordinary TCA/RSA thresholds against the dark
        // optical depth rather than a separate knob, §4.P.2.
        ApproxFlags::TCA_IDM_DR => {
            task.precision.tca_trigger_tau_c_over_tau_h - inputs.tau_c_idm_dr / inputs.tau_h
        }
        ApproxFlags::RSA_IDR => tau / inputs.tau_k - task.precision.rsa_trigger,
        _ => -1.0,
    })
}

/// Runs one perturbation task end to end.
pub fn run_task(task: &PerturbationTask) -> Result<TaskOutput> {
    let tau_ini = task.tau_grid.tau[0];
    let tau_today = *task.tau_grid.tau.last().unwrap();
    let enabled = enabled_flags(task);
    let schedule = approx::build_schedule(tau_ini, tau_today, enabled, |flag, tau| {
        trigger_value(task, flag, tau)
    })?;

    let mut workspace = Workspace::new(
        task.k,
        task.mode,
        task.precision.gauge,
        task.species,
        task.precision,
    );
    match task.mode {
        Mode::Scalar => {
            let mut idx = LastIndex::default();
            let row = task
                .background
                .background_at_tau(tau_ini, BackgroundLevel::Normal, &mut idx)?;
            initial_conditions::set_scalar_initial_conditions(
                &mut workspace.y,
                task.ic,
                task.precision.gauge,
                task.species,
                task.k,
                tau_ini,
                &row,
            )?;
        }
        Mode::Tensor | Mode::Vector => {
            initial_conditions::set_tensor_initial_conditions(&mut workspace.y);
        }
    }
    workspace.dy = vec![0.0; workspace.y.data.len()];

    let mut sources = SourceTable::new(task.tau_grid.tau.clone());
    let mut diagnostics = SpeciesDiagnosticsTable::new(task.tau_grid.tau.clone());

    let mut event_idx = 0usize;
    let tol = Tolerance {
        rtol: task.precision.tol_perturb_integration,
        atol: task.precision.tol_perturb_integration * 1e-6,
    };

    let mut tau = tau_ini;
    let mut dt = task.precision.tau_stepsize
        * (tau_today - tau_ini)
        / (task.tau_grid.tau.len().max(2) as f64);

    for &target in &task.tau_grid.tau {
        while tau < target {
            while event_idx < schedule.events.len() && schedule.events[event_idx].tau <= tau {
                let new_flags = schedule.flags_in_interval[event_idx + 1];
                workspace.transition_to(
                    new_flags,
                    task.mode,
                    task.precision.gauge,
                    task.species,
                    task.precision,
                );
                event_idx += 1;
            }
            let next_switch = schedule
                .events
                .get(event_idx)
                .map_or(tau_today, |e| e.tau);
            let step_target = target.min(next_switch);
            let step_dt = dt.min(step_target - tau).max(1e-12 * tau_today);

            let species = task.species;
            let precision = task.precision;
            let mode = task.mode;
            let gauge = task.precision.gauge;
            let background = task.background;
            let thermodynamics = task.thermodynamics;
            let layout = workspace.y.layout.clone();
            let flags = workspace.flags;

            let mut rhs_closure = move |t: f64, y: &[f64], dy: &mut [f64]| -> Result<()> {
                let mut local = Workspace {
                    y: crate::vector::IntegrationVector {
                        layout: layout.clone(),
                        data: y.to_vec(),
                    },
                    dy: vec![0.0; y.len()],
                    flags,
                    k: task.k,
                    metric_sources: vec![[0.0; 3]; species.len()],
                };
                let mut idx = LastIndex::default();
                let row = background.background_at_tau(t, BackgroundLevel::Normal, &mut idx)?;
                let z = 1.0 / row.a.max(1e-300) - 1.0;
                let thermo = thermodynamics.thermodynamics_at_z(z, &row, &mut idx)?;
                let kappa_prime_idm_dr = kappa_prime_idm_dr_at(species, z);
                derivs::compute_derivatives(
                    &mut local,
                    mode,
                    gauge,
                    species,
                    &row,
                    &thermo,
                    kappa_prime_idm_dr,
                    precision,
                )?;
                dy.copy_from_slice(&local.dy);
                Ok(())
            };
            let rhs: &mut Rhs<'_> = &mut rhs_closure;

            let result = match task.precision.evolver {
                EvolverKind::Rk => integrator::step_rk45(rhs, tau, step_dt, &workspace.y.data, tol)?,
                EvolverKind::Ndf15 => {
                    integrator::step_tr_bdf2(rhs, tau, step_dt, &workspace.y.data, tol)?
                }
            };
            workspace.y.data = result.y;
            tau = result.tau;
            dt = result.dt_next.max(1e-10 * tau_today);
        }
        sample_at(task, &mut workspace, target, &mut sources, &mut diagnostics)?;
    }

    Ok(TaskOutput {
        sources,
        diagnostics,
    })
}

fn sample_at(
    task: &PerturbationTask,
    workspace: &mut Workspace,
    tau: f64,
    sources: &mut SourceTable,
    diagnostics: &mut SpeciesDiagnosticsTable,
) -> Result<()> {
    let mut idx = LastIndex::default();
    let row = task
        .background
        .background_at_tau(tau, BackgroundLevel::Normal, &mut idx)?;
    let z = 1.0 / row.a.max(1e-300) - 1.0;
    let thermo = task.thermodynamics.thermodynamics_at_z(z, &row, &mut idx)?;
    let kappa_prime_idm_dr = kappa_prime_idm_dr_at(task.species, z);

    derivs::compute_derivatives(
        workspace,
        task.mode,
        task.precision.gauge,
        task.species,
        &row,
        &thermo,
        kappa_prime_idm_dr,
        task.precision,
    )?;

    if task.mode == Mode::Scalar {
        let g_delta = workspace.y.field("g_delta").first().copied().unwrap_or(0.0);
        let psi = match task.precision.gauge {
            Gauge::Newtonian => {
                let phi = workspace.y.field("metric_phi").first().copied().unwrap_or(0.0);
                let k2 = einstein::k2_eff(task.k, task.background.curvature());
                let _ = k2;
                -phi
            }
            Gauge::Synchronous => 0.0,
        };
        let sachs_wolfe = thermo.g * (g_delta / 4.0 + psi);
        sources.push(SourceKind::Temperature, sachs_wolfe);

        let b_theta = workspace.y.field("b_theta").first().copied().unwrap_or(0.0);
        sources.push(SourceKind::Doppler, thermo.g * b_theta / task.k.max(1e-300));

        let shear = workspace
            .y
            .field("g_hierarchy")
            .first()
            .copied()
            .unwrap_or(0.0)
            / 2.0;
        let pol_quad = workspace.y.field("g_pol").first().copied().unwrap_or(0.0);
        let pi_pol = shear + pol_quad;
        sources.push(SourceKind::EPolarization, 0.75 * thermo.g * pi_pol);
        sources.push(
            SourceKind::Quadrupole,
            0.75 * thermo.g * pi_pol / (task.k * task.k).max(1e-300),
        );

        let phi = workspace.y.field("metric_phi").first().copied().unwrap_or(0.0);
        sources.push(SourceKind::Lensing, phi - psi);

        for (bin_idx, bin) in task.precision.selection_bins.iter().enumerate() {
            let window = selection_window(bin, z);
            let delta_cdm = workspace.y.field("cdm_delta").first().copied().unwrap_or(0.0);
            let theta_cdm = workspace.y.field("cdm_theta").first().copied().unwrap_or(0.0);
            sources.push(SourceKind::NumberCount(bin_idx), window * delta_cdm);
            sources.push(SourceKind::NumberCountRsd(bin_idx), window * theta_cdm / task.k.max(1e-300));
            sources.push(SourceKind::GalaxyLensing(bin_idx), window * (phi - psi));
        }

        for s in task.species.iter() {
            let (name, delta_field, theta_field) = match s {
                SpeciesEnum::Photons(_) => ("photons", "g_delta", "g_theta"),
                SpeciesEnum::Baryons(_) => ("baryons", "b_delta", "b_theta"),
                SpeciesEnum::Cdm(_) => ("cdm", "cdm_delta", "cdm_theta"),
                SpeciesEnum::UltraRelativisticNeutrinos(_) => ("ur", "ur_delta", "ur_theta"),
                _ => continue,
            };
            diagnostics.push(name, "delta", workspace.y.field(delta_field).first().copied().unwrap_or(0.0));
            diagnostics.push(name, "theta", workspace.y.field(theta_field).first().copied().unwrap_or(0.0));
        }
    }

    Ok(())
}

fn selection_window(bin: &crate::config::SelectionBin, z: f64) -> f64 {
    use crate::config::SelectionKind;
    let dz = (z - bin.z_mean) / bin.width.max(1e-12);
    match bin.kind {
        SelectionKind::Dirac => {
            if (z - bin.z_mean).abs() < 1e-6 {
                1.0
            } else {
                0.0
            }
        }
        SelectionKind::Gaussian => (-0.5 * dz * dz).exp(),
        SelectionKind::TopHat => 0.5 * (1.0 - dz.abs().min(bin.cut) / bin.cut.max(1e-12)).max(0.0) * 2.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::{AnalyticFlatLcdm, ToyRecombination};
    use crate::grid::build_tau_grid;
    use crate::species::{Baryons, Cdm, InteractingDarkMatter, InteractingDarkRadiation, Photons};

    #[test]
    fn scalar_adiabatic_task_produces_finite_temperature_source() {
        let background = AnalyticFlatLcdm::new(1.0 / 2997.9, 0.31, 9.2e-5);
        let thermodynamics = ToyRecombination {
            z_rec: 1100.0,
            width: 80.0,
            kappa_prime_scale: 1e4,
        };
        let precision = Precision::default();
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

        let tau_today = background.tau_today();
        let tau_ini = tau_today * 1e-4;
        let kappa_eff = |tau: f64| -> Result<f64> {
            kappa_prime_at(&background, &thermodynamics, tau)
        };
        let z_of = |tau: f64| z_of_tau(&background, tau).unwrap_or(0.0);
        let tau_grid = build_tau_grid(&background, tau_ini, 2.0, kappa_eff, z_of, 0.0).unwrap();
        // keep the test cheap: subsample the grid to a handful of points
        let sparse: Vec<f64> = tau_grid
            .tau
            .iter()
            .step_by((tau_grid.tau.len() / 8).max(1))
            .copied()
            .collect();
        let sparse_grid = TauGrid {
            tau: sparse,
            late_start: 0,
        };

        let task = PerturbationTask {
            mode: Mode::Scalar,
            ic: InitialCondition::Adiabatic,
            k: 0.01,
            species: &species,
            precision: &precision,
            background: &background,
            thermodynamics: &thermodynamics,
            tau_grid: &sparse_grid,
        };
        let output = run_task(&task).unwrap();
        assert!(output
            .sources
            .column(SourceKind::Temperature)
            .iter()
            .all(|v| v.is_finite()));
    }

    #[test]
    fn kappa_prime_idm_dr_at_is_zero_without_idm_species() {
        let species = SpeciesList(vec![SpeciesEnum::Cdm(Cdm)]);
        assert_eq!(kappa_prime_idm_dr_at(&species, 1000.0), 0.0);
    }

    #[test]
    fn kappa_prime_idm_dr_at_grows_with_redshift() {
        let species = SpeciesList(vec![SpeciesEnum::InteractingDarkMatter(
            InteractingDarkMatter {
                coupling_strength: 1e-3,
                temperature_index: 2.0,
            },
        )]);
        let low_z = kappa_prime_idm_dr_at(&species, 10.0);
        let high_z = kappa_prime_idm_dr_at(&species, 1000.0);
        assert!(high_z > low_z);
        assert!((low_z - 1e-3 * 11.0_f64.powf(2.0)).abs() < 1e-12);
    }

    #[test]
    fn enabled_flags_sets_idm_dr_flags_only_when_idm_species_present() {
        let background = AnalyticFlatLcdm::new(1.0 / 2997.9, 0.31, 9.2e-5);
        let thermodynamics = ToyRecombination {
            z_rec: 1100.0,
            width: 80.0,
            kappa_prime_scale: 1e4,
        };
        let precision = Precision::default();
        let without_idm = SpeciesList(vec![SpeciesEnum::Cdm(Cdm)]);
        let tau_grid = TauGrid {
            tau: vec![1.0, 2.0],
            late_start: 0,
        };
        let task_without = PerturbationTask {
            mode: Mode::Scalar,
            ic: InitialCondition::Adiabatic,
            k: 0.01,
            species: &without_idm,
            precision: &precision,
            background: &background,
            thermodynamics: &thermodynamics,
            tau_grid: &tau_grid,
        };
        assert!(!enabled_flags(&task_without).contains(ApproxFlags::TCA_IDM_DR));

        let with_idm = SpeciesList(vec![
            SpeciesEnum::Cdm(Cdm),
            SpeciesEnum::InteractingDarkMatter(InteractingDarkMatter {
                coupling_strength: 1e-3,
                temperature_index: 2.0,
            }),
            SpeciesEnum::InteractingDarkRadiation(InteractingDarkRadiation { l_max: 4 }),
        ]);
        let task_with = PerturbationTask {
            mode: Mode::Scalar,
            ic: InitialCondition::Adiabatic,
            k: 0.01,
            species: &with_idm,
            precision: &precision,
            background: &background,
            thermodynamics: &thermodynamics,
            tau_grid: &tau_grid,
        };
        let flags = enabled_flags(&task_with);
        assert!(flags.contains(ApproxFlags::TCA_IDM_DR));
        assert!(flags.contains(ApproxFlags::RSA_IDR));
    }
}
