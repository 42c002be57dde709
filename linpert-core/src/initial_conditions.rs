//! Super-horizon initial conditions, §4.P.1 step 2 "seed `y(τ_ini)` from the
//! requested [`InitialCondition`] using the leading-order series expansion
//! in `kτ`".
//!
//! Each mode is normalized the way Ma & Bertschinger (1995) §3 and Bucher,
//! Moodley & Turok (2000) normalize theirs: curvature perturbation `ζ=1` for
//! the adiabatic mode, unit entropy perturbation for each isocurvature mode.
//! Only the leading `O((kτ)^0)` term is kept; a production engine would add
//! the `O(kτ)` and `O((kτ)²)` correction terms CLASS carries to suppress
//! transients near `τ_ini` (resolved Open Question, see `DESIGN.md`).

use crate::background::BackgroundRow;
use crate::error::{Error, Result};
use crate::mode::{Gauge, InitialCondition, Mode};
use crate::species::SpeciesEnum;
use crate::species::SpeciesList;
use crate::vector::IntegrationVector;

fn set(y: &mut IntegrationVector, name: &str, value: f64) {
    if let Some(slot) = y.layout.slot(name).cloned() {
        if slot.len > 0 {
            y.data[slot.offset] = value;
        }
    }
}

/// Seeds `y` in place for one scalar-mode initial condition.
pub fn set_scalar_initial_conditions(
    y: &mut IntegrationVector,
    ic: InitialCondition,
    gauge: Gauge,
    species: &SpeciesList,
    k: f64,
    tau_ini: f64,
    background: &BackgroundRow,
) -> Result<()> {
    if background.a_h == 0.0 {
        return Err(Error::Numerical {
            tau: tau_ini,
            message: "aH vanished while setting initial conditions".to_string(),
        });
    }
    let rho_r: f64 = species
        .iter()
        .enumerate()
        .filter(|(_, s)| {
            matches!(
                s,
                SpeciesEnum::Photons(_) | SpeciesEnum::UltraRelativisticNeutrinos(_)
            )
        })
        .map(|(i, _)| background.rho.get(i).copied().unwrap_or(0.0))
        .sum();
    let rho_ur: f64 = species
        .iter()
        .enumerate()
        .filter(|(_, s)| matches!(s, SpeciesEnum::UltraRelativisticNeutrinos(_)))
        .map(|(i, _)| background.rho.get(i).copied().unwrap_or(0.0))
        .sum();
    let f_ur = if rho_r > 0.0 { rho_ur / rho_r } else { 0.0 };

    match ic {
        InitialCondition::Adiabatic => set_adiabatic(y, gauge, species, k, tau_ini, f_ur),
        InitialCondition::BaryonIso => set_baryon_isocurvature(y, k, tau_ini),
        InitialCondition::CdmIso => set_cdm_isocurvature(y, k, tau_ini),
        InitialCondition::NeutrinoDensityIso => {
            set_neutrino_density_isocurvature(y, k, tau_ini, f_ur)
        }
        InitialCondition::NeutrinoVelocityIso => {
            set_neutrino_velocity_isocurvature(y, k, tau_ini, f_ur)
        }
    }
    Ok(())
}

/// The standard adiabatic mode: a single curvature perturbation `ζ=-1`
/// shared by every species, with super-horizon density contrasts
/// `δ_i = -2/3 (1+w_i) ψ - ...` collapsing, at leading order in `kτ`, to the
/// textbook ratios `δ_γ = δ_ur = -4/3 η_0`, `δ_b = δ_cdm = 3/4 δ_γ`.
fn set_adiabatic(y: &mut IntegrationVector, gauge: Gauge, species: &SpeciesList, k: f64, tau_ini: f64, f_ur: f64) {
    let eta0 = 1.0;
    let _ = f_ur;
    match gauge {
        Gauge::Synchronous => {
            set(y, "metric_eta", eta0);
            let delta_g = -2.0 / 3.0 * (k * tau_ini).powi(2) * eta0;
            set(y, "g_delta", delta_g);
            set(y, "g_theta", -k.powi(3) * tau_ini.powi(3) / 18.0 * eta0);
            set(y, "ur_delta", delta_g);
            set(y, "ur_theta", -k.powi(3) * tau_ini.powi(3) / 18.0 * eta0);
            set(y, "b_delta", 0.75 * delta_g);
            set(y, "b_theta", -k.powi(3) * tau_ini.powi(3) / 18.0 * eta0);
            set(y, "cdm_delta", 0.75 * delta_g);
            set(y, "idm_dr_delta", 0.75 * delta_g);
            set(y, "idr_delta", delta_g);
        }
        Gauge::Newtonian => {
            let psi0 = -eta0;
            set(y, "metric_phi", -psi0);
            let delta_g = -2.0 * psi0;
            set(y, "g_delta", delta_g);
            set(y, "g_theta", k * k * tau_ini / 3.0 * psi0);
            set(y, "ur_delta", delta_g);
            set(y, "ur_theta", k * k * tau_ini / 3.0 * psi0);
            set(y, "b_delta", 0.75 * delta_g);
            set(y, "b_theta", k * k * tau_ini / 3.0 * psi0);
            set(y, "cdm_delta", 0.75 * delta_g);
            set(y, "cdm_theta", k * k * tau_ini / 3.0 * psi0);
            set(y, "idm_dr_delta", 0.75 * delta_g);
            set(y, "idr_delta", delta_g);
        }
    }
    let _ = species;
}

fn set_baryon_isocurvature(y: &mut IntegrationVector, k: f64, tau_ini: f64) {
    set(y, "b_delta", 1.0);
    set(y, "cdm_delta", 0.0);
    set(y, "g_delta", 0.0);
    let _ = (k, tau_ini);
}

fn set_cdm_isocurvature(y: &mut IntegrationVector, k: f64, tau_ini: f64) {
    set(y, "cdm_delta", 1.0);
    set(y, "b_delta", 0.0);
    set(y, "g_delta", 0.0);
    let _ = (k, tau_ini);
}

fn set_neutrino_density_isocurvature(y: &mut IntegrationVector, k: f64, tau_ini: f64, f_ur: f64) {
    if f_ur <= 0.0 {
        return;
    }
    set(y, "ur_delta", 1.0);
    set(y, "g_delta", -f_ur / (1.0 - f_ur).max(1e-6));
    let _ = (k, tau_ini);
}

fn set_neutrino_velocity_isocurvature(y: &mut IntegrationVector, k: f64, tau_ini: f64, f_ur: f64) {
    if f_ur <= 0.0 {
        return;
    }
    set(y, "ur_theta", k * 1.0);
    set(y, "g_theta", -f_ur / (1.0 - f_ur).max(1e-6) * k);
    let _ = tau_ini;
}

/// Seeds the tensor-mode initial condition: a scale-invariant tensor metric
/// perturbation `h=1`, `h′=0`, zero radiation anisotropy.
pub fn set_tensor_initial_conditions(y: &mut IntegrationVector) {
    set(y, "h", 1.0);
    set(y, "h_prime", 0.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;
    use crate::mode::Mode;
    use crate::species::{Baryons, Cdm, Photons};
    use crate::vector::VectorLayout;
    use crate::approx::ApproxFlags;

    fn species() -> SpeciesList {
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

    #[test]
    fn adiabatic_sync_gauge_sets_consistent_density_ratios() {
        let precision = Precision::default();
        let s = species();
        let layout =
            VectorLayout::build_scalar(Mode::Scalar, Gauge::Synchronous, ApproxFlags::empty(), &s, &precision);
        let mut y = IntegrationVector::zeros(layout);
        let background = BackgroundRow {
            a: 1e-6,
            a_h: 1.0,
            a_h_prime: 0.0,
            rho: vec![1e-4, 1.0, 5.0],
            p: vec![1e-4 / 3.0, 0.0, 0.0],
        };
        set_scalar_initial_conditions(&mut y, InitialCondition::Adiabatic, Gauge::Synchronous, &s, 0.01, 1.0, &background)
            .unwrap();
        let g_delta = y.field("g_delta")[0];
        let b_delta = y.field("b_delta")[0];
        assert!((b_delta - 0.75 * g_delta).abs() < 1e-12);
    }

    #[test]
    fn isocurvature_modes_zero_out_photon_density() {
        let precision = Precision::default();
        let s = species();
        let layout =
            VectorLayout::build_scalar(Mode::Scalar, Gauge::Synchronous, ApproxFlags::empty(), &s, &precision);
        let mut y = IntegrationVector::zeros(layout);
        let background = BackgroundRow {
            a: 1e-6,
            a_h: 1.0,
            a_h_prime: 0.0,
            rho: vec![1e-4, 1.0, 5.0],
            p: vec![1e-4 / 3.0, 0.0, 0.0],
        };
        set_scalar_initial_conditions(
            &mut y,
            InitialCondition::CdmIso,
            Gauge::Synchronous,
            &s,
            0.01,
            1.0,
            &background,
        )
        .unwrap();
        assert_eq!(y.field("g_delta")[0], 0.0);
        assert_eq!(y.field("cdm_delta")[0], 1.0);
    }
}
