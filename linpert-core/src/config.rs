//! Configuration: the struct of flags and precision knobs described in §6,
//! plus the fatal configuration-error checks of §7 that must pass before
//! any task is dispatched.

use crate::error::{Error, Result};
use crate::mode::Gauge;
use crate::species::{SpeciesCapabilities, SpeciesList};
use serde::{Deserialize, Serialize};

/// Tight-coupling slip scheme, §4.P.4.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TcaScheme {
    /// Ma & Bertschinger, first order.
    MaBertschinger,
    /// CAMB-style.
    Camb,
    /// CLASS first order.
    Class1st,
    /// CLASS second order.
    Class2nd,
    /// Compromise CLASS-like second order (CRS).
    Crs,
    /// Compromise between [`Self::Camb`] and [`Self::Class2nd`].
    CompromiseClass,
}

/// Radiation-streaming approximation scheme.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RsaScheme {
    /// Disabled.
    None,
    /// Moment-discarding.
    Md,
    /// Moment-discarding with a reionization correction term.
    MdWithReio,
}

/// Ultra-relativistic-fluid approximation scheme.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum UfaScheme {
    /// Disabled.
    None,
    /// Ma & Bertschinger.
    MaBertschinger,
    /// Hu's scheme.
    Hu,
    /// CLASS's scheme.
    Class,
}

/// Non-cold-DM-fluid approximation scheme.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum NcdmfaScheme {
    /// Disabled.
    None,
    /// Ma & Bertschinger.
    MaBertschinger,
    /// Hu's scheme.
    Hu,
    /// CLASS's scheme.
    Class,
}

/// Stiff-ODE evolver choice, §6 `evolver`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum EvolverKind {
    /// Variable-order, adaptive BDF (NDF15-style).
    Ndf15,
    /// Adaptive explicit Runge-Kutta.
    Rk,
}

/// Selection-window kind for a redshift bin, §4.T.2.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub enum SelectionKind {
    /// A delta function at `z_mean`.
    Dirac,
    /// A Gaussian of width `σ`.
    Gaussian,
    /// A tanh-smoothed top-hat.
    TopHat,
}

/// One redshift bin for number-count / lensing sources.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct SelectionBin {
    /// Selection-window shape.
    pub kind: SelectionKind,
    /// Bin center redshift.
    pub z_mean: f64,
    /// Bin width (σ for Gaussian, half-width for top-hat; ignored for
    /// Dirac).
    pub width: f64,
    /// Number of standard deviations / widths at which the window is cut
    /// off.
    pub cut: f64,
}

/// Tensor-mode photon treatment, §6 `tensor_method`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TensorMethod {
    /// Photons only, no polarization sourcing.
    PhotonsOnly,
    /// Massless free-streaming approximation.
    MasslessApprox,
    /// Exact photon + neutrino tensor Boltzmann hierarchy.
    Exact,
}

/// The full struct of precision and physics knobs, §6.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Precision {
    /// Metric gauge.
    pub gauge: Gauge,
    /// Enable scalar modes.
    pub scalars: bool,
    /// Enable vector modes.
    pub vectors: bool,
    /// Enable tensor modes.
    pub tensors: bool,

    /// Enable each scalar initial condition.
    pub ic_ad: bool,
    /// See [`Self::ic_ad`].
    pub ic_bi: bool,
    /// See [`Self::ic_ad`].
    pub ic_cdi: bool,
    /// See [`Self::ic_ad`].
    pub ic_nid: bool,
    /// See [`Self::ic_ad`].
    pub ic_niv: bool,

    /// Maximum redshift at which matter power spectra are requested; also
    /// used to bound the τ-grid when CMB sources are not wanted, §3 "Time
    /// grid".
    pub z_max_pk: f64,
    /// Redshift bins for number-count / lensing sources.
    pub selection_bins: Vec<SelectionBin>,
    /// Tensor photon treatment.
    pub tensor_method: TensorMethod,

    /// Tight-coupling scheme.
    pub tca_scheme: TcaScheme,
    /// Radiation-streaming scheme.
    pub rsa_scheme: RsaScheme,
    /// Ultra-relativistic-fluid scheme.
    pub ufa_scheme: UfaScheme,
    /// Non-cold-DM-fluid scheme.
    pub ncdmfa_scheme: NcdmfaScheme,
    /// Stiff-ODE evolver.
    pub evolver: EvolverKind,

    /// `τ_c/τ_h` trigger below which TCA switches on.
    pub tca_trigger_tau_c_over_tau_h: f64,
    /// `τ_c/τ_k` trigger below which TCA switches on.
    pub tca_trigger_tau_c_over_tau_k: f64,
    /// `τ/τ_k` trigger above which RSA switches on.
    pub rsa_trigger: f64,
    /// `τ/τ_k` trigger above which UFA switches on.
    pub ufa_trigger: f64,

    /// Relative/absolute tolerance passed to the evolver.
    pub tol_perturb_integration: f64,
    /// `aH/κ′` target used to bisect `τ_ini` when CMB sources are wanted.
    pub start_sources_at_tau_c_over_tau_h: f64,
    /// Base integrator step-size multiplier, §3 "Time grid".
    pub tau_stepsize: f64,

    /// `k_min_tau0` knob of §4.P.1.
    pub k_min_tau0: f64,
    /// Super-horizon step coefficient.
    pub k_step_super: f64,
    /// Sub-horizon step coefficient.
    pub k_step_sub: f64,
    /// Width of the super-to-sub transition in units of `k_rec`.
    pub k_step_transition: f64,
    /// Suppresses the step size by this factor deep inside the horizon.
    pub k_super_reduction: f64,
    /// Center of the BAO log-spacing crossover in units of `k_rec`.
    pub k_bao_center: f64,
    /// Width of the BAO log-spacing crossover.
    pub k_bao_width: f64,
    /// Number of `k` values per decade for the matter power spectrum.
    pub k_per_decade_pk: f64,
    /// Number of `k` values per decade in the BAO region.
    pub k_per_decade_bao: f64,
    /// Closed-universe flat-approximation threshold on `ν`.
    pub hyper_flat_approximation_nu: f64,

    /// ℓ-grid logarithmic step coefficient.
    pub l_logstep: f64,
    /// ℓ-grid linear step.
    pub l_linstep: u32,
    /// Exponent rescaling the logarithmic ℓ step.
    pub l_rescaling: f64,
    /// Maximum ℓ for CMB temperature/polarization sources.
    pub l_max_scalars: u32,
    /// Maximum ℓ for tensor sources.
    pub l_max_tensors: u32,
    /// Maximum ℓ for vector sources.
    pub l_max_vectors: u32,

    /// Use the PPF fluid scheme rather than explicit `(δ,θ)` for dark
    /// energy when [`FldParameterization::Ppf`] is selected.
    ///
    /// [`FldParameterization::Ppf`]: crate::species::FldParameterization::Ppf
    pub use_ppf: bool,
    /// PPF sound-speed knob `c_γ/c_fld`.
    pub c_gamma_over_c_fld: f64,
    /// PPF knob bounding `c_γ k²/H²`.
    pub c_gamma_k_h_square_max: f64,

    /// `q_max` above which Limber is always used, §4.T.3.
    pub q_max_bessel: f64,
    /// ℓ/`z_mean` threshold for switching to Limber for local number-count
    /// sources.
    pub l_switch_limber_for_nc_local_over_z: f64,
    /// As above, for line-of-sight-integrated number-count sources.
    pub l_switch_limber_for_nc_los_over_z: f64,
    /// ℓ above which the CMB lensing potential switches to Limber.
    pub l_switch_limber_for_cmb_lensing: u32,
}

impl Default for Precision {
    fn default() -> Self {
        Self {
            gauge: Gauge::Synchronous,
            scalars: true,
            vectors: false,
            tensors: false,

            ic_ad: true,
            ic_bi: false,
            ic_cdi: false,
            ic_nid: false,
            ic_niv: false,

            z_max_pk: 0.0,
            selection_bins: Vec::new(),
            tensor_method: TensorMethod::Exact,

            tca_scheme: TcaScheme::Class2nd,
            rsa_scheme: RsaScheme::Md,
            ufa_scheme: UfaScheme::Class,
            ncdmfa_scheme: NcdmfaScheme::Class,
            evolver: EvolverKind::Ndf15,

            tca_trigger_tau_c_over_tau_h: 1e-2,
            tca_trigger_tau_c_over_tau_k: 1e-2,
            rsa_trigger: 40.0,
            ufa_trigger: 30.0,

            tol_perturb_integration: 1e-6,
            start_sources_at_tau_c_over_tau_h: 4e-2,
            tau_stepsize: 0.3,

            k_min_tau0: 0.1,
            k_step_super: 0.05,
            k_step_sub: 0.08,
            k_step_transition: 0.2,
            k_super_reduction: 1e2,
            k_bao_center: 2.25,
            k_bao_width: 0.2,
            k_per_decade_pk: 10.0,
            k_per_decade_bao: 70.0,
            hyper_flat_approximation_nu: 1.0e4,

            l_logstep: 1.12,
            l_linstep: 40,
            l_rescaling: 1.0,
            l_max_scalars: 2500,
            l_max_tensors: 600,
            l_max_vectors: 600,

            use_ppf: true,
            c_gamma_over_c_fld: 0.1,
            c_gamma_k_h_square_max: 1e10,

            q_max_bessel: 1.0e6,
            l_switch_limber_for_nc_local_over_z: 100.0,
            l_switch_limber_for_nc_los_over_z: 30.0,
            l_switch_limber_for_cmb_lensing: 400,
        }
    }
}

impl Precision {
    /// Validates the fatal configuration errors of §7 that do not require
    /// access to the background/thermodynamics tables: `ℓ_max < 4` when a
    /// hierarchy is needed, gauge=synchronous without CDM, an evolver flag
    /// out of range (covered by the type system here), `z_max_pk` set while
    /// requesting CMB sources past recombination, and nonsensical ranges.
    pub fn validate(&self, species: &SpeciesList) -> Result<()> {
        if !(self.scalars || self.vectors || self.tensors) {
            return Err(Error::Configuration(
                "at least one of scalars/vectors/tensors must be enabled".to_string(),
            ));
        }
        if matches!(self.gauge, Gauge::Synchronous) && !species.has_cdm() {
            return Err(Error::Configuration(
                "synchronous gauge requires a cdm species to fix the residual gauge freedom"
                    .to_string(),
            ));
        }
        for s in species.iter() {
            use crate::species::SpeciesEnum;
            let l_max = match s {
                SpeciesEnum::Photons(p) => Some(p.l_max),
                SpeciesEnum::UltraRelativisticNeutrinos(u) => Some(u.l_max),
                SpeciesEnum::InteractingDarkRadiation(i) => Some(i.l_max),
                SpeciesEnum::DecayRadiation(d) => Some(d.l_max),
                SpeciesEnum::Ncdm(n) => Some(n.l_max),
                _ => None,
            };
            if let Some(l_max) = l_max {
                if l_max < 4 {
                    return Err(Error::Configuration(format!(
                        "l_max={l_max} too small for hierarchy species {}; need >= 4",
                        s.name()
                    )));
                }
            }
            if matches!(s, SpeciesEnum::InteractingDarkMatter(_))
                && !species.iter().any(|o| matches!(o, SpeciesEnum::InteractingDarkRadiation(_)))
            {
                return Err(Error::Configuration(
                    "idm-dr requires a matching idr species to couple to".to_string(),
                ));
            }
        }
        if self.z_max_pk < 0.0 {
            return Err(Error::Configuration(
                "z_max_pk must be non-negative".to_string(),
            ));
        }
        if self.k_min_tau0 <= 0.0 {
            return Err(Error::Configuration(
                "k_min_tau0 must be positive".to_string(),
            ));
        }
        if self.hyper_flat_approximation_nu <= 3.0 {
            return Err(Error::Configuration(
                "hyper_flat_approximation_nu must exceed the integer-nu threshold of 3"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::species::{Cdm, Photons, SpeciesEnum};

    #[test]
    fn default_precision_validates_with_photons_and_cdm() {
        let species = SpeciesList(vec![
            SpeciesEnum::Photons(Photons {
                l_max: 8,
                l_max_pol: 6,
            }),
            SpeciesEnum::Cdm(Cdm),
        ]);
        Precision::default().validate(&species).unwrap();
    }

    #[test]
    fn synchronous_without_cdm_is_rejected() {
        let species = SpeciesList(vec![SpeciesEnum::Photons(Photons {
            l_max: 8,
            l_max_pol: 6,
        })]);
        let err = Precision::default().validate(&species).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn small_l_max_is_rejected() {
        let species = SpeciesList(vec![
            SpeciesEnum::Photons(Photons {
                l_max: 2,
                l_max_pol: 6,
            }),
            SpeciesEnum::Cdm(Cdm),
        ]);
        let err = Precision::default().validate(&species).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn idm_dr_without_idr_partner_is_rejected() {
        use crate::species::InteractingDarkMatter;
        let species = SpeciesList(vec![
            SpeciesEnum::Photons(Photons {
                l_max: 8,
                l_max_pol: 6,
            }),
            SpeciesEnum::Cdm(Cdm),
            SpeciesEnum::InteractingDarkMatter(InteractingDarkMatter {
                coupling_strength: 1e3,
                temperature_index: 4.0,
            }),
        ]);
        let err = Precision::default().validate(&species).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn idm_dr_with_idr_partner_validates() {
        use crate::species::{InteractingDarkMatter, InteractingDarkRadiation};
        let species = SpeciesList(vec![
            SpeciesEnum::Photons(Photons {
                l_max: 8,
                l_max_pol: 6,
            }),
            SpeciesEnum::Cdm(Cdm),
            SpeciesEnum::InteractingDarkMatter(InteractingDarkMatter {
                coupling_strength: 1e3,
                temperature_index: 4.0,
            }),
            SpeciesEnum::InteractingDarkRadiation(InteractingDarkRadiation { l_max: 6 }),
        ]);
        Precision::default().validate(&species).unwrap();
    }
}
