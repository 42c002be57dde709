//! Species polymorphism.
//!
//! Mirrors the `Subgrid`/`SubgridEnum` pattern used throughout the teacher
//! crate's grid module: a small capability trait implemented by one payload
//! struct per species, dispatched through a tagged enum via
//! `enum_dispatch` rather than virtual inheritance (§9 Design Notes).
//! [`crate::derivs`] folds the stress-energy contribution of every active
//! species by iterating a `Vec<SpeciesEnum>` — a fold over the species
//! list, not a visitor hierarchy.

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

/// Capability set each species advertises, §3 `Species`.
#[enum_dispatch]
pub trait SpeciesCapabilities {
    /// Short, stable name used in diagnostics and source-table labels.
    fn name(&self) -> &'static str;

    /// Carries a density perturbation `δ`.
    fn has_density(&self) -> bool;

    /// Carries a velocity divergence `θ`.
    fn has_velocity(&self) -> bool;

    /// Carries an anisotropic-stress (shear) perturbation `σ`.
    fn has_shear(&self) -> bool;

    /// Carries a full Boltzmann multipole hierarchy rather than a fluid
    /// truncation.
    fn has_hierarchy(&self) -> bool;

    /// Can decay into a daughter species (sources a [`DecayRadiation`]).
    fn can_decay(&self) -> bool {
        false
    }

    /// Interacts non-gravitationally with another species in the dark
    /// sector (idm-dr pair).
    fn is_interacting(&self) -> bool {
        false
    }
}

/// Photons (`γ`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Photons {
    /// Maximum photon temperature multipole, `ℓ_max,γ`.
    pub l_max: usize,
    /// Maximum photon polarization multipole, `ℓ_max,γ,pol`.
    pub l_max_pol: usize,
}

impl SpeciesCapabilities for Photons {
    fn name(&self) -> &'static str {
        "g"
    }
    fn has_density(&self) -> bool {
        true
    }
    fn has_velocity(&self) -> bool {
        true
    }
    fn has_shear(&self) -> bool {
        true
    }
    fn has_hierarchy(&self) -> bool {
        true
    }
}

/// Baryons (`b`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Baryons {
    /// Whether the perturbed-recombination pair `(δT_b, δχ)` is carried.
    pub perturbed_recombination: bool,
}

impl SpeciesCapabilities for Baryons {
    fn name(&self) -> &'static str {
        "b"
    }
    fn has_density(&self) -> bool {
        true
    }
    fn has_velocity(&self) -> bool {
        true
    }
    fn has_shear(&self) -> bool {
        false
    }
    fn has_hierarchy(&self) -> bool {
        false
    }
}

/// Cold dark matter (`cdm`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Cdm;

impl SpeciesCapabilities for Cdm {
    fn name(&self) -> &'static str {
        "cdm"
    }
    fn has_density(&self) -> bool {
        true
    }
    fn has_velocity(&self) -> bool {
        // only integrated in newtonian gauge; synchronous sets theta_cdm = 0
        // by gauge choice rather than by omitting the capability.
        true
    }
    fn has_shear(&self) -> bool {
        false
    }
    fn has_hierarchy(&self) -> bool {
        false
    }
}

/// Ultra-relativistic neutrinos (`ur`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UltraRelativisticNeutrinos {
    /// Maximum multipole of the free-streaming hierarchy.
    pub l_max: usize,
}

impl SpeciesCapabilities for UltraRelativisticNeutrinos {
    fn name(&self) -> &'static str {
        "ur"
    }
    fn has_density(&self) -> bool {
        true
    }
    fn has_velocity(&self) -> bool {
        true
    }
    fn has_shear(&self) -> bool {
        true
    }
    fn has_hierarchy(&self) -> bool {
        true
    }
}

/// Interacting dark radiation (`idr`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InteractingDarkRadiation {
    /// Maximum multipole of the hierarchy.
    pub l_max: usize,
}

impl SpeciesCapabilities for InteractingDarkRadiation {
    fn name(&self) -> &'static str {
        "idr"
    }
    fn has_density(&self) -> bool {
        true
    }
    fn has_velocity(&self) -> bool {
        true
    }
    fn has_shear(&self) -> bool {
        true
    }
    fn has_hierarchy(&self) -> bool {
        true
    }
    fn is_interacting(&self) -> bool {
        true
    }
}

/// Interacting dark matter (`idm-dr`), the scattering partner of
/// [`InteractingDarkRadiation`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InteractingDarkMatter {
    /// Dark opacity amplitude Γ₀ (Mpc⁻¹), the idm-dr analog of Thomson
    /// `κ′`: `κ′_idm_dr(z) = Γ₀·(1+z)^n`.
    pub coupling_strength: f64,
    /// Power-law index `n` of the (1+z) scaling.
    pub temperature_index: f64,
}

impl InteractingDarkMatter {
    /// `κ′_idm_dr(z) = Γ₀·(1+z)^n`, the dark-sector analog of the Thomson
    /// opacity used to drive TCA_idm_dr/RSA_idr's triggers.
    #[must_use]
    pub fn kappa_prime(&self, z: f64) -> f64 {
        self.coupling_strength * (1.0 + z).powf(self.temperature_index)
    }
}

impl SpeciesCapabilities for InteractingDarkMatter {
    fn name(&self) -> &'static str {
        "idm_dr"
    }
    fn has_density(&self) -> bool {
        true
    }
    fn has_velocity(&self) -> bool {
        true
    }
    fn has_shear(&self) -> bool {
        false
    }
    fn has_hierarchy(&self) -> bool {
        false
    }
    fn is_interacting(&self) -> bool {
        true
    }
}

/// Decaying cold dark matter (`dcdm`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Dcdm {
    /// Decay rate `Γ_dcdm` in units of inverse conformal time at `a=1`.
    pub decay_rate: f64,
}

impl SpeciesCapabilities for Dcdm {
    fn name(&self) -> &'static str {
        "dcdm"
    }
    fn has_density(&self) -> bool {
        true
    }
    fn has_velocity(&self) -> bool {
        true
    }
    fn has_shear(&self) -> bool {
        false
    }
    fn has_hierarchy(&self) -> bool {
        false
    }
    fn can_decay(&self) -> bool {
        true
    }
}

/// Decay radiation (`dr`), possibly sourced by several parents; each
/// instance names the index of its parent in the species list so the
/// scattering-kernel sum in [`crate::derivs`] can be maintained in parallel
/// with the per-species contributions, §4.P.4.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DecayRadiation {
    /// Maximum multipole of the hierarchy.
    pub l_max: usize,
    /// Index into the species list of the decaying parent sourcing this
    /// radiation bath.
    pub parent_index: usize,
}

impl SpeciesCapabilities for DecayRadiation {
    fn name(&self) -> &'static str {
        "dr"
    }
    fn has_density(&self) -> bool {
        true
    }
    fn has_velocity(&self) -> bool {
        true
    }
    fn has_shear(&self) -> bool {
        true
    }
    fn has_hierarchy(&self) -> bool {
        true
    }
}

/// Whether an [`Ncdm`] species decays into dark radiation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum NcdmSubtype {
    /// Stable, only gravitationally coupled.
    Standard,
    /// Decays into a [`DecayRadiation`] bath.
    DecayingToDr,
}

/// Non-cold dark matter (`ncdm`) with a momentum-grid Boltzmann hierarchy.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Ncdm {
    /// [`NcdmSubtype::Standard`] or [`NcdmSubtype::DecayingToDr`].
    pub subtype: NcdmSubtype,
    /// Mass in eV.
    pub mass_ev: f64,
    /// Degeneracy factor.
    pub degeneracy: f64,
    /// Number of momentum quadrature bins `q`.
    pub momentum_bins: usize,
    /// Maximum multipole `ℓ_max,ncdm` of the hierarchy per momentum bin, used
    /// when the ncdm-fluid approximation is off (§3 `IntegrationVector`).
    pub l_max: usize,
    /// Index of the decay-radiation species sourced by this species, if
    /// [`Self::subtype`] is [`NcdmSubtype::DecayingToDr`].
    pub dr_index: Option<usize>,
}

impl SpeciesCapabilities for Ncdm {
    fn name(&self) -> &'static str {
        "ncdm"
    }
    fn has_density(&self) -> bool {
        true
    }
    fn has_velocity(&self) -> bool {
        true
    }
    fn has_shear(&self) -> bool {
        true
    }
    fn has_hierarchy(&self) -> bool {
        true
    }
    fn can_decay(&self) -> bool {
        matches!(self.subtype, NcdmSubtype::DecayingToDr)
    }
}

/// Parameterization used by [`Fld`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FldParameterization {
    /// Explicit `(δ, θ)` evolution.
    Explicit,
    /// Parameterized post-Friedmann `Γ_fld` evolution (§6 `use_ppf`).
    Ppf,
}

/// Fluid dark energy (`fld`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Fld {
    /// Which of the two parameterizations is active.
    pub parameterization: FldParameterization,
}

impl SpeciesCapabilities for Fld {
    fn name(&self) -> &'static str {
        "fld"
    }
    fn has_density(&self) -> bool {
        matches!(self.parameterization, FldParameterization::Explicit)
    }
    fn has_velocity(&self) -> bool {
        matches!(self.parameterization, FldParameterization::Explicit)
    }
    fn has_shear(&self) -> bool {
        false
    }
    fn has_hierarchy(&self) -> bool {
        false
    }
}

/// Scalar field dark energy (`scf`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Scf;

impl SpeciesCapabilities for Scf {
    fn name(&self) -> &'static str {
        "scf"
    }
    fn has_density(&self) -> bool {
        true
    }
    fn has_velocity(&self) -> bool {
        false
    }
    fn has_shear(&self) -> bool {
        false
    }
    fn has_hierarchy(&self) -> bool {
        false
    }
}

/// Tagged union over every species variant, dispatched through
/// [`SpeciesCapabilities`].
///
/// WARNING: never change the order of existing variants, only add to the
/// end — indices into a configured species list are stable across a run and
/// are used to label `S[...]` rows.
#[enum_dispatch(SpeciesCapabilities)]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum SpeciesEnum {
    /// See [`Photons`].
    Photons,
    /// See [`Baryons`].
    Baryons,
    /// See [`Cdm`].
    Cdm,
    /// See [`UltraRelativisticNeutrinos`].
    UltraRelativisticNeutrinos,
    /// See [`InteractingDarkRadiation`].
    InteractingDarkRadiation,
    /// See [`InteractingDarkMatter`].
    InteractingDarkMatter,
    /// See [`Dcdm`].
    Dcdm,
    /// See [`DecayRadiation`].
    DecayRadiation,
    /// See [`Ncdm`].
    Ncdm,
    /// See [`Fld`].
    Fld,
    /// See [`Scf`].
    Scf,
}

/// An ordered, named list of active species for one run.
///
/// The stress-energy summation (§4.P.4 `perturb_total_stress_energy`) is a
/// fold over this list, not a dispatch over a type hierarchy.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SpeciesList(pub Vec<SpeciesEnum>);

impl SpeciesList {
    /// Returns true if any configured species requires CDM for the
    /// requested gauge to have a well-posed synchronous-gauge residual
    /// gauge freedom, §7 "gauge=synchronous with no CDM".
    #[must_use]
    pub fn has_cdm(&self) -> bool {
        self.0.iter().any(|s| matches!(s, SpeciesEnum::Cdm(_)))
    }

    /// Iterate the species list together with their capabilities.
    pub fn iter(&self) -> impl Iterator<Item = &SpeciesEnum> {
        self.0.iter()
    }

    /// Total number of configured species.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn photons_carry_full_hierarchy() {
        let g = Photons {
            l_max: 8,
            l_max_pol: 6,
        };
        assert!(g.has_density());
        assert!(g.has_velocity());
        assert!(g.has_shear());
        assert!(g.has_hierarchy());
        assert!(!g.can_decay());
    }

    #[test]
    fn dcdm_can_decay_fld_cannot() {
        let d = Dcdm { decay_rate: 0.01 };
        assert!(d.can_decay());
        let f = Fld {
            parameterization: FldParameterization::Ppf,
        };
        assert!(!f.can_decay());
        assert!(!f.has_density());
    }

    #[test]
    fn ncdm_decay_flag_follows_subtype() {
        let stable = Ncdm {
            subtype: NcdmSubtype::Standard,
            mass_ev: 0.06,
            degeneracy: 1.0,
            momentum_bins: 5,
            l_max: 17,
            dr_index: None,
        };
        assert!(!stable.can_decay());

        let decaying = Ncdm {
            subtype: NcdmSubtype::DecayingToDr,
            dr_index: Some(0),
            ..stable
        };
        assert!(decaying.can_decay());
    }

    #[test]
    fn species_list_detects_missing_cdm() {
        let list = SpeciesList(vec![SpeciesEnum::Photons(Photons {
            l_max: 8,
            l_max_pol: 6,
        })]);
        assert!(!list.has_cdm());
        let mut v = list.0;
        v.push(SpeciesEnum::Cdm(Cdm));
        assert!(SpeciesList(v).has_cdm());
    }
}
