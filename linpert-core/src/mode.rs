//! Mode, initial condition and gauge enumerations.
//!
//! These three small enums gate almost every other decision in the engine:
//! which hierarchies [`species`] exposes, which metric variables
//! [`vector::IntegrationVector`] carries, and the spin of the radial
//! functions [`crate::transfer::radial`] evaluates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Perturbation mode. Determines which sources exist, which hierarchies are
/// integrated, and the spin of the radial functions used in the transfer
/// stage.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Mode {
    /// Scalar perturbations: density, velocity and shear sources.
    Scalar,
    /// Vector perturbations: vorticity sources, decay in an expanding
    /// background absent a source.
    Vector,
    /// Tensor perturbations: gravitational-wave sources.
    Tensor,
}

impl Mode {
    /// The integer `m` in `q² = k² + K(1+m)`, §4.T.1.
    #[must_use]
    pub const fn curvature_shift(self) -> u32 {
        match self {
            Self::Scalar => 0,
            Self::Vector => 1,
            Self::Tensor => 2,
        }
    }

    /// Whether this mode supports more than one [`InitialCondition`].
    #[must_use]
    pub const fn has_multiple_ics(self) -> bool {
        matches!(self, Self::Scalar)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scalar => "scalar",
            Self::Vector => "vector",
            Self::Tensor => "tensor",
        })
    }
}

/// Initial-condition label. Determines the analytic small-`kτ` expansion
/// used to populate the integration vector at `τ_ini`, §4.P.5.
///
/// Only [`Self::Adiabatic`] is defined for [`Mode::Vector`] and
/// [`Mode::Tensor`]; those modes are represented by a single conceptual
/// "tensor" IC, modelled here by reusing `Adiabatic` since the expansion
/// coefficients differ only by the mode-specific coefficients already
/// threaded through [`crate::initial_conditions`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum InitialCondition {
    /// Adiabatic: a single curvature perturbation sourcing all species
    /// coherently.
    Adiabatic,
    /// Baryon isocurvature.
    BaryonIso,
    /// CDM isocurvature.
    CdmIso,
    /// Neutrino density isocurvature.
    NeutrinoDensityIso,
    /// Neutrino velocity isocurvature.
    NeutrinoVelocityIso,
}

impl InitialCondition {
    /// All five scalar initial conditions, in the canonical order used to
    /// index `S[mode][ic][...]`.
    pub const ALL_SCALAR: [Self; 5] = [
        Self::Adiabatic,
        Self::BaryonIso,
        Self::CdmIso,
        Self::NeutrinoDensityIso,
        Self::NeutrinoVelocityIso,
    ];

    /// Only adiabatic initial conditions are consistent with interacting
    /// dark matter / dark radiation, §4.P.5.
    #[must_use]
    pub const fn consistent_with_idm_dr(self) -> bool {
        matches!(self, Self::Adiabatic)
    }
}

impl fmt::Display for InitialCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Adiabatic => "ad",
            Self::BaryonIso => "bi",
            Self::CdmIso => "cdi",
            Self::NeutrinoDensityIso => "nid",
            Self::NeutrinoVelocityIso => "niv",
        })
    }
}

/// Metric gauge. Changes which metric variables are integrated and which
/// are algebraic, §3 `IntegrationVector`, §4.P.4.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Gauge {
    /// Synchronous gauge: integrates `(h, η)`, leaves `ψ`/`ϕ` out of the
    /// vector.
    Synchronous,
    /// Newtonian (longitudinal) gauge: integrates `ϕ` directly, `ψ` is
    /// algebraic.
    Newtonian,
}

impl fmt::Display for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Synchronous => "synchronous",
            Self::Newtonian => "newtonian",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curvature_shift_matches_spin() {
        assert_eq!(Mode::Scalar.curvature_shift(), 0);
        assert_eq!(Mode::Vector.curvature_shift(), 1);
        assert_eq!(Mode::Tensor.curvature_shift(), 2);
    }

    #[test]
    fn only_adiabatic_is_idm_dr_consistent() {
        for ic in InitialCondition::ALL_SCALAR {
            assert_eq!(
                ic.consistent_with_idm_dr(),
                matches!(ic, InitialCondition::Adiabatic)
            );
        }
    }
}
