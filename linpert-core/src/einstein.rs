//! Einstein closure equations, §4.P.3 "metric potentials are solved
//! algebraically from the species stress-energy sums, never propagated as
//! independent degrees of freedom beyond the one gauge-dependent potential
//! each gauge keeps as a dof".
//!
//! Units: `4πG = 1` throughout this module, the convention under which the
//! species `ρ`/`p` values returned by [`crate::background::BackgroundTable`]
//! already carry the right normalization to appear bare in these equations.
//! This is a resolved Open Question (see `DESIGN.md`); a production
//! background table would instead carry `G` explicitly.

/// The aggregated, `a²`-weighted stress-energy moments the closure needs:
/// `Σδρ_i`, `Σ(ρ_i+p_i)θ_i`, `Σ(ρ_i+p_i)σ_i`, each already multiplied by
/// `a²` so this module never has to know about the scale factor directly.
#[derive(Clone, Copy, Debug, Default)]
pub struct StressEnergySums {
    /// `a² Σ δρ_i`.
    pub delta_rho_a2: f64,
    /// `a² Σ (ρ_i+p_i) θ_i`.
    pub theta_rho_plus_p_a2: f64,
    /// `a² Σ (ρ_i+p_i) σ_i`.
    pub sigma_rho_plus_p_a2: f64,
}

impl StressEnergySums {
    /// Accumulates one species' contribution, already `a²`-weighted by the
    /// caller.
    pub fn add(&mut self, delta_rho_a2: f64, theta_rho_plus_p_a2: f64, sigma_rho_plus_p_a2: f64) {
        self.delta_rho_a2 += delta_rho_a2;
        self.theta_rho_plus_p_a2 += theta_rho_plus_p_a2;
        self.sigma_rho_plus_p_a2 += sigma_rho_plus_p_a2;
    }
}

/// The curvature-corrected eigenvalue `k²` scalar harmonics solve the wave
/// equation with, §4.P.1: flat space leaves `k²` untouched, closed/open
/// space shift it by `3K`.
#[must_use]
pub fn k2_eff(k: f64, curvature: f64) -> f64 {
    k * k - 3.0 * curvature
}

/// Synchronous-gauge metric quantities of Ma & Bertschinger (1995) eq.
/// (21)-(22): `η′` is propagated as the one metric degree of freedom in
/// [`crate::vector::VectorLayout::build_scalar`] (`metric_eta`); `h′` is
/// solved algebraically at every τ from the 00 Einstein equation and never
/// itself propagated.
#[derive(Clone, Copy, Debug, Default)]
pub struct SynchronousMetric {
    /// `η′`.
    pub eta_prime: f64,
    /// `h′`, algebraic.
    pub h_prime: f64,
    /// `α = (h′ + 6η′) / (2k²)`, the shear potential used by the
    /// anisotropic-stress closure of higher multipoles.
    pub alpha: f64,
}

/// Solves the synchronous-gauge closure at a given τ.
#[must_use]
pub fn synchronous_closure(
    k: f64,
    curvature: f64,
    a_h: f64,
    eta: f64,
    sums: &StressEnergySums,
) -> SynchronousMetric {
    let k2 = k2_eff(k, curvature);
    let eta_prime = sums.theta_rho_plus_p_a2 / k2;
    let h_prime = (2.0 * k2 * eta + sums.delta_rho_a2) / a_h;
    let alpha = (h_prime + 6.0 * eta_prime) / (2.0 * k2);
    SynchronousMetric {
        eta_prime,
        h_prime,
        alpha,
    }
}

/// Newtonian-gauge metric potentials, §4.P.3. `φ` is the one propagated
/// metric degree of freedom (`metric_phi`); `ψ` is solved algebraically
/// from the anisotropic-stress Einstein equation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NewtonianMetric {
    /// `φ′`.
    pub phi_prime: f64,
    /// `ψ`, algebraic.
    pub psi: f64,
}

/// Solves the Newtonian-gauge closure at a given τ.
#[must_use]
pub fn newtonian_closure(
    k: f64,
    curvature: f64,
    a_h: f64,
    phi: f64,
    sums: &StressEnergySums,
) -> NewtonianMetric {
    let k2 = k2_eff(k, curvature);
    let psi = -phi - sums.sigma_rho_plus_p_a2 / k2;
    let phi_prime = a_h * psi + sums.theta_rho_plus_p_a2 / k2;
    NewtonianMetric { phi_prime, psi }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn k2_eff_reduces_to_k2_when_flat() {
        assert!((k2_eff(0.1, 0.0) - 0.01).abs() < 1e-15);
    }

    #[test]
    fn synchronous_closure_zero_sources_gives_zero_h_prime_offset() {
        let sums = StressEnergySums::default();
        let m = synchronous_closure(0.1, 0.0, 1.0, 0.5, &sums);
        assert!((m.eta_prime).abs() < 1e-15);
        assert!((m.h_prime - (2.0 * 0.01 * 0.5)).abs() < 1e-12);
    }

    #[test]
    fn newtonian_closure_with_no_shear_sets_psi_to_minus_phi() {
        let sums = StressEnergySums::default();
        let m = newtonian_closure(0.1, 0.0, 1.0, 0.3, &sums);
        assert!((m.psi + 0.3).abs() < 1e-15);
    }
}
