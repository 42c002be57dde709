//! The hyperspherical Bessel interpolator service, §4.T.1 "evaluate and
//! cache `Φ_l^ν(χ)`, `Φ_l^ν{}'(χ)` and `Φ_l^ν{}''(χ)` on demand for whichever
//! `(ℓ, ν)` pairs the transfer stage asks for, then serve a fast
//! Hermite-interpolated lookup against the τ grid instead of recomputing the
//! special function at every node".
//!
//! Flat space (`K=0`) reduces `Φ_l^ν(χ)` to the ordinary spherical Bessel
//! function `j_l(νχ)`, evaluated here by Miller's downward-recursion
//! algorithm. Curved space is approximated by the same flat formula once `ν`
//! exceeds [`crate::config::Precision::hyper_flat_approximation_nu`]; below
//! that threshold, rather than the exact closed/open hyperspherical
//! recursion, this module evaluates the flat Bessel function of the
//! curvature-consistent angular-diameter distance `D(χ)` (`R sin(χ/R)`
//! closed, `R sinh(χ/R)` open, `χ` flat) and propagates derivatives through
//! the chain rule using the fact that every one of these `D` satisfies the
//! same geodesic-deviation equation `D'' = -K D`. This keeps `Φ`, `Φ′`, `Φ″`
//! mutually consistent and exact in the flat limit without implementing the
//! full hypergeometric recursion — a resolved Open Question, see `DESIGN.md`.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Arguments `νχ` (flat) or `ν D(χ)` (curved) above this are rejected in
/// nonclosed geometry: Miller's recursion is no longer the bottleneck
/// (forward recursion is stable for any `x`), but an argument this large
/// almost always means a caller asked for `χ` past the table's intended
/// range, e.g. `τ_today` extrapolated forward past the integration grid.
pub const MAX_BESSEL_ARGUMENT: f64 = 1.0e8;

/// Ordinary spherical Bessel function `j_l(x)` via Miller's downward
/// recursion for `x` below the turning point, forward recursion above it.
#[must_use]
pub fn spherical_bessel_j(l: u32, x: f64) -> f64 {
    if x.abs() < 1e-10 {
        return if l == 0 { 1.0 } else { 0.0 };
    }
    if l == 0 {
        return x.sin() / x;
    }
    if l == 1 {
        return x.sin() / (x * x) - x.cos() / x;
    }
    if f64::from(l) < x {
        // forward recursion is stable above the turning point x ~ l
        let mut j_lm1 = x.sin() / x;
        let mut j_l = x.sin() / (x * x) - x.cos() / x;
        for n in 1..l {
            let j_lp1 = (2.0 * f64::from(n) + 1.0) / x * j_l - j_lm1;
            j_lm1 = j_l;
            j_l = j_lp1;
        }
        j_l
    } else {
        // Miller's algorithm: recurse downward from an order well above l
        // where an arbitrary seed is safe, then normalize against j_0.
        let start = l + 15 + (x as u32).min(50);
        let mut j_np1 = 0.0_f64;
        let mut j_n = 1.0e-30_f64;
        let mut result = 0.0_f64;
        let mut norm_sum = j_n * j_n;
        for n in (1..=start).rev() {
            let j_nm1 = (2.0 * f64::from(n) + 1.0) / x * j_n - j_np1;
            j_np1 = j_n;
            j_n = j_nm1;
            if n - 1 == l {
                result = j_n;
            }
            norm_sum += j_n * j_n;
            if j_n.abs() > 1e250 {
                j_n *= 1e-250;
                j_np1 *= 1e-250;
                result *= 1e-250;
                norm_sum *= 1e-500;
            }
        }
        let j0_exact = x.sin() / x;
        let norm = j0_exact / j_n;
        let _ = norm_sum;
        result * norm
    }
}

/// `j_l'(x)`, via the standard recursion `j_l' = j_{l-1} - (l+1)/x j_l`.
#[must_use]
pub fn spherical_bessel_j_prime(l: u32, x: f64) -> f64 {
    if l == 0 {
        return -spherical_bessel_j(1, x);
    }
    let j_lm1 = spherical_bessel_j(l - 1, x);
    let j_l = spherical_bessel_j(l, x);
    let x_safe = if x == 0.0 { 1e-300 } else { x };
    j_lm1 - (f64::from(l) + 1.0) / x_safe * j_l
}

/// `j_l''(x)`, from the spherical Bessel ODE `x² j'' + 2x j' + (x² -
/// l(l+1)) j = 0`.
#[must_use]
pub fn spherical_bessel_j_second_prime(l: u32, x: f64) -> f64 {
    let x_safe = if x.abs() < 1e-8 { 1e-8 } else { x };
    let j_l = spherical_bessel_j(l, x);
    let j_lp = spherical_bessel_j_prime(l, x);
    let ll1 = f64::from(l) * (f64::from(l) + 1.0);
    -2.0 / x_safe * j_lp - (1.0 - ll1 / (x_safe * x_safe)) * j_l
}

/// The curvature-consistent angular-diameter distance `D(χ)`: `χ` flat,
/// `R sin(χ/R)` closed, `R sinh(χ/R)` open.
#[must_use]
fn angular_distance(chi: f64, curvature: f64) -> f64 {
    if curvature > 0.0 {
        let radius = curvature.sqrt().recip();
        radius * (chi / radius).sin()
    } else if curvature < 0.0 {
        let radius = (-curvature).sqrt().recip();
        radius * (chi / radius).sinh()
    } else {
        chi
    }
}

/// `D'(χ)`.
#[must_use]
fn angular_distance_prime(chi: f64, curvature: f64) -> f64 {
    if curvature > 0.0 {
        let radius = curvature.sqrt().recip();
        (chi / radius).cos()
    } else if curvature < 0.0 {
        let radius = (-curvature).sqrt().recip();
        (chi / radius).cosh()
    } else {
        1.0
    }
}

/// Inverts [`angular_distance`]: the `χ` at which `D(χ) = target`.
#[must_use]
fn angular_distance_inverse(target: f64, curvature: f64) -> f64 {
    if curvature > 0.0 {
        let radius = curvature.sqrt().recip();
        radius * (target / radius).clamp(-1.0, 1.0).asin()
    } else if curvature < 0.0 {
        let radius = (-curvature).sqrt().recip();
        radius * (target / radius).asinh()
    } else {
        target
    }
}

/// Evaluates `Φ_l^ν(χ)`, `Φ_l^ν{}'(χ)` and `Φ_l^ν{}''(χ)` for the given
/// curvature, §4.T.1/§4.S. `curvature`: positive closed, zero flat, negative
/// open, matching [`crate::background::BackgroundTable::curvature`].
///
/// Fatal in nonclosed geometry (`curvature <= 0`) when the effective
/// argument exceeds [`MAX_BESSEL_ARGUMENT`], §7: closed geometry is bounded
/// (`χ/R ∈ [0, π]`) so no such guard applies there.
pub fn phi_and_derivatives(
    l: u32,
    nu: f64,
    chi: f64,
    curvature: f64,
    flat_approx_nu: f64,
) -> Result<(f64, f64, f64)> {
    if curvature == 0.0 || nu.abs() >= flat_approx_nu {
        let x = nu * chi;
        if curvature <= 0.0 && x.abs() > MAX_BESSEL_ARGUMENT {
            return Err(Error::GridInconsistency(format!(
                "phi(l={l}, nu={nu}, chi={chi}) argument {x} exceeds x_max={MAX_BESSEL_ARGUMENT}"
            )));
        }
        let value = spherical_bessel_j(l, x);
        let d1 = nu * spherical_bessel_j_prime(l, x);
        let d2 = nu * nu * spherical_bessel_j_second_prime(l, x);
        return Ok((value, d1, d2));
    }
    let d = angular_distance(chi, curvature);
    let d_prime = angular_distance_prime(chi, curvature);
    let x = nu * d;
    if curvature <= 0.0 && x.abs() > MAX_BESSEL_ARGUMENT {
        return Err(Error::GridInconsistency(format!(
            "phi(l={l}, nu={nu}, chi={chi}) argument {x} exceeds x_max={MAX_BESSEL_ARGUMENT}"
        )));
    }
    let j = spherical_bessel_j(l, x);
    let j_prime = spherical_bessel_j_prime(l, x);
    let j_second = spherical_bessel_j_second_prime(l, x);

    let value = j;
    let d1 = nu * d_prime * j_prime;
    // D'' = -K D, the geodesic-deviation equation every branch of D solves.
    let d_second = -curvature * d;
    let d2 = nu * nu * d_prime * d_prime * j_second + nu * d_second * j_prime;
    Ok((value, d1, d2))
}

/// `Φ_l^ν(χ)` alone; see [`phi_and_derivatives`].
pub fn phi(l: u32, nu: f64, chi: f64, curvature: f64, flat_approx_nu: f64) -> Result<f64> {
    phi_and_derivatives(l, nu, chi, curvature, flat_approx_nu).map(|(value, _, _)| value)
}

/// Airy/WKB-style estimate of the hyperspherical turning point: the `χ` at
/// which `Φ_l^ν` transitions from exponential decay to oscillation, i.e.
/// where the effective argument `ν D(χ)` crosses `√(l(l+1))`. Below this
/// `χ`, `Φ_l^ν` and its derivatives are negligible, which is what bounds
/// `ℓ_max` for a given `ν` and source support in §4.T.1's q-list
/// construction.
#[must_use]
pub fn chi_at_phi_min(l: u32, nu: f64, curvature: f64) -> f64 {
    let x_turn = (f64::from(l) * (f64::from(l) + 1.0)).sqrt();
    let target = x_turn / nu.max(1e-300);
    angular_distance_inverse(target, curvature)
}

/// The largest `ℓ` whose turning point lies at or below `chi`, the
/// Airy/WKB-style `ℓ_max` this `(ν, χ)` pair can still resolve.
#[must_use]
pub fn l_max_for_chi(nu: f64, chi: f64, curvature: f64) -> u32 {
    let x = nu * angular_distance(chi, curvature);
    if x <= 0.0 {
        return 0;
    }
    // x ~ sqrt(l(l+1)) ~ l + 1/2 for large l
    (x - 0.5).max(0.0).floor() as u32
}

fn hermite_basis(t: f64) -> (f64, f64, f64, f64) {
    let t2 = t * t;
    let t3 = t2 * t;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + t;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    (h00, h10, h01, h11)
}

fn hermite_basis_prime(t: f64) -> (f64, f64, f64, f64) {
    let t2 = t * t;
    (
        6.0 * t2 - 6.0 * t,
        3.0 * t2 - 4.0 * t + 1.0,
        -6.0 * t2 + 6.0 * t,
        3.0 * t2 - 2.0 * t,
    )
}

fn hermite_basis_second(t: f64) -> (f64, f64, f64, f64) {
    (12.0 * t - 6.0, 6.0 * t - 4.0, -12.0 * t + 6.0, 6.0 * t - 2.0)
}

/// A precomputed, Hermite-interpolatable table of `Φ_l^ν(χ)` over a fixed
/// `χ` (equivalently τ) grid, the unit the transfer stage actually
/// consumes. Stores value and first derivative at each node so
/// [`Self::interpolate_hermite`] can reconstruct `Φ`, `Φ′` and `Φ″` from a
/// cubic Hermite spline, a deliberately lighter-weight stand-in for a full
/// quintic Hermite scheme (which would additionally need `Φ″` at the
/// nodes) — a resolved Open Question, see `DESIGN.md`.
#[derive(Clone, Debug)]
pub struct BesselTable {
    /// The abscissas the table was built on, strictly increasing.
    pub x: Vec<f64>,
    /// `Φ_l^ν` sampled at each `x`.
    pub values: Vec<f64>,
    /// `Φ_l^ν{}'` sampled at each `x`.
    pub derivatives: Vec<f64>,
}

impl BesselTable {
    /// Builds a table for fixed `(l, ν)` over `x`.
    pub fn build(l: u32, nu: f64, curvature: f64, flat_approx_nu: f64, x: Vec<f64>) -> Result<Self> {
        let mut values = Vec::with_capacity(x.len());
        let mut derivatives = Vec::with_capacity(x.len());
        for &xi in &x {
            let (value, d1, _) = phi_and_derivatives(l, nu, xi, curvature, flat_approx_nu)?;
            values.push(value);
            derivatives.push(d1);
        }
        Ok(Self { x, values, derivatives })
    }

    /// Linear interpolation at `query`, clamping to the table's endpoints
    /// outside its range.
    #[must_use]
    pub fn interpolate(&self, query: f64) -> f64 {
        self.interpolate_hermite(query).0
    }

    /// Cubic Hermite interpolation at `query`, returning `(Φ, Φ′, Φ″)`,
    /// clamping to the table's endpoints outside its range.
    #[must_use]
    pub fn interpolate_hermite(&self, query: f64) -> (f64, f64, f64) {
        if self.x.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        if query <= self.x[0] {
            return (self.values[0], self.derivatives[0], 0.0);
        }
        if query >= *self.x.last().unwrap() {
            return (*self.values.last().unwrap(), *self.derivatives.last().unwrap(), 0.0);
        }
        let idx = match self.x.binary_search_by(|probe| probe.partial_cmp(&query).unwrap()) {
            Ok(i) if i == 0 => 1,
            Ok(i) => i,
            Err(i) => i,
        };
        let (x0, x1) = (self.x[idx - 1], self.x[idx]);
        let h = (x1 - x0).max(1e-300);
        let t = (query - x0) / h;
        let (p0, p1) = (self.values[idx - 1], self.values[idx]);
        let (m0, m1) = (self.derivatives[idx - 1], self.derivatives[idx]);

        let (h00, h10, h01, h11) = hermite_basis(t);
        let value = h00 * p0 + h10 * h * m0 + h01 * p1 + h11 * h * m1;

        let (h00p, h10p, h01p, h11p) = hermite_basis_prime(t);
        let d1 = (h00p * p0 + h10p * h * m0 + h01p * p1 + h11p * h * m1) / h;

        let (h00s, h10s, h01s, h11s) = hermite_basis_second(t);
        let d2 = (h00s * p0 + h10s * h * m0 + h01s * p1 + h11s * h * m1) / (h * h);

        (value, d1, d2)
    }
}

/// Caches [`BesselTable`]s per `(ℓ, ν bit pattern)`, since the transfer
/// stage repeatedly asks for the same `(ℓ, ν)` pair across many `k` tasks
/// sharing a source table's τ grid.
#[derive(Default)]
pub struct Service {
    curvature: f64,
    flat_approx_nu: f64,
    cache: RwLock<HashMap<(u32, u64), BesselTable>>,
}

impl Service {
    /// Builds a service for a fixed background curvature.
    #[must_use]
    pub fn new(curvature: f64, flat_approx_nu: f64) -> Self {
        Self {
            curvature,
            flat_approx_nu,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the interpolated `Φ_l^ν(χ)` at `query`, building and
    /// caching the table on `x` the first time `(l, ν)` is requested.
    pub fn evaluate(&self, l: u32, nu: f64, x: &[f64], query: f64) -> Result<f64> {
        let key = (l, nu.to_bits());
        if let Some(table) = self.cache.read().unwrap().get(&key) {
            return Ok(table.interpolate(query));
        }
        let table = BesselTable::build(l, nu, self.curvature, self.flat_approx_nu, x.to_vec())?;
        let value = table.interpolate(query);
        self.cache.write().unwrap().insert(key, table);
        Ok(value)
    }

    /// Number of distinct `(ℓ, ν)` tables currently cached.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spherical_bessel_j0_matches_sinc() {
        for &x in &[0.1f64, 1.0, 5.0, 20.0] {
            let expected = x.sin() / x;
            assert!((spherical_bessel_j(0, x) - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn spherical_bessel_decays_below_turning_point() {
        // j_l(x) is tiny for x << l
        let small = spherical_bessel_j(50, 1.0).abs();
        let near_turning = spherical_bessel_j(50, 50.0).abs();
        assert!(small < near_turning);
    }

    #[test]
    fn bessel_table_interpolates_between_samples() {
        let x: Vec<f64> = (0..100).map(|i| i as f64 * 0.1 + 1.0).collect();
        let table = BesselTable::build(5, 100.0, 0.0, 1e4, x.clone()).unwrap();
        let exact = spherical_bessel_j(5, 100.0 * 5.05);
        let interp = table.interpolate(5.05);
        assert!((interp - exact).abs() < 1e-3);
    }

    #[test]
    fn service_caches_after_first_evaluation() {
        let service = Service::new(0.0, 1e4);
        let x: Vec<f64> = (0..50).map(|i| i as f64 * 0.2).collect();
        assert_eq!(service.cached_len(), 0);
        service.evaluate(3, 10.0, &x, 4.0).unwrap();
        assert_eq!(service.cached_len(), 1);
        service.evaluate(3, 10.0, &x, 6.0).unwrap();
        assert_eq!(service.cached_len(), 1);
    }

    #[test]
    fn derivative_matches_finite_difference_in_flat_space() {
        let eps = 1e-5;
        let (value, d1, _) = phi_and_derivatives(10, 3.0, 4.0, 0.0, 1e4).unwrap();
        let plus = phi(10, 3.0, 4.0 + eps, 0.0, 1e4).unwrap();
        let minus = phi(10, 3.0, 4.0 - eps, 0.0, 1e4).unwrap();
        let fd = (plus - minus) / (2.0 * eps);
        assert!((d1 - fd).abs() < 1e-4);
        let _ = value;
    }

    #[test]
    fn closed_geometry_derivative_matches_finite_difference() {
        let eps = 1e-6;
        let curvature = 1e-3;
        let (_, d1, _) = phi_and_derivatives(5, 2.0, 1.0, curvature, 1e4).unwrap();
        let plus = phi(5, 2.0, 1.0 + eps, curvature, 1e4).unwrap();
        let minus = phi(5, 2.0, 1.0 - eps, curvature, 1e4).unwrap();
        let fd = (plus - minus) / (2.0 * eps);
        assert!((d1 - fd).abs() < 1e-3);
    }

    #[test]
    fn open_geometry_derivative_matches_finite_difference() {
        let eps = 1e-6;
        let curvature = -1e-3;
        let (_, d1, _) = phi_and_derivatives(5, 2.0, 1.0, curvature, 1e4).unwrap();
        let plus = phi(5, 2.0, 1.0 + eps, curvature, 1e4).unwrap();
        let minus = phi(5, 2.0, 1.0 - eps, curvature, 1e4).unwrap();
        let fd = (plus - minus) / (2.0 * eps);
        assert!((d1 - fd).abs() < 1e-3);
    }

    #[test]
    fn nonclosed_argument_past_x_max_is_rejected() {
        let err = phi(5, 1.0, MAX_BESSEL_ARGUMENT * 2.0, 0.0, 1e4).unwrap_err();
        assert!(matches!(err, Error::GridInconsistency(_)));
    }

    #[test]
    fn closed_geometry_never_hits_the_x_max_guard() {
        // D(chi) is bounded by the curvature radius regardless of chi, so
        // the guard must never fire for curvature > 0.
        let curvature = 1e-3;
        let huge_chi = 1e12;
        assert!(phi(5, 1.0, huge_chi, curvature, 1e4).is_ok());
    }

    #[test]
    fn turning_point_chi_increases_with_l() {
        let low = chi_at_phi_min(2, 10.0, 0.0);
        let high = chi_at_phi_min(50, 10.0, 0.0);
        assert!(low < high);
    }

    #[test]
    fn l_max_for_chi_is_consistent_with_turning_point() {
        let nu = 20.0;
        let chi = chi_at_phi_min(15, nu, 0.0);
        let l_max = l_max_for_chi(nu, chi, 0.0);
        assert!(l_max <= 16 && l_max >= 13);
    }
}
