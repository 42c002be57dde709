//! The Limber approximation, §4.T.3 "above the configured `ℓ` threshold,
//! replace the Bessel convolution with the local Limber projection", §4.T.5
//! "analytic asymptotic expansion of the projection integral".
//!
//! Valid when the source is a slowly varying function of τ compared to the
//! oscillation period of `Φ_l^ν`, which holds for number-count and
//! weak-lensing sources at high `ℓ`, or for any source once `q` itself is
//! past the table's reach ([`crate::config::Precision::q_max_bessel`]); see
//! [`use_limber`] for the thresholds that decide when to switch.

use crate::config::Precision;
use crate::sources::{SourceKind, SourceTable};
use crate::transfer::radial::{radial_function_kind, RadialFunctionKind, RadialTransfer};

fn interp_linear(x: &[f64], y: &[f64], query: f64) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    if query <= x[0] {
        return y[0];
    }
    if query >= *x.last().unwrap() {
        return *y.last().unwrap();
    }
    let idx = match x.binary_search_by(|probe| probe.partial_cmp(&query).unwrap()) {
        Ok(i) => return y[i],
        Err(i) => i,
    };
    let t = (query - x[idx - 1]) / (x[idx] - x[idx - 1]);
    y[idx - 1] + t * (y[idx] - y[idx - 1])
}

/// Quadratic (three-point parabola) interpolation of the *regular* product
/// `S(τ)·(τ_today−τ)` around `query`, then divides the curvature kernel
/// back out, §4.T.5. Line-of-sight-integrated sources like the lensing
/// potential carry an implicit `1/(τ_today−τ)`-type weight that makes `S`
/// itself diverge as `τ → τ_today`; interpolating the regularized product
/// directly avoids that divergence, at the cost of one division back out
/// at the very end (`query` is always strictly less than `τ_today` for any
/// `ℓ ≥ 0`, so that division is safe).
fn sample_regular_product(tau: &[f64], s: &[f64], tau_today: f64, query: f64) -> f64 {
    let n = tau.len().min(s.len());
    if n == 0 {
        return 0.0;
    }
    if n < 3 {
        let denom = (tau_today - query).max(1e-300);
        return interp_linear(tau, s, query) * (tau_today - query).max(0.0) / denom;
    }
    let product: Vec<f64> = (0..n).map(|i| s[i] * (tau_today - tau[i]).max(0.0)).collect();
    let idx = match tau.binary_search_by(|probe| probe.partial_cmp(&query).unwrap()) {
        Ok(i) => i,
        Err(i) => i,
    };
    // pick the 3 nodes straddling `query` as tightly as possible
    let lo = idx.saturating_sub(1).min(n - 3);
    let (t0, t1, t2) = (tau[lo], tau[lo + 1], tau[lo + 2]);
    let (p0, p1, p2) = (product[lo], product[lo + 1], product[lo + 2]);
    // Lagrange quadratic through (t0,p0), (t1,p1), (t2,p2)
    let l0 = (query - t1) * (query - t2) / ((t0 - t1) * (t0 - t2));
    let l1 = (query - t0) * (query - t2) / ((t1 - t0) * (t1 - t2));
    let l2 = (query - t0) * (query - t1) / ((t2 - t0) * (t2 - t1));
    let regular = l0 * p0 + l1 * p1 + l2 * p2;
    regular / (tau_today - query).max(1e-300)
}

/// Whether the source kind's Limber sampling needs the regular-product
/// parabola of [`sample_regular_product`] rather than plain interpolation:
/// true for the two line-of-sight-integrated kernels that carry a
/// `(τ_today−τ)`-type weight, false for local sources.
fn needs_regular_product_sampling(kind: SourceKind) -> bool {
    matches!(kind, SourceKind::Lensing | SourceKind::GalaxyLensing(_))
}

/// Whether `kind` at multipole `l` and bin redshift `z_mean` should use the
/// Limber approximation rather than the exact Bessel convolution, §4.T.3.
/// `q` past [`Precision::q_max_bessel`] forces Limber regardless of kind,
/// since the exact Bessel table would need an argument beyond its safe
/// range there.
#[must_use]
pub fn use_limber(kind: SourceKind, l: u32, z_mean: f64, q: f64, precision: &Precision, is_line_of_sight: bool) -> bool {
    if q > precision.q_max_bessel {
        return true;
    }
    match kind {
        SourceKind::NumberCount(_) | SourceKind::GalaxyLensing(_) | SourceKind::NumberCountRsd(_) => {
            let threshold = if is_line_of_sight {
                precision.l_switch_limber_for_nc_los_over_z
            } else {
                precision.l_switch_limber_for_nc_local_over_z
            };
            f64::from(l) > threshold * z_mean.max(1e-6)
        }
        SourceKind::Lensing => l > precision.l_switch_limber_for_cmb_lensing,
        SourceKind::Temperature | SourceKind::Doppler | SourceKind::Quadrupole | SourceKind::EPolarization => false,
    }
}

/// The asymptotic expansion `√(π/2ℓ)(1 − 1/(4ℓ) + 1/(32ℓ²))` of the
/// flat-sky projection integral, §4.T.5.
fn asymptotic_weight(l_eff: f64) -> f64 {
    let l_eff = l_eff.max(0.5);
    (std::f64::consts::PI / (2.0 * l_eff)).sqrt() * (1.0 - 1.0 / (4.0 * l_eff) + 1.0 / (32.0 * l_eff * l_eff))
}

/// The curvature correction `(1 − Kℓ²/q²)^{-1/4}`, §4.T.5.
fn curvature_correction(l_eff: f64, q: f64, curvature: f64) -> f64 {
    if curvature == 0.0 {
        return 1.0;
    }
    let argument = (1.0 - curvature * l_eff * l_eff / (q * q).max(1e-300)).max(1e-6);
    argument.powf(-0.25)
}

/// One Limber-sampled, weighted value at shift `l_shift` (an `ℓ ± 0.5`-style
/// sample point), §4.T.5.
fn weighted_sample(
    tau: &[f64],
    s: &[f64],
    tau_today: f64,
    q: f64,
    curvature: f64,
    l_shift: f64,
    regular_product: bool,
) -> f64 {
    let l_eff = l_shift.max(0.5);
    let tau_target = tau_today - l_eff / q.max(1e-300);
    let sv = if regular_product {
        sample_regular_product(tau, s, tau_today, tau_target)
    } else {
        interp_linear(tau, s, tau_target)
    };
    let weight = asymptotic_weight(l_eff) * curvature_correction(l_eff, q, curvature) / q.max(1e-300);
    sv * weight
}

/// Computes `Δ_l(k)` via the Limber approximation, §4.T.5: the plain
/// asymptotic expansion for `Φ`-type sources (SCALAR_T0, NC density,
/// lensing potential), and `ℓ ± 0.5`-shifted finite differences of the same
/// kernel for `Φ′`/`Φ″`-type sources (Doppler/NC_RSD, the polarization
/// quadrupole/E), since a derivative in `χ` maps onto a half-integer shift
/// in the Limber multipole.
#[must_use]
pub fn limber_transfer(
    l_grid: &[u32],
    q: f64,
    curvature: f64,
    tau_today: f64,
    sources: &SourceTable,
    kind: SourceKind,
) -> RadialTransfer {
    let tau = &sources.tau;
    let s = sources.column(kind);
    let regular_product = needs_regular_product_sampling(kind);
    let component = radial_function_kind(kind);
    let mut values = Vec::with_capacity(l_grid.len());
    for &l in l_grid {
        let l_f = f64::from(l);
        let sample = |shift: f64| weighted_sample(tau, s, tau_today, q, curvature, l_f + shift, regular_product);
        let value = match component {
            RadialFunctionKind::Phi => sample(0.5),
            RadialFunctionKind::PhiPrime => sample(0.5) - sample(-0.5),
            RadialFunctionKind::PhiDoublePrime => sample(0.5) - 2.0 * sample(0.0) + sample(-0.5),
        };
        values.push(value);
    }
    RadialTransfer {
        l: l_grid.to_vec(),
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_number_count_switches_to_limber_at_high_l() {
        let precision = Precision::default();
        assert!(!use_limber(SourceKind::NumberCount(0), 10, 1.0, 1.0, &precision, false));
        assert!(use_limber(SourceKind::NumberCount(0), 500, 1.0, 1.0, &precision, false));
    }

    #[test]
    fn temperature_uses_limber_only_past_q_max_bessel() {
        let precision = Precision::default();
        assert!(!use_limber(SourceKind::Temperature, 5000, 1.0, 1.0, &precision, false));
        assert!(use_limber(
            SourceKind::Temperature,
            5000,
            1.0,
            precision.q_max_bessel * 2.0,
            &precision,
            false
        ));
    }

    #[test]
    fn cmb_lensing_switches_to_limber_at_high_l() {
        let precision = Precision::default();
        assert!(!use_limber(SourceKind::Lensing, 10, 0.0, 1.0, &precision, false));
        assert!(use_limber(SourceKind::Lensing, 2000, 0.0, 1.0, &precision, false));
    }

    #[test]
    fn limber_transfer_is_finite() {
        let tau: Vec<f64> = (0..100).map(|i| 1.0 + i as f64 * 1.0).collect();
        let mut sources = SourceTable::new(tau.clone());
        for _ in &tau {
            sources.push(SourceKind::NumberCount(0), 1.0);
        }
        let result = limber_transfer(&[10, 50, 200], 0.01, 0.0, 120.0, &sources, SourceKind::NumberCount(0));
        assert!(result.values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn regular_product_sampling_stays_finite_near_tau_today() {
        let tau: Vec<f64> = (0..200).map(|i| 0.01 + i as f64 * 0.5).collect();
        let tau_today = *tau.last().unwrap();
        let mut sources = SourceTable::new(tau.clone());
        for &t in &tau {
            // a source that would diverge under plain interpolation as t -> tau_today
            sources.push(SourceKind::GalaxyLensing(0), 1.0 / (tau_today - t).max(1e-3));
        }
        let result = limber_transfer(&[2000], 1.0, 0.0, tau_today, &sources, SourceKind::GalaxyLensing(0));
        assert!(result.values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn doppler_kind_differs_from_plain_phi_sampling() {
        let tau: Vec<f64> = (0..100).map(|i| 1.0 + i as f64).collect();
        let mut t0 = SourceTable::new(tau.clone());
        let mut doppler = SourceTable::new(tau.clone());
        for &t in &tau {
            t0.push(SourceKind::Temperature, t.sin());
            doppler.push(SourceKind::Doppler, t.sin());
        }
        let a = limber_transfer(&[50], 0.1, 0.0, 150.0, &t0, SourceKind::Temperature);
        let b = limber_transfer(&[50], 0.1, 0.0, 150.0, &doppler, SourceKind::Doppler);
        assert!((a.values[0] - b.values[0]).abs() > 1e-12);
    }
}
