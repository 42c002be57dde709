//! Wavenumber, multipole and conformal-time grid construction, §3 and §4.P.1.

use crate::background::{BackgroundLevel, BackgroundTable, LastIndex};
use crate::config::Precision;
use crate::error::{Error, Result};
use crate::mode::Mode;

/// A constructed wavenumber grid: the ordered `k` values plus the three
/// region boundaries `k_size_cmb ≤ k_size_cl ≤ k_size` of §3.
#[derive(Clone, Debug)]
pub struct KGrid {
    /// Ordered, strictly increasing wavenumbers.
    pub k: Vec<f64>,
    /// Number of `k` values sufficient for CMB-only spectra.
    pub k_size_cmb: usize,
    /// Number of `k` values sufficient for CMB + LSS spectra.
    pub k_size_cl: usize,
    /// Index into `k` of each user-supplied "output k value", in the order
    /// they were requested.
    pub output_indices: Vec<usize>,
}

/// Recombination sound-horizon wavenumber estimate used to center the
/// super-to-sub horizon transition, §4.P.1. A full implementation reads this
/// off the thermodynamics module; here we take it as a precomputed input
/// since thermodynamics is an external collaborator this crate does not own.
pub fn k_rec_estimate(tau_rec: f64) -> f64 {
    2.0 * std::f64::consts::PI / tau_rec
}

/// Builds the k-grid, §4.P.1.
///
/// `k_min` follows the curvature-dependent formula of §4.P.1:
/// - flat: `k_min_tau0 / τ_today`
/// - open: `√(−K + (k_min_tau0 / (τ_today·angular_rescale))²)`
/// - closed: `3√K`
///
/// The step size follows the tanh-blended super/sub-horizon formula, with an
/// additional tanh blend in `log k` centered at `k_bao_center·k_rec` used to
/// decide whether the BAO-region linear density (`k_per_decade_bao`) or the
/// broadband logarithmic density (`k_per_decade_pk`) dominates locally.
pub fn build_k_grid(
    mode: Mode,
    precision: &Precision,
    background: &dyn BackgroundTable,
    tau_rec: f64,
    angular_rescale: f64,
    output_k: &[f64],
) -> Result<KGrid> {
    let curvature = background.curvature();
    let tau_today = background.tau_today();
    let a0_h0 = background.a0_h0();
    let k_rec = k_rec_estimate(tau_rec);

    let k_min = if curvature > 0.0 {
        3.0 * curvature.sqrt()
    } else if curvature < 0.0 {
        (-curvature + (precision.k_min_tau0 / (tau_today * angular_rescale)).powi(2)).sqrt()
    } else {
        precision.k_min_tau0 / tau_today
    };
    if k_min <= 0.0 || !k_min.is_finite() {
        return Err(Error::GridInconsistency(format!(
            "computed non-positive k_min={k_min}"
        )));
    }

    let scale2 = a0_h0 * a0_h0 + curvature.abs();
    let k_max = {
        // enough range to resolve the requested ell_max temperature
        // multipoles plus any user-requested output k values
        let from_lmax = f64::from(precision.l_max_scalars.max(precision.l_max_tensors)) / tau_rec;
        output_k
            .iter()
            .copied()
            .fold(from_lmax.max(k_min * 10.0), f64::max)
    };

    let mut k = vec![k_min];
    while *k.last().unwrap() < k_max {
        let last = *k.last().unwrap();
        let step = step_size(last, k_rec, scale2, precision);
        if step <= 0.0 || !step.is_finite() {
            return Err(Error::GridInconsistency(format!(
                "k step underflowed at k={last}"
            )));
        }
        let next = if curvature > 0.0 {
            // closed case: above nu=3 discretize nu to integers
            let nu = (last + step) / curvature.sqrt();
            if nu > 3.0 {
                nu.round() * curvature.sqrt()
            } else {
                last + step
            }
        } else {
            last + step
        };
        if next <= last {
            return Err(Error::GridInconsistency(
                "k grid failed to advance monotonically".to_string(),
            ));
        }
        k.push(next);
    }

    let k_size_cmb = k
        .iter()
        .position(|&kk| kk > 0.35 / tau_rec)
        .unwrap_or(k.len())
        .max(1)
        .min(k.len());
    let k_size_cl = k.len();

    let mut output_indices = Vec::with_capacity(output_k.len());
    for &ko in output_k {
        if ko < k_min {
            return Err(Error::GridInconsistency(format!(
                "requested output k={ko} below k_min={k_min}"
            )));
        }
        match k.binary_search_by(|probe| probe.partial_cmp(&ko).unwrap()) {
            Ok(idx) => output_indices.push(idx),
            Err(idx) => {
                k.insert(idx, ko);
                output_indices.push(idx);
            }
        }
    }

    for w in k.windows(2) {
        if w[1] <= w[0] {
            return Err(Error::GridInconsistency(
                "k grid is not strictly monotone after merging output points".to_string(),
            ));
        }
    }

    Ok(KGrid {
        k,
        k_size_cmb,
        k_size_cl,
        output_indices,
    })
}

fn step_size(k: f64, k_rec: f64, scale2: f64, precision: &Precision) -> f64 {
    let tanh_transition =
        0.5 * (((k - k_rec) / (k_rec * precision.k_step_transition)).tanh() + 1.0);
    let base = (precision.k_step_super
        + tanh_transition * (precision.k_step_sub - precision.k_step_super))
        * k_rec;
    let k2_over_scale2 = k * k / scale2;
    let envelope =
        (k2_over_scale2 + 1.0) / (k2_over_scale2 + 1.0 / precision.k_super_reduction);
    let bao_center = precision.k_bao_center * k_rec;
    let bao_blend = 0.5
        * (1.0
            + ((k.ln() - bao_center.ln()) / precision.k_bao_width.ln().abs().max(1e-6)).tanh());
    let per_decade = precision.k_per_decade_bao * bao_blend
        + precision.k_per_decade_pk * (1.0 - bao_blend);
    let log_step = k * (10f64.powf(1.0 / per_decade.max(1.0)) - 1.0);
    (base * envelope).min(log_step.max(base * envelope * 1e-3))
}

/// Builds the ℓ-grid, §3 "Multipole grid".
///
/// Starts with a logarithmic step sized `ℓ·(step^rescaling − 1)`, crosses
/// over to the fixed linear step `l_linstep` once the log step would exceed
/// it, and finishes exactly at `l_max`.
#[must_use]
pub fn build_l_grid(l_max: u32, l_logstep: f64, l_linstep: u32, rescaling: f64) -> Vec<u32> {
    let mut ls = vec![2u32];
    loop {
        let last = *ls.last().unwrap();
        if last >= l_max {
            break;
        }
        let log_step = (f64::from(last) * (l_logstep.powf(rescaling) - 1.0)).max(1.0);
        let next = if (log_step as u32) >= l_linstep {
            last + l_linstep
        } else {
            last + (log_step.ceil() as u32).max(1)
        };
        if next >= l_max {
            ls.push(l_max);
            break;
        }
        ls.push(next);
    }
    ls
}

/// A constructed conformal-time grid plus the index at which the
/// "late-sources" suffix (`z ≤ z_max_pk`) begins, §3 "Time grid".
#[derive(Clone, Debug)]
pub struct TauGrid {
    /// Ordered, strictly increasing conformal times.
    pub tau: Vec<f64>,
    /// First index with `z(τ) ≤ z_max_pk`; the suffix `tau[late_start..]` is
    /// the re-indexed late-sources region.
    pub late_start: usize,
}

/// Bisects for `τ_ini` such that `aH/κ′ ≈ start_sources_at_tau_c_over_tau_h`,
/// §3 "Time grid". `kappa_prime_of_tau` stands in for a thermodynamics
/// lookup (an external collaborator); callers own threading the real table
/// through.
pub fn bisect_tau_ini(
    background: &dyn BackgroundTable,
    kappa_prime_of_tau: impl Fn(f64) -> Result<f64>,
    target_ratio: f64,
) -> Result<f64> {
    let tau_today = background.tau_today();
    let mut lo = tau_today * 1e-8;
    let mut hi = tau_today * 0.5;
    let ratio = |tau: f64| -> Result<f64> {
        let mut idx = LastIndex::default();
        let row = background.background_at_tau(tau, BackgroundLevel::Short, &mut idx)?;
        let kp = kappa_prime_of_tau(tau)?;
        if kp <= 0.0 {
            return Err(Error::Numerical {
                tau,
                message: "kappa_prime non-positive while bisecting tau_ini".to_string(),
            });
        }
        if row.a_h == 0.0 {
            return Err(Error::Numerical {
                tau,
                message: "aH vanished while bisecting tau_ini".to_string(),
            });
        }
        Ok(row.a_h / kp)
    };
    let mut f_lo = ratio(lo)? - target_ratio;
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        let f_mid = ratio(mid)? - target_ratio;
        if f_mid.signum() == f_lo.signum() {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
        if (hi - lo) < 1e-10 * tau_today {
            break;
        }
    }
    Ok(0.5 * (lo + hi))
}

/// Builds the τ-grid by stepping `step = stepsize · min(1/(aH), 1/κ′_eff)`
/// from `τ_ini` to `τ_today`, §3 "Time grid".
pub fn build_tau_grid(
    background: &dyn BackgroundTable,
    tau_ini: f64,
    stepsize: f64,
    kappa_prime_eff_of_tau: impl Fn(f64) -> Result<f64>,
    z_of_tau: impl Fn(f64) -> f64,
    z_max_pk: f64,
) -> Result<TauGrid> {
    let tau_today = background.tau_today();
    if tau_ini <= 0.0 || tau_ini >= tau_today {
        return Err(Error::GridInconsistency(format!(
            "tau_ini={tau_ini} out of range (0, tau_today={tau_today})"
        )));
    }
    let mut tau = vec![tau_ini];
    let mut idx = LastIndex::default();
    loop {
        let t = *tau.last().unwrap();
        if t >= tau_today {
            break;
        }
        let row = background.background_at_tau(t, BackgroundLevel::Short, &mut idx)?;
        if row.a_h == 0.0 {
            return Err(Error::Numerical {
                tau: t,
                message: "aH vanished while building tau grid".to_string(),
            });
        }
        let tau_h = 1.0 / row.a_h;
        let kappa_eff = kappa_prime_eff_of_tau(t)?;
        let tau_c = if kappa_eff > 0.0 {
            1.0 / kappa_eff
        } else {
            f64::INFINITY
        };
        let step = stepsize * tau_h.min(tau_c);
        if step <= 0.0 || !step.is_finite() {
            return Err(Error::GridInconsistency(format!(
                "tau step underflowed at tau={t}"
            )));
        }
        tau.push((t + step).min(tau_today));
    }
    if *tau.last().unwrap() < tau_today {
        tau.push(tau_today);
    }

    let late_start = tau
        .iter()
        .position(|&t| z_of_tau(t) <= z_max_pk)
        .unwrap_or(tau.len() - 1);

    Ok(TauGrid { tau, late_start })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::AnalyticFlatLcdm;

    #[test]
    fn l_grid_starts_at_two_and_ends_exactly_at_lmax() {
        let ls = build_l_grid(2500, 1.12, 40, 1.0);
        assert_eq!(ls[0], 2);
        assert_eq!(*ls.last().unwrap(), 2500);
        for w in ls.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn k_grid_is_strictly_monotone_and_contains_output_points() {
        let bg = AnalyticFlatLcdm::new(1.0 / 2997.9, 0.31, 9.2e-5);
        let precision = Precision::default();
        let tau_rec = bg.tau_today() * 0.02;
        let output_k = [1e-3, 5e-2];
        let grid =
            build_k_grid(Mode::Scalar, &precision, &bg, tau_rec, 1.0, &output_k).unwrap();
        for w in grid.k.windows(2) {
            assert!(w[1] > w[0]);
        }
        for (i, &ko) in output_k.iter().enumerate() {
            let idx = grid.output_indices[i];
            assert!((grid.k[idx] - ko).abs() < 1e-12 * ko.max(1.0));
        }
        assert!(grid.k_size_cmb <= grid.k_size_cl);
        assert!(grid.k_size_cl <= grid.k.len());
    }

    #[test]
    fn closed_universe_k_grid_is_integer_nu_above_three() {
        struct ClosedBg(AnalyticFlatLcdm);
        impl BackgroundTable for ClosedBg {
            fn background_at_tau(
                &self,
                tau: f64,
                level: BackgroundLevel,
                last_index: &mut LastIndex,
            ) -> Result<BackgroundRow> {
                self.0.background_at_tau(tau, level, last_index)
            }
            fn tau_today(&self) -> f64 {
                self.0.tau_today()
            }
            fn a0_h0(&self) -> f64 {
                self.0.a0_h0()
            }
            fn curvature(&self) -> f64 {
                1e-4
            }
        }
        use crate::background::{BackgroundRow, BackgroundTable};
        let bg = ClosedBg(AnalyticFlatLcdm::new(1.0 / 2997.9, 0.31, 9.2e-5));
        let precision = Precision::default();
        let tau_rec = bg.tau_today() * 0.02;
        let grid = build_k_grid(Mode::Scalar, &precision, &bg, tau_rec, 1.0, &[]).unwrap();
        let sqrt_k = 1e-4_f64.sqrt();
        for &k in grid.k.iter().filter(|&&k| k / sqrt_k > 3.0) {
            let nu = k / sqrt_k;
            assert!((nu - nu.round()).abs() < 1e-6);
        }
    }
}
