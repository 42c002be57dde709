//! Assembles per-`k` radial transfer functions into angular power spectra,
//! §4.T "project `Δ_l(k)` against the primordial power spectrum".

use crate::sources::SourceKind;
use std::collections::BTreeMap;

/// `Δ_l(k)` for every `(source kind, ℓ)` pair, collected across the whole
/// `k` grid.
#[derive(Clone, Debug, Default)]
pub struct TransferFunctions {
    k: Vec<f64>,
    columns: BTreeMap<(SourceKind, u32), Vec<f64>>,
}

impl TransferFunctions {
    /// Allocates a table over the fixed `k` grid every column will share.
    #[must_use]
    pub fn new(k: Vec<f64>) -> Self {
        Self {
            k,
            columns: BTreeMap::new(),
        }
    }

    /// Records `Δ_l(k)` for one `k` task's contribution to `(kind, l)`.
    ///
    /// Callers append in the same order as [`Self::k`]; this is checked by
    /// `debug_assert` rather than at every call in release builds.
    pub fn push(&mut self, kind: SourceKind, l: u32, value: f64) {
        let column = self.columns.entry((kind, l)).or_default();
        debug_assert!(column.len() < self.k.len(), "transfer column overflowed the k grid");
        column.push(value);
    }

    /// Read access to one `(kind, l)` column, aligned with [`Self::k`].
    #[must_use]
    pub fn column(&self, kind: SourceKind, l: u32) -> &[f64] {
        self.columns.get(&(kind, l)).map_or(&[], Vec::as_slice)
    }

    /// The shared `k` grid.
    #[must_use]
    pub fn k(&self) -> &[f64] {
        &self.k
    }
}

/// `C_l = 4π ∫ dlnk P(k) Δ_l^a(k) Δ_l^b(k)`, trapezoidal in `ln k`, §4.T.
///
/// Pass the same kind/`l` for both `a` and `b` for an auto-spectrum, or
/// different kinds for a cross-spectrum (e.g. temperature x lensing).
#[must_use]
pub fn angular_power_spectrum(
    k: &[f64],
    delta_a: &[f64],
    delta_b: &[f64],
    primordial_power: impl Fn(f64) -> f64,
) -> f64 {
    let n = k.len().min(delta_a.len()).min(delta_b.len());
    if n < 2 {
        return 0.0;
    }
    let integrand = |i: usize| primordial_power(k[i]) * delta_a[i] * delta_b[i];
    let mut acc = 0.0;
    for i in 0..n - 1 {
        let f_i = integrand(i);
        let f_ip1 = integrand(i + 1);
        let dlnk = (k[i + 1] / k[i]).ln();
        acc += 0.5 * (f_i + f_ip1) * dlnk;
    }
    4.0 * std::f64::consts::PI * acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_functions_round_trip() {
        let mut t = TransferFunctions::new(vec![1e-3, 1e-2, 1e-1]);
        t.push(SourceKind::Temperature, 2, 0.1);
        t.push(SourceKind::Temperature, 2, 0.2);
        t.push(SourceKind::Temperature, 2, 0.3);
        assert_eq!(t.column(SourceKind::Temperature, 2), &[0.1, 0.2, 0.3]);
        assert!(t.column(SourceKind::Temperature, 3).is_empty());
    }

    #[test]
    fn auto_spectrum_is_nonnegative_for_a_flat_spectrum() {
        let k: Vec<f64> = (1..=100).map(|i| 1e-4 * 1.05_f64.powi(i)).collect();
        let delta: Vec<f64> = k.iter().map(|&kk| (-kk * 10.0).exp()).collect();
        let cl = angular_power_spectrum(&k, &delta, &delta, |_| 2.1e-9);
        assert!(cl >= 0.0);
        assert!(cl.is_finite());
    }

    #[test]
    fn zero_transfer_gives_zero_spectrum() {
        let k = vec![1e-3, 1e-2, 1e-1];
        let zero = vec![0.0; 3];
        let cl = angular_power_spectrum(&k, &zero, &zero, |_| 2.1e-9);
        assert_eq!(cl, 0.0);
    }
}
