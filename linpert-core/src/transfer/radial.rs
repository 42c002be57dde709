//! Exact line-of-sight radial projection, §4.T.1 "convolve `S(k,τ)` against
//! the radial function appropriate to the source kind, over the full τ
//! grid", §4.T.4 "eleven radial-function kinds, built from `Φ`, `Φ′` and
//! `Φ″`".

use crate::error::Result;
use crate::hyperspherical::BesselTable;
use crate::sources::{SourceKind, SourceTable};

/// Which derivative of `Φ_l^ν` a source column convolves against, §4.T.4.
/// Every one of the eleven named radial-function kinds (SCALAR_T0/T1/T2/E,
/// the vector/tensor T/E/B families, NC_RSD) reduces to one of these three
/// once the source itself already carries the right prefactor (`(√|K|/k)`
/// for T1-like terms is folded into the source at sampling time, since it
/// depends on `k` but not on `χ`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RadialFunctionKind {
    /// `Φ_l^ν(χ)` — SCALAR_T0, vector/tensor T, NC density.
    Phi,
    /// `Φ_l^ν{}'(χ)` — SCALAR_T1 (Doppler), NC_RSD, vector/tensor E/B.
    PhiPrime,
    /// `Φ_l^ν{}''(χ)` — SCALAR_T2 (polarization-coupled quadrupole),
    /// SCALAR_E.
    PhiDoublePrime,
}

/// Maps a [`SourceKind`] to the radial function its line-of-sight
/// convolution uses, §4.T.4.
#[must_use]
pub fn radial_function_kind(kind: SourceKind) -> RadialFunctionKind {
    match kind {
        SourceKind::Temperature
        | SourceKind::NumberCount(_)
        | SourceKind::Lensing
        | SourceKind::GalaxyLensing(_) => RadialFunctionKind::Phi,
        SourceKind::Doppler | SourceKind::NumberCountRsd(_) => RadialFunctionKind::PhiPrime,
        SourceKind::Quadrupole | SourceKind::EPolarization => RadialFunctionKind::PhiDoublePrime,
    }
}

/// `Δ_l(k)` for one source kind, one `(mode, k)`, across a grid of `ℓ`.
#[derive(Clone, Debug)]
pub struct RadialTransfer {
    /// The `ℓ` values this was computed for.
    pub l: Vec<u32>,
    /// `Δ_l(k)`, aligned with [`Self::l`].
    pub values: Vec<f64>,
}

/// Integrates `Δ_l(k) = ∫ S(k,τ) R_l^ν(χ(τ)) dτ` by the trapezoidal rule
/// over the source table's τ grid, `χ(τ) = τ_today - τ`, where `R` is `Φ`,
/// `Φ′` or `Φ″` depending on `kind`, §4.T.4.
pub fn line_of_sight_transfer(
    l_grid: &[u32],
    nu: f64,
    curvature: f64,
    flat_approx_nu: f64,
    tau_today: f64,
    sources: &SourceTable,
    kind: SourceKind,
) -> Result<RadialTransfer> {
    let s = sources.column(kind);
    let tau = &sources.tau;
    let n = tau.len().min(s.len());
    if n < 2 {
        return Ok(RadialTransfer {
            l: l_grid.to_vec(),
            values: vec![0.0; l_grid.len()],
        });
    }
    // chi(tau) decreases as tau increases; the table needs strictly
    // increasing abscissas, so build it on the reversed, ascending order.
    let chi_asc: Vec<f64> = (0..n).rev().map(|i| (tau_today - tau[i]).max(0.0)).collect();
    let component = radial_function_kind(kind);

    let mut values = Vec::with_capacity(l_grid.len());
    for &l in l_grid {
        let table = BesselTable::build(l, nu, curvature, flat_approx_nu, chi_asc.clone())?;
        let mut acc = 0.0;
        for i in 0..n - 1 {
            let chi_i = (tau_today - tau[i]).max(0.0);
            let chi_ip1 = (tau_today - tau[i + 1]).max(0.0);
            let r_i = select_component(&table, chi_i, component);
            let r_ip1 = select_component(&table, chi_ip1, component);
            let f_i = s[i] * r_i;
            let f_ip1 = s[i + 1] * r_ip1;
            acc += 0.5 * (f_i + f_ip1) * (tau[i + 1] - tau[i]);
        }
        values.push(acc);
    }
    Ok(RadialTransfer {
        l: l_grid.to_vec(),
        values,
    })
}

fn select_component(table: &BesselTable, chi: f64, component: RadialFunctionKind) -> f64 {
    let (value, d1, d2) = table.interpolate_hermite(chi);
    match component {
        RadialFunctionKind::Phi => value,
        RadialFunctionKind::PhiPrime => d1,
        RadialFunctionKind::PhiDoublePrime => d2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_source_gives_zero_transfer() {
        let mut sources = SourceTable::new(vec![1.0, 2.0, 3.0, 4.0]);
        for _ in 0..4 {
            sources.push(SourceKind::Temperature, 0.0);
        }
        let result =
            line_of_sight_transfer(&[2, 10, 50], 0.05, 0.0, 1e4, 5.0, &sources, SourceKind::Temperature).unwrap();
        assert!(result.values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn nonzero_source_gives_finite_transfer() {
        let tau: Vec<f64> = (0..200).map(|i| 0.01 + i as f64 * 0.05).collect();
        let mut sources = SourceTable::new(tau.clone());
        for &t in &tau {
            sources.push(SourceKind::Temperature, (-((t - 5.0).powi(2))).exp());
        }
        let tau_today = *tau.last().unwrap() + 0.1;
        let result =
            line_of_sight_transfer(&[2, 10, 200], 0.05, 0.0, 1e4, tau_today, &sources, SourceKind::Temperature)
                .unwrap();
        assert!(result.values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn quadrupole_kind_differs_from_plain_phi_convolution() {
        let tau: Vec<f64> = (0..200).map(|i| 0.01 + i as f64 * 0.05).collect();
        let mut t0 = SourceTable::new(tau.clone());
        let mut t2 = SourceTable::new(tau.clone());
        for &t in &tau {
            let s = (-((t - 5.0).powi(2))).exp();
            t0.push(SourceKind::Temperature, s);
            t2.push(SourceKind::Quadrupole, s);
        }
        let tau_today = *tau.last().unwrap() + 0.1;
        let a = line_of_sight_transfer(&[10], 0.05, 0.0, 1e4, tau_today, &t0, SourceKind::Temperature).unwrap();
        let b = line_of_sight_transfer(&[10], 0.05, 0.0, 1e4, tau_today, &t2, SourceKind::Quadrupole).unwrap();
        assert!((a.values[0] - b.values[0]).abs() > 1e-12);
    }
}
