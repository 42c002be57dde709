//! Radial projection: convolves one `(mode, ic, k)` task's
//! [`crate::sources::SourceTable`] with hyperspherical Bessel radial
//! functions ([`crate::hyperspherical`]) to produce `Δ_l(k)`, then
//! [`projector`] assembles those across the whole `k` grid into angular
//! power spectra, §4.T.

pub mod limber;
pub mod projector;
pub mod qgrid;
pub mod radial;

use crate::config::{Precision, SelectionBin};
use crate::error::Result;
use crate::mode::Mode;
use crate::sources::{SourceKind, SourceTable};
use projector::TransferFunctions;
use qgrid::{nu_of_k, snap_nu};
use radial::RadialTransfer;

/// Zeroes `Δ_l(k)` for `ℓ ≥ ν/√K` in closed geometry, §3's IntegrationVector
/// invariant: the hyperspherical harmonics on a closed `S³` of curvature
/// radius `R = 1/√K` only resolve multipoles up to `ℓ ~ νR`, so any higher
/// `ℓ` carries no physical transfer in that geometry.
fn closed_universe_cutoff(l: u32, nu: f64, curvature: f64) -> bool {
    curvature > 0.0 && f64::from(l) >= nu / curvature.sqrt()
}

/// Runs the radial projection for one `k` task's source table, dispatching
/// each `(kind, ℓ)` to the exact Bessel convolution or the Limber
/// approximation per [`limber::use_limber`], enforcing the closed-universe
/// `ℓ ≥ ν/√K` truncation, and accumulates the result into `out` at this
/// task's position in the shared `k` grid.
pub fn project_task(
    out: &mut TransferFunctions,
    l_grid: &[u32],
    mode: Mode,
    k: f64,
    curvature: f64,
    tau_today: f64,
    precision: &Precision,
    selection_bins: &[SelectionBin],
    sources: &SourceTable,
) -> Result<()> {
    let nu = snap_nu(nu_of_k(k, mode, curvature), curvature, precision.hyper_flat_approximation_nu);
    let mut kinds = vec![
        SourceKind::Temperature,
        SourceKind::Doppler,
        SourceKind::Quadrupole,
        SourceKind::EPolarization,
        SourceKind::Lensing,
    ];
    kinds.extend((0..selection_bins.len()).map(SourceKind::NumberCount));
    kinds.extend((0..selection_bins.len()).map(SourceKind::NumberCountRsd));
    kinds.extend((0..selection_bins.len()).map(SourceKind::GalaxyLensing));

    for kind in kinds {
        let z_mean = match kind {
            SourceKind::NumberCount(i) | SourceKind::NumberCountRsd(i) | SourceKind::GalaxyLensing(i) => {
                selection_bins.get(i).map_or(0.0, |b| b.z_mean)
            }
            _ => 0.0,
        };
        let is_los = matches!(kind, SourceKind::GalaxyLensing(_));
        let (limber_ls, exact_ls): (Vec<u32>, Vec<u32>) = l_grid
            .iter()
            .copied()
            .partition(|&l| limber::use_limber(kind, l, z_mean, nu, precision, is_los));

        let mut exact = if exact_ls.is_empty() {
            RadialTransfer {
                l: Vec::new(),
                values: Vec::new(),
            }
        } else {
            radial::line_of_sight_transfer(
                &exact_ls,
                nu,
                curvature,
                precision.hyper_flat_approximation_nu,
                tau_today,
                sources,
                kind,
            )?
        };
        let limber_result = if limber_ls.is_empty() {
            RadialTransfer {
                l: Vec::new(),
                values: Vec::new(),
            }
        } else {
            limber::limber_transfer(&limber_ls, nu, curvature, tau_today, sources, kind)
        };
        exact.l.extend(limber_result.l);
        exact.values.extend(limber_result.values);

        for (l, value) in l_grid.iter().copied().map(|l| {
            let idx = exact.l.iter().position(|&x| x == l).expect("every requested l was computed");
            let value = if closed_universe_cutoff(l, nu, curvature) {
                0.0
            } else {
                exact.values[idx]
            };
            (l, value)
        }) {
            out.push(kind, l, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_task_populates_every_requested_kind_and_l() {
        let precision = Precision::default();
        let tau: Vec<f64> = (0..50).map(|i| 0.1 + i as f64 * 2.0).collect();
        let mut sources = SourceTable::new(tau.clone());
        for &t in &tau {
            sources.push(SourceKind::Temperature, (-(t - 50.0).powi(2) / 200.0).exp());
            sources.push(SourceKind::Doppler, 0.01 * (-(t - 50.0).powi(2) / 200.0).exp());
            sources.push(SourceKind::Quadrupole, 0.01 * (-(t - 50.0).powi(2) / 200.0).exp());
            sources.push(SourceKind::EPolarization, 0.1 * (-(t - 50.0).powi(2) / 200.0).exp());
            sources.push(SourceKind::Lensing, 1e-5);
        }
        let mut out = TransferFunctions::new(vec![0.01]);
        let l_grid = vec![2, 10, 50];
        project_task(
            &mut out,
            &l_grid,
            Mode::Scalar,
            0.01,
            0.0,
            *tau.last().unwrap() + 1.0,
            &precision,
            &[],
            &sources,
        )
        .unwrap();
        for &l in &l_grid {
            assert_eq!(out.column(SourceKind::Temperature, l).len(), 1);
            assert!(out.column(SourceKind::Temperature, l)[0].is_finite());
        }
    }

    #[test]
    fn closed_universe_truncates_multipoles_past_nu_over_sqrt_k() {
        let precision = Precision::default();
        let tau: Vec<f64> = (0..50).map(|i| 0.1 + i as f64 * 2.0).collect();
        let mut sources = SourceTable::new(tau.clone());
        for &t in &tau {
            sources.push(SourceKind::Temperature, (-(t - 50.0).powi(2) / 200.0).exp());
            sources.push(SourceKind::Doppler, 0.0);
            sources.push(SourceKind::Quadrupole, 0.0);
            sources.push(SourceKind::EPolarization, 0.0);
            sources.push(SourceKind::Lensing, 0.0);
        }
        let curvature = 1e-2;
        let k = 0.05;
        let nu = snap_nu(nu_of_k(k, Mode::Scalar, curvature), curvature, precision.hyper_flat_approximation_nu);
        let l_cutoff = (nu / curvature.sqrt()).floor() as u32 + 5;
        let mut out = TransferFunctions::new(vec![k]);
        let l_grid = vec![2, l_cutoff];
        project_task(
            &mut out,
            &l_grid,
            Mode::Scalar,
            k,
            curvature,
            *tau.last().unwrap() + 1.0,
            &precision,
            &[],
            &sources,
        )
        .unwrap();
        assert_eq!(out.column(SourceKind::Temperature, l_cutoff)[0], 0.0);
    }
}
