//! The curvature-shifted radial wavenumber `ν`, §4.T.1 "`q² = k² + K(1+m)`",
//! and the q-list construction: closed-universe integer-`ν` quantization and
//! adaptive spacing below/above the flat-approximation threshold.

use crate::grid::KGrid;
use crate::mode::Mode;

/// `ν(k)` for one `(mode, curvature)` pair.
#[must_use]
pub fn nu_of_k(k: f64, mode: Mode, curvature: f64) -> f64 {
    let m = f64::from(mode.curvature_shift());
    (k * k + curvature * (1.0 + m)).max(0.0).sqrt()
}

/// Snaps `nu` onto the integer lattice the hyperspherical eigenvalue
/// problem on a closed `S³` actually admits, §4.T.1. The Laplacian on a
/// closed universe has eigenvalues `ν ∈ {3, 4, 5, ...}` (scalar modes);
/// below `flat_approx_nu` — where the exact closed recursion, rather than
/// its flat approximation, matters — any off-lattice `ν` coming out of
/// [`nu_of_k`] must be rounded onto that lattice before a `Φ` table is
/// built for it, or the table describes a non-normalizable mode.
#[must_use]
pub fn snap_nu(nu: f64, curvature: f64, flat_approx_nu: f64) -> f64 {
    if curvature > 0.0 && nu < flat_approx_nu {
        nu.round().max(3.0)
    } else {
        nu
    }
}

/// The full `ν` grid paired with a [`KGrid`], in the same order as
/// [`KGrid::k`], after closed-universe integer-`ν` rounding.
#[derive(Clone, Debug)]
pub struct QGrid {
    /// `ν` values, one per entry of the source `KGrid`, integer-rounded
    /// below `flat_approx_nu` in closed geometry.
    pub nu: Vec<f64>,
    /// First index in `nu` at or above `flat_approx_nu`, where the flat
    /// approximation takes over from the exact closed/open hyperspherical
    /// recursion (`index_q_flat_approximation`).
    pub index_flat_approximation: usize,
}

impl QGrid {
    /// Builds the `ν` grid for `mode` over `k_grid`, snapping to the
    /// closed-universe integer lattice where applicable.
    #[must_use]
    pub fn build(k_grid: &KGrid, mode: Mode, curvature: f64, flat_approx_nu: f64) -> Self {
        let nu: Vec<f64> = k_grid
            .k
            .iter()
            .map(|&k| snap_nu(nu_of_k(k, mode, curvature), curvature, flat_approx_nu))
            .collect();
        let index_flat_approximation = nu.iter().position(|&n| n >= flat_approx_nu).unwrap_or(nu.len());
        Self { nu, index_flat_approximation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_space_nu_equals_k() {
        assert!((nu_of_k(0.05, Mode::Scalar, 0.0) - 0.05).abs() < 1e-15);
    }

    #[test]
    fn curvature_shift_increases_with_spin() {
        let k = 0.01;
        let curvature = 1e-4;
        let nu_scalar = nu_of_k(k, Mode::Scalar, curvature);
        let nu_vector = nu_of_k(k, Mode::Vector, curvature);
        let nu_tensor = nu_of_k(k, Mode::Tensor, curvature);
        assert!(nu_scalar < nu_vector);
        assert!(nu_vector < nu_tensor);
    }

    #[test]
    fn snap_nu_rounds_to_integer_lattice_below_flat_approximation_in_closed_space() {
        let snapped = snap_nu(5.3, 1e-3, 10.0);
        assert!((snapped - 5.0).abs() < 1e-12);
        assert!(snap_nu(2.2, 1e-3, 10.0) >= 3.0);
    }

    #[test]
    fn snap_nu_is_identity_in_flat_space() {
        assert!((snap_nu(5.3, 0.0, 10.0) - 5.3).abs() < 1e-12);
    }

    #[test]
    fn snap_nu_is_identity_above_flat_approximation() {
        assert!((snap_nu(50.3, 1e-3, 10.0) - 50.3).abs() < 1e-12);
    }

    #[test]
    fn qgrid_tracks_flat_approximation_boundary() {
        let k_grid = KGrid {
            k: vec![0.001, 0.01, 0.1, 1.0],
            k_size_cmb: 4,
            k_size_cl: 4,
            output_indices: Vec::new(),
        };
        let grid = QGrid::build(&k_grid, Mode::Scalar, 1e-4, 0.05);
        assert!(grid.index_flat_approximation <= grid.nu.len());
        for &n in grid.nu.iter().skip(grid.index_flat_approximation) {
            assert!(n >= 0.05);
        }
    }
}
