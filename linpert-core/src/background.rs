//! External collaborator interfaces: background cosmology and thermodynamics.
//!
//! §1 treats these as out of scope, "external collaborators supplying
//! tabulated inputs via named interfaces". This module defines exactly those
//! two named interfaces (`background_at_tau`, `thermodynamics_at_z`) as
//! traits, plus one analytic implementation of each that is accurate enough
//! to drive the integrator end-to-end in tests — a flat ΛCDM background and
//! a toy instantaneous-recombination thermal history. Production callers are
//! expected to supply their own tabulated implementations (e.g. backed by a
//! spline over a precomputed table); the engine only ever calls through the
//! trait.

use crate::error::{Error, Result};

/// Which rows of the background table a caller needs filled in, mirroring
/// CLASS's `short`/`normal`/`long` background-vector levels: callers in a
/// tight inner loop ask for `Short` to avoid paying for unused derivatives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackgroundLevel {
    /// Only `a`, `H`.
    Short,
    /// `a`, `H`, `H′`, and per-species `ρ_i`, `p_i`.
    Normal,
    /// Everything in `Normal` plus second derivatives needed by the
    /// tight-coupling slip schemes.
    Long,
}

/// One row of the background table at a given `τ`.
#[derive(Clone, Debug, Default)]
pub struct BackgroundRow {
    /// Scale factor `a`.
    pub a: f64,
    /// Conformal Hubble rate `aH`.
    pub a_h: f64,
    /// Derivative of the conformal Hubble rate w.r.t. `τ`.
    pub a_h_prime: f64,
    /// Per-species energy density `ρ_i`, indexed the same as the configured
    /// [`crate::species::SpeciesList`].
    pub rho: Vec<f64>,
    /// Per-species pressure `p_i`.
    pub p: Vec<f64>,
}

/// Opaque hint a caller carries between successive calls so the
/// implementation can start its table search near the last hit rather than
/// from the beginning, §5 "per-task last-index hint".
#[derive(Clone, Copy, Debug, Default)]
pub struct LastIndex(pub usize);

/// The `background_at_tau` external interface, §6.
pub trait BackgroundTable: Sync {
    /// Evaluate the background at conformal time `τ`, filling only the
    /// rows `level` requires. `last_index` is updated to a hint for the
    /// next call at a nearby `τ`.
    fn background_at_tau(
        &self,
        tau: f64,
        level: BackgroundLevel,
        last_index: &mut LastIndex,
    ) -> Result<BackgroundRow>;

    /// Conformal time today, `τ_today`.
    fn tau_today(&self) -> f64;

    /// `a₀H₀`, i.e. `aH` evaluated at `a=1`.
    fn a0_h0(&self) -> f64;

    /// Curvature `K`: positive closed, zero flat, negative open.
    fn curvature(&self) -> f64;
}

/// One row of the thermodynamics table at a given redshift.
#[derive(Clone, Debug, Default)]
pub struct ThermoRow {
    /// Free-electron fraction `x_e`.
    pub x_e: f64,
    /// Visibility function `g`.
    pub g: f64,
    /// Thomson opacity `κ′ = d(optical depth)/dτ`.
    pub kappa_prime: f64,
    /// `κ″`.
    pub kappa_prime_prime: f64,
    /// `κ‴`.
    pub kappa_prime_prime_prime: f64,
    /// Baryon temperature `T_b`.
    pub t_b: f64,
    /// Baryon sound speed squared `c_b²`.
    pub c_b2: f64,
    /// `dc_b²/dτ`.
    pub dc_b2: f64,
    /// Recombination rate.
    pub rate: f64,
}

/// The `thermodynamics_at_z` external interface, §6.
pub trait ThermodynamicsTable: Sync {
    /// Evaluate thermodynamic quantities at redshift `z`.
    fn thermodynamics_at_z(
        &self,
        z: f64,
        background: &BackgroundRow,
        last_index: &mut LastIndex,
    ) -> Result<ThermoRow>;
}

/// An analytic flat ΛCDM background, accurate enough to exercise the
/// integrator end to end. Not intended for production use: real callers
/// should interpolate a precomputed background table instead.
pub struct AnalyticFlatLcdm {
    /// Hubble parameter today in Mpc⁻¹.
    pub h0: f64,
    /// Matter density parameter today.
    pub omega_m: f64,
    /// Radiation density parameter today.
    pub omega_r: f64,
    /// Conformal time today, precomputed by integration at construction.
    tau_today: f64,
}

impl AnalyticFlatLcdm {
    /// Builds the background, integrating `τ(a)` once to cache `τ_today`.
    #[must_use]
    pub fn new(h0: f64, omega_m: f64, omega_r: f64) -> Self {
        let mut this = Self {
            h0,
            omega_m,
            omega_r,
            tau_today: 0.0,
        };
        this.tau_today = this.tau_of_a(1.0);
        this
    }

    /// `H(a)` in Mpc⁻¹ for flat ΛCDM with only matter + radiation + a
    /// cosmological constant filling the remainder.
    fn h_of_a(&self, a: f64) -> f64 {
        let omega_l = 1.0 - self.omega_m - self.omega_r;
        self.h0
            * (self.omega_r / a.powi(4) + self.omega_m / a.powi(3) + omega_l).sqrt()
    }

    /// `τ(a) = ∫₀^a da' / (a'² H(a'))` by adaptive Simpson quadrature with a
    /// change of variables `a' = a·u` to regularize the `a→0` endpoint.
    fn tau_of_a(&self, a: f64) -> f64 {
        let n = 20_000;
        let mut sum = 0.0;
        let da = a / n as f64;
        for i in 0..n {
            let a0 = da * i as f64 + 1e-12;
            let a1 = da * (i as f64 + 1.0);
            let f = |x: f64| 1.0 / (x * x * self.h_of_a(x));
            // Simpson's rule on [a0, a1]
            let am = 0.5 * (a0 + a1);
            sum += (a1 - a0) / 6.0 * (f(a0) + 4.0 * f(am) + f(a1));
        }
        sum
    }

    /// `a(τ)` by bisection against [`Self::tau_of_a`].
    fn a_of_tau(&self, tau: f64) -> f64 {
        let mut lo = 1e-10_f64;
        let mut hi = 1.0_f64.max(2.0);
        while self.tau_of_a(hi) < tau {
            hi *= 2.0;
        }
        for _ in 0..100 {
            let mid = 0.5 * (lo + hi);
            if self.tau_of_a(mid) < tau {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }
}

impl BackgroundTable for AnalyticFlatLcdm {
    fn background_at_tau(
        &self,
        tau: f64,
        _level: BackgroundLevel,
        last_index: &mut LastIndex,
    ) -> Result<BackgroundRow> {
        if tau <= 0.0 {
            return Err(Error::Numerical {
                tau,
                message: "requested background at tau <= 0".to_string(),
            });
        }
        let a = self.a_of_tau(tau);
        let h = self.h_of_a(a);
        let a_h = a * h;
        if a_h == 0.0 {
            return Err(Error::Numerical {
                tau,
                message: "aH vanished".to_string(),
            });
        }
        last_index.0 = last_index.0.wrapping_add(1);
        let eps = 1e-6 * tau.max(1.0);
        let a_h_next = {
            let a2 = self.a_of_tau(tau + eps);
            a2 * self.h_of_a(a2)
        };
        let a_h_prime = (a_h_next - a_h) / eps;

        let omega_l = 1.0 - self.omega_m - self.omega_r;
        let rho = vec![
            self.omega_r / a.powi(4),
            self.omega_m / a.powi(3),
            omega_l,
        ];
        let p = vec![rho[0] / 3.0, 0.0, -omega_l];

        Ok(BackgroundRow {
            a,
            a_h,
            a_h_prime,
            rho,
            p,
        })
    }

    fn tau_today(&self) -> f64 {
        self.tau_today
    }

    fn a0_h0(&self) -> f64 {
        self.h0
    }

    fn curvature(&self) -> f64 {
        0.0
    }
}

/// A toy instantaneous-recombination thermal history: `x_e` transitions
/// smoothly from `1` to a frozen residual ionization around a configured
/// redshift. Exists purely so the engine can be driven end to end in tests
/// without a real recombination code.
pub struct ToyRecombination {
    /// Redshift of recombination.
    pub z_rec: f64,
    /// Width of the transition in redshift.
    pub width: f64,
    /// Thomson cross section times baryon number density today, setting the
    /// overall scale of `κ′` before recombination.
    pub kappa_prime_scale: f64,
}

impl ThermodynamicsTable for ToyRecombination {
    fn thermodynamics_at_z(
        &self,
        z: f64,
        background: &BackgroundRow,
        last_index: &mut LastIndex,
    ) -> Result<ThermoRow> {
        last_index.0 = last_index.0.wrapping_add(1);
        let x_e = 0.5 * (1.0 + ((z - self.z_rec) / self.width).tanh()) * 0.99 + 0.01;
        let a = background.a;
        let kappa_prime = self.kappa_prime_scale * x_e / (a * a);
        if kappa_prime < 0.0 {
            return Err(Error::Numerical {
                tau: 0.0,
                message: format!("kappa_prime negative at z={z}"),
            });
        }
        let g = {
            let dxe_dz = {
                let dz = 1e-4 * self.width;
                let xe2 = 0.5 * (1.0 + ((z + dz - self.z_rec) / self.width).tanh()) * 0.99 + 0.01;
                (xe2 - x_e) / dz
            };
            (-dxe_dz).max(0.0) / self.width.max(1e-12)
        };
        Ok(ThermoRow {
            x_e,
            g,
            kappa_prime,
            kappa_prime_prime: 0.0,
            kappa_prime_prime_prime: 0.0,
            t_b: 2.725 * (1.0 + z),
            c_b2: 1e-5 * (1.0 + z),
            dc_b2: 0.0,
            rate: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_lcdm_tau_today_is_positive_and_monotone_in_a() {
        let bg = AnalyticFlatLcdm::new(1.0 / 2997.9, 0.31, 9.2e-5);
        assert!(bg.tau_today() > 0.0);
        let mut idx = LastIndex::default();
        let row_early = bg
            .background_at_tau(bg.tau_today() * 1e-3, BackgroundLevel::Normal, &mut idx)
            .unwrap();
        let row_late = bg
            .background_at_tau(bg.tau_today() * 0.9, BackgroundLevel::Normal, &mut idx)
            .unwrap();
        assert!(row_late.a > row_early.a);
    }

    #[test]
    fn toy_recombination_x_e_between_zero_and_one() {
        let thermo = ToyRecombination {
            z_rec: 1100.0,
            width: 80.0,
            kappa_prime_scale: 1.0,
        };
        let bg_row = BackgroundRow {
            a: 1.0 / 1101.0,
            ..Default::default()
        };
        let mut idx = LastIndex::default();
        let row = thermo
            .thermodynamics_at_z(1100.0, &bg_row, &mut idx)
            .unwrap();
        assert!(row.x_e > 0.0 && row.x_e <= 1.0);
        assert!(row.kappa_prime >= 0.0);
    }
}
