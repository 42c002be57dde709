//! Per-task scratch space, §3 `Workspace`/`TransferWorkspace`.
//!
//! One [`Workspace`] is allocated per `(k, mode)` perturbation task and
//! reused across every τ step the evolver takes for that task; one
//! [`TransferWorkspace`] is allocated per `(k, ℓ)` transfer task. Keeping
//! these as long-lived, preallocated buffers rather than re-allocating at
//! every step is what lets [`crate::dispatch`] hand one workspace to each
//! rayon worker and never touch the allocator again in the hot loop.

use crate::approx::ApproxFlags;
use crate::config::Precision;
use crate::mode::{Gauge, Mode};
use crate::species::SpeciesList;
use crate::vector::{IntegrationVector, VectorLayout};

/// Scratch space threaded through one perturbation-integration task.
#[derive(Clone, Debug)]
pub struct Workspace {
    /// Current state vector.
    pub y: IntegrationVector,
    /// Time derivative of `y` at the current τ, reused across RHS
    /// evaluations within a single evolver step.
    pub dy: Vec<f64>,
    /// Currently-active approximation flags.
    pub flags: ApproxFlags,
    /// The wavenumber this workspace belongs to.
    pub k: f64,
    /// Scratch buffer for per-species metric source terms accumulated by
    /// the Einstein closure, indexed the same as the configured species
    /// list (`δρ`, `(ρ+p)θ`, `(ρ+p)σ`).
    pub metric_sources: Vec<[f64; 3]>,
}

impl Workspace {
    /// Allocates a workspace for wavenumber `k` with no approximations
    /// active yet, sized for `mode`/`gauge`/`species`.
    #[must_use]
    pub fn new(
        k: f64,
        mode: Mode,
        gauge: Gauge,
        species: &SpeciesList,
        precision: &Precision,
    ) -> Self {
        let layout = match mode {
            Mode::Scalar => {
                VectorLayout::build_scalar(mode, gauge, ApproxFlags::empty(), species, precision)
            }
            Mode::Tensor => VectorLayout::build_tensor(species),
            Mode::Vector => VectorLayout::build_tensor(species),
        };
        let y = IntegrationVector::zeros(layout);
        let dy = vec![0.0; y.data.len()];
        Self {
            y,
            dy,
            flags: ApproxFlags::empty(),
            k,
            metric_sources: vec![[0.0; 3]; species.len()],
        }
    }

    /// Transitions the workspace to a new set of active flags, rebuilding
    /// the layout and copying shared fields by name (§4.P.2 "synthesize
    /// newly exposed fields"); `dy` is resized to match but left at zero
    /// since the RHS is always recomputed fresh after a transition.
    pub fn transition_to(
        &mut self,
        new_flags: ApproxFlags,
        mode: Mode,
        gauge: Gauge,
        species: &SpeciesList,
        precision: &Precision,
    ) {
        let new_layout = match mode {
            Mode::Scalar => VectorLayout::build_scalar(mode, gauge, new_flags, species, precision),
            Mode::Tensor | Mode::Vector => VectorLayout::build_tensor(species),
        };
        self.y = self.y.transition(new_layout);
        self.dy = vec![0.0; self.y.data.len()];
        self.flags = new_flags;
    }
}

/// Scratch space threaded through one `(k, ℓ)` radial-projection task, §4.T.
#[derive(Clone, Debug)]
pub struct TransferWorkspace {
    /// Cached hyperspherical Bessel values at the τ nodes of the current
    /// source table, refreshed whenever the τ grid or ℓ changes.
    pub bessel_values: Vec<f64>,
    /// Integrand buffer reused by the line-of-sight quadrature,
    /// `len == bessel_values.len()`.
    pub integrand: Vec<f64>,
    /// The multipole this workspace is currently evaluating.
    pub l: u32,
}

impl TransferWorkspace {
    /// Allocates a transfer workspace sized for a source table with
    /// `n_tau` rows.
    #[must_use]
    pub fn new(n_tau: usize) -> Self {
        Self {
            bessel_values: vec![0.0; n_tau],
            integrand: vec![0.0; n_tau],
            l: 0,
        }
    }

    /// Resizes the buffers in place for a new τ-grid length, reusing the
    /// allocation when the new length does not exceed capacity.
    pub fn resize(&mut self, n_tau: usize) {
        self.bessel_values.clear();
        self.bessel_values.resize(n_tau, 0.0);
        self.integrand.clear();
        self.integrand.resize(n_tau, 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::species::{Cdm, Photons, SpeciesEnum};

    fn species() -> SpeciesList {
        SpeciesList(vec![
            SpeciesEnum::Photons(Photons {
                l_max: 8,
                l_max_pol: 6,
            }),
            SpeciesEnum::Cdm(Cdm),
        ])
    }

    #[test]
    fn new_workspace_has_no_flags_and_matching_dy_len() {
        let precision = Precision::default();
        let s = species();
        let ws = Workspace::new(0.05, Mode::Scalar, Gauge::Synchronous, &s, &precision);
        assert_eq!(ws.flags, ApproxFlags::empty());
        assert_eq!(ws.dy.len(), ws.y.data.len());
        assert_eq!(ws.metric_sources.len(), s.len());
    }

    #[test]
    fn transition_to_tca_drops_hierarchy_field() {
        let precision = Precision::default();
        let s = species();
        let mut ws = Workspace::new(0.05, Mode::Scalar, Gauge::Synchronous, &s, &precision);
        assert!(ws.y.layout.has("g_hierarchy"));
        ws.transition_to(
            ApproxFlags::TCA,
            Mode::Scalar,
            Gauge::Synchronous,
            &s,
            &precision,
        );
        assert!(!ws.y.layout.has("g_hierarchy"));
        assert_eq!(ws.dy.len(), ws.y.data.len());
    }

    #[test]
    fn transfer_workspace_resize_preserves_requested_len() {
        let mut tw = TransferWorkspace::new(10);
        tw.resize(25);
        assert_eq!(tw.bessel_values.len(), 25);
        assert_eq!(tw.integrand.len(), 25);
    }
}
