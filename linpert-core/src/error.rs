//! Error taxonomy for the perturbation and transfer engine.
//!
//! Errors are grouped the way §7 of the specification groups them: failures
//! that are fatal at configuration time, failures that indicate an
//! inconsistent grid, numerical failures discovered while evaluating
//! external tables, and failures of the stiff integrator itself. All four
//! are represented as explicit variants rather than folded into a single
//! string so that the scheduler (`dispatch`) can tell a fatal
//! misconfiguration (abort everything before dispatching) apart from a
//! single task's integration failure (abort the stage, but only after every
//! already-dispatched task has run to completion).

use thiserror::Error;

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A fatal error discovered while validating a [`crate::config::Precision`]
    /// or the species/mode/gauge combination requested of the engine.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A fatal error discovered while constructing the k-, ℓ- or τ-grids,
    /// or the hyperspherical q-list, e.g. non-monotone k after merging
    /// output points, or a request to evaluate Φℓ beyond a precomputed
    /// HIS's `x_max`.
    #[error("grid inconsistency: {0}")]
    GridInconsistency(String),

    /// A fatal numerical error encountered while evaluating an external
    /// table or an algebraic closure, e.g. `κ′` negative or `aH = 0` at a
    /// queried τ. Carries the offending τ for diagnostics.
    #[error("numerical error at tau={tau}: {message}")]
    Numerical {
        /// The conformal time at which the error was detected.
        tau: f64,
        /// Human-readable description of what went wrong.
        message: String,
    },

    /// The stiff integrator reported failure while advancing a single
    /// `(mode, ic, k)` task. Fatal for that task; the scheduler folds it
    /// into a stage-wide failure once all dispatched tasks complete.
    #[error("integration failed for k={k} at tau={tau}: {message}")]
    Integration {
        /// The wavenumber of the failing task.
        k: f64,
        /// The conformal time at which the integrator gave up.
        tau: f64,
        /// Human-readable description of what went wrong.
        message: String,
    },

    /// Error that does not originate from this crate.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
