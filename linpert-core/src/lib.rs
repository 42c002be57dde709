#![warn(clippy::all)]
#![warn(missing_docs)]

//! Core numerical engine for a linear-perturbation Boltzmann solver.
//!
//! Two pipelined cores, each a per-wavenumber parallel map over an
//! independent [`dispatch::TaskPool`]:
//!
//! - [`perturbations`]: integrates the stiff perturbation hierarchy for
//!   each `(mode, initial condition, k)` and samples source functions
//!   `S(k, τ)` into [`sources::SourceTable`].
//! - [`transfer`]: convolves those sources with hyperspherical Bessel
//!   radial functions ([`hyperspherical`]) to produce multipole transfer
//!   functions `Δℓ(q)`.
//!
//! Background cosmology and thermodynamics tables are external
//! collaborators, represented here by the [`background`] traits; this
//! crate never computes `a(τ)`, `H(τ)` or recombination history itself.

pub mod approx;
pub mod background;
pub mod config;
pub mod derivs;
pub mod dispatch;
pub mod einstein;
pub mod error;
pub mod grid;
pub mod hyperspherical;
pub mod initial_conditions;
pub mod integrator;
pub mod mode;
pub mod perturbations;
pub mod sources;
pub mod species;
pub mod transfer;
pub mod vector;
pub mod workspace;

pub use error::{Error, Result};
