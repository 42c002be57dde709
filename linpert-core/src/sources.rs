//! Source function storage, §3 "source functions `S(k,τ)`" and §4.P step 5
//! "sample one scalar per `(source kind, k, τ)` into a dense table indexed
//! the same way across every wavenumber task so the transfer stage can
//! treat it as a flat matrix".

use std::collections::BTreeMap;

/// Which physical source a column of [`SourceTable`] holds.
///
/// [`Self::Temperature`], [`Self::Doppler`] and [`Self::Quadrupole`] are the
/// three scalar temperature components (SCALAR_T0/T1/T2, §4.T.4) that
/// [`crate::transfer::radial`] convolves against `Φ`, `Φ′` and `Φ″`
/// respectively and sums into one `Δ_l^T(k)`; they are stored as separate
/// columns here only because each needs a different radial function.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SourceKind {
    /// CMB temperature monopole + integrated Sachs-Wolfe (SCALAR_T0).
    Temperature,
    /// CMB temperature Doppler term (SCALAR_T1), convolved with `Φ′`.
    Doppler,
    /// CMB temperature polarization-coupled quadrupole term (SCALAR_T2),
    /// convolved with `Φ″`.
    Quadrupole,
    /// CMB E-mode polarization.
    EPolarization,
    /// CMB lensing potential.
    Lensing,
    /// Galaxy number counts for selection bin `index`.
    NumberCount(usize),
    /// Redshift-space-distortion correction to galaxy number counts for
    /// selection bin `index` (NC_RSD), convolved with `Φ′`.
    NumberCountRsd(usize),
    /// Galaxy weak-lensing shear for selection bin `index`.
    GalaxyLensing(usize),
}

/// One `(mode, initial condition, k)` task's sampled source functions over
/// the τ grid it was integrated on.
#[derive(Clone, Debug, Default)]
pub struct SourceTable {
    /// The τ grid the sources are sampled on (shared across all kinds for
    /// this task).
    pub tau: Vec<f64>,
    columns: BTreeMap<SourceKind, Vec<f64>>,
}

impl SourceTable {
    /// Allocates an empty table over `tau`, with no kinds populated yet.
    #[must_use]
    pub fn new(tau: Vec<f64>) -> Self {
        Self {
            tau,
            columns: BTreeMap::new(),
        }
    }

    /// Appends one sample for `kind` at the next τ index; callers must call
    /// this once per kind per τ step, in τ order, or [`Self::column`] will
    /// disagree in length with [`Self::tau`].
    pub fn push(&mut self, kind: SourceKind, value: f64) {
        self.columns.entry(kind).or_default().push(value);
    }

    /// Read access to one source kind's values, aligned with `self.tau`.
    #[must_use]
    pub fn column(&self, kind: SourceKind) -> &[f64] {
        self.columns.get(&kind).map_or(&[], Vec::as_slice)
    }

    /// Which kinds have been populated.
    pub fn kinds(&self) -> impl Iterator<Item = SourceKind> + '_ {
        self.columns.keys().copied()
    }
}

/// A per-wavenumber table of derived species densities/velocities sampled
/// alongside the source functions, output for diagnostic/plotting use.
#[derive(Clone, Debug, Default)]
pub struct SpeciesDiagnosticsTable {
    /// The τ grid, shared with the owning [`SourceTable`].
    pub tau: Vec<f64>,
    /// `(species name, field name) -> values`.
    columns: BTreeMap<(String, &'static str), Vec<f64>>,
}

impl SpeciesDiagnosticsTable {
    /// Allocates an empty table over `tau`.
    #[must_use]
    pub fn new(tau: Vec<f64>) -> Self {
        Self {
            tau,
            columns: BTreeMap::new(),
        }
    }

    /// Appends a sample of `field` (`"delta"` or `"theta"`) for `species`.
    pub fn push(&mut self, species: &str, field: &'static str, value: f64) {
        self.columns
            .entry((species.to_string(), field))
            .or_default()
            .push(value);
    }

    /// Read access to one `(species, field)` column.
    #[must_use]
    pub fn column(&self, species: &str, field: &str) -> &[f64] {
        self.columns
            .iter()
            .find(|((s, f), _)| s == species && *f == field)
            .map_or(&[][..], |(_, v)| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_table_round_trips_columns() {
        let mut t = SourceTable::new(vec![1.0, 2.0, 3.0]);
        t.push(SourceKind::Temperature, 0.1);
        t.push(SourceKind::Temperature, 0.2);
        t.push(SourceKind::NumberCount(0), 5.0);
        assert_eq!(t.column(SourceKind::Temperature), &[0.1, 0.2]);
        assert_eq!(t.column(SourceKind::NumberCount(0)), &[5.0]);
        assert!(t.column(SourceKind::Lensing).is_empty());
    }

    #[test]
    fn diagnostics_table_distinguishes_species_and_field() {
        let mut d = SpeciesDiagnosticsTable::new(vec![1.0]);
        d.push("cdm", "delta", 0.5);
        d.push("baryons", "delta", 0.6);
        assert_eq!(d.column("cdm", "delta"), &[0.5]);
        assert_eq!(d.column("baryons", "delta"), &[0.6]);
    }
}
