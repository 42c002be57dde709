//! `IntegrationVector`: a struct-of-arrays with a small header describing
//! which fields are present and their offsets, §3 `IntegrationVector` and §9
//! Design Notes ("model y as a struct-of-arrays ... do not rely on pointer
//! punning across layouts").

use crate::approx::ApproxFlags;
use crate::config::Precision;
use crate::mode::{Gauge, Mode};
use crate::species::{NcdmSubtype, SpeciesEnum, SpeciesList};
use std::collections::HashMap;

/// Where one named field lives inside the flat `data` array of an
/// [`IntegrationVector`].
#[derive(Clone, Debug)]
pub struct FieldSlot {
    /// Offset of the first element.
    pub offset: usize,
    /// Number of elements.
    pub len: usize,
}

/// Describes which fields are present in a given approximation regime and
/// where they live. Stable identity: a field that exists in two successive
/// layouts keeps the same name (not necessarily the same offset) so
/// [`IntegrationVector::transition`] can copy it by name.
#[derive(Clone, Debug, Default)]
pub struct VectorLayout {
    fields: HashMap<String, FieldSlot>,
    total_len: usize,
}

impl VectorLayout {
    fn push(&mut self, name: impl Into<String>, len: usize) {
        let offset = self.total_len;
        self.fields.insert(name.into(), FieldSlot { offset, len });
        self.total_len += len;
    }

    /// Total number of scalar degrees of freedom.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Look up the slot of a named field, if present in this layout.
    #[must_use]
    pub fn slot(&self, name: &str) -> Option<&FieldSlot> {
        self.fields.get(name)
    }

    /// Whether a field is present in this layout.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    fn names(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Builds the layout for a scalar-mode integration vector active under
    /// `flags`, following the field-presence rules of §3
    /// `IntegrationVector` and §4.P.2.
    #[must_use]
    pub fn build_scalar(
        mode: Mode,
        gauge: Gauge,
        flags: ApproxFlags,
        species: &SpeciesList,
        precision: &Precision,
    ) -> Self {
        debug_assert_eq!(mode, Mode::Scalar);
        let mut l = Self::default();

        // photons
        l.push("g_delta", 1);
        l.push("g_theta", 1);
        if !flags.contains(ApproxFlags::TCA) {
            for s in species.iter() {
                if let SpeciesEnum::Photons(p) = s {
                    l.push("g_hierarchy", p.l_max.saturating_sub(1)); // l=2..=l_max
                    l.push("g_pol", p.l_max_pol + 1); // l=0..=l_max_pol
                }
            }
            let perturbed_recombination = species.iter().any(
                |s| matches!(s, SpeciesEnum::Baryons(b) if b.perturbed_recombination),
            );
            if perturbed_recombination {
                l.push("b_delta_tb", 1);
                l.push("b_delta_chi", 1);
            }
        }

        // baryons
        l.push("b_delta", 1);
        l.push("b_theta", 1);

        // cdm
        if species.iter().any(|s| matches!(s, SpeciesEnum::Cdm(_))) {
            l.push("cdm_delta", 1);
            if matches!(gauge, Gauge::Newtonian) {
                l.push("cdm_theta", 1);
            }
        }

        // ultra-relativistic neutrinos
        if let Some(SpeciesEnum::UltraRelativisticNeutrinos(u)) =
            species.iter().find(|s| matches!(s, SpeciesEnum::UltraRelativisticNeutrinos(_)))
        {
            if !flags.contains(ApproxFlags::RSA) {
                l.push("ur_delta", 1);
                l.push("ur_theta", 1);
                if flags.contains(ApproxFlags::UFA) {
                    l.push("ur_shear", 1);
                } else {
                    l.push("ur_hierarchy", u.l_max.saturating_sub(1)); // l=2..=l_max
                }
            }
        }

        // interacting dark radiation / dark matter
        if species
            .iter()
            .any(|s| matches!(s, SpeciesEnum::InteractingDarkMatter(_)))
        {
            l.push("idm_dr_delta", 1);
            l.push("idm_dr_theta", 1);
        }
        if let Some(SpeciesEnum::InteractingDarkRadiation(i)) = species
            .iter()
            .find(|s| matches!(s, SpeciesEnum::InteractingDarkRadiation(_)))
        {
            if !flags.contains(ApproxFlags::RSA_IDR) {
                l.push("idr_delta", 1);
                l.push("idr_theta", 1);
                if !flags.contains(ApproxFlags::TCA_IDM_DR) {
                    l.push("idr_hierarchy", i.l_max.saturating_sub(1));
                }
            }
        }

        // decaying cdm
        if species.iter().any(|s| matches!(s, SpeciesEnum::Dcdm(_))) {
            l.push("dcdm_delta", 1);
            l.push("dcdm_theta", 1);
        }

        // decay radiation: aggregated hierarchy plus one per channel
        let dr_species: Vec<_> = species
            .iter()
            .filter_map(|s| match s {
                SpeciesEnum::DecayRadiation(d) => Some(d),
                _ => None,
            })
            .collect();
        if !dr_species.is_empty() {
            let l_max_agg = dr_species.iter().map(|d| d.l_max).max().unwrap_or(0);
            l.push("dr_total_hierarchy", l_max_agg + 1); // l=0..=l_max_agg
            for (idx, d) in dr_species.iter().enumerate() {
                l.push(format!("dr_channel_{idx}_hierarchy"), d.l_max + 1);
            }
        }

        // ncdm
        for (idx, s) in species.0.iter().enumerate() {
            if let SpeciesEnum::Ncdm(n) = s {
                let per_bin_len = if flags.contains(ApproxFlags::NCDMFA) {
                    3
                } else {
                    n.l_max + 1
                };
                for q in 0..n.momentum_bins {
                    l.push(format!("ncdm{idx}_q{q}_psi"), per_bin_len);
                }
                let _ = n.subtype == NcdmSubtype::DecayingToDr;
            }
        }

        // fluid dark energy
        for s in species.iter() {
            if let SpeciesEnum::Fld(f) = s {
                use crate::species::FldParameterization;
                match f.parameterization {
                    FldParameterization::Explicit => {
                        l.push("fld_delta", 1);
                        l.push("fld_theta", 1);
                    }
                    FldParameterization::Ppf => {
                        l.push("fld_gamma", 1);
                    }
                }
            }
        }

        // scalar field
        if species.iter().any(|s| matches!(s, SpeciesEnum::Scf(_))) {
            l.push("scf_phi", 1);
            l.push("scf_phi_prime", 1);
        }

        // metric
        match gauge {
            Gauge::Synchronous => l.push("metric_eta", 1),
            Gauge::Newtonian => l.push("metric_phi", 1),
        }

        let _ = precision; // reserved for future field-presence knobs
        l
    }

    /// Builds the layout for a tensor-mode integration vector: `(h, h′)`
    /// plus radiation hierarchies, §3 `IntegrationVector`.
    #[must_use]
    pub fn build_tensor(species: &SpeciesList) -> Self {
        let mut l = Self::default();
        l.push("h", 1);
        l.push("h_prime", 1);
        for s in species.iter() {
            match s {
                SpeciesEnum::Photons(p) => {
                    l.push("g_t_hierarchy", p.l_max + 1);
                    l.push("g_t_pol", p.l_max_pol + 1);
                }
                SpeciesEnum::UltraRelativisticNeutrinos(u) => {
                    l.push("ur_t_hierarchy", u.l_max + 1);
                }
                _ => {}
            }
        }
        l
    }
}

/// A dense vector of physical degrees of freedom, laid out per
/// [`VectorLayout`].
#[derive(Clone, Debug)]
pub struct IntegrationVector {
    /// The layout describing which fields are present and where.
    pub layout: VectorLayout,
    /// The flat backing store.
    pub data: Vec<f64>,
}

impl IntegrationVector {
    /// Allocates a zeroed vector for `layout`.
    #[must_use]
    pub fn zeros(layout: VectorLayout) -> Self {
        let len = layout.total_len();
        Self {
            layout,
            data: vec![0.0; len],
        }
    }

    /// Read access to a named field.
    #[must_use]
    pub fn field(&self, name: &str) -> &[f64] {
        match self.layout.slot(name) {
            Some(slot) => &self.data[slot.offset..slot.offset + slot.len],
            None => &[],
        }
    }

    /// Write access to a named field.
    pub fn field_mut(&mut self, name: &str) -> &mut [f64] {
        match self.layout.slot(name) {
            Some(slot) => &mut self.data[slot.offset..slot.offset + slot.len],
            None => &mut [],
        }
    }

    /// Transitions `self` to `new_layout`: fields present in both layouts
    /// are copied verbatim by name; fields absent from `self` are left at
    /// zero for the caller to fill from a physically motivated surrogate
    /// (§4.P.2 "synthesize newly exposed fields"), §3 invariant: "never
    /// left uninitialized" is the caller's responsibility once this
    /// returns.
    #[must_use]
    pub fn transition(&self, new_layout: VectorLayout) -> Self {
        let mut out = Self::zeros(new_layout);
        for name in self.layout.names() {
            if out.layout.has(name) {
                let src = self.field(name);
                let dst = out.field_mut(name);
                let n = src.len().min(dst.len());
                dst[..n].copy_from_slice(&src[..n]);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::species::{Baryons, Cdm, Photons};

    fn species() -> SpeciesList {
        SpeciesList(vec![
            SpeciesEnum::Photons(Photons {
                l_max: 8,
                l_max_pol: 6,
            }),
            SpeciesEnum::Baryons(Baryons {
                perturbed_recombination: false,
            }),
            SpeciesEnum::Cdm(Cdm),
        ])
    }

    #[test]
    fn tca_off_exposes_hierarchy_tca_on_does_not() {
        let precision = Precision::default();
        let s = species();
        let off = VectorLayout::build_scalar(
            Mode::Scalar,
            Gauge::Synchronous,
            ApproxFlags::empty(),
            &s,
            &precision,
        );
        let on = VectorLayout::build_scalar(
            Mode::Scalar,
            Gauge::Synchronous,
            ApproxFlags::TCA,
            &s,
            &precision,
        );
        assert!(off.has("g_hierarchy"));
        assert!(!on.has("g_hierarchy"));
        assert!(off.has("g_delta") && on.has("g_delta"));
    }

    #[test]
    fn transition_preserves_shared_fields() {
        let precision = Precision::default();
        let s = species();
        let off = VectorLayout::build_scalar(
            Mode::Scalar,
            Gauge::Synchronous,
            ApproxFlags::empty(),
            &s,
            &precision,
        );
        let mut v = IntegrationVector::zeros(off);
        v.field_mut("g_delta")[0] = 1.25;
        let on = VectorLayout::build_scalar(
            Mode::Scalar,
            Gauge::Synchronous,
            ApproxFlags::TCA,
            &s,
            &precision,
        );
        let v2 = v.transition(on);
        assert_eq!(v2.field("g_delta")[0], 1.25);
        assert!(v2.field("g_hierarchy").is_empty());
    }

    #[test]
    fn cdm_theta_only_present_in_newtonian_gauge() {
        let precision = Precision::default();
        let s = species();
        let sync = VectorLayout::build_scalar(
            Mode::Scalar,
            Gauge::Synchronous,
            ApproxFlags::empty(),
            &s,
            &precision,
        );
        let newt = VectorLayout::build_scalar(
            Mode::Scalar,
            Gauge::Newtonian,
            ApproxFlags::empty(),
            &s,
            &precision,
        );
        assert!(!sync.has("cdm_theta"));
        assert!(newt.has("cdm_theta"));
    }
}
