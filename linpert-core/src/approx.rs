//! The approximation-switching state machine, §4.P.2.
//!
//! Six independent on/off flags are tracked as a [`bitflags`] set, the way
//! the teacher workspace already declares `bitflags` as a dependency for
//! exactly this kind of small, serializable flag set. Each flag is
//! monotone over `[τ_ini, τ_today]` — it can only turn on once, or off
//! once — and the scheduler's job is to find the handful of switch times at
//! which the active combination changes, by bisecting each flag's own
//! trigger condition independently.

use crate::background::{BackgroundLevel, BackgroundTable, LastIndex};
use crate::error::{Error, Result};
use bitflags::bitflags;

bitflags! {
    /// Which approximations are active in a given τ interval.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ApproxFlags: u8 {
        /// Tight-coupling approximation.
        const TCA = 0b0000_0001;
        /// Radiation-streaming approximation (photons + ur).
        const RSA = 0b0000_0010;
        /// Ultra-relativistic-fluid approximation.
        const UFA = 0b0000_0100;
        /// Non-cold-DM-fluid approximation.
        const NCDMFA = 0b0000_1000;
        /// Dark tight-coupling approximation (idm-dr).
        const TCA_IDM_DR = 0b0001_0000;
        /// Dark radiation-streaming approximation (idr).
        const RSA_IDR = 0b0010_0000;
    }
}

/// Quantities needed to evaluate the six trigger conditions of §4.P.2 at a
/// given τ. Computed from the background/thermodynamics tables plus the
/// wavenumber `k` of the task being scheduled.
#[derive(Clone, Copy, Debug)]
pub struct TriggerInputs {
    /// `τ_h = 1/(aH)`.
    pub tau_h: f64,
    /// `τ_k = 1/k`.
    pub tau_k: f64,
    /// `τ_c = 1/κ′`, or `+inf` if there is no Thomson scattering (e.g. after
    /// recombination opacity has frozen out to a negligible residual).
    pub tau_c: f64,
    /// `τ_c/τ_c,idm_dr` analog for the dark sector; `+inf` if no idm-dr
    /// pair is configured.
    pub tau_c_idm_dr: f64,
    /// Whether free streaming has begun (reionization-aware cutoff for
    /// RSA).
    pub past_tau_free_streaming: bool,
    /// Whether an ncdm species is present (RSA only drops `τ_k` from the
    /// timescale function when no ncdm species remains, §4.P.3).
    pub has_ncdm: bool,
}

/// A function that can evaluate [`TriggerInputs`] at an arbitrary τ, used
/// both to bisect switch times and to evaluate the active flag set directly.
pub trait TriggerTable: Sync {
    /// Evaluate the trigger inputs at `τ` for wavenumber `k`.
    fn inputs_at(&self, tau: f64, k: f64) -> Result<TriggerInputs>;
}

/// One switch event: at `tau`, `flag` transitions to `turns_on`.
#[derive(Clone, Copy, Debug)]
pub struct SwitchEvent {
    /// The conformal time of the switch.
    pub tau: f64,
    /// Which flag changes.
    pub flag: ApproxFlags,
    /// `true` if the flag turns on, `false` if it turns off.
    pub turns_on: bool,
}

/// A complete, monotone approximation schedule over `[τ_ini, τ_today]`.
#[derive(Clone, Debug)]
pub struct Schedule {
    /// Switch events in increasing τ order.
    pub events: Vec<SwitchEvent>,
    /// `flags_in_interval[i]` is active on `[boundaries[i], boundaries[i+1])`
    /// where `boundaries = [tau_ini, events[0].tau, ..., tau_today]`.
    pub flags_in_interval: Vec<ApproxFlags>,
}

impl Schedule {
    /// The τ boundaries delimiting each constant-flags interval, including
    /// `τ_ini` and `τ_today`.
    #[must_use]
    pub fn boundaries(&self, tau_ini: f64, tau_today: f64) -> Vec<f64> {
        let mut b = vec![tau_ini];
        b.extend(self.events.iter().map(|e| e.tau));
        b.push(tau_today);
        b
    }
}

/// Bisects a single scalar trigger function `g(τ)` for the τ at which it
/// crosses zero, assuming `g` is monotone on `[lo, hi]` (true by
/// construction for every trigger in §4.P.2: each can only fire once).
fn bisect_trigger(mut lo: f64, mut hi: f64, g: impl Fn(f64) -> Result<f64>) -> Result<f64> {
    let mut f_lo = g(lo)?;
    let f_hi = g(hi)?;
    if f_lo.signum() == f_hi.signum() {
        // no crossing in range: the flag is constant over the whole
        // interval, report the interval boundary closer to the sign that
        // dominates, i.e. never switches - caller treats this as "no event".
        return Ok(if f_lo > 0.0 { lo } else { hi });
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        let f_mid = g(mid)?;
        if f_mid.signum() == f_lo.signum() {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
        if (hi - lo).abs() < 1e-12 * hi.abs().max(1.0) {
            break;
        }
    }
    Ok(0.5 * (lo + hi))
}

/// Builds the full approximation schedule for wavenumber `k` over
/// `[tau_ini, tau_today]`, §4.P.2 steps 1-2.
///
/// `trigger_value(flag, tau)` returns, for the named flag, a scalar whose
/// sign is negative while the approximation should be off and positive
/// once it should be on (e.g. `tca_trigger_tau_c_over_tau_h - τ_c/τ_h` for
/// TCA, which starts positive at early times and crosses zero once as `τ_c`
/// grows). Each flag in `enabled_flags` is assumed genuinely monotone;
/// callers validate that independently via [`Schedule::validate_monotone`].
pub fn build_schedule(
    tau_ini: f64,
    tau_today: f64,
    enabled_flags: ApproxFlags,
    trigger_value: impl Fn(ApproxFlags, f64) -> Result<f64>,
) -> Result<Schedule> {
    const ALL: [ApproxFlags; 6] = [
        ApproxFlags::TCA,
        ApproxFlags::RSA,
        ApproxFlags::UFA,
        ApproxFlags::NCDMFA,
        ApproxFlags::TCA_IDM_DR,
        ApproxFlags::RSA_IDR,
    ];

    let mut events = Vec::new();
    for flag in ALL {
        if !enabled_flags.contains(flag) {
            continue;
        }
        let sign_ini = trigger_value(flag, tau_ini)?;
        let sign_today = trigger_value(flag, tau_today)?;
        if sign_ini.signum() != sign_today.signum() {
            let tau_switch =
                bisect_trigger(tau_ini, tau_today, |t| trigger_value(flag, t))?;
            events.push(SwitchEvent {
                tau: tau_switch,
                flag,
                turns_on: sign_today > 0.0,
            });
        }
    }
    events.sort_by(|a, b| a.tau.partial_cmp(&b.tau).unwrap());

    // detect simultaneous switches: fatal misconfiguration, §4.P.2 step 2.
    for w in events.windows(2) {
        if (w[1].tau - w[0].tau).abs() < 1e-9 * tau_today.max(1.0) {
            return Err(Error::Configuration(format!(
                "multiple approximation flags switch at the same tau={}: {:?} and {:?}",
                w[0].tau, w[0].flag, w[1].flag
            )));
        }
    }

    let mut flags_in_interval = Vec::with_capacity(events.len() + 1);
    let mut current = ApproxFlags::empty();
    for flag in ALL {
        if enabled_flags.contains(flag) {
            let sign_ini = trigger_value(flag, tau_ini)?;
            if sign_ini > 0.0 {
                current |= flag;
            }
        }
    }
    flags_in_interval.push(current);
    for e in &events {
        if e.turns_on {
            current |= e.flag;
        } else {
            current &= !e.flag;
        }
        flags_in_interval.push(current);
    }

    Ok(Schedule {
        events,
        flags_in_interval,
    })
}

/// Checks the §8 "monotonicity of approximation flags" invariant against an
/// observed sequence of flag snapshots sampled along a trajectory.
#[must_use]
pub fn is_monotone_sequence(flag: ApproxFlags, observed: &[ApproxFlags]) -> bool {
    let mut seen_on = false;
    for &snapshot in observed {
        let on = snapshot.contains(flag);
        if seen_on && !on {
            return false;
        }
        seen_on |= on;
    }
    true
}

/// The timescale function used by the stiff integrator, §4.P.3: `min(τ_h,
/// τ_k, τ_c)`, with `τ_c` dropped when TCA is on, and `τ_k` dropped when
/// RSA is on and no ncdm species remains.
#[must_use]
pub fn integration_timescale(flags: ApproxFlags, inputs: &TriggerInputs) -> f64 {
    let mut scale = inputs.tau_h;
    if !flags.contains(ApproxFlags::TCA) {
        scale = scale.min(inputs.tau_c);
    }
    if !(flags.contains(ApproxFlags::RSA) && !inputs.has_ncdm) {
        scale = scale.min(inputs.tau_k);
    }
    scale
}

/// Placeholder background-driven trigger table, used by
/// [`crate::perturbations`] to adapt [`BackgroundTable`]/thermodynamics
/// lookups into the scalar [`TriggerInputs`] the scheduler needs. Kept here
/// (rather than duplicated at every call site) since it is pure plumbing
/// over the external interfaces of §6.
pub struct BackgroundTriggerTable<'a> {
    /// Background table.
    pub background: &'a dyn BackgroundTable,
    /// `κ′(τ)` lookup (threaded in by the caller, who owns the
    /// thermodynamics table).
    pub kappa_prime: &'a (dyn Fn(f64) -> Result<f64> + Sync),
    /// `κ′_idm_dr(τ)` lookup, or always returns `+inf` if no idm-dr pair is
    /// configured.
    pub kappa_prime_idm_dr: &'a (dyn Fn(f64) -> Result<f64> + Sync),
    /// τ at which free streaming begins (e.g. after reionization cutoff).
    pub tau_free_streaming: f64,
    /// Whether any ncdm species is configured.
    pub has_ncdm: bool,
}

impl TriggerTable for BackgroundTriggerTable<'_> {
    fn inputs_at(&self, tau: f64, k: f64) -> Result<TriggerInputs> {
        let mut idx = LastIndex::default();
        let row = self
            .background
            .background_at_tau(tau, BackgroundLevel::Short, &mut idx)?;
        if row.a_h == 0.0 {
            return Err(Error::Numerical {
                tau,
                message: "aH vanished while evaluating approximation triggers".to_string(),
            });
        }
        let kappa_prime = (self.kappa_prime)(tau)?;
        Ok(TriggerInputs {
            tau_h: 1.0 / row.a_h,
            tau_k: 1.0 / k,
            tau_c: if kappa_prime > 0.0 {
                1.0 / kappa_prime
            } else {
                f64::INFINITY
            },
            tau_c_idm_dr: {
                let kp = (self.kappa_prime_idm_dr)(tau)?;
                if kp > 0.0 {
                    1.0 / kp
                } else {
                    f64::INFINITY
                }
            },
            past_tau_free_streaming: tau > self.tau_free_streaming,
            has_ncdm: self.has_ncdm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tca_switches_off_exactly_once() {
        // tau_c/tau_h grows monotonically with tau in this synthetic model,
        // so the trigger (trigger - ratio) crosses zero exactly once.
        let tau_ini = 1.0;
        let tau_today = 1000.0;
        let trigger = 1e-2;
        let trigger_value = |flag: ApproxFlags, tau: f64| -> Result<f64> {
            assert_eq!(flag, ApproxFlags::TCA);
            let ratio = tau / tau_today; // grows 0 -> 1
            Ok(trigger - ratio)
        };
        let schedule =
            build_schedule(tau_ini, tau_today, ApproxFlags::TCA, trigger_value).unwrap();
        assert_eq!(schedule.events.len(), 1);
        assert!(!schedule.events[0].turns_on);
        assert!(is_monotone_sequence(
            ApproxFlags::TCA,
            &schedule.flags_in_interval
        ));
    }

    #[test]
    fn simultaneous_switches_are_rejected() {
        let tau_ini = 1.0;
        let tau_today = 1000.0;
        let switch_tau = 500.0;
        let trigger_value = |_flag: ApproxFlags, tau: f64| -> Result<f64> {
            Ok(if tau < switch_tau { 1.0 } else { -1.0 })
        };
        let err = build_schedule(
            tau_ini,
            tau_today,
            ApproxFlags::TCA | ApproxFlags::UFA,
            trigger_value,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn timescale_drops_tau_c_when_tca_on() {
        let inputs = TriggerInputs {
            tau_h: 10.0,
            tau_k: 5.0,
            tau_c: 0.1,
            tau_c_idm_dr: f64::INFINITY,
            past_tau_free_streaming: false,
            has_ncdm: false,
        };
        assert!((integration_timescale(ApproxFlags::empty(), &inputs) - 0.1).abs() < 1e-12);
        assert!(
            (integration_timescale(ApproxFlags::TCA, &inputs) - 5.0).abs() < 1e-12
        );
    }
}
