//! Debounce and repeat-limiting for ongoing conditions.
//!
//! A condition's first breach always notifies and creates its
//! [`ConditionState`]; later breaches notify only when the tier's debounce
//! interval has elapsed and the episode's notification cap is not exhausted.
//! Recovery is never debounced.

use chrono::{DateTime, Duration, Utc};
use pbxmon_common::types::{ConditionKey, ConditionState, Tier, TierSpec};
use std::collections::BTreeMap;

/// Debounce interval and notification cap for one severity tier.
#[derive(Debug, Clone, Copy)]
pub struct DebouncePolicy {
    pub interval_mins: i64,
    pub max_repeats: u32,
}

impl DebouncePolicy {
    pub const ATTENTION: Self = Self {
        interval_mins: 30,
        max_repeats: 2,
    };
    pub const SEVERE: Self = Self {
        interval_mins: 15,
        max_repeats: 4,
    };
    pub const CRITICAL: Self = Self {
        interval_mins: 5,
        max_repeats: 6,
    };

    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Attention => Self::ATTENTION,
            Tier::Severe => Self::SEVERE,
            Tier::Critical => Self::CRITICAL,
        }
    }

    /// Tier default with per-metric overrides applied.
    pub fn for_spec(tier: Tier, spec: Option<&TierSpec>) -> Self {
        let mut policy = Self::for_tier(tier);
        if let Some(spec) = spec {
            if let Some(mins) = spec.interval_mins {
                policy.interval_mins = mins;
            }
            if let Some(max) = spec.max_repeats {
                policy.max_repeats = max;
            }
        }
        policy
    }
}

/// Whether this evaluation of an already-understood breach should emit a
/// notification.
pub fn should_notify(
    state: Option<&ConditionState>,
    now: DateTime<Utc>,
    policy: DebouncePolicy,
) -> bool {
    match state {
        None => true,
        Some(s) => {
            s.repeat_count <= policy.max_repeats
                && now - s.last_alert_at >= Duration::minutes(effective_interval(s, policy))
        }
    }
}

fn effective_interval(state: &ConditionState, policy: DebouncePolicy) -> i64 {
    state.inherited_interval_mins.unwrap_or(policy.interval_mins)
}

/// How a notified breach relates to the condition's prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachKind {
    New,
    Repeat,
    Escalate,
}

/// Outcome of a breach that cleared the debounce gate.
#[derive(Debug, Clone)]
pub struct BreachOutcome {
    pub kind: BreachKind,
    pub since: DateTime<Utc>,
    pub repeat_count: u32,
}

/// Records a breach against the condition map.
///
/// Creates the state on first breach; otherwise updates the stored tier and
/// applies the debounce gate. Returns `Some` exactly when a notification
/// should be emitted. `since` is never modified for an existing state.
pub fn register_breach(
    conditions: &mut BTreeMap<ConditionKey, ConditionState>,
    key: ConditionKey,
    tier: Tier,
    now: DateTime<Utc>,
    policy: DebouncePolicy,
) -> Option<BreachOutcome> {
    match conditions.get_mut(&key) {
        None => {
            conditions.insert(
                key,
                ConditionState {
                    since: now,
                    last_alert_at: now,
                    repeat_count: 1,
                    tier,
                    inherited_interval_mins: None,
                },
            );
            Some(BreachOutcome {
                kind: BreachKind::New,
                since: now,
                repeat_count: 1,
            })
        }
        Some(state) => {
            let kind = if tier > state.tier {
                BreachKind::Escalate
            } else {
                BreachKind::Repeat
            };
            let notify = should_notify(Some(state), now, policy);
            state.tier = tier;
            if !notify {
                return None;
            }
            state.repeat_count += 1;
            state.last_alert_at = now;
            Some(BreachOutcome {
                kind,
                since: state.since,
                repeat_count: state.repeat_count,
            })
        }
    }
}

/// Result of clearing a condition on its first clean reading.
#[derive(Debug, Clone)]
pub struct Recovery {
    pub since: DateTime<Utc>,
    pub duration: Duration,
    pub tier: Tier,
}

/// Deletes the condition and reports the episode duration. Returns `None`
/// when no state was active, so repeated clean readings stay silent.
pub fn clear_condition(
    conditions: &mut BTreeMap<ConditionKey, ConditionState>,
    key: &ConditionKey,
    now: DateTime<Utc>,
) -> Option<Recovery> {
    conditions.remove(key).map(|state| Recovery {
        since: state.since,
        duration: now - state.since,
        tier: state.tier,
    })
}
