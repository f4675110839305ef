//! Lifecycle tracking for mutually exclusive SIP registration faults.
//!
//! A line is either nominal (`Registered`) or in exactly one of four fault
//! labels. When it flips directly from one fault to another the episode
//! continues: the old label's bookkeeping is handed off without emitting a
//! recovery, so a line bouncing Rejected → Unregistered → Rejected keeps one
//! coherent narrative instead of resetting its duration on each flip.

use crate::escalation::{self, BreachKind, DebouncePolicy};
use chrono::{DateTime, Duration, Utc};
use pbxmon_common::types::{ConditionKey, ConditionState, SipFault, SipStatus, Tier};
use std::collections::BTreeMap;

/// Decision for one monitored line after one reading.
#[derive(Debug, Clone)]
pub enum LineOutcome {
    /// Nominal with no active fault, or a fault still inside its debounce
    /// window.
    Silent,
    /// The active fault should notify (first occurrence or debounced repeat).
    Alert {
        fault: SipFault,
        kind: BreachKind,
        since: DateTime<Utc>,
    },
    /// The line moved directly from one fault to another.
    Transition {
        from: SipFault,
        to: SipFault,
        previous_since: DateTime<Utc>,
        previous_duration: Duration,
    },
    /// The line returned to nominal.
    Recover {
        from: SipFault,
        since: DateTime<Utc>,
        duration: Duration,
    },
}

/// Finds the single active fault condition for a line, if any.
///
/// The tracker maintains the invariant that at most one fault state exists
/// per line across all labels.
pub fn active_fault(
    conditions: &BTreeMap<ConditionKey, ConditionState>,
    line: &str,
) -> Option<SipFault> {
    active_entry(conditions, line).map(|(fault, _)| fault)
}

/// The active fault and its episode start, found in one scan.
fn active_entry(
    conditions: &BTreeMap<ConditionKey, ConditionState>,
    line: &str,
) -> Option<(SipFault, DateTime<Utc>)> {
    SipFault::ALL.into_iter().find_map(|fault| {
        conditions
            .get(&ConditionKey::SipFault {
                line: line.to_string(),
                fault,
            })
            .map(|state| (fault, state.since))
    })
}

/// Applies one reading's status for one line against the condition map.
pub fn track_line(
    conditions: &mut BTreeMap<ConditionKey, ConditionState>,
    line: &str,
    status: SipStatus,
    now: DateTime<Utc>,
    policy: DebouncePolicy,
) -> LineOutcome {
    let active = active_entry(conditions, line);

    match (status.fault(), active) {
        (None, None) => LineOutcome::Silent,

        // Back to nominal: plain recovery against whichever label was active.
        (None, Some((previous, _))) => {
            let key = ConditionKey::SipFault {
                line: line.to_string(),
                fault: previous,
            };
            match escalation::clear_condition(conditions, &key, now) {
                Some(recovery) => LineOutcome::Recover {
                    from: previous,
                    since: recovery.since,
                    duration: recovery.duration,
                },
                None => LineOutcome::Silent,
            }
        }

        // Same fault persists: ordinary repeat mechanics.
        (Some(fault), Some((previous, _))) if fault == previous => {
            let key = ConditionKey::SipFault {
                line: line.to_string(),
                fault,
            };
            match escalation::register_breach(conditions, key, Tier::Attention, now, policy) {
                Some(outcome) => LineOutcome::Alert {
                    fault,
                    kind: outcome.kind,
                    since: outcome.since,
                },
                None => LineOutcome::Silent,
            }
        }

        // Direct flip between faults: hand the episode over to the new label.
        (Some(fault), Some((previous, previous_since))) => {
            conditions.remove(&ConditionKey::SipFault {
                line: line.to_string(),
                fault: previous,
            });
            conditions.insert(
                ConditionKey::SipFault {
                    line: line.to_string(),
                    fault,
                },
                ConditionState {
                    since: now,
                    last_alert_at: now,
                    // Continuation of the same episode, counted once.
                    repeat_count: 1,
                    tier: Tier::Attention,
                    inherited_interval_mins: None,
                },
            );
            LineOutcome::Transition {
                from: previous,
                to: fault,
                previous_since,
                previous_duration: now - previous_since,
            }
        }

        // Fresh fault on a clean line.
        (Some(fault), None) => {
            let key = ConditionKey::SipFault {
                line: line.to_string(),
                fault,
            };
            match escalation::register_breach(conditions, key, Tier::Attention, now, policy) {
                Some(outcome) => LineOutcome::Alert {
                    fault,
                    kind: outcome.kind,
                    since: outcome.since,
                },
                None => LineOutcome::Silent,
            }
        }
    }
}
