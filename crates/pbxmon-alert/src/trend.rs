//! Sliding-window trend classification for contact round-trip latency.
//!
//! A single high RTT sample is noise; a sustained run is not. Severity is
//! therefore decided from suffix windows of the capped history: the shorter
//! the window, the higher the bound it must clear and the higher the tier.
//! Tier bookkeeping lives in per-tier condition states, while the episode's
//! overall start is carried separately so recovery reports the full span of
//! the high-latency episode regardless of how tiers shifted within it.

use crate::escalation::{self, BreachKind, DebouncePolicy};
use chrono::{DateTime, Duration, Utc};
use pbxmon_common::types::{
    ConditionKey, ConditionState, DeviceAlertState, RttBounds, RttSample, Tier,
};

/// Maximum samples kept per contact; oldest evicted first.
pub const HISTORY_CAP: usize = 12;

/// Window length that must be fully breached for each tier.
pub fn window_len(tier: Tier) -> usize {
    match tier {
        Tier::Critical => 4,
        Tier::Severe => 8,
        Tier::Attention => 12,
    }
}

/// Appends a sample, evicting from the front past [`HISTORY_CAP`].
pub fn push_sample(history: &mut Vec<RttSample>, sample: RttSample) {
    history.push(sample);
    if history.len() > HISTORY_CAP {
        let excess = history.len() - HISTORY_CAP;
        history.drain(..excess);
    }
}

/// Trend verdict for one contact's history.
#[derive(Debug, Clone)]
pub enum TrendClass {
    /// The tier whose full window is breached; highest tier wins.
    Breached {
        tier: Tier,
        window: usize,
        avg_ms: f64,
        window_start: DateTime<Utc>,
    },
    /// A full attention window sits at or under the attention bound.
    Settled,
    /// Not enough samples, or a mixed window.
    Inconclusive,
}

/// Classifies the history in strict critical → severe → attention order,
/// using only windows with their full sample count.
pub fn classify(history: &[RttSample], bounds: &RttBounds) -> TrendClass {
    for tier in [Tier::Critical, Tier::Severe, Tier::Attention] {
        let window = window_len(tier);
        if history.len() < window {
            continue;
        }
        let tail = &history[history.len() - window..];
        if tail.iter().all(|s| s.rtt_ms > bounds.bound(tier)) {
            let avg_ms = tail.iter().map(|s| s.rtt_ms).sum::<f64>() / window as f64;
            return TrendClass::Breached {
                tier,
                window,
                avg_ms,
                window_start: tail[0].timestamp,
            };
        }
    }

    if history.len() >= window_len(Tier::Attention)
        && history[history.len() - window_len(Tier::Attention)..]
            .iter()
            .all(|s| s.rtt_ms <= bounds.bound(Tier::Attention))
    {
        return TrendClass::Settled;
    }

    TrendClass::Inconclusive
}

/// Decision for one contact after one RTT sample.
#[derive(Debug, Clone)]
pub enum RttOutcome {
    Silent,
    Alert {
        tier: Tier,
        kind: BreachKind,
        since: DateTime<Utc>,
        avg_ms: f64,
        window: usize,
    },
    Recover {
        /// Highest tier active when the episode settled.
        tier: Tier,
        since: DateTime<Utc>,
        duration: Duration,
    },
}

/// Feeds one parsed RTT sample through the trend state machine.
pub fn track_rtt(
    state: &mut DeviceAlertState,
    contact: &str,
    sample: RttSample,
    bounds: &RttBounds,
    now: DateTime<Utc>,
) -> RttOutcome {
    let history = state.rtt_history.entry(contact.to_string()).or_default();
    push_sample(history, sample);

    match classify(history, bounds) {
        TrendClass::Inconclusive => RttOutcome::Silent,
        TrendClass::Breached {
            tier,
            window,
            avg_ms,
            window_start,
        } => breach_tier(state, contact, tier, window, avg_ms, window_start, now),
        TrendClass::Settled => settle(state, contact, now),
    }
}

#[allow(clippy::too_many_arguments)]
fn breach_tier(
    state: &mut DeviceAlertState,
    contact: &str,
    tier: Tier,
    window: usize,
    avg_ms: f64,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> RttOutcome {
    let key = ConditionKey::RttTier {
        contact: contact.to_string(),
        tier,
    };
    let policy = DebouncePolicy::for_tier(tier);

    if let Some(existing) = state.conditions.get_mut(&key) {
        if !escalation::should_notify(Some(existing), now, policy) {
            return RttOutcome::Silent;
        }
        existing.repeat_count += 1;
        existing.last_alert_at = now;
        return RttOutcome::Alert {
            tier,
            kind: BreachKind::Repeat,
            since: existing.since,
            avg_ms,
            window,
        };
    }

    // Tier changed within the episode (or a fresh episode started): clear
    // the stale tier states so their timers do not linger.
    let mut displaced: Option<ConditionState> = None;
    for other in [Tier::Critical, Tier::Severe, Tier::Attention] {
        if other == tier {
            continue;
        }
        if let Some(old) = state.conditions.remove(&ConditionKey::RttTier {
            contact: contact.to_string(),
            tier: other,
        }) {
            displaced = Some(old);
        }
    }

    // The episode's start survives tier movement; seeded from the first
    // confirmed window breach.
    state
        .rtt_episode_since
        .entry(contact.to_string())
        .or_insert(window_start);

    match displaced {
        None => {
            state.conditions.insert(
                key,
                ConditionState {
                    since: window_start,
                    last_alert_at: now,
                    repeat_count: 1,
                    tier,
                    inherited_interval_mins: None,
                },
            );
            RttOutcome::Alert {
                tier,
                kind: BreachKind::New,
                since: window_start,
                avg_ms,
                window,
            }
        }
        Some(old) if old.tier < tier => {
            // Escalation: no debounce already earned for the higher tier,
            // fire immediately.
            state.conditions.insert(
                key,
                ConditionState {
                    since: window_start,
                    last_alert_at: now,
                    repeat_count: 1,
                    tier,
                    inherited_interval_mins: None,
                },
            );
            RttOutcome::Alert {
                tier,
                kind: BreachKind::Escalate,
                since: window_start,
                avg_ms,
                window,
            }
        }
        Some(old) => {
            // De-escalation: the stricter tier's debounce window carries
            // over so the softer tier cannot re-alert early.
            let inherited = old
                .inherited_interval_mins
                .unwrap_or(DebouncePolicy::for_tier(old.tier).interval_mins);
            let mut fresh = ConditionState {
                since: window_start,
                last_alert_at: old.last_alert_at,
                repeat_count: 0,
                tier,
                inherited_interval_mins: Some(inherited),
            };
            let notify = escalation::should_notify(Some(&fresh), now, policy);
            if notify {
                fresh.repeat_count = 1;
                fresh.last_alert_at = now;
            }
            let since = fresh.since;
            state.conditions.insert(key, fresh);
            if notify {
                RttOutcome::Alert {
                    tier,
                    kind: BreachKind::Escalate,
                    since,
                    avg_ms,
                    window,
                }
            } else {
                RttOutcome::Silent
            }
        }
    }
}

fn settle(state: &mut DeviceAlertState, contact: &str, now: DateTime<Utc>) -> RttOutcome {
    let mut earliest: Option<DateTime<Utc>> = None;
    let mut highest: Option<Tier> = None;
    for tier in [Tier::Critical, Tier::Severe, Tier::Attention] {
        if let Some(old) = state.conditions.remove(&ConditionKey::RttTier {
            contact: contact.to_string(),
            tier,
        }) {
            highest.get_or_insert(tier);
            earliest = Some(match earliest {
                Some(ts) => ts.min(old.since),
                None => old.since,
            });
        }
    }

    let episode = state.rtt_episode_since.remove(contact);
    match (highest, earliest) {
        (Some(tier), Some(tier_since)) => {
            let since = episode.unwrap_or(tier_since);
            RttOutcome::Recover {
                tier,
                since,
                duration: now - since,
            }
        }
        _ => RttOutcome::Silent,
    }
}
