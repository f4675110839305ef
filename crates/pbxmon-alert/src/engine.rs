//! Per-reading orchestration across all configured metrics of one device.
//!
//! `process` is pure: it consumes the prior persisted state and returns the
//! updated state plus the ordered list of alert events. Persistence and
//! delivery are the caller's concern, and readings for one device must be
//! fed in strictly in arrival order.

use crate::escalation::{self, BreachKind, DebouncePolicy};
use crate::evaluator::{self, PrevContext};
use crate::transition::{self, LineOutcome};
use crate::trend::{self, RttOutcome};
use chrono::{DateTime, Utc};
use pbxmon_common::id;
use pbxmon_common::types::{
    format_duration, AlertEvent, AlertKind, ConditionKey, DeviceAlertState, DeviceConfig, Reading,
    RttSample, SipStatus, Tier,
};
use serde_json::Value;
use std::collections::BTreeSet;

/// Payload key carrying the device's reported IP address.
const IP_KEY: &str = "ip";
/// Payload key mapping SIP line name to registration status string.
const SIP_STATUS_KEY: &str = "sipRegistrationStatus";
/// Payload key mapping SIP contact name to availability/RTT string.
const SIP_CONTACT_KEY: &str = "sipContactAvailability";

#[derive(Debug, Default)]
pub struct AlertEngine;

impl AlertEngine {
    pub fn new() -> Self {
        Self
    }

    /// Wipes the device's condition bookkeeping and stamps when it was last
    /// seen, so the next reading produces a single back-online event.
    pub fn mark_offline(&self, state: &mut DeviceAlertState, last_seen: DateTime<Utc>) {
        state.conditions.clear();
        state.rtt_history.clear();
        state.rtt_episode_since.clear();
        state.offline_since = Some(last_seen);
    }

    /// Evaluates one reading against the device's configuration.
    ///
    /// Returns the mutated state and the events for this reading, ordered by
    /// descending severity with recoveries last. Failures in one metric are
    /// isolated and never abort evaluation of the others.
    pub fn process(
        &self,
        device_id: &str,
        mut state: DeviceAlertState,
        config: &DeviceConfig,
        previous: Option<&Reading>,
        reading: &Reading,
        now: DateTime<Utc>,
    ) -> (DeviceAlertState, Vec<AlertEvent>) {
        let mut events = Vec::new();

        // Offline recovery first: the reading itself proves the device is
        // back. Condition state was wiped when it went offline; wipe again
        // in case anything was persisted in between.
        if let Some(down_since) = state.offline_since.take() {
            state.conditions.clear();
            state.rtt_history.clear();
            state.rtt_episode_since.clear();
            events.push(event(
                device_id,
                "device-online".to_string(),
                Tier::Attention,
                AlertKind::Recover,
                format!(
                    "device \"{device_id}\" is back online (down for {})",
                    format_duration(now - down_since)
                ),
                now,
            ));
        }

        self.check_ip_change(device_id, previous, reading, now, &mut events);

        let prev_ctx = previous.map(|r| PrevContext {
            payload: &r.payload,
            timestamp: r.timestamp,
        });
        for (path, metric_cfg) in &config.thresholds {
            let Some(breaches) = evaluator::evaluate(
                &reading.payload,
                reading.timestamp,
                prev_ctx,
                path,
                metric_cfg,
            ) else {
                // Unresolvable path: skip this metric, leave its state alone.
                continue;
            };

            let mut breached_keys = BTreeSet::new();
            for breach in breaches {
                let key = ConditionKey::Metric {
                    path: path.clone(),
                    item: breach.item.clone(),
                };
                breached_keys.insert(key.clone());
                let policy =
                    DebouncePolicy::for_spec(breach.tier, metric_cfg.tier_spec(breach.tier));
                if let Some(outcome) =
                    escalation::register_breach(&mut state.conditions, key.clone(), breach.tier, now, policy)
                {
                    let target = match &breach.item {
                        Some(item) => format!("{path} [{item}]"),
                        None => path.clone(),
                    };
                    let message = match outcome.kind {
                        BreachKind::New => format!(
                            "{target} is {} (expected {})",
                            breach.actual, breach.expected
                        ),
                        BreachKind::Repeat => format!(
                            "{target} is {} (expected {}), ongoing for {}",
                            breach.actual,
                            breach.expected,
                            format_duration(now - outcome.since)
                        ),
                        BreachKind::Escalate => format!(
                            "{target} is {} (expected {}), escalated after {}",
                            breach.actual,
                            breach.expected,
                            format_duration(now - outcome.since)
                        ),
                    };
                    events.push(event(
                        device_id,
                        key.to_string(),
                        breach.tier,
                        breach_kind(outcome.kind),
                        message,
                        now,
                    ));
                }
            }

            // Anything previously breached for this path that came back
            // clean recovers now, including array elements that disappeared.
            let stale: Vec<ConditionKey> = state
                .conditions
                .keys()
                .filter(|k| matches!(k, ConditionKey::Metric { path: p, .. } if p == path))
                .filter(|k| !breached_keys.contains(*k))
                .cloned()
                .collect();
            for key in stale {
                if let Some(recovery) = escalation::clear_condition(&mut state.conditions, &key, now)
                {
                    let target = match &key {
                        ConditionKey::Metric {
                            item: Some(item), ..
                        } => format!("{path} [{item}]"),
                        _ => path.clone(),
                    };
                    events.push(event(
                        device_id,
                        key.to_string(),
                        recovery.tier,
                        AlertKind::Recover,
                        format!(
                            "{target} back to normal (out of range for {})",
                            format_duration(recovery.duration)
                        ),
                        now,
                    ));
                }
            }
        }

        self.check_sip_lines(device_id, &mut state, config, reading, now, &mut events);
        self.check_rtt_contacts(device_id, &mut state, config, reading, now, &mut events);

        // Severity-descending for triage, recoveries at the end.
        events.sort_by_key(|e| (e.kind == AlertKind::Recover, std::cmp::Reverse(e.tier)));

        (state, events)
    }

    /// Stateless notice when the reported IP differs from the previous
    /// reading's.
    fn check_ip_change(
        &self,
        device_id: &str,
        previous: Option<&Reading>,
        reading: &Reading,
        now: DateTime<Utc>,
        events: &mut Vec<AlertEvent>,
    ) {
        let current = reading.payload.get(IP_KEY).and_then(Value::as_str);
        let before = previous.and_then(|r| r.payload.get(IP_KEY).and_then(Value::as_str));
        if let (Some(before), Some(current)) = (before, current) {
            if before != current {
                events.push(event(
                    device_id,
                    format!("metric:{IP_KEY}"),
                    Tier::Attention,
                    AlertKind::New,
                    format!("IP changed ({before} -> {current})"),
                    now,
                ));
            }
        }
    }

    fn check_sip_lines(
        &self,
        device_id: &str,
        state: &mut DeviceAlertState,
        config: &DeviceConfig,
        reading: &Reading,
        now: DateTime<Utc>,
        events: &mut Vec<AlertEvent>,
    ) {
        let Some(status_map) = reading
            .payload
            .get(SIP_STATUS_KEY)
            .and_then(Value::as_object)
        else {
            return;
        };

        if status_map.is_empty() {
            // The device reported the section but could not read any line.
            if let Some(outcome) = escalation::register_breach(
                &mut state.conditions,
                ConditionKey::SipStatusUnavailable,
                Tier::Critical,
                now,
                DebouncePolicy::ATTENTION,
            ) {
                events.push(event(
                    device_id,
                    ConditionKey::SipStatusUnavailable.to_string(),
                    Tier::Critical,
                    breach_kind(outcome.kind),
                    format!(
                        "SIP registration status not available, ongoing for {}",
                        format_duration(now - outcome.since)
                    ),
                    now,
                ));
            }
            return;
        }

        if let Some(recovery) =
            escalation::clear_condition(&mut state.conditions, &ConditionKey::SipStatusUnavailable, now)
        {
            events.push(event(
                device_id,
                ConditionKey::SipStatusUnavailable.to_string(),
                recovery.tier,
                AlertKind::Recover,
                format!(
                    "SIP registration status available again (not available for {})",
                    format_duration(recovery.duration)
                ),
                now,
            ));
        }

        for line in &config.monitored_lines {
            let Some(raw) = status_map.get(line).and_then(Value::as_str) else {
                continue;
            };
            let status = SipStatus::parse(raw);
            let outcome = transition::track_line(
                &mut state.conditions,
                line,
                status,
                now,
                DebouncePolicy::SEVERE,
            );
            match outcome {
                LineOutcome::Silent => {}
                LineOutcome::Alert { fault, kind, since } => {
                    let key = ConditionKey::SipFault {
                        line: line.clone(),
                        fault,
                    };
                    events.push(event(
                        device_id,
                        key.to_string(),
                        Tier::Attention,
                        breach_kind(kind),
                        format!(
                            "{} registration {fault}, ongoing for {}",
                            line.to_uppercase(),
                            format_duration(now - since)
                        ),
                        now,
                    ));
                }
                LineOutcome::Transition {
                    from,
                    to,
                    previous_duration,
                    ..
                } => {
                    let key = ConditionKey::SipFault {
                        line: line.clone(),
                        fault: to,
                    };
                    events.push(event(
                        device_id,
                        key.to_string(),
                        Tier::Attention,
                        AlertKind::Transition,
                        format!(
                            "{} registration {to} now, previously {from} for {}",
                            line.to_uppercase(),
                            format_duration(previous_duration)
                        ),
                        now,
                    ));
                }
                LineOutcome::Recover {
                    from, duration, ..
                } => {
                    let key = ConditionKey::SipFault {
                        line: line.clone(),
                        fault: from,
                    };
                    events.push(event(
                        device_id,
                        key.to_string(),
                        Tier::Attention,
                        AlertKind::Recover,
                        format!(
                            "{} registered again ({from} for {})",
                            line.to_uppercase(),
                            format_duration(duration)
                        ),
                        now,
                    ));
                }
            }
        }
    }

    fn check_rtt_contacts(
        &self,
        device_id: &str,
        state: &mut DeviceAlertState,
        config: &DeviceConfig,
        reading: &Reading,
        now: DateTime<Utc>,
        events: &mut Vec<AlertEvent>,
    ) {
        let Some(contact_map) = reading
            .payload
            .get(SIP_CONTACT_KEY)
            .and_then(Value::as_object)
        else {
            return;
        };

        for contact in &config.monitored_contacts {
            let Some(raw) = contact_map.get(contact).and_then(Value::as_str) else {
                continue;
            };

            let unavailable_key = ConditionKey::RttUnavailable {
                contact: contact.clone(),
            };
            let Some(rtt_ms) = parse_rtt(raw) else {
                // No numeric sample: a binary condition of its own, and the
                // trend history stays untouched.
                if let Some(outcome) = escalation::register_breach(
                    &mut state.conditions,
                    unavailable_key.clone(),
                    Tier::Attention,
                    now,
                    DebouncePolicy::ATTENTION,
                ) {
                    events.push(event(
                        device_id,
                        unavailable_key.to_string(),
                        Tier::Attention,
                        breach_kind(outcome.kind),
                        format!(
                            "{} RTT not available, ongoing for {}",
                            contact.to_uppercase(),
                            format_duration(now - outcome.since)
                        ),
                        now,
                    ));
                }
                continue;
            };

            if let Some(recovery) =
                escalation::clear_condition(&mut state.conditions, &unavailable_key, now)
            {
                events.push(event(
                    device_id,
                    unavailable_key.to_string(),
                    recovery.tier,
                    AlertKind::Recover,
                    format!(
                        "{} RTT available again (not available for {})",
                        contact.to_uppercase(),
                        format_duration(recovery.duration)
                    ),
                    now,
                ));
            }

            let sample = RttSample {
                timestamp: now,
                rtt_ms,
            };
            match trend::track_rtt(state, contact, sample, &config.rtt_bounds, now) {
                RttOutcome::Silent => {}
                RttOutcome::Alert {
                    tier,
                    kind,
                    since,
                    avg_ms,
                    window,
                } => {
                    let key = ConditionKey::RttTier {
                        contact: contact.clone(),
                        tier,
                    };
                    events.push(event(
                        device_id,
                        key.to_string(),
                        tier,
                        breach_kind(kind),
                        format!(
                            "{} RTT {tier} (avg {avg_ms:.1}ms over last {window} samples), high for {}",
                            contact.to_uppercase(),
                            format_duration(now - since)
                        ),
                        now,
                    ));
                }
                RttOutcome::Recover { tier, duration, .. } => {
                    let key = ConditionKey::RttTier {
                        contact: contact.clone(),
                        tier,
                    };
                    events.push(event(
                        device_id,
                        key.to_string(),
                        tier,
                        AlertKind::Recover,
                        format!(
                            "{} RTT back to normal (<= {}ms), high for {}",
                            contact.to_uppercase(),
                            config.rtt_bounds.attention_ms,
                            format_duration(duration)
                        ),
                        now,
                    ));
                }
            }
        }
    }
}

/// Extracts the RTT figure from availability strings such as
/// `"Avail (RTT: 23.512ms)"`. Returns `None` for anything unparsable.
pub fn parse_rtt(raw: &str) -> Option<f64> {
    let lower = raw.to_lowercase();
    let start = lower.find("rtt:")? + 4;
    let tail = lower[start..].trim_start();
    let end = tail
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(tail.len());
    tail[..end].parse().ok()
}

fn breach_kind(kind: BreachKind) -> AlertKind {
    match kind {
        BreachKind::New => AlertKind::New,
        BreachKind::Repeat => AlertKind::Repeat,
        BreachKind::Escalate => AlertKind::Escalate,
    }
}

fn event(
    device_id: &str,
    condition: String,
    tier: Tier,
    kind: AlertKind,
    message: String,
    now: DateTime<Utc>,
) -> AlertEvent {
    AlertEvent {
        id: id::next_id(),
        device_id: device_id.to_string(),
        condition,
        tier,
        kind,
        message,
        timestamp: now,
    }
}
