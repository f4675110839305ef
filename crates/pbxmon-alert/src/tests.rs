use crate::engine::{parse_rtt, AlertEngine};
use crate::escalation::{self, BreachKind, DebouncePolicy};
use crate::evaluator::{self, PrevContext};
use crate::render::render_report;
use crate::transition::{self, LineOutcome};
use crate::trend::{self, RttOutcome, TrendClass};
use chrono::{DateTime, Duration, TimeZone, Utc};
use pbxmon_common::types::{
    AlertKind, CompareOp, ConditionKey, DeviceAlertState, DeviceConfig, MetricConfig, Reading,
    RttBounds, RttSample, SipFault, SipStatus, Tier, TierSpec,
};
use serde_json::json;
use std::collections::BTreeMap;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
}

fn reading(device: &str, ts: DateTime<Utc>, payload: serde_json::Value) -> Reading {
    Reading {
        device_id: device.to_string(),
        timestamp: ts,
        payload,
    }
}

fn metric(op: CompareOp, tier: Tier, threshold: serde_json::Value) -> MetricConfig {
    let spec = TierSpec::threshold(threshold);
    let mut cfg = MetricConfig {
        op,
        transform: None,
        critical: None,
        severe: None,
        attention: None,
    };
    match tier {
        Tier::Critical => cfg.critical = Some(spec),
        Tier::Severe => cfg.severe = Some(spec),
        Tier::Attention => cfg.attention = Some(spec),
    }
    cfg
}

fn ram_config() -> DeviceConfig {
    let mut thresholds = BTreeMap::new();
    thresholds.insert(
        "ramUsage".to_string(),
        metric(CompareOp::GreaterThan, Tier::Attention, json!("80%")),
    );
    DeviceConfig {
        thresholds,
        ..Default::default()
    }
}

// ---- evaluator ----

#[test]
fn evaluator_picks_highest_matching_tier() {
    let cfg = MetricConfig {
        op: CompareOp::GreaterThan,
        transform: None,
        critical: Some(TierSpec::threshold(json!("95%"))),
        severe: Some(TierSpec::threshold(json!("85%"))),
        attention: Some(TierSpec::threshold(json!("70%"))),
    };
    let payload = json!({ "diskUsage": "96%" });
    let breaches = evaluator::evaluate(&payload, t0(), None, "diskUsage", &cfg).unwrap();
    assert_eq!(breaches.len(), 1);
    assert_eq!(breaches[0].tier, Tier::Critical);
    assert_eq!(breaches[0].expected, "<= 95%");
    assert_eq!(breaches[0].actual, "96.00%");
}

#[test]
fn evaluator_compares_on_base_units() {
    // Threshold "500 MB" against a raw byte count; display scales, the
    // comparison does not.
    let cfg = metric(
        CompareOp::GreaterThan,
        Tier::Severe,
        json!("500 MB"),
    );
    let payload = json!({ "memUsed": 600 * 1024 * 1024 });
    let breaches = evaluator::evaluate(&payload, t0(), None, "memUsed", &cfg).unwrap();
    assert_eq!(breaches.len(), 1);
    assert_eq!(breaches[0].actual, "600.00 MB");

    let payload = json!({ "memUsed": 400 * 1024 * 1024 });
    let breaches = evaluator::evaluate(&payload, t0(), None, "memUsed", &cfg).unwrap();
    assert!(breaches.is_empty());
}

#[test]
fn evaluator_iterates_array_paths_per_element() {
    let cfg = metric(CompareOp::GreaterThan, Tier::Attention, json!(90));
    let payload = json!({
        "docker_stats": [
            { "name": "asterisk", "cpu_usage": 95.0 },
            { "name": "mysql", "cpu_usage": 10.0 },
        ]
    });
    let breaches =
        evaluator::evaluate(&payload, t0(), None, "docker_stats[].cpu_usage", &cfg).unwrap();
    assert_eq!(breaches.len(), 1);
    assert_eq!(breaches[0].item.as_deref(), Some("asterisk"));
    assert_eq!(breaches[0].actual, "95.00%");
}

#[test]
fn evaluator_not_includes_flags_missing_required_entries() {
    let cfg = metric(
        CompareOp::NotIncludes,
        Tier::Critical,
        json!(["asterisk", "mysql"]),
    );
    let payload = json!({ "containersRunning": ["mysql"] });
    let breaches =
        evaluator::evaluate(&payload, t0(), None, "containersRunning", &cfg).unwrap();
    assert_eq!(breaches.len(), 1);
    assert_eq!(breaches[0].tier, Tier::Critical);
    assert_eq!(breaches[0].expected, "includes asterisk, mysql");

    let payload = json!({ "containersRunning": ["mysql", "asterisk"] });
    let breaches =
        evaluator::evaluate(&payload, t0(), None, "containersRunning", &cfg).unwrap();
    assert!(breaches.is_empty());
}

#[test]
fn evaluator_unresolvable_path_skips_metric() {
    let cfg = metric(CompareOp::GreaterThan, Tier::Attention, json!(1));
    let payload = json!({ "other": 5 });
    assert!(evaluator::evaluate(&payload, t0(), None, "missing.deep", &cfg).is_none());
}

#[test]
fn evaluator_byte_rate_uses_previous_reading() {
    let cfg = MetricConfig {
        op: CompareOp::GreaterThan,
        transform: Some("byte_rate".parse().unwrap()),
        critical: None,
        severe: None,
        attention: Some(TierSpec::threshold(json!("1 MB"))),
    };
    let prev_payload = json!({ "network": [ { "name": "eth0", "rx_bytes": 0 } ] });
    let prev = PrevContext {
        payload: &prev_payload,
        timestamp: t0(),
    };
    // 40 MB in 10 seconds = 4 MB/s
    let payload = json!({ "network": [ { "name": "eth0", "rx_bytes": 40 * 1024 * 1024 } ] });
    let breaches = evaluator::evaluate(
        &payload,
        t0() + Duration::seconds(10),
        Some(prev),
        "network[].rx_bytes",
        &cfg,
    )
    .unwrap();
    assert_eq!(breaches.len(), 1);
    assert_eq!(breaches[0].actual, "4.00 MB/s");

    // Without a previous reading the rate cannot be formed; no breach.
    let breaches =
        evaluator::evaluate(&payload, t0(), None, "network[].rx_bytes", &cfg).unwrap();
    assert!(breaches.is_empty());
}

// ---- escalation ----

#[test]
fn first_breach_creates_state_and_notifies() {
    let mut conditions = BTreeMap::new();
    let key = ConditionKey::Metric {
        path: "ramUsage".into(),
        item: None,
    };
    let outcome = escalation::register_breach(
        &mut conditions,
        key.clone(),
        Tier::Attention,
        t0(),
        DebouncePolicy::ATTENTION,
    )
    .expect("first breach always notifies");
    assert_eq!(outcome.kind, BreachKind::New);
    assert_eq!(outcome.repeat_count, 1);

    let state = conditions.get(&key).unwrap();
    assert_eq!(state.since, t0());
    assert_eq!(state.last_alert_at, t0());
    assert_eq!(state.repeat_count, 1);
}

#[test]
fn debounce_holds_repeat_count_between_boundaries() {
    let mut conditions = BTreeMap::new();
    let key = ConditionKey::Metric {
        path: "ramUsage".into(),
        item: None,
    };
    let policy = DebouncePolicy::ATTENTION; // 30 min, max 2

    let _ = escalation::register_breach(&mut conditions, key.clone(), Tier::Attention, t0(), policy);

    // Breaching readings every 10 minutes: none clears the 30-minute gate.
    for minutes in [10, 20, 29] {
        let outcome = escalation::register_breach(
            &mut conditions,
            key.clone(),
            Tier::Attention,
            t0() + Duration::minutes(minutes),
            policy,
        );
        assert!(outcome.is_none(), "no repeat inside debounce window");
        assert_eq!(conditions.get(&key).unwrap().repeat_count, 1);
    }

    let outcome = escalation::register_breach(
        &mut conditions,
        key.clone(),
        Tier::Attention,
        t0() + Duration::minutes(30),
        policy,
    )
    .expect("debounce boundary reached");
    assert_eq!(outcome.kind, BreachKind::Repeat);
    assert_eq!(outcome.repeat_count, 2);
    // since is never touched after creation
    assert_eq!(conditions.get(&key).unwrap().since, t0());
}

#[test]
fn max_repeats_silences_episode_until_recovery() {
    let mut conditions = BTreeMap::new();
    let key = ConditionKey::Metric {
        path: "cpuUsage".into(),
        item: None,
    };
    let policy = DebouncePolicy {
        interval_mins: 1,
        max_repeats: 2,
    };

    let mut notified = 0;
    for i in 0..10 {
        if escalation::register_breach(
            &mut conditions,
            key.clone(),
            Tier::Attention,
            t0() + Duration::minutes(i * 5),
            policy,
        )
        .is_some()
        {
            notified += 1;
        }
    }
    // count 1 (new), then repeats while repeat_count <= 2
    assert_eq!(notified, 3);
    assert_eq!(conditions.get(&key).unwrap().repeat_count, 3);
}

#[test]
fn recovery_reports_duration_and_is_idempotent() {
    let mut conditions = BTreeMap::new();
    let key = ConditionKey::Metric {
        path: "ramUsage".into(),
        item: None,
    };
    let _ = escalation::register_breach(
        &mut conditions,
        key.clone(),
        Tier::Attention,
        t0(),
        DebouncePolicy::ATTENTION,
    );

    let recovery = escalation::clear_condition(&mut conditions, &key, t0() + Duration::minutes(35))
        .expect("active condition recovers");
    assert_eq!(recovery.duration, Duration::minutes(35));

    // Second clean reading: state is absent, nothing fires.
    assert!(escalation::clear_condition(&mut conditions, &key, t0() + Duration::minutes(40)).is_none());
}

// ---- transition ----

#[test]
fn line_fault_handoff_keeps_one_episode() {
    let mut conditions = BTreeMap::new();
    let policy = DebouncePolicy::SEVERE;

    // Rejected at t0
    let outcome = transition::track_line(&mut conditions, "sip101", SipStatus::Rejected, t0(), policy);
    assert!(matches!(
        outcome,
        LineOutcome::Alert {
            fault: SipFault::Rejected,
            kind: BreachKind::New,
            ..
        }
    ));

    // Flips straight to Unregistered 5 minutes later
    let outcome = transition::track_line(
        &mut conditions,
        "sip101",
        SipStatus::Unregistered,
        t0() + Duration::minutes(5),
        policy,
    );
    match outcome {
        LineOutcome::Transition {
            from,
            to,
            previous_duration,
            ..
        } => {
            assert_eq!(from, SipFault::Rejected);
            assert_eq!(to, SipFault::Unregistered);
            assert_eq!(previous_duration, Duration::minutes(5));
        }
        other => panic!("expected transition, got {other:?}"),
    }
    // Exactly one fault state exists, and it is the new label.
    assert_eq!(
        transition::active_fault(&conditions, "sip101"),
        Some(SipFault::Unregistered)
    );
    assert_eq!(conditions.len(), 1);

    // Registered 3 minutes after the flip: recovery carries only the
    // Unregistered span, not the whole episode.
    let outcome = transition::track_line(
        &mut conditions,
        "sip101",
        SipStatus::Registered,
        t0() + Duration::minutes(8),
        policy,
    );
    match outcome {
        LineOutcome::Recover { from, duration, .. } => {
            assert_eq!(from, SipFault::Unregistered);
            assert_eq!(duration, Duration::minutes(3));
        }
        other => panic!("expected recovery, got {other:?}"),
    }
    assert!(conditions.is_empty());
}

#[test]
fn nominal_line_with_no_state_stays_silent() {
    let mut conditions = BTreeMap::new();
    let outcome = transition::track_line(
        &mut conditions,
        "sip101",
        SipStatus::Registered,
        t0(),
        DebouncePolicy::SEVERE,
    );
    assert!(matches!(outcome, LineOutcome::Silent));
    assert!(conditions.is_empty());
}

#[test]
fn sip_status_strings_map_to_labels() {
    assert_eq!(SipStatus::parse("Registered"), SipStatus::Registered);
    assert_eq!(SipStatus::parse("Rejected"), SipStatus::Rejected);
    assert_eq!(SipStatus::parse(""), SipStatus::NotAvailable);
    assert_eq!(SipStatus::parse("Not Avail"), SipStatus::NotAvailable);
    assert_eq!(SipStatus::parse("Timeout?!"), SipStatus::Unknown);
}

// ---- trend ----

fn sample(ts: DateTime<Utc>, rtt_ms: f64) -> RttSample {
    RttSample {
        timestamp: ts,
        rtt_ms,
    }
}

#[test]
fn history_caps_at_twelve_dropping_oldest() {
    let mut history = Vec::new();
    for i in 0..13 {
        trend::push_sample(
            &mut history,
            sample(t0() + Duration::minutes(i), 100.0 + i as f64),
        );
    }
    assert_eq!(history.len(), 12);
    // The oldest original sample (i = 0) is gone; i = 1 leads.
    assert_eq!(history[0].rtt_ms, 101.0);
    assert_eq!(history[11].rtt_ms, 112.0);
}

#[test]
fn critical_window_wins_over_older_low_samples() {
    let bounds = RttBounds::default();
    let mut history = Vec::new();
    for i in 0..8 {
        trend::push_sample(&mut history, sample(t0() + Duration::minutes(i), 40.0));
    }
    for i in 8..12 {
        trend::push_sample(&mut history, sample(t0() + Duration::minutes(i), 260.0));
    }
    match trend::classify(&history, &bounds) {
        TrendClass::Breached { tier, window, .. } => {
            assert_eq!(tier, Tier::Critical);
            assert_eq!(window, 4);
        }
        other => panic!("expected critical breach, got {other:?}"),
    }
}

#[test]
fn partial_windows_are_inconclusive() {
    let bounds = RttBounds::default();
    let history: Vec<RttSample> = (0..3)
        .map(|i| sample(t0() + Duration::minutes(i), 300.0))
        .collect();
    assert!(matches!(
        trend::classify(&history, &bounds),
        TrendClass::Inconclusive
    ));
}

#[test]
fn trend_escalates_immediately_and_recovers_with_episode_duration() {
    let bounds = RttBounds::default();
    let mut state = DeviceAlertState::default();
    let mut now = t0();

    // Eight sustained samples just over the severe bound.
    let mut last = RttOutcome::Silent;
    for _ in 0..8 {
        last = trend::track_rtt(&mut state, "trunk-a", sample(now, 210.0), &bounds, now);
        now += Duration::minutes(1);
    }
    let severe_since = match last {
        RttOutcome::Alert {
            tier: Tier::Severe,
            kind: BreachKind::New,
            since,
            ..
        } => since,
        other => panic!("expected severe alert, got {other:?}"),
    };
    assert_eq!(severe_since, t0());

    // Four samples over the critical bound escalate without waiting out the
    // severe debounce window.
    let mut outcomes = Vec::new();
    for _ in 0..4 {
        outcomes.push(trend::track_rtt(
            &mut state,
            "trunk-a",
            sample(now, 280.0),
            &bounds,
            now,
        ));
        now += Duration::minutes(1);
    }
    assert!(matches!(
        outcomes.last(),
        Some(RttOutcome::Alert {
            tier: Tier::Critical,
            kind: BreachKind::Escalate,
            ..
        })
    ));
    // Only the critical tier state remains.
    assert!(state.conditions.contains_key(&ConditionKey::RttTier {
        contact: "trunk-a".into(),
        tier: Tier::Critical
    }));
    assert!(!state.conditions.contains_key(&ConditionKey::RttTier {
        contact: "trunk-a".into(),
        tier: Tier::Severe
    }));

    // Twelve clean samples settle the episode; the recovery spans back to
    // the first severe breach, not just the critical stretch, and reports
    // the tier that was active at the end.
    let mut recovery = None;
    for _ in 0..12 {
        if let RttOutcome::Recover { tier, since, .. } =
            trend::track_rtt(&mut state, "trunk-a", sample(now, 90.0), &bounds, now)
        {
            recovery = Some((tier, since));
        }
        now += Duration::minutes(1);
    }
    let (tier, since) = recovery.expect("episode recovers");
    assert_eq!(tier, Tier::Critical);
    assert_eq!(since, t0());
    assert!(state.conditions.is_empty());
    assert!(state.rtt_episode_since.is_empty());
}

#[test]
fn de_escalation_inherits_stricter_interval() {
    let bounds = RttBounds::default();
    let mut state = DeviceAlertState::default();
    let mut now = t0();

    // Straight to critical: 8 quiet-ish samples then 4 over the bound.
    for _ in 0..8 {
        trend::track_rtt(&mut state, "trunk-a", sample(now, 180.0), &bounds, now);
        now += Duration::minutes(1);
    }
    let mut fired_critical = false;
    for _ in 0..4 {
        if let RttOutcome::Alert {
            tier: Tier::Critical,
            ..
        } = trend::track_rtt(&mut state, "trunk-a", sample(now, 300.0), &bounds, now)
        {
            fired_critical = true;
        }
        now += Duration::minutes(1);
    }
    assert!(fired_critical);
    let critical_alert_at = now - Duration::minutes(1);

    // Latency falls back to attention territory. The attention tier would
    // normally wait 30 minutes, but it inherits the critical tier's
    // 5-minute window already earned.
    let mut alerted_at = None;
    for _ in 0..8 {
        if let RttOutcome::Alert {
            tier: Tier::Attention,
            ..
        } = trend::track_rtt(&mut state, "trunk-a", sample(now, 160.0), &bounds, now)
        {
            alerted_at = Some(now);
            break;
        }
        now += Duration::minutes(1);
    }
    let alerted_at = alerted_at.expect("attention tier alerts after inherited interval");
    let waited = alerted_at - critical_alert_at;
    assert!(waited >= Duration::minutes(5));
    assert!(
        waited < Duration::minutes(30),
        "must not wait the full attention interval, waited {waited}"
    );
}

// ---- engine ----

#[test]
fn ram_scenario_end_to_end() {
    pbxmon_common::id::init(1, 1);
    let engine = AlertEngine::new();
    let config = ram_config();
    let state = DeviceAlertState::default();

    // Reading 1: 85% at t=0
    let r1 = reading("dev-x", t0(), json!({ "ramUsage": "85%" }));
    let (state, events) = engine.process("dev-x", state, &config, None, &r1, t0());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AlertKind::New);
    assert_eq!(events[0].tier, Tier::Attention);
    let key = ConditionKey::Metric {
        path: "ramUsage".into(),
        item: None,
    };
    let cond = state.conditions.get(&key).unwrap();
    assert_eq!(cond.since, t0());
    assert_eq!(cond.last_alert_at, t0());
    assert_eq!(cond.repeat_count, 1);

    // Reading 2: 86% ten minutes later, inside the 30-minute debounce
    let now = t0() + Duration::minutes(10);
    let r2 = reading("dev-x", now, json!({ "ramUsage": "86%" }));
    let (state, events) = engine.process("dev-x", state, &config, Some(&r1), &r2, now);
    assert!(events.is_empty());
    assert_eq!(state.conditions.get(&key).unwrap().repeat_count, 1);

    // Reading 3: back to 40% at t=35min
    let now = t0() + Duration::minutes(35);
    let r3 = reading("dev-x", now, json!({ "ramUsage": "40%" }));
    let (state, events) = engine.process("dev-x", state, &config, Some(&r2), &r3, now);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AlertKind::Recover);
    assert!(events[0].message.contains("35 min 0 sec"));
    assert!(state.conditions.is_empty());

    // A fourth clean reading stays silent: recovery is not re-emitted.
    let now = t0() + Duration::minutes(40);
    let r4 = reading("dev-x", now, json!({ "ramUsage": "41%" }));
    let (_, events) = engine.process("dev-x", state, &config, Some(&r3), &r4, now);
    assert!(events.is_empty());
}

#[test]
fn metric_tier_movement_on_a_stable_key() {
    pbxmon_common::id::init(1, 1);
    let engine = AlertEngine::new();
    let mut thresholds = BTreeMap::new();
    thresholds.insert(
        "diskUsage".to_string(),
        MetricConfig {
            op: CompareOp::GreaterThan,
            transform: None,
            critical: Some(TierSpec::threshold(json!("95%"))),
            severe: None,
            attention: Some(TierSpec::threshold(json!("70%"))),
        },
    );
    let config = DeviceConfig {
        thresholds,
        ..Default::default()
    };
    let key = ConditionKey::Metric {
        path: "diskUsage".into(),
        item: None,
    };

    // 85% opens an attention episode.
    let r1 = reading("dev-x", t0(), json!({ "diskUsage": "85%" }));
    let (state, events) =
        engine.process("dev-x", DeviceAlertState::default(), &config, None, &r1, t0());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AlertKind::New);
    assert_eq!(events[0].tier, Tier::Attention);

    // 96% past the critical interval: the same key escalates, no second
    // condition appears.
    let now = t0() + Duration::minutes(6);
    let r2 = reading("dev-x", now, json!({ "diskUsage": "96%" }));
    let (state, events) = engine.process("dev-x", state, &config, Some(&r1), &r2, now);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AlertKind::Escalate);
    assert_eq!(events[0].tier, Tier::Critical);
    assert_eq!(events[0].condition, "metric:diskUsage");
    assert!(events[0].message.contains("escalated after 6 min 0 sec"));
    assert_eq!(state.conditions.len(), 1);
    let cond = state.conditions.get(&key).unwrap();
    assert_eq!(cond.tier, Tier::Critical);
    assert_eq!(cond.since, t0());

    // Back to 85%: the stored tier drops silently, the key and episode
    // survive.
    let now = t0() + Duration::minutes(7);
    let r3 = reading("dev-x", now, json!({ "diskUsage": "85%" }));
    let (state, events) = engine.process("dev-x", state, &config, Some(&r2), &r3, now);
    assert!(events.is_empty());
    let cond = state.conditions.get(&key).unwrap();
    assert_eq!(cond.tier, Tier::Attention);
    assert_eq!(cond.since, t0());

    // Clean value closes the whole episode.
    let now = t0() + Duration::minutes(10);
    let r4 = reading("dev-x", now, json!({ "diskUsage": "40%" }));
    let (state, events) = engine.process("dev-x", state, &config, Some(&r3), &r4, now);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AlertKind::Recover);
    assert!(events[0].message.contains("10 min 0 sec"));
    assert!(state.conditions.is_empty());
}

#[test]
fn sip_sequence_produces_new_transition_recover() {
    pbxmon_common::id::init(1, 1);
    let engine = AlertEngine::new();
    let config = DeviceConfig {
        monitored_lines: vec!["sip101".to_string()],
        ..Default::default()
    };
    let state = DeviceAlertState::default();

    let r1 = reading(
        "pbx-1",
        t0(),
        json!({ "sipRegistrationStatus": { "sip101": "Rejected" } }),
    );
    let (state, events) = engine.process("pbx-1", state, &config, None, &r1, t0());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AlertKind::New);
    assert_eq!(events[0].condition, "sip:sip101:Rejected");

    let now = t0() + Duration::minutes(5);
    let r2 = reading(
        "pbx-1",
        now,
        json!({ "sipRegistrationStatus": { "sip101": "Unregistered" } }),
    );
    let (state, events) = engine.process("pbx-1", state, &config, Some(&r1), &r2, now);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AlertKind::Transition);
    assert!(events[0].message.contains("Rejected for 5 min 0 sec"));

    let now = t0() + Duration::minutes(8);
    let r3 = reading(
        "pbx-1",
        now,
        json!({ "sipRegistrationStatus": { "sip101": "Registered" } }),
    );
    let (state, events) = engine.process("pbx-1", state, &config, Some(&r2), &r3, now);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AlertKind::Recover);
    // Only the Unregistered stretch; the Rejected episode is not recounted.
    assert!(events[0].message.contains("Unregistered for 3 min 0 sec"));
    assert!(state.conditions.is_empty());
}

#[test]
fn empty_registration_map_is_its_own_condition() {
    pbxmon_common::id::init(1, 1);
    let engine = AlertEngine::new();
    let config = DeviceConfig {
        monitored_lines: vec!["sip101".to_string()],
        ..Default::default()
    };

    let r1 = reading("pbx-1", t0(), json!({ "sipRegistrationStatus": {} }));
    let (state, events) =
        engine.process("pbx-1", DeviceAlertState::default(), &config, None, &r1, t0());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tier, Tier::Critical);
    assert!(state
        .conditions
        .contains_key(&ConditionKey::SipStatusUnavailable));

    let now = t0() + Duration::minutes(2);
    let r2 = reading(
        "pbx-1",
        now,
        json!({ "sipRegistrationStatus": { "sip101": "Registered" } }),
    );
    let (state, events) = engine.process("pbx-1", state, &config, Some(&r1), &r2, now);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AlertKind::Recover);
    assert!(state.conditions.is_empty());
}

#[test]
fn unavailable_rtt_sample_skips_history() {
    pbxmon_common::id::init(1, 1);
    let engine = AlertEngine::new();
    let config = DeviceConfig {
        monitored_contacts: vec!["trunk-a".to_string()],
        ..Default::default()
    };

    let r1 = reading(
        "pbx-1",
        t0(),
        json!({ "sipContactAvailability": { "trunk-a": "Not Avail" } }),
    );
    let (state, events) =
        engine.process("pbx-1", DeviceAlertState::default(), &config, None, &r1, t0());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AlertKind::New);
    assert!(state.rtt_history.is_empty(), "no sample enters the trend history");
    assert!(state.conditions.contains_key(&ConditionKey::RttUnavailable {
        contact: "trunk-a".into()
    }));

    // A parsable sample recovers the unavailable condition and feeds the
    // history.
    let now = t0() + Duration::minutes(1);
    let r2 = reading(
        "pbx-1",
        now,
        json!({ "sipContactAvailability": { "trunk-a": "Avail (RTT: 23.512ms)" } }),
    );
    let (state, events) = engine.process("pbx-1", state, &config, Some(&r1), &r2, now);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AlertKind::Recover);
    assert_eq!(state.rtt_history.get("trunk-a").unwrap().len(), 1);
}

#[test]
fn rtt_recovery_event_keyed_by_settled_tier() {
    pbxmon_common::id::init(1, 1);
    let engine = AlertEngine::new();
    let config = DeviceConfig {
        monitored_contacts: vec!["trunk-a".to_string()],
        ..Default::default()
    };

    // Quiet lead-in, a critical stretch, then a clean dozen.
    let mut state = DeviceAlertState::default();
    let mut prev: Option<Reading> = None;
    let mut now = t0();
    let mut last_events = Vec::new();
    let rtts = std::iter::repeat(180)
        .take(8)
        .chain(std::iter::repeat(300).take(4))
        .chain(std::iter::repeat(90).take(12));
    for rtt in rtts {
        let r = reading(
            "pbx-1",
            now,
            json!({ "sipContactAvailability": { "trunk-a": format!("Avail (RTT: {rtt}ms)") } }),
        );
        let (next, events) = engine.process("pbx-1", state, &config, prev.as_ref(), &r, now);
        state = next;
        if !events.is_empty() {
            last_events = events;
        }
        prev = Some(r);
        now += Duration::minutes(1);
    }

    // The episode peaked at critical, so its recovery carries that tier
    // rather than defaulting to attention.
    assert_eq!(last_events.len(), 1);
    assert_eq!(last_events[0].kind, AlertKind::Recover);
    assert_eq!(last_events[0].tier, Tier::Critical);
    assert_eq!(last_events[0].condition, "rtt:trunk-a:critical");
    assert!(state.conditions.is_empty());
    assert!(state.rtt_episode_since.is_empty());
}

#[test]
fn offline_recovery_precedes_and_clears_everything() {
    pbxmon_common::id::init(1, 1);
    let engine = AlertEngine::new();
    let config = ram_config();

    // Build up a condition, then mark the device offline.
    let r1 = reading("dev-x", t0(), json!({ "ramUsage": "85%" }));
    let (mut state, _) =
        engine.process("dev-x", DeviceAlertState::default(), &config, None, &r1, t0());
    engine.mark_offline(&mut state, t0() + Duration::minutes(5));
    assert!(state.conditions.is_empty());
    assert!(state.offline_since.is_some());

    // First reading after coming back: exactly one back-online recovery,
    // even though RAM is clean (its state was wiped with the device).
    let now = t0() + Duration::minutes(20);
    let r2 = reading("dev-x", now, json!({ "ramUsage": "40%" }));
    let (state, events) = engine.process("dev-x", state, &config, None, &r2, now);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AlertKind::Recover);
    assert!(events[0].message.contains("back online"));
    assert!(events[0].message.contains("15 min 0 sec"));
    assert!(state.offline_since.is_none());
}

#[test]
fn ip_change_emits_stateless_notice() {
    pbxmon_common::id::init(1, 1);
    let engine = AlertEngine::new();
    let config = DeviceConfig::default();

    let r1 = reading("dev-x", t0(), json!({ "ip": "10.0.0.5" }));
    let now = t0() + Duration::minutes(1);
    let r2 = reading("dev-x", now, json!({ "ip": "10.0.0.9" }));
    let (_, events) = engine.process(
        "dev-x",
        DeviceAlertState::default(),
        &config,
        Some(&r1),
        &r2,
        now,
    );
    assert_eq!(events.len(), 1);
    assert!(events[0].message.contains("10.0.0.5 -> 10.0.0.9"));

    // Same IP again: nothing.
    let now = now + Duration::minutes(1);
    let r3 = reading("dev-x", now, json!({ "ip": "10.0.0.9" }));
    let (_, events) = engine.process(
        "dev-x",
        DeviceAlertState::default(),
        &config,
        Some(&r2),
        &r3,
        now,
    );
    assert!(events.is_empty());
}

#[test]
fn events_ordered_by_severity_with_recoveries_last() {
    pbxmon_common::id::init(1, 1);
    let engine = AlertEngine::new();
    let mut thresholds = BTreeMap::new();
    thresholds.insert(
        "containersRunning".to_string(),
        metric(CompareOp::NotIncludes, Tier::Critical, json!(["asterisk"])),
    );
    thresholds.insert(
        "cpuUsage".to_string(),
        metric(CompareOp::GreaterThan, Tier::Attention, json!("90%")),
    );
    thresholds.insert(
        "ramUsage".to_string(),
        metric(CompareOp::GreaterThan, Tier::Attention, json!("80%")),
    );
    let config = DeviceConfig {
        thresholds,
        ..Default::default()
    };

    // Prior state: CPU already breached, about to recover.
    let r0 = reading(
        "dev-x",
        t0(),
        json!({ "cpuUsage": "95%", "ramUsage": "10%", "containersRunning": ["asterisk"] }),
    );
    let (state, _) = engine.process("dev-x", DeviceAlertState::default(), &config, None, &r0, t0());

    let now = t0() + Duration::minutes(1);
    let r1 = reading(
        "dev-x",
        now,
        json!({ "cpuUsage": "20%", "ramUsage": "85%", "containersRunning": ["mysql"] }),
    );
    let (_, events) = engine.process("dev-x", state, &config, Some(&r0), &r1, now);
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].tier, Tier::Critical);
    assert_eq!(events[1].tier, Tier::Attention);
    assert_ne!(events[1].kind, AlertKind::Recover);
    assert_eq!(events[2].kind, AlertKind::Recover);
}

#[test]
fn parse_rtt_extracts_milliseconds() {
    assert_eq!(parse_rtt("Avail (RTT: 23.512ms)"), Some(23.512));
    assert_eq!(parse_rtt("avail rtt: 180ms"), Some(180.0));
    assert_eq!(parse_rtt("Not Avail"), None);
    assert_eq!(parse_rtt(""), None);
}

// ---- render ----

#[test]
fn report_groups_events_into_sections() {
    pbxmon_common::id::init(1, 1);
    let engine = AlertEngine::new();
    let mut thresholds = BTreeMap::new();
    thresholds.insert(
        "containersRunning".to_string(),
        metric(CompareOp::NotIncludes, Tier::Critical, json!(["asterisk"])),
    );
    thresholds.insert(
        "ramUsage".to_string(),
        metric(CompareOp::GreaterThan, Tier::Attention, json!("80%")),
    );
    let config = DeviceConfig {
        thresholds,
        ..Default::default()
    };
    let r1 = reading(
        "dev-x",
        t0(),
        json!({ "ramUsage": "85%", "containersRunning": [] }),
    );
    let (_, events) =
        engine.process("dev-x", DeviceAlertState::default(), &config, None, &r1, t0());

    let report = render_report("dev-x", t0(), &events).expect("events render");
    assert!(report.starts_with("Device: DEV-X"));
    let critical_at = report.find("CRITICAL").unwrap();
    let notice_at = report.find("NOTIFICATION").unwrap();
    assert!(critical_at < notice_at);

    assert!(render_report("dev-x", t0(), &[]).is_none());
}
