//! Plain-text report assembly for one reading's events.

use chrono::{DateTime, Utc};
use pbxmon_common::types::{AlertEvent, AlertKind, Tier};

/// Groups events into severity sections under a device header, ready for an
/// opaque delivery channel. Returns `None` when there is nothing to say.
pub fn render_report(
    device_id: &str,
    now: DateTime<Utc>,
    events: &[AlertEvent],
) -> Option<String> {
    if events.is_empty() {
        return None;
    }

    let mut criticals = Vec::new();
    let mut attentions = Vec::new();
    let mut notices = Vec::new();
    let mut recoveries = Vec::new();
    for event in events {
        let bucket = if event.kind == AlertKind::Recover {
            &mut recoveries
        } else {
            match event.tier {
                Tier::Critical => &mut criticals,
                Tier::Severe => &mut attentions,
                Tier::Attention => &mut notices,
            }
        };
        bucket.push(format!("- {}", event.message));
    }

    let mut sections = Vec::new();
    for (title, lines) in [
        ("CRITICAL", criticals),
        ("ATTENTION", attentions),
        ("NOTIFICATION", notices),
        ("RECOVERY", recoveries),
    ] {
        if !lines.is_empty() {
            sections.push(format!("{title}\n{}", lines.join("\n")));
        }
    }

    Some(format!(
        "Device: {}\nTime: {}\n\n{}",
        device_id.to_uppercase(),
        now.format("%H:%M:%S"),
        sections.join("\n\n")
    ))
}
