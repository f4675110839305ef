//! Stateless threshold evaluation for one metric path of one reading.
//!
//! Resolves scalar and array paths into the raw JSON payload, applies the
//! optional pre-transform, and tests the value against the configured tiers
//! in strict critical → severe → attention order.

use chrono::{DateTime, Utc};
use pbxmon_common::types::{CompareOp, MetricConfig, Tier, ValueTransform};
use serde_json::Value;

/// One confirmed breach for a metric target. Array paths can produce one
/// breach per element (e.g. per container).
#[derive(Debug, Clone)]
pub struct Breach {
    /// Element name for array paths (`docker_stats[].cpu_usage`), `None`
    /// for scalar paths.
    pub item: Option<String>,
    pub tier: Tier,
    /// The offending value, normalized into a human unit.
    pub actual: String,
    /// Human description of the nominal range, built from the inverse of
    /// the matched operator.
    pub expected: String,
}

/// The previous reading's payload and timestamp, for delta-based transforms.
/// Supplied explicitly by the caller so no hidden cache couples devices.
#[derive(Debug, Clone, Copy)]
pub struct PrevContext<'a> {
    pub payload: &'a Value,
    pub timestamp: DateTime<Utc>,
}

/// A resolved metric value in comparable form.
#[derive(Debug, Clone)]
enum Actual {
    Num(f64),
    Text(String),
    List(Vec<String>),
}

/// Evaluates one configured metric path against the payload.
///
/// Returns `None` when the metric could not be evaluated at all (path
/// unresolvable); the caller must then leave any active condition for the
/// path untouched. Returns `Some` with zero or more breaches otherwise.
/// Never panics on malformed input.
pub fn evaluate(
    payload: &Value,
    timestamp: DateTime<Utc>,
    previous: Option<PrevContext<'_>>,
    path: &str,
    cfg: &MetricConfig,
) -> Option<Vec<Breach>> {
    if let Some((base, sub)) = split_array_path(path) {
        let items = match resolve(payload, base) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => {
                tracing::warn!(path, "metric path unresolvable, skipping");
                return None;
            }
        };

        let mut breaches = Vec::new();
        for (index, entry) in items.iter().enumerate() {
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| index.to_string());
            let raw = if sub.is_empty() {
                Some(entry)
            } else {
                resolve(entry, sub)
            };
            let Some(raw) = raw else {
                tracing::debug!(path, item = %name, "array element lacks sub-path, skipping element");
                continue;
            };
            if let Some(breach) =
                evaluate_target(raw, payload, timestamp, previous, path, Some(&name), cfg)
            {
                breaches.push(breach);
            }
        }
        Some(breaches)
    } else {
        let Some(raw) = resolve(payload, path) else {
            tracing::warn!(path, "metric path unresolvable, skipping");
            return None;
        };
        let breach = evaluate_target(raw, payload, timestamp, previous, path, None, cfg);
        Some(breach.into_iter().collect())
    }
}

fn evaluate_target(
    raw: &Value,
    payload: &Value,
    timestamp: DateTime<Utc>,
    previous: Option<PrevContext<'_>>,
    path: &str,
    item: Option<&str>,
    cfg: &MetricConfig,
) -> Option<Breach> {
    let Some(mut actual) = extract(raw) else {
        tracing::debug!(path, "metric value not interpretable, skipping");
        return None;
    };

    if let Some(transform) = cfg.transform {
        actual = apply_transform(transform, actual, payload, timestamp, previous, path, item)?;
    }

    // Strict severity order; the first matching tier wins.
    for tier in [Tier::Critical, Tier::Severe, Tier::Attention] {
        let Some(spec) = cfg.tier_spec(tier) else {
            continue;
        };
        match check(cfg.op, &actual, &spec.threshold) {
            Some(true) => {
                return Some(Breach {
                    item: item.map(str::to_string),
                    tier,
                    actual: display_actual(&actual, path, cfg.transform),
                    expected: format!("{} {}", cfg.op.inverse(), display_threshold(&spec.threshold)),
                });
            }
            Some(false) => {}
            None => {
                tracing::warn!(path, op = %cfg.op, "operator not applicable to value, skipping tier");
            }
        }
    }
    None
}

/// Splits `docker_stats[].cpu_usage` into `("docker_stats", "cpu_usage")`.
fn split_array_path(path: &str) -> Option<(&str, &str)> {
    let (base, rest) = path.split_once("[]")?;
    Some((base, rest.strip_prefix('.').unwrap_or(rest)))
}

/// Walks a dot-separated path into nested JSON objects.
fn resolve<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn extract(raw: &Value) -> Option<Actual> {
    match raw {
        Value::Number(n) => n.as_f64().map(Actual::Num),
        Value::String(s) => match parse_measure(s) {
            Some(v) => Some(Actual::Num(v)),
            None => Some(Actual::Text(s.clone())),
        },
        Value::Array(items) => Some(Actual::List(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        )),
        Value::Bool(b) => Some(Actual::Text(b.to_string())),
        _ => None,
    }
}

/// Parses a number with an optional binary unit ("1.5 GB", "85%", "120 KB/s")
/// into base units (bytes, or the bare number for percentages).
pub fn parse_measure(s: &str) -> Option<f64> {
    let s = s.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
        .unwrap_or(s.len());
    let num: f64 = s[..digits_end].parse().ok()?;
    let unit = s[digits_end..].trim().trim_end_matches("/s").trim();
    let factor = match unit.to_uppercase().as_str() {
        "" | "%" => 1.0,
        "B" => 1.0,
        "KB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1024.0_f64.powi(4),
        _ => return None,
    };
    Some(num * factor)
}

fn threshold_num(threshold: &Value) -> Option<f64> {
    match threshold {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_measure(s),
        _ => None,
    }
}

fn apply_transform(
    transform: ValueTransform,
    actual: Actual,
    payload: &Value,
    timestamp: DateTime<Utc>,
    previous: Option<PrevContext<'_>>,
    path: &str,
    item: Option<&str>,
) -> Option<Actual> {
    let Actual::Num(value) = actual else {
        tracing::debug!(path, %transform, "transform requires a numeric value, skipping");
        return None;
    };
    match transform {
        ValueTransform::FractionToPercent => Some(Actual::Num(value * 100.0)),
        ValueTransform::MbToBytes => Some(Actual::Num(value * 1024.0 * 1024.0)),
        ValueTransform::ByteRate => {
            let prev = previous?;
            let prev_value = resolve_counterpart(prev.payload, path, item)?;
            let elapsed = (timestamp - prev.timestamp).num_seconds();
            if elapsed <= 0 {
                tracing::debug!(path, "non-positive elapsed time between readings, skipping rate");
                return None;
            }
            Some(Actual::Num((value - prev_value) / elapsed as f64))
        }
    }
    // The comparison below always runs on base units; display formatting is
    // applied separately and never feeds back into the check.
}

/// Resolves the same metric target in the previous reading's payload,
/// matching array elements by name rather than position.
fn resolve_counterpart(prev_payload: &Value, path: &str, item: Option<&str>) -> Option<f64> {
    let raw = match (split_array_path(path), item) {
        (Some((base, sub)), Some(name)) => {
            let items = resolve(prev_payload, base)?.as_array()?;
            let entry = items
                .iter()
                .find(|e| e.get("name").and_then(Value::as_str) == Some(name))?;
            resolve(entry, sub)?
        }
        _ => resolve(prev_payload, path)?,
    };
    match extract(raw)? {
        Actual::Num(v) => Some(v),
        _ => None,
    }
}

fn check(op: CompareOp, actual: &Actual, threshold: &Value) -> Option<bool> {
    match op {
        CompareOp::NotIncludes => {
            let allowed: Vec<&str> = threshold
                .as_array()?
                .iter()
                .filter_map(Value::as_str)
                .collect();
            match actual {
                // Allow-list check: breach when the value is not sanctioned.
                Actual::Text(s) => Some(!allowed.contains(&s.as_str())),
                Actual::Num(n) => Some(!allowed.contains(&format_num(*n).as_str())),
                // Liveness check: breach when any required entry is missing
                // from the reported list.
                Actual::List(present) => {
                    Some(allowed.iter().any(|req| !present.iter().any(|p| p == req)))
                }
            }
        }
        CompareOp::Equal | CompareOp::NotEqual => {
            let eq = match (actual, threshold) {
                (Actual::Text(s), Value::String(t)) => s == t,
                (Actual::Num(n), _) => {
                    let t = threshold_num(threshold)?;
                    (n - t).abs() < f64::EPSILON
                }
                _ => return None,
            };
            Some(if op == CompareOp::Equal { eq } else { !eq })
        }
        _ => {
            let Actual::Num(value) = actual else {
                return None;
            };
            let t = threshold_num(threshold)?;
            Some(match op {
                CompareOp::GreaterThan => *value > t,
                CompareOp::LessThan => *value < t,
                CompareOp::GreaterEqual => *value >= t,
                CompareOp::LessEqual => *value <= t,
                _ => unreachable!("numeric arm only"),
            })
        }
    }
}

fn format_num(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{v:.0}")
    } else {
        format!("{v:.2}")
    }
}

fn is_percent_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.contains("percent") || lower.contains("usage")
}

fn is_rate_path(path: &str, transform: Option<ValueTransform>) -> bool {
    transform == Some(ValueTransform::ByteRate) || path.starts_with("network")
}

/// Formats a value for display: percentages and rates keep their suffix,
/// everything else is scaled to the largest byte unit under 1024.
fn display_actual(actual: &Actual, path: &str, transform: Option<ValueTransform>) -> String {
    match actual {
        Actual::Text(s) => s.clone(),
        Actual::List(items) => items.join(", "),
        Actual::Num(v) => {
            if is_percent_path(path) {
                format!("{v:.2}%")
            } else if is_rate_path(path, transform) {
                let (scaled, unit) = to_best_unit(*v);
                format!("{scaled:.2} {unit}/s")
            } else {
                let (scaled, unit) = to_best_unit(*v);
                format!("{scaled:.2} {unit}")
            }
        }
    }
}

fn display_threshold(threshold: &Value) -> String {
    match threshold {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

fn to_best_unit(bytes: f64) -> (f64, &'static str) {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes;
    let mut index = 0;
    while value.abs() >= 1024.0 && index < UNITS.len() - 1 {
        value /= 1024.0;
        index += 1;
    }
    (value, UNITS[index])
}
