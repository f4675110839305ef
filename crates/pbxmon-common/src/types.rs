use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One telemetry snapshot reported by a device.
///
/// The payload is kept as raw JSON because devices report a mix of shapes:
/// plain numbers, percentage strings, container-name lists and per-line SIP
/// status maps. The evaluator resolves paths into it lazily.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Alert severity tier, ordered from lowest to highest urgency.
///
/// # Examples
///
/// ```
/// use pbxmon_common::types::Tier;
///
/// let tier: Tier = "severe".parse().unwrap();
/// assert_eq!(tier, Tier::Severe);
/// assert_eq!(tier.to_string(), "severe");
/// assert!(Tier::Critical > Tier::Attention);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Attention,
    Severe,
    Critical,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Attention => write!(f, "attention"),
            Tier::Severe => write!(f, "severe"),
            Tier::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "attention" => Ok(Tier::Attention),
            "severe" => Ok(Tier::Severe),
            "critical" => Ok(Tier::Critical),
            _ => Err(format!("unknown tier: {s}")),
        }
    }
}

/// Lifecycle stage of an alert event within one condition episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    New,
    Repeat,
    Escalate,
    Recover,
    Transition,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::New => write!(f, "new"),
            AlertKind::Repeat => write!(f, "repeat"),
            AlertKind::Escalate => write!(f, "escalate"),
            AlertKind::Recover => write!(f, "recover"),
            AlertKind::Transition => write!(f, "transition"),
        }
    }
}

/// One alert or recovery decision produced by the engine for a reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: String,
    pub device_id: String,
    /// String form of the [`ConditionKey`] this event belongs to.
    pub condition: String,
    pub tier: Tier,
    pub kind: AlertKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Registration status of one SIP line as reported by the device.
///
/// `Registered` is nominal; everything else is a fault label. Labels are
/// mutually exclusive, so at most one fault condition may be active per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipStatus {
    Registered,
    Rejected,
    Unregistered,
    NotAvailable,
    Unknown,
}

impl SipStatus {
    /// Maps the raw status string from a reading. Empty strings and
    /// `"Not Avail"` mean the device could not report a status; anything
    /// unrecognized is `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "Registered" => SipStatus::Registered,
            "Rejected" => SipStatus::Rejected,
            "Unregistered" => SipStatus::Unregistered,
            "" | "Not Avail" => SipStatus::NotAvailable,
            _ => SipStatus::Unknown,
        }
    }

    /// Returns the fault label, or `None` when the line is nominal.
    pub fn fault(self) -> Option<SipFault> {
        match self {
            SipStatus::Registered => None,
            SipStatus::Rejected => Some(SipFault::Rejected),
            SipStatus::Unregistered => Some(SipFault::Unregistered),
            SipStatus::NotAvailable => Some(SipFault::NotAvailable),
            SipStatus::Unknown => Some(SipFault::Unknown),
        }
    }
}

/// The abnormal registration labels a SIP line can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SipFault {
    Rejected,
    Unregistered,
    NotAvailable,
    Unknown,
}

impl SipFault {
    pub const ALL: [SipFault; 4] = [
        SipFault::Rejected,
        SipFault::Unregistered,
        SipFault::NotAvailable,
        SipFault::Unknown,
    ];

    /// Human label used in messages and condition keys.
    pub fn as_str(self) -> &'static str {
        match self {
            SipFault::Rejected => "Rejected",
            SipFault::Unregistered => "Unregistered",
            SipFault::NotAvailable => "Not Avail",
            SipFault::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for SipFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SipFault {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Rejected" => Ok(SipFault::Rejected),
            "Unregistered" => Ok(SipFault::Unregistered),
            "Not Avail" => Ok(SipFault::NotAvailable),
            "Unknown" => Ok(SipFault::Unknown),
            _ => Err(format!("unknown sip fault label: {s}")),
        }
    }
}

/// Identity of one trackable condition on a device.
///
/// Keys are a closed set instead of runtime-assembled field-name strings, so
/// the full state space is visible to the compiler. They serialize to a
/// compact string form for use as JSON map keys.
///
/// # Examples
///
/// ```
/// use pbxmon_common::types::{ConditionKey, SipFault, Tier};
///
/// let key = ConditionKey::SipFault {
///     line: "sip101".into(),
///     fault: SipFault::Rejected,
/// };
/// let s = key.to_string();
/// assert_eq!(s, "sip:sip101:Rejected");
/// assert_eq!(s.parse::<ConditionKey>().unwrap(), key);
///
/// let key = ConditionKey::RttTier { contact: "trunk-a".into(), tier: Tier::Critical };
/// assert_eq!(key.to_string(), "rtt:trunk-a:critical");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ConditionKey {
    /// A configured threshold metric, optionally narrowed to one element of
    /// an array path (e.g. a single container or interface).
    Metric { path: String, item: Option<String> },
    /// One fault label of one monitored SIP line.
    SipFault { line: String, fault: SipFault },
    /// The reading carried an empty registration-status map.
    SipStatusUnavailable,
    /// The RTT probe for a contact returned no parsable sample.
    RttUnavailable { contact: String },
    /// One severity tier of a contact's RTT trend.
    RttTier { contact: String, tier: Tier },
}

impl std::fmt::Display for ConditionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionKey::Metric { path, item: None } => write!(f, "metric:{path}"),
            ConditionKey::Metric {
                path,
                item: Some(item),
            } => write!(f, "metric:{path}:{item}"),
            ConditionKey::SipFault { line, fault } => write!(f, "sip:{line}:{fault}"),
            ConditionKey::SipStatusUnavailable => write!(f, "sip-status-unavailable"),
            ConditionKey::RttUnavailable { contact } => write!(f, "rtt-unavail:{contact}"),
            ConditionKey::RttTier { contact, tier } => write!(f, "rtt:{contact}:{tier}"),
        }
    }
}

impl std::str::FromStr for ConditionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "sip-status-unavailable" {
            return Ok(ConditionKey::SipStatusUnavailable);
        }
        let (tag, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed condition key: {s}"))?;
        match tag {
            "metric" => match rest.split_once(':') {
                Some((path, item)) => Ok(ConditionKey::Metric {
                    path: path.to_string(),
                    item: Some(item.to_string()),
                }),
                None => Ok(ConditionKey::Metric {
                    path: rest.to_string(),
                    item: None,
                }),
            },
            "sip" => {
                let (line, fault) = rest
                    .split_once(':')
                    .ok_or_else(|| format!("malformed sip condition key: {s}"))?;
                Ok(ConditionKey::SipFault {
                    line: line.to_string(),
                    fault: fault.parse()?,
                })
            }
            "rtt-unavail" => Ok(ConditionKey::RttUnavailable {
                contact: rest.to_string(),
            }),
            "rtt" => {
                let (contact, tier) = rest
                    .split_once(':')
                    .ok_or_else(|| format!("malformed rtt condition key: {s}"))?;
                Ok(ConditionKey::RttTier {
                    contact: contact.to_string(),
                    tier: tier.parse()?,
                })
            }
            _ => Err(format!("unknown condition key tag: {tag}")),
        }
    }
}

impl From<ConditionKey> for String {
    fn from(key: ConditionKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for ConditionKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Persisted bookkeeping for one ongoing condition.
///
/// Exists exactly while the condition is in breach; deleted on recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionState {
    /// First time this condition was detected. Never modified once set.
    pub since: DateTime<Utc>,
    /// Timestamp of the most recent emitted notification.
    pub last_alert_at: DateTime<Utc>,
    /// How many notifications this episode has emitted.
    pub repeat_count: u32,
    /// Current severity of the condition.
    pub tier: Tier,
    /// Debounce interval inherited from a stricter RTT tier after
    /// de-escalation within the same episode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherited_interval_mins: Option<i64>,
}

/// One RTT measurement kept in the trend history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RttSample {
    pub timestamp: DateTime<Utc>,
    pub rtt_ms: f64,
}

/// Full persisted alerting state for one device.
///
/// Owned exclusively by the alert engine; collaborators only load and save
/// it whole. Cleared entirely when the device goes offline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceAlertState {
    #[serde(default)]
    pub conditions: BTreeMap<ConditionKey, ConditionState>,
    /// Per-contact RTT trend history, capped at 12 samples.
    #[serde(default)]
    pub rtt_history: BTreeMap<String, Vec<RttSample>>,
    /// Start of the ongoing high-RTT episode per contact, carried across
    /// tier escalations and de-escalations.
    #[serde(default)]
    pub rtt_episode_since: BTreeMap<String, DateTime<Utc>>,
    /// Set when the device was marked offline; the next reading turns this
    /// into a single offline-recovery event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_since: Option<DateTime<Utc>>,
}

impl DeviceAlertState {
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
            && self.rtt_history.is_empty()
            && self.rtt_episode_since.is_empty()
            && self.offline_since.is_none()
    }
}

/// Comparison operator for threshold evaluation.
///
/// # Examples
///
/// ```
/// use pbxmon_common::types::CompareOp;
///
/// let op: CompareOp = ">".parse().unwrap();
/// assert_eq!(op, CompareOp::GreaterThan);
/// assert_eq!(op.inverse(), "<=");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum CompareOp {
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    Equal,
    NotEqual,
    /// Set-membership negation: breaches when the value is absent from the
    /// configured allow-list.
    NotIncludes,
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompareOp::GreaterThan => write!(f, ">"),
            CompareOp::LessThan => write!(f, "<"),
            CompareOp::GreaterEqual => write!(f, ">="),
            CompareOp::LessEqual => write!(f, "<="),
            CompareOp::Equal => write!(f, "=="),
            CompareOp::NotEqual => write!(f, "!="),
            CompareOp::NotIncludes => write!(f, "!includes"),
        }
    }
}

impl std::str::FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">" => Ok(CompareOp::GreaterThan),
            "<" => Ok(CompareOp::LessThan),
            ">=" => Ok(CompareOp::GreaterEqual),
            "<=" => Ok(CompareOp::LessEqual),
            "==" => Ok(CompareOp::Equal),
            "!=" => Ok(CompareOp::NotEqual),
            "!includes" => Ok(CompareOp::NotIncludes),
            _ => Err(format!("unknown compare operator: {s}")),
        }
    }
}

impl CompareOp {
    /// The inverse operator string, used in "expected" descriptions.
    pub fn inverse(self) -> &'static str {
        match self {
            CompareOp::GreaterThan => "<=",
            CompareOp::LessThan => ">=",
            CompareOp::GreaterEqual => "<",
            CompareOp::LessEqual => ">",
            CompareOp::Equal => "!=",
            CompareOp::NotEqual => "==",
            CompareOp::NotIncludes => "includes",
        }
    }
}

impl From<CompareOp> for String {
    fn from(op: CompareOp) -> Self {
        op.to_string()
    }
}

impl TryFrom<String> for CompareOp {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Pre-comparison value transform applied by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ValueTransform {
    /// 0.0–1.0 fraction into a 0–100 percentage.
    FractionToPercent,
    /// Megabyte figure into bytes.
    MbToBytes,
    /// Bytes-per-second rate from a byte-counter delta against the previous
    /// reading, divided by elapsed seconds.
    ByteRate,
}

impl std::fmt::Display for ValueTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueTransform::FractionToPercent => write!(f, "fraction_to_percent"),
            ValueTransform::MbToBytes => write!(f, "mb_to_bytes"),
            ValueTransform::ByteRate => write!(f, "byte_rate"),
        }
    }
}

impl std::str::FromStr for ValueTransform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fraction_to_percent" => Ok(ValueTransform::FractionToPercent),
            "mb_to_bytes" => Ok(ValueTransform::MbToBytes),
            "byte_rate" => Ok(ValueTransform::ByteRate),
            _ => Err(format!("unknown value transform: {s}")),
        }
    }
}

impl From<ValueTransform> for String {
    fn from(t: ValueTransform) -> Self {
        t.to_string()
    }
}

impl TryFrom<String> for ValueTransform {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Threshold and debounce parameters for one severity tier of a metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSpec {
    /// Threshold value: a number, a string with a unit ("500 MB", "85%"),
    /// or an array (allow-lists for `!includes`).
    pub threshold: serde_json::Value,
    /// Minimum minutes between repeat notifications; tier default if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_mins: Option<i64>,
    /// Notification cap per episode; tier default if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_repeats: Option<u32>,
}

impl TierSpec {
    pub fn threshold(value: impl Into<serde_json::Value>) -> Self {
        Self {
            threshold: value.into(),
            interval_mins: None,
            max_repeats: None,
        }
    }
}

/// Configuration of one monitored metric path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub op: CompareOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<ValueTransform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<TierSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severe: Option<TierSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attention: Option<TierSpec>,
}

impl MetricConfig {
    /// The spec for a tier, if configured.
    pub fn tier_spec(&self, tier: Tier) -> Option<&TierSpec> {
        match tier {
            Tier::Critical => self.critical.as_ref(),
            Tier::Severe => self.severe.as_ref(),
            Tier::Attention => self.attention.as_ref(),
        }
    }
}

/// RTT trend bounds in milliseconds, one per severity tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RttBounds {
    #[serde(default = "RttBounds::default_critical")]
    pub critical_ms: f64,
    #[serde(default = "RttBounds::default_severe")]
    pub severe_ms: f64,
    #[serde(default = "RttBounds::default_attention")]
    pub attention_ms: f64,
}

impl RttBounds {
    fn default_critical() -> f64 {
        250.0
    }
    fn default_severe() -> f64 {
        200.0
    }
    fn default_attention() -> f64 {
        150.0
    }

    pub fn bound(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Critical => self.critical_ms,
            Tier::Severe => self.severe_ms,
            Tier::Attention => self.attention_ms,
        }
    }
}

impl Default for RttBounds {
    fn default() -> Self {
        Self {
            critical_ms: Self::default_critical(),
            severe_ms: Self::default_severe(),
            attention_ms: Self::default_attention(),
        }
    }
}

/// Per-device alerting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Metric path to threshold rule, evaluated in path order.
    #[serde(default)]
    pub thresholds: BTreeMap<String, MetricConfig>,
    /// SIP lines whose registration status is tracked.
    #[serde(default)]
    pub monitored_lines: Vec<String>,
    /// SIP contacts whose round-trip latency is tracked.
    #[serde(default)]
    pub monitored_contacts: Vec<String>,
    #[serde(default)]
    pub rtt_bounds: RttBounds,
}

/// Format a duration as a human-readable "X min Y sec" string.
///
/// # Examples
///
/// ```
/// use chrono::Duration;
/// use pbxmon_common::types::format_duration;
///
/// assert_eq!(format_duration(Duration::seconds(95)), "1 min 35 sec");
/// assert_eq!(format_duration(Duration::seconds(-3)), "0 min 0 sec");
/// ```
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.num_seconds().max(0);
    format!("{} min {} sec", total_secs / 60, total_secs % 60)
}
