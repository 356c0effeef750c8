use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metric kind. Gauges are overwritten on update, counters accumulate.
///
/// # Examples
///
/// ```
/// use tally_common::types::MetricKind;
///
/// let kind: MetricKind = "counter".parse().unwrap();
/// assert_eq!(kind, MetricKind::Counter);
/// assert_eq!(kind.to_string(), "counter");
/// assert!("Counter".parse::<MetricKind>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = MetricDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            _ => Err(MetricDecodeError::UnknownKind(s.to_string())),
        }
    }
}

/// Errors raised while turning wire input into a [`Metric`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricDecodeError {
    #[error("metric id must not be empty")]
    EmptyId,

    #[error("unknown metric type: {0}")]
    UnknownKind(String),

    #[error("{kind} metric is missing its `{field}` field")]
    MissingField {
        kind: MetricKind,
        field: &'static str,
    },

    #[error("{kind} metric must not carry a `{field}` field")]
    UnexpectedField {
        kind: MetricKind,
        field: &'static str,
    },

    #[error("invalid {kind} value: {raw}")]
    InvalidNumber { kind: MetricKind, raw: String },

    #[error("gauge value must be finite")]
    NonFinite,
}

/// The payload of a metric. The variant is the kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Gauge(v) => write!(f, "{v}"),
            MetricValue::Counter(d) => write!(f, "{d}"),
        }
    }
}

/// Identity of a metric. Ordered by kind, then id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub kind: MetricKind,
    pub id: String,
}

impl MetricKey {
    pub fn new(id: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for MetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// A single metric as it travels between agent, server and storage.
///
/// On the wire it is `{id, type, delta?, value?, hash?}` with exactly one
/// of `delta`/`value` present, chosen by `type`.
///
/// ```
/// use tally_common::types::{Metric, MetricValue};
///
/// let m: Metric = serde_json::from_str(r#"{"id":"PollCount","type":"counter","delta":3}"#).unwrap();
/// assert_eq!(m.value, MetricValue::Counter(3));
/// assert!(serde_json::from_str::<Metric>(r#"{"id":"PollCount","type":"counter","value":3}"#).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MetricWire", into = "MetricWire")]
pub struct Metric {
    pub id: String,
    pub value: MetricValue,
    pub hash: Option<String>,
}

impl Metric {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Gauge(value),
            hash: None,
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Counter(delta),
            hash: None,
        }
    }

    /// Builds a metric from the three path segments of a plaintext update.
    pub fn from_parts(kind: MetricKind, id: &str, raw: &str) -> Result<Self, MetricDecodeError> {
        if id.is_empty() {
            return Err(MetricDecodeError::EmptyId);
        }
        let invalid = || MetricDecodeError::InvalidNumber {
            kind,
            raw: raw.to_string(),
        };
        match kind {
            MetricKind::Counter => {
                let delta = raw.trim().parse::<i64>().map_err(|_| invalid())?;
                Ok(Self::counter(id, delta))
            }
            MetricKind::Gauge => {
                let value = raw.trim().parse::<f64>().map_err(|_| invalid())?;
                if !value.is_finite() {
                    return Err(MetricDecodeError::NonFinite);
                }
                Ok(Self::gauge(id, value))
            }
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    pub fn key(&self) -> MetricKey {
        MetricKey::new(self.id.clone(), self.kind())
    }

    pub fn delta(&self) -> Option<i64> {
        match self.value {
            MetricValue::Counter(d) => Some(d),
            MetricValue::Gauge(_) => None,
        }
    }

    pub fn gauge_value(&self) -> Option<f64> {
        match self.value {
            MetricValue::Gauge(v) => Some(v),
            MetricValue::Counter(_) => None,
        }
    }

    /// Folds an incoming value into this one: counters add (saturating),
    /// gauges and mismatched kinds are replaced.
    pub fn absorb(&mut self, incoming: MetricValue) {
        self.value = match (self.value, incoming) {
            (MetricValue::Counter(current), MetricValue::Counter(delta)) => {
                MetricValue::Counter(current.saturating_add(delta))
            }
            (_, next) => next,
        };
    }

    /// Same metric without its signature.
    pub fn unsigned(mut self) -> Self {
        self.hash = None;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetricWire {
    id: String,
    #[serde(rename = "type")]
    kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

impl TryFrom<MetricWire> for Metric {
    type Error = MetricDecodeError;

    fn try_from(wire: MetricWire) -> Result<Self, Self::Error> {
        if wire.id.is_empty() {
            return Err(MetricDecodeError::EmptyId);
        }
        let value = match (wire.kind, wire.delta, wire.value) {
            (MetricKind::Counter, Some(delta), None) => MetricValue::Counter(delta),
            (MetricKind::Gauge, None, Some(value)) if value.is_finite() => MetricValue::Gauge(value),
            (MetricKind::Gauge, None, Some(_)) => return Err(MetricDecodeError::NonFinite),
            (MetricKind::Counter, None, _) => {
                return Err(MetricDecodeError::MissingField {
                    kind: MetricKind::Counter,
                    field: "delta",
                })
            }
            (MetricKind::Counter, Some(_), Some(_)) => {
                return Err(MetricDecodeError::UnexpectedField {
                    kind: MetricKind::Counter,
                    field: "value",
                })
            }
            (MetricKind::Gauge, _, None) => {
                return Err(MetricDecodeError::MissingField {
                    kind: MetricKind::Gauge,
                    field: "value",
                })
            }
            (MetricKind::Gauge, Some(_), Some(_)) => {
                return Err(MetricDecodeError::UnexpectedField {
                    kind: MetricKind::Gauge,
                    field: "delta",
                })
            }
        };
        Ok(Metric {
            id: wire.id,
            value,
            hash: wire.hash.filter(|h| !h.is_empty()),
        })
    }
}

impl From<Metric> for MetricWire {
    fn from(metric: Metric) -> Self {
        let (delta, value) = match metric.value {
            MetricValue::Counter(d) => (Some(d), None),
            MetricValue::Gauge(v) => (None, Some(v)),
        };
        MetricWire {
            kind: metric.value.kind(),
            id: metric.id,
            delta,
            value,
            hash: metric.hash,
        }
    }
}

/// Body of `POST /value`: identifies a metric without carrying a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricLookup {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
}

impl From<MetricLookup> for MetricKey {
    fn from(lookup: MetricLookup) -> Self {
        MetricKey::new(lookup.id, lookup.kind)
    }
}

/// Immutable point-in-time copy of every collected metric.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub metrics: BTreeMap<MetricKey, Metric>,
}

impl Snapshot {
    pub fn new(metrics: BTreeMap<MetricKey, Metric>) -> Self {
        Self {
            taken_at: Some(Utc::now()),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn get(&self, id: &str, kind: MetricKind) -> Option<&Metric> {
        self.metrics.get(&MetricKey::new(id, kind))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.values()
    }

    pub fn to_vec(&self) -> Vec<Metric> {
        self.metrics.values().cloned().collect()
    }
}

impl FromIterator<Metric> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Metric>>(iter: I) -> Self {
        Snapshot::new(iter.into_iter().map(|m| (m.key(), m)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_serializes_without_value_or_hash() {
        let json = serde_json::to_string(&Metric::counter("PollCount", 5)).unwrap();
        assert_eq!(json, r#"{"id":"PollCount","type":"counter","delta":5}"#);
    }

    #[test]
    fn gauge_roundtrips_through_json() {
        let mut m = Metric::gauge("Alloc", 1234.5);
        m.hash = Some("abc".into());
        let json = serde_json::to_string(&m).unwrap();
        let back: Metric = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn decode_rejects_mismatched_fields() {
        let cases = [
            r#"{"id":"","type":"gauge","value":1}"#,
            r#"{"id":"a","type":"gauge"}"#,
            r#"{"id":"a","type":"gauge","value":1,"delta":1}"#,
            r#"{"id":"a","type":"counter","value":1.5}"#,
            r#"{"id":"a","type":"histogram","value":1}"#,
            r#"{"type":"counter","delta":1}"#,
        ];
        for case in cases {
            assert!(serde_json::from_str::<Metric>(case).is_err(), "accepted {case}");
        }
    }

    #[test]
    fn empty_hash_is_treated_as_absent() {
        let m: Metric = serde_json::from_str(r#"{"id":"a","type":"counter","delta":1,"hash":""}"#).unwrap();
        assert!(m.hash.is_none());
    }

    #[test]
    fn from_parts_parses_by_kind() {
        assert_eq!(
            Metric::from_parts(MetricKind::Gauge, "Alloc", "10.5").unwrap(),
            Metric::gauge("Alloc", 10.5)
        );
        assert_eq!(
            Metric::from_parts(MetricKind::Counter, "PollCount", "7").unwrap(),
            Metric::counter("PollCount", 7)
        );
        assert!(Metric::from_parts(MetricKind::Counter, "PollCount", "7.5").is_err());
        assert!(Metric::from_parts(MetricKind::Gauge, "Alloc", "none").is_err());
        assert_eq!(
            Metric::from_parts(MetricKind::Gauge, "Alloc", "NaN"),
            Err(MetricDecodeError::NonFinite)
        );
        assert_eq!(
            Metric::from_parts(MetricKind::Gauge, "", "1"),
            Err(MetricDecodeError::EmptyId)
        );
    }

    #[test]
    fn absorb_accumulates_counters_and_replaces_gauges() {
        let mut c = Metric::counter("c", i64::MAX - 1);
        c.absorb(MetricValue::Counter(5));
        assert_eq!(c.delta(), Some(i64::MAX));

        let mut g = Metric::gauge("g", 1.0);
        g.absorb(MetricValue::Gauge(2.0));
        assert_eq!(g.gauge_value(), Some(2.0));
    }

    #[test]
    fn gauge_display_has_no_trailing_zeroes() {
        assert_eq!(MetricValue::Gauge(10.0).to_string(), "10");
        assert_eq!(MetricValue::Gauge(0.25).to_string(), "0.25");
        assert_eq!(MetricValue::Counter(-3).to_string(), "-3");
    }

    #[test]
    fn keys_order_by_kind_then_id() {
        let snapshot: Snapshot = vec![
            Metric::counter("a", 1),
            Metric::gauge("b", 1.0),
            Metric::gauge("a", 1.0),
        ]
        .into_iter()
        .collect();
        let ids: Vec<_> = snapshot.iter().map(|m| (m.kind(), m.id.as_str())).collect();
        assert_eq!(
            ids,
            vec![
                (MetricKind::Gauge, "a"),
                (MetricKind::Gauge, "b"),
                (MetricKind::Counter, "a"),
            ]
        );
        assert!(snapshot.get("a", MetricKind::Counter).is_some());
        assert!(snapshot.taken_at.is_some());
    }

    #[test]
    fn lookup_decodes_type_field() {
        let lookup: MetricLookup = serde_json::from_str(r#"{"id":"Alloc","type":"gauge"}"#).unwrap();
        assert_eq!(MetricKey::from(lookup), MetricKey::new("Alloc", MetricKind::Gauge));
    }
}
