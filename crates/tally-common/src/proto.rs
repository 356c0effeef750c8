//! Messages and service glue for the `tally.Metrics` streaming RPC.

use crate::types::{Metric, MetricDecodeError, MetricValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MetricType {
    Gauge = 0,
    Counter = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MetricProto {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(enumeration = "MetricType", tag = "2")]
    pub r#type: i32,
    #[prost(int64, optional, tag = "3")]
    pub delta: Option<i64>,
    #[prost(double, optional, tag = "4")]
    pub value: Option<f64>,
    #[prost(string, tag = "5")]
    pub hash: String,
}

#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct SaveAck {
    #[prost(uint32, tag = "1")]
    pub applied: u32,
}

impl From<&Metric> for MetricProto {
    fn from(metric: &Metric) -> Self {
        let (kind, delta, value) = match metric.value {
            MetricValue::Counter(d) => (MetricType::Counter, Some(d), None),
            MetricValue::Gauge(v) => (MetricType::Gauge, None, Some(v)),
        };
        MetricProto {
            id: metric.id.clone(),
            r#type: kind as i32,
            delta,
            value,
            hash: metric.hash.clone().unwrap_or_default(),
        }
    }
}

impl TryFrom<MetricProto> for Metric {
    type Error = MetricDecodeError;

    fn try_from(proto: MetricProto) -> Result<Self, Self::Error> {
        if proto.id.is_empty() {
            return Err(MetricDecodeError::EmptyId);
        }
        let kind = MetricType::try_from(proto.r#type)
            .map_err(|_| MetricDecodeError::UnknownKind(proto.r#type.to_string()))?;
        let value = match kind {
            MetricType::Counter => MetricValue::Counter(proto.delta.ok_or(MetricDecodeError::MissingField {
                kind: crate::types::MetricKind::Counter,
                field: "delta",
            })?),
            MetricType::Gauge => {
                let v = proto.value.ok_or(MetricDecodeError::MissingField {
                    kind: crate::types::MetricKind::Gauge,
                    field: "value",
                })?;
                if !v.is_finite() {
                    return Err(MetricDecodeError::NonFinite);
                }
                MetricValue::Gauge(v)
            }
        };
        Ok(Metric {
            id: proto.id,
            value,
            hash: Some(proto.hash).filter(|h| !h.is_empty()),
        })
    }
}

include!(concat!(env!("OUT_DIR"), "/tally.Metrics.rs"));
