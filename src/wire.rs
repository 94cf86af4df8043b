use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Whether a metric value is an integer counter or a floating point reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Integer,
    Real,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Integer => "integer",
            MetricKind::Real => "real",
        }
    }
}

/// A metric value, typed according to the record's `kind`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Real(f64),
}

impl MetricValue {
    /// Returns the integer value, or None for real-typed records.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetricValue::Int(v) => Some(*v),
            MetricValue::Real(_) => None,
        }
    }

    /// Returns the value as a float regardless of kind.
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Int(v) => *v as f64,
            MetricValue::Real(v) => *v,
        }
    }
}

/// One telemetry sample or derived metric.
///
/// The wire encoding is a legacy positional array:
///
/// ```text
/// [ 97612, "/sys/net/tx_bytes", "2017-05-25T11:04:45Z", "integer", "", 10394624195, [ "eth0" ], null ]
/// ```
///
/// Timestamps carry second precision. The trailing `null` is a reserved
/// slot kept for compatibility with existing consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub asset_id: i64,
    pub path: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MetricKind,
    pub unit: String,
    pub value: MetricValue,
    pub tags: Vec<String>,
}

impl MetricRecord {
    /// Builds a real-valued derived record with no tags.
    pub fn real(
        asset_id: i64,
        path: impl Into<String>,
        timestamp: DateTime<Utc>,
        unit: &str,
        value: f64,
    ) -> Self {
        Self {
            asset_id,
            path: path.into(),
            timestamp,
            kind: MetricKind::Real,
            unit: unit.to_string(),
            value: MetricValue::Real(value),
            tags: Vec::new(),
        }
    }

    /// Builds an integer-valued derived record with no tags.
    pub fn integer(
        asset_id: i64,
        path: impl Into<String>,
        timestamp: DateTime<Utc>,
        unit: &str,
        value: i64,
    ) -> Self {
        Self {
            asset_id,
            path: path.into(),
            timestamp,
            kind: MetricKind::Integer,
            unit: unit.to_string(),
            value: MetricValue::Int(value),
            tags: Vec::new(),
        }
    }

    /// Key addressing this record's tag configuration.
    pub fn lookup_id(&self) -> String {
        lookup_id(self.asset_id, &self.path)
    }
}

/// Renders the `(asset_id, path)` tag configuration key.
pub fn lookup_id(asset_id: i64, path: &str) -> String {
    format!("{asset_id}:{path}")
}

impl Serialize for MetricRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(8))?;
        seq.serialize_element(&self.asset_id)?;
        seq.serialize_element(&self.path)?;
        seq.serialize_element(&self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true))?;
        seq.serialize_element(self.kind.as_str())?;
        seq.serialize_element(&self.unit)?;
        match &self.value {
            MetricValue::Int(v) => seq.serialize_element(v)?,
            MetricValue::Real(v) => seq.serialize_element(v)?,
        }
        seq.serialize_element(&self.tags)?;
        seq.serialize_element(&Option::<u8>::None)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for MetricRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = MetricRecord;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a legacy metric array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let asset_id: i64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let path: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let raw_ts: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let raw_kind: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(3, &self))?;
                let unit: Option<String> = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(4, &self))?;

                let kind = match raw_kind.as_str() {
                    "integer" => MetricKind::Integer,
                    "real" => MetricKind::Real,
                    other => {
                        return Err(de::Error::custom(format!("unknown metric type {other:?}")))
                    }
                };

                // The value element is typed by the preceding kind element.
                let value = match kind {
                    MetricKind::Integer => MetricValue::Int(
                        seq.next_element()?
                            .ok_or_else(|| de::Error::invalid_length(5, &self))?,
                    ),
                    MetricKind::Real => MetricValue::Real(
                        seq.next_element()?
                            .ok_or_else(|| de::Error::invalid_length(5, &self))?,
                    ),
                };

                let tags: Option<Vec<String>> = seq.next_element()?.unwrap_or_default();

                // Trailing reserved elements.
                while seq.next_element::<de::IgnoredAny>()?.is_some() {}

                let timestamp = DateTime::parse_from_rfc3339(&raw_ts)
                    .map_err(de::Error::custom)?
                    .with_timezone(&Utc);

                Ok(MetricRecord {
                    asset_id,
                    path,
                    timestamp,
                    kind,
                    unit: unit.unwrap_or_default(),
                    value,
                    tags: tags.unwrap_or_default(),
                })
            }
        }

        deserializer.deserialize_seq(RecordVisitor)
    }
}

/// Reads the asset id from the first element of an encoded record without
/// decoding the rest. Dispatcher hot path.
pub fn peek_asset_id(payload: &[u8]) -> Result<i64, serde_json::Error> {
    struct PeekVisitor;

    impl<'de> Visitor<'de> for PeekVisitor {
        type Value = i64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a metric array starting with an asset id")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<i64, A::Error> {
            let asset_id: i64 = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(0, &self))?;
            while seq.next_element::<de::IgnoredAny>()?.is_some() {}
            Ok(asset_id)
        }
    }

    struct Peek(i64);

    impl<'de> Deserialize<'de> for Peek {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_seq(PeekVisitor).map(Peek)
        }
    }

    serde_json::from_slice::<Peek>(payload).map(|p| p.0)
}
