//! Normalized entity data structures
//!
//! Every streamed topic carries exactly one entity. Entities are stored as a
//! flat map of field name to [`FieldValue`] so deltas can be merged field by
//! field without knowing the concrete entity shape.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TerminalError;

/// Kind of entity streamed by the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Live instrument quote (bid/ask/last)
    Instrument,
    /// Account position in an instrument
    Position,
    /// Deal ticket (a submitted or working trade)
    DealTicket,
}

impl EntityKind {
    /// Identifier used in topic keys and REST paths
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Instrument => "instrument",
            EntityKind::Position => "position",
            EntityKind::DealTicket => "deal",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = TerminalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "instrument" | "quote" => Ok(EntityKind::Instrument),
            "position" => Ok(EntityKind::Position),
            "deal" | "deal_ticket" | "dealticket" => Ok(EntityKind::DealTicket),
            _ => Err(TerminalError::parse(format!("Unknown entity kind: {}", s))),
        }
    }
}

/// Identity of a normalized entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A single field value of an entity
///
/// Numbers are kept as [`Decimal`] so prices never pick up float noise.
/// On the wire they are JSON numbers and text stays a JSON string, so
/// `Text("123")` never comes back as a number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Number(Decimal),
    Text(String),
    Bool(bool),
    Null,
}

impl FieldValue {
    /// Convert a JSON value into a field value.
    ///
    /// Numbers are parsed through their textual form; objects and arrays are
    /// kept as JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Bool(*b),
            serde_json::Value::Number(n) => {
                let text = n.to_string();
                Decimal::from_str(&text)
                    .or_else(|_| Decimal::from_scientific(&text))
                    .map(FieldValue::Number)
                    .unwrap_or(FieldValue::Text(text))
            }
            serde_json::Value::String(s) => FieldValue::Text(s.clone()),
            other => FieldValue::Text(other.to_string()),
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            FieldValue::Number(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Decimal> for FieldValue {
    fn from(value: Decimal) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(Decimal::from(value))
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(d) => write!(f, "{}", d),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Null => f.write_str("null"),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Number(d) => {
                if let Some(i) = d.fract().is_zero().then(|| d.to_i64()).flatten() {
                    serializer.serialize_i64(i)
                } else if let Some(f) = d.to_f64() {
                    serializer.serialize_f64(f)
                } else {
                    serializer.collect_str(d)
                }
            }
            FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::Bool(b) => serializer.serialize_bool(*b),
            FieldValue::Null => serializer.serialize_unit(),
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(FieldValue::from_json(&value))
    }
}

/// Ordered field map; ordering keeps serialized records stable
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Convert a JSON object payload into a field map.
///
/// Returns `None` if the payload is not an object.
pub fn fields_from_json(payload: &serde_json::Value) -> Option<FieldMap> {
    let object = payload.as_object()?;
    Some(
        object
            .iter()
            .map(|(name, value)| (name.clone(), FieldValue::from_json(value)))
            .collect(),
    )
}

/// Canonical record of an entity as last confirmed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub key: EntityKey,

    /// Sequence number of the last applied snapshot or delta
    pub version: u64,

    pub fields: FieldMap,

    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn new(key: EntityKey, version: u64, fields: FieldMap, updated_at: DateTime<Utc>) -> Self {
        Self {
            key,
            version,
            fields,
            updated_at,
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn decimal(&self, field: &str) -> Option<Decimal> {
        self.get(field).and_then(FieldValue::as_decimal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_entity_kind_round_trip_names() {
        assert_eq!("deal".parse::<EntityKind>().unwrap(), EntityKind::DealTicket);
        assert_eq!("Deal_Ticket".parse::<EntityKind>().unwrap(), EntityKind::DealTicket);
        assert_eq!(EntityKind::Instrument.to_string(), "instrument");
        assert!("order".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_numbers_parse_without_float_noise() {
        assert_eq!(FieldValue::from_json(&json!(1.1)), FieldValue::Number(dec!(1.1)));
        assert_eq!(FieldValue::from_json(&json!(100)), FieldValue::Number(dec!(100)));
    }

    #[test]
    fn test_field_values_keep_their_variant_through_json() {
        let values = vec![
            FieldValue::Text("123".to_string()),
            FieldValue::Number(dec!(101.25)),
            FieldValue::Number(dec!(100)),
            FieldValue::Bool(false),
            FieldValue::Null,
        ];

        let text = serde_json::to_string(&values).unwrap();
        assert_eq!(text, r#"["123",101.25,100,false,null]"#);

        let back: Vec<FieldValue> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn test_fields_from_json() {
        let fields = fields_from_json(&json!({
            "bid": 1.0842,
            "side": "buy",
            "open": true,
            "note": null,
            "legs": [1, 2]
        }))
        .unwrap();

        assert_eq!(fields["bid"], FieldValue::Number(dec!(1.0842)));
        assert_eq!(fields["side"], FieldValue::Text("buy".to_string()));
        assert_eq!(fields["open"], FieldValue::Bool(true));
        assert_eq!(fields["note"], FieldValue::Null);
        assert_eq!(fields["legs"], FieldValue::Text("[1,2]".to_string()));

        assert!(fields_from_json(&json!([1, 2])).is_none());
    }
}
