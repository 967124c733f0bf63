//! # Input Normalizer
//!
//! Maps an open-world input record onto the closed-world feature schema. The
//! output always has exactly one slot per schema feature, in schema order.
//! Keys outside the schema are dropped. Coercion to a number never fails the
//! record: a value that cannot become a finite number is recorded as missing,
//! together with the reason, and left for the imputation service.

use crate::schema::FeatureSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One raw cell as supplied by a caller, before coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Bool(bool),
    Text(String),
    Null,
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Bool(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<Option<f64>> for RawValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(RawValue::Null, RawValue::Number)
    }
}

/// A mapping from feature name to raw value. May contain unknown keys and
/// need not cover the schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputRecord {
    values: HashMap<String, RawValue>,
}

impl InputRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, feature: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.insert(feature, value);
        self
    }

    pub fn insert(&mut self, feature: impl Into<String>, value: impl Into<RawValue>) {
        self.values.insert(feature.into(), value.into());
    }

    pub fn get(&self, feature: &str) -> Option<&RawValue> {
        self.values.get(feature)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Parses a JSON object of `feature -> number | string | bool | null`.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl<K: Into<String>, V: Into<RawValue>> FromIterator<(K, V)> for InputRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = InputRecord::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

/// Why a schema slot ended up without a number.
#[derive(Debug, Clone, PartialEq)]
pub enum MissingReason {
    /// The key was not present in the record.
    Absent,
    /// The value was an explicit null.
    Null,
    /// The value was empty or whitespace-only text.
    Empty,
    /// Text that does not parse as a number.
    Unparsable(String),
    /// A boolean, which carries no numeric meaning here.
    NonNumeric,
    /// NaN or an infinity.
    NonFinite,
}

impl MissingReason {
    /// True when the caller supplied something that failed coercion, as opposed
    /// to supplying nothing at all.
    pub fn is_coercion_failure(&self) -> bool {
        matches!(
            self,
            MissingReason::Unparsable(_) | MissingReason::NonNumeric | MissingReason::NonFinite
        )
    }
}

impl fmt::Display for MissingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingReason::Absent => f.write_str("absent"),
            MissingReason::Null => f.write_str("null"),
            MissingReason::Empty => f.write_str("empty"),
            MissingReason::Unparsable(text) => write!(f, "unparsable value '{text}'"),
            MissingReason::NonNumeric => f.write_str("non-numeric value"),
            MissingReason::NonFinite => f.write_str("non-finite value"),
        }
    }
}

/// A normalized slot: either a finite number or a recorded reason for absence.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Value(f64),
    Missing(MissingReason),
}

impl Slot {
    pub fn value(&self) -> Option<f64> {
        match self {
            Slot::Value(v) => Some(*v),
            Slot::Missing(_) => None,
        }
    }
}

/// A record aligned to the schema, one slot per feature.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    slots: Vec<Slot>,
}

impl NormalizedRow {
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn missing_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Missing(_)))
            .count()
    }

    /// Number of slots where a supplied value failed coercion.
    pub fn coercion_failures(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Missing(r) if r.is_coercion_failure()))
            .count()
    }
}

/// Coerces one raw value to a finite number.
pub fn coerce(value: &RawValue) -> Slot {
    match value {
        RawValue::Null => Slot::Missing(MissingReason::Null),
        RawValue::Bool(_) => Slot::Missing(MissingReason::NonNumeric),
        RawValue::Number(v) => finite(*v),
        RawValue::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Slot::Missing(MissingReason::Empty);
            }
            match trimmed.parse::<f64>() {
                Ok(v) => finite(v),
                Err(_) => Slot::Missing(MissingReason::Unparsable(trimmed.to_string())),
            }
        }
    }
}

fn finite(v: f64) -> Slot {
    if v.is_finite() {
        Slot::Value(v)
    } else {
        Slot::Missing(MissingReason::NonFinite)
    }
}

/// Aligns `record` to `schema`.
pub fn normalize(record: &InputRecord, schema: &FeatureSchema) -> NormalizedRow {
    for key in record.keys().filter(|k| !schema.contains(k)) {
        log::trace!("Dropping unknown input key '{key}'");
    }

    let slots = schema
        .iter()
        .map(|feature| match record.get(feature) {
            None => Slot::Missing(MissingReason::Absent),
            Some(raw) => {
                let slot = coerce(raw);
                if let Slot::Missing(reason) = &slot {
                    if reason.is_coercion_failure() {
                        log::debug!("Feature '{feature}' treated as missing: {reason}");
                    }
                }
                slot
            }
        })
        .collect();

    NormalizedRow { slots }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> FeatureSchema {
        FeatureSchema::new(vec![
            "koi_period".into(),
            "koi_depth".into(),
            "koi_prad".into(),
        ])
        .unwrap()
    }

    #[test]
    fn output_follows_schema_order_and_drops_unknown_keys() {
        let record = InputRecord::new()
            .with("koi_prad", 1.2)
            .with("not_a_feature", 99.0)
            .with("koi_period", 365.25);
        let row = normalize(&record, &schema());

        assert_eq!(row.len(), 3);
        assert_eq!(row.slots()[0], Slot::Value(365.25));
        assert_eq!(row.slots()[1], Slot::Missing(MissingReason::Absent));
        assert_eq!(row.slots()[2], Slot::Value(1.2));
    }

    #[test]
    fn coercion_failures_become_missing() {
        assert_eq!(coerce(&RawValue::Null), Slot::Missing(MissingReason::Null));
        assert_eq!(
            coerce(&RawValue::Text("   ".into())),
            Slot::Missing(MissingReason::Empty)
        );
        assert_eq!(
            coerce(&RawValue::Text("abc".into())),
            Slot::Missing(MissingReason::Unparsable("abc".into()))
        );
        assert_eq!(
            coerce(&RawValue::Bool(true)),
            Slot::Missing(MissingReason::NonNumeric)
        );
        assert_eq!(
            coerce(&RawValue::Number(f64::NAN)),
            Slot::Missing(MissingReason::NonFinite)
        );
        assert_eq!(
            coerce(&RawValue::Text("inf".into())),
            Slot::Missing(MissingReason::NonFinite)
        );
    }

    #[test]
    fn numeric_text_is_parsed() {
        assert_eq!(coerce(&RawValue::Text(" 2e-3 ".into())), Slot::Value(0.002));
        assert_eq!(coerce(&RawValue::Text("-7".into())), Slot::Value(-7.0));
    }

    #[test]
    fn record_parses_from_json_with_nulls_and_text() {
        let record = InputRecord::from_json(
            r#"{"koi_period": 3.5, "koi_depth": null, "koi_prad": "11.5", "flag": true}"#,
        )
        .unwrap();
        assert_eq!(record.get("koi_period"), Some(&RawValue::Number(3.5)));
        assert_eq!(record.get("koi_depth"), Some(&RawValue::Null));
        assert_eq!(record.get("flag"), Some(&RawValue::Bool(true)));

        let row = normalize(&record, &schema());
        assert_eq!(row.slots()[1], Slot::Missing(MissingReason::Null));
        assert_eq!(row.slots()[2], Slot::Value(11.5));
        assert_eq!(row.missing_count(), 1);
        assert_eq!(row.coercion_failures(), 0);
    }
}
