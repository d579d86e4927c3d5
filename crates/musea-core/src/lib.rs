//! Row model and first-seen deduplication for the musea table.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as JsonValue};

pub const CRATE_NAME: &str = "musea-core";

/// Business identifier used to deduplicate museum rows.
pub const DEFAULT_KEY_FIELD: &str = "museum_id";

/// One row of the remote table, with field order as returned by the server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, JsonValue>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: JsonValue) -> Option<JsonValue> {
        self.0.insert(field.into(), value)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn into_inner(self) -> Map<String, JsonValue> {
        self.0
    }

    /// Bucket this record falls into when deduplicating on `field`.
    pub fn dedup_key(&self, field: &str) -> DedupKey {
        DedupKey::of(self.get(field))
    }
}

impl From<Map<String, JsonValue>> for Record {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

impl TryFrom<JsonValue> for Record {
    type Error = JsonValue;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        match value {
            JsonValue::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}

/// Rows in server return order. No sort is implied.
pub type RecordSet = Vec<Record>;

/// Uniqueness bucket for a key value.
///
/// Absent fields and JSON `null` share the `Missing` bucket. Numbers compare by
/// numeric value, so `1` and `1.0` collide. Everything else compares by its
/// canonical JSON text, which keeps `"1"` and `1` apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Missing,
    Number(String),
    Value(String),
}

// Integral floats below 2^53 convert to i64 without loss.
const MAX_EXACT_FLOAT_INT: f64 = 9_007_199_254_740_992.0;

impl DedupKey {
    pub fn of(value: Option<&JsonValue>) -> Self {
        match value {
            None | Some(JsonValue::Null) => Self::Missing,
            Some(JsonValue::Number(number)) => Self::Number(canonical_number(number)),
            Some(other) => Self::Value(other.to_string()),
        }
    }
}

fn canonical_number(number: &Number) -> String {
    if let Some(i) = number.as_i64() {
        return i.to_string();
    }
    if let Some(u) = number.as_u64() {
        return u.to_string();
    }
    match number.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT_INT => (f as i64).to_string(),
        Some(f) => f.to_string(),
        None => number.to_string(),
    }
}

/// Outcome of splitting a record set into first occurrences and repeats.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DedupPartition {
    pub kept: RecordSet,
    pub duplicates: RecordSet,
}

impl DedupPartition {
    pub fn removed(&self) -> usize {
        self.duplicates.len()
    }
}

/// Keep the first record seen for each distinct value of `key`, in input order.
pub fn deduplicate(records: RecordSet, key: &str) -> RecordSet {
    partition_duplicates(records, key).kept
}

/// Same walk as [`deduplicate`], but also hands back the dropped repeats.
pub fn partition_duplicates(records: RecordSet, key: &str) -> DedupPartition {
    let mut seen: HashSet<DedupKey> = HashSet::with_capacity(records.len());
    let mut partition = DedupPartition::default();

    for record in records {
        if seen.insert(record.dedup_key(key)) {
            partition.kept.push(record);
        } else {
            partition.duplicates.push(record);
        }
    }

    partition
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: JsonValue) -> Record {
        Record::try_from(value).expect("object literal")
    }

    fn names(records: &[Record]) -> Vec<&str> {
        records
            .iter()
            .map(|r| r.get("name").and_then(|v| v.as_str()).unwrap_or_default())
            .collect()
    }

    #[test]
    fn keeps_first_occurrence_per_museum_id() {
        let rows = vec![
            rec(json!({"museum_id": "m1", "name": "A"})),
            rec(json!({"museum_id": "m2", "name": "B"})),
            rec(json!({"museum_id": "m1", "name": "A-dup"})),
        ];

        let unique = deduplicate(rows, DEFAULT_KEY_FIELD);

        assert_eq!(
            unique,
            vec![
                rec(json!({"museum_id": "m1", "name": "A"})),
                rec(json!({"museum_id": "m2", "name": "B"})),
            ]
        );
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(deduplicate(Vec::new(), DEFAULT_KEY_FIELD).is_empty());
    }

    #[test]
    fn missing_and_null_keys_share_one_bucket() {
        let rows = vec![
            rec(json!({"name": "no-key"})),
            rec(json!({"museum_id": null, "name": "null-key"})),
            rec(json!({"name": "no-key-again"})),
            rec(json!({"museum_id": "m1", "name": "keyed"})),
        ];

        let unique = deduplicate(rows, DEFAULT_KEY_FIELD);

        assert_eq!(names(&unique), vec!["no-key", "keyed"]);
    }

    #[test]
    fn string_and_number_keys_do_not_collide() {
        let rows = vec![
            rec(json!({"museum_id": "1", "name": "text"})),
            rec(json!({"museum_id": 1, "name": "number"})),
            rec(json!({"museum_id": 1, "name": "number-dup"})),
        ];

        let unique = deduplicate(rows, DEFAULT_KEY_FIELD);

        assert_eq!(names(&unique), vec!["text", "number"]);
    }

    #[test]
    fn integral_float_and_integer_keys_collide() {
        let rows = vec![
            rec(json!({"museum_id": 1, "name": "int"})),
            rec(json!({"museum_id": 1.0, "name": "float"})),
            rec(json!({"museum_id": 1.5, "name": "fraction"})),
            rec(json!({"museum_id": 1.5, "name": "fraction-dup"})),
            rec(json!({"museum_id": -0.0, "name": "neg-zero"})),
            rec(json!({"museum_id": 0, "name": "zero"})),
        ];

        let unique = deduplicate(rows, DEFAULT_KEY_FIELD);

        assert_eq!(names(&unique), vec!["int", "fraction", "neg-zero"]);
    }

    #[test]
    fn string_key_never_matches_numeric_key() {
        assert_ne!(DedupKey::of(Some(&json!("1"))), DedupKey::of(Some(&json!(1.0))));
        assert_eq!(DedupKey::of(Some(&json!(1.0))), DedupKey::of(Some(&json!(1))));
    }

    #[test]
    fn output_is_ordered_subsequence_and_idempotent() {
        let rows = vec![
            rec(json!({"museum_id": "c", "name": "1"})),
            rec(json!({"museum_id": "a", "name": "2"})),
            rec(json!({"museum_id": "c", "name": "3"})),
            rec(json!({"museum_id": "b", "name": "4"})),
            rec(json!({"museum_id": "a", "name": "5"})),
            rec(json!({"name": "6"})),
        ];

        let once = deduplicate(rows.clone(), DEFAULT_KEY_FIELD);
        assert_eq!(names(&once), vec!["1", "2", "4", "6"]);

        let mut cursor = rows.iter();
        for kept in &once {
            assert!(cursor.any(|r| r == kept), "kept rows must appear in input order");
        }

        let keys: HashSet<_> = once.iter().map(|r| r.dedup_key(DEFAULT_KEY_FIELD)).collect();
        assert_eq!(keys.len(), once.len());

        let twice = deduplicate(once.clone(), DEFAULT_KEY_FIELD);
        assert_eq!(twice, once);
    }

    #[test]
    fn partition_reports_dropped_rows() {
        let rows = vec![
            rec(json!({"museum_id": "m1", "name": "A"})),
            rec(json!({"museum_id": "m1", "name": "A-dup"})),
            rec(json!({"museum_id": "m1", "name": "A-dup-2"})),
        ];

        let partition = partition_duplicates(rows, DEFAULT_KEY_FIELD);

        assert_eq!(names(&partition.kept), vec!["A"]);
        assert_eq!(names(&partition.duplicates), vec!["A-dup", "A-dup-2"]);
        assert_eq!(partition.removed(), 2);
    }

    #[test]
    fn record_round_trips_field_order() {
        let text = r#"{"zeta":1,"museum_id":"m1","alpha":null}"#;
        let record: Record = serde_json::from_str(text).expect("parse");

        assert_eq!(record.fields().collect::<Vec<_>>(), vec!["zeta", "museum_id", "alpha"]);
        assert_eq!(serde_json::to_string(&record).expect("serialize"), text);
    }

    #[test]
    fn non_object_json_is_rejected() {
        assert!(Record::try_from(json!([1, 2])).is_err());
    }
}
