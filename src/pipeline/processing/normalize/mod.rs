pub mod rules;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::trace;

use crate::config::NormalizeConfig;
use crate::types::{CandidateRecord, EventField, NormalizedEvent};
use rules::RuleTable;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("record is missing required key '{0}'")]
    MissingField(String),

    #[error("canonical field '{0}' produced twice")]
    DuplicateField(String),

    #[error("only object records can be normalized")]
    NotAnObject,

    #[error("invalid normalization rules: {0}")]
    InvalidRules(String),
}

/// Turns device status records into canonical events
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    table: RuleTable,
}

impl Normalizer {
    pub fn new(table: RuleTable) -> Self {
        Self { table }
    }

    /// Build from configuration: configured rules replace the built-in table entirely
    pub fn from_config(config: &NormalizeConfig) -> Result<Self, NormalizeError> {
        let table = if config.rules.is_empty() {
            RuleTable::from_rules(RuleTable::builtin().rules().to_vec(), config.sentinel.clone())?
        } else {
            RuleTable::from_rules(config.rules.clone(), config.sentinel.clone())?
        };
        Ok(Self { table })
    }

    pub fn table(&self) -> &RuleTable {
        &self.table
    }

    /// Normalize a candidate record. Arrays are not device status events.
    pub fn normalize(&self, record: &CandidateRecord) -> Result<NormalizedEvent, NormalizeError> {
        match record {
            CandidateRecord::Object(map) => self.normalize_object(map),
            CandidateRecord::Array(_) => Err(NormalizeError::NotAnObject),
        }
    }

    pub fn normalize_object(
        &self,
        record: &Map<String, Value>,
    ) -> Result<NormalizedEvent, NormalizeError> {
        if let Some(missing) = self
            .table
            .required_keys()
            .find(|key| !record.contains_key(*key))
        {
            return Err(NormalizeError::MissingField(missing.to_string()));
        }

        let mut event = NormalizedEvent::new();
        for (key, value) in record {
            let rule = self.table.lookup(key);

            if rule.is_some_and(|r| r.exclude) {
                trace!(key = %key, "Dropping excluded key");
                continue;
            }
            if rule.is_some_and(|r| r.drop_if_sentinel) && self.table.is_unavailable(value) {
                trace!(key = %key, "Dropping unavailable reading");
                continue;
            }

            // Keys without a rule keep their value as printed, JSON null included
            let field = EventField {
                name: rule
                    .map(|r| r.canonical_name().to_string())
                    .unwrap_or_else(|| key.clone()),
                value: value.clone(),
                unit: rule.and_then(|r| r.unit.clone()),
            };
            event
                .push(field)
                .map_err(|f| NormalizeError::DuplicateField(f.name))?;
        }

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> CandidateRecord {
        match value {
            Value::Object(map) => CandidateRecord::Object(map),
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_tampering_record_normalizes_to_two_fields() {
        let normalizer = Normalizer::default();
        let record = object(json!({
            "event": "TAMPERING",
            "ultra_meas": "0.54",
            "mag_meas": "N/A",
            "prev_hash": "abc"
        }));

        let event = normalizer.normalize(&record).unwrap();

        assert_eq!(event.len(), 2);
        let kind = event.get("Event_Type").unwrap();
        assert_eq!(kind.value, json!("TAMPERING"));
        assert_eq!(kind.unit, None);
        let distance = event.get("Ultrasonic").unwrap();
        assert_eq!(distance.value, json!("0.54"));
        assert_eq!(distance.unit.as_deref(), Some("m"));
        assert!(!event.contains("Magnetometer"));
        assert!(!event.contains("prev_hash"));
    }

    #[test]
    fn test_excluded_and_sentinel_fields_are_absent_not_null() {
        let normalizer = Normalizer::default();
        let record = object(json!({
            "event": "PRESENCE",
            "curr_hash": "f00d",
            "timestamp": "123456",
            "ultra_meas": "N/A",
            "mag_meas": null
        }));

        let event = normalizer.normalize(&record).unwrap();

        assert_eq!(event.len(), 1);
        assert!(event.fields().iter().all(|f| !f.value.is_null()));
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let normalizer = Normalizer::default();
        let record = object(json!({"event": "SUCCESS", "MAC": "AA:BB", "user": "carol"}));

        let event = normalizer.normalize(&record).unwrap();

        assert_eq!(event.get("MAC").unwrap().value, json!("AA:BB"));
        assert_eq!(event.get("User").unwrap().value, json!("carol"));
    }

    #[test]
    fn test_sentinel_only_dropped_for_sensor_keys() {
        let normalizer = Normalizer::default();
        let record = object(json!({"event": "FAIL", "user": "N/A"}));

        let event = normalizer.normalize(&record).unwrap();

        assert_eq!(event.get("User").unwrap().value, json!("N/A"));
    }

    #[test]
    fn test_missing_required_key_is_an_error() {
        let normalizer = Normalizer::default();
        let record = object(json!({"ultra_meas": "0.20"}));

        assert_eq!(
            normalizer.normalize(&record),
            Err(NormalizeError::MissingField("event".to_string()))
        );
    }

    #[test]
    fn test_duplicate_canonical_name_is_an_error() {
        let normalizer = Normalizer::default();
        let record = object(json!({"event": "FAIL", "Event_Type": "FAIL"}));

        assert_eq!(
            normalizer.normalize(&record),
            Err(NormalizeError::DuplicateField("Event_Type".to_string()))
        );
    }

    #[test]
    fn test_arrays_are_not_normalized() {
        let normalizer = Normalizer::default();
        let record = CandidateRecord::Array(vec![json!(1)]);
        assert_eq!(normalizer.normalize(&record), Err(NormalizeError::NotAnObject));
    }

    #[test]
    fn test_normalization_is_deterministic() {
        let normalizer = Normalizer::default();
        let line = r#"{"user":"dave","event":"PRESENCE","ultra_meas":"0.12","MAC":"01:02","mag_meas":"0.9"}"#;
        let record = object(serde_json::from_str(line).unwrap());

        let first = normalizer.normalize(&record).unwrap();
        let second = normalizer.normalize(&record).unwrap();

        assert_eq!(first.fields(), second.fields());
        let names: Vec<&str> = first.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["User", "Event_Type", "Ultrasonic", "MAC", "Magnetometer"]
        );
    }

    #[test]
    fn test_configured_rules_replace_builtin_table() {
        let config = NormalizeConfig {
            sentinel: "--".to_string(),
            rules: vec![rules::NormalizationRule {
                key: "temp".to_string(),
                rename: Some("Temperature".to_string()),
                unit: Some("C".to_string()),
                exclude: false,
                drop_if_sentinel: true,
                required: false,
            }],
        };
        let normalizer = Normalizer::from_config(&config).unwrap();

        let event = normalizer
            .normalize(&object(json!({"temp": "21.5", "event": "X"})))
            .unwrap();
        assert_eq!(event.get("Temperature").unwrap().unit.as_deref(), Some("C"));
        assert_eq!(event.get("event").unwrap().value, json!("X"));

        let dropped = normalizer
            .normalize(&object(json!({"temp": "--"})))
            .unwrap();
        assert!(dropped.is_empty());
    }

    #[test]
    fn test_unruled_null_passes_through_as_null() {
        let normalizer = Normalizer::default();
        let record = object(json!({"event": "SUCCESS", "battery": null}));

        let event = normalizer.normalize(&record).unwrap();

        assert_eq!(event.get("battery").unwrap().value, Value::Null);
        assert_eq!(event.len(), 2);
    }
}
