use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::NormalizeError;
use crate::constants::*;

/// How one source key is treated on its way into a normalized event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationRule {
    /// Key as printed by the firmware
    pub key: String,
    /// Canonical name; the source key is kept when absent
    #[serde(default)]
    pub rename: Option<String>,
    /// Unit tag attached to the emitted field
    #[serde(default)]
    pub unit: Option<String>,
    /// Never forward this key (hash chain linkage, raw timestamps)
    #[serde(default)]
    pub exclude: bool,
    /// Drop the field when the reading is the unavailable sentinel
    #[serde(default)]
    pub drop_if_sentinel: bool,
    /// A record without this key is malformed
    #[serde(default)]
    pub required: bool,
}

impl NormalizationRule {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            rename: None,
            unit: None,
            exclude: false,
            drop_if_sentinel: false,
            required: false,
        }
    }

    fn renamed(mut self, name: &str) -> Self {
        self.rename = Some(name.to_string());
        self
    }

    fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    fn sensor_reading(mut self) -> Self {
        self.drop_if_sentinel = true;
        self
    }

    fn excluded(mut self) -> Self {
        self.exclude = true;
        self
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Name the field is emitted under
    pub fn canonical_name(&self) -> &str {
        self.rename.as_deref().unwrap_or(&self.key)
    }
}

/// Lookup table consulted by the normalizer
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<NormalizationRule>,
    by_key: HashMap<String, usize>,
    sentinel: String,
}

impl RuleTable {
    /// Rules for the status records printed by the base station firmware
    pub fn builtin() -> Self {
        let rules = vec![
            NormalizationRule::new(KEY_EVENT)
                .renamed(FIELD_EVENT_TYPE)
                .required(),
            NormalizationRule::new(KEY_ULTRASONIC)
                .renamed(FIELD_ULTRASONIC)
                .with_unit(UNIT_METERS)
                .sensor_reading(),
            NormalizationRule::new(KEY_MAGNETOMETER)
                .renamed(FIELD_MAGNETOMETER)
                .sensor_reading(),
            NormalizationRule::new(KEY_USER).renamed(FIELD_USER),
            NormalizationRule::new(KEY_PREV_HASH).excluded(),
            NormalizationRule::new(KEY_CURR_HASH).excluded(),
            NormalizationRule::new(KEY_TIMESTAMP).excluded(),
        ];
        let by_key = rules
            .iter()
            .enumerate()
            .map(|(i, r)| (r.key.clone(), i))
            .collect();
        Self {
            rules,
            by_key,
            sentinel: UNAVAILABLE_SENTINEL.to_string(),
        }
    }

    /// Build a table from configured rules, rejecting ambiguous definitions
    pub fn from_rules(
        rules: Vec<NormalizationRule>,
        sentinel: impl Into<String>,
    ) -> Result<Self, NormalizeError> {
        let mut by_key = HashMap::new();
        let mut canonical = HashSet::new();

        for (i, rule) in rules.iter().enumerate() {
            if by_key.insert(rule.key.clone(), i).is_some() {
                return Err(NormalizeError::InvalidRules(format!(
                    "key '{}' has more than one rule",
                    rule.key
                )));
            }
            if rule.exclude && rule.required {
                return Err(NormalizeError::InvalidRules(format!(
                    "key '{}' cannot be both required and excluded",
                    rule.key
                )));
            }
            if !rule.exclude && !canonical.insert(rule.canonical_name().to_string()) {
                return Err(NormalizeError::InvalidRules(format!(
                    "canonical name '{}' is produced by more than one rule",
                    rule.canonical_name()
                )));
            }
        }

        Ok(Self {
            rules,
            by_key,
            sentinel: sentinel.into(),
        })
    }

    pub fn lookup(&self, key: &str) -> Option<&NormalizationRule> {
        self.by_key.get(key).map(|&i| &self.rules[i])
    }

    pub fn required_keys(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .filter(|r| r.required)
            .map(|r| r.key.as_str())
    }

    pub fn rules(&self) -> &[NormalizationRule] {
        &self.rules
    }

    /// Whether `value` stands for a reading the device could not take
    pub fn is_unavailable(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => s.trim() == self.sentinel,
            Value::Null => true,
            _ => false,
        }
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_table_covers_device_keys() {
        let table = RuleTable::builtin();

        let distance = table.lookup("ultra_meas").unwrap();
        assert_eq!(distance.canonical_name(), "Ultrasonic");
        assert_eq!(distance.unit.as_deref(), Some("m"));
        assert!(distance.drop_if_sentinel);

        assert!(table.lookup("prev_hash").unwrap().exclude);
        assert!(table.lookup("timestamp").unwrap().exclude);
        assert!(table.lookup("MAC").is_none());
        assert_eq!(table.required_keys().collect::<Vec<_>>(), vec!["event"]);
    }

    #[test]
    fn test_builtin_rules_pass_validation() {
        let builtin = RuleTable::builtin();
        let rebuilt = RuleTable::from_rules(builtin.rules().to_vec(), "N/A");
        assert!(rebuilt.is_ok());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let rules = vec![
            NormalizationRule::new("a").renamed("A"),
            NormalizationRule::new("a").renamed("B"),
        ];
        assert!(matches!(
            RuleTable::from_rules(rules, "N/A"),
            Err(NormalizeError::InvalidRules(_))
        ));
    }

    #[test]
    fn test_colliding_canonical_names_rejected() {
        let rules = vec![
            NormalizationRule::new("dist").renamed("Distance"),
            NormalizationRule::new("range").renamed("Distance"),
        ];
        assert!(RuleTable::from_rules(rules, "N/A").is_err());
    }

    #[test]
    fn test_sentinel_detection() {
        let table = RuleTable::from_rules(Vec::new(), "unavailable").unwrap();
        assert!(table.is_unavailable(&json!("unavailable")));
        assert!(table.is_unavailable(&json!(" unavailable ")));
        assert!(table.is_unavailable(&Value::Null));
        assert!(!table.is_unavailable(&json!("N/A")));
        assert!(!table.is_unavailable(&json!(0.0)));
    }

    #[test]
    fn test_rules_deserialize_with_defaults() {
        let rule: NormalizationRule =
            toml::from_str("key = \"temp\"\nrename = \"Temperature\"\nunit = \"C\"").unwrap();
        assert_eq!(rule.canonical_name(), "Temperature");
        assert!(!rule.exclude);
        assert!(!rule.drop_if_sentinel);
        assert!(!rule.required);
    }
}
