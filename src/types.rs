use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Which physical source a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Interactive serial channel to the device
    Device,
    /// Mirrored debug log file
    Log,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Device => write!(f, "device"),
            SourceKind::Log => write!(f, "log"),
        }
    }
}

/// One terminated line as read from a source, terminator removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub text: String,
    /// Set when the line exceeded the configured maximum and was cut short
    pub truncated: bool,
}

/// A line with terminal noise removed and highlight spans balanced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanedLine {
    pub text: String,
    /// Whether any sequence was removed, translated or appended
    pub modified: bool,
    /// Number of synthetic span closers appended for highlights left open
    pub closed_spans: usize,
}

/// A JSON value recovered from a line
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateRecord {
    Object(Map<String, Value>),
    Array(Vec<Value>),
}

impl CandidateRecord {
    pub fn into_value(self) -> Value {
        match self {
            CandidateRecord::Object(map) => Value::Object(map),
            CandidateRecord::Array(items) => Value::Array(items),
        }
    }
}

/// A single canonical field of a normalized event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventField {
    pub name: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Device status event in canonical form. Field names are unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    fields: Vec<EventField>,
}

impl NormalizedEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field, refusing a name that is already present
    pub fn push(&mut self, field: EventField) -> std::result::Result<(), EventField> {
        if self.contains(&field.name) {
            return Err(field);
        }
        self.fields.push(field);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&EventField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[EventField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Records in the shape the backend data endpoint accepts
    pub fn to_backend_records(&self) -> Vec<BackendRecord<'_>> {
        self.fields
            .iter()
            .map(|f| BackendRecord {
                variable: &f.name,
                value: &f.value,
                unit: f.unit.as_deref(),
            })
            .collect()
    }
}

impl fmt::Display for NormalizedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", field.name, field.value)?;
            if let Some(unit) = &field.unit {
                write!(f, " ({})", unit)?;
            }
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Serialize)]
pub struct BackendRecord<'a> {
    pub variable: &'a str,
    pub value: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'a str>,
}

/// Identity of a delivery request: a process-monotonic sequence for ordering and a
/// random correlation id that stays unique across restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    pub seq: u64,
    pub correlation: Uuid,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}-{}", self.seq, self.correlation.simple())
    }
}

#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        RequestId {
            seq: self.next.fetch_add(1, Ordering::Relaxed),
            correlation: Uuid::new_v4(),
        }
    }
}
