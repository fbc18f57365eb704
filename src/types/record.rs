//! Canonical record and the raw candidate handed over by the extraction side.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TrawlError};

/// Scalar attribute value stored on a [`Record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A normalized business entity as it is written to segments and the master log.
///
/// `fields` is a `BTreeMap` so that serialization is byte-stable across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub identifier: String,
    pub collected_at: DateTime<Utc>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    #[must_use]
    pub fn new(identifier: impl Into<String>, collected_at: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.into(),
            collected_at,
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(FieldValue::as_text)
    }

    /// Serialize as one segment line, including the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        if self.identifier.is_empty() {
            return Err(TrawlError::malformed("record identifier is empty"));
        }
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one segment line (without its newline).
    pub fn from_line(line: &str) -> Result<Self> {
        let record: Self = serde_json::from_str(line)?;
        if record.identifier.is_empty() {
            return Err(TrawlError::malformed("record identifier is empty"));
        }
        Ok(record)
    }
}

/// Raw output of the extraction collaborator, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Time the page was scraped, if the extractor knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_at: Option<DateTime<Utc>>,
}

impl Candidate {
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            collected_at: None,
        }
    }

    /// Build a candidate from a JSON object; anything else is malformed.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self::new(fields)),
            other => Err(TrawlError::malformed(format!(
                "candidate must be a JSON object, got {other}"
            ))),
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn line_round_trip_keeps_scalar_kinds() {
        let record = Record::new("A", ts())
            .with_field("name", "Cafe Uno")
            .with_field("rating", 4.5)
            .with_field("reviews", 120_i64)
            .with_field("open", true);
        let line = record.to_line().unwrap();
        assert!(line.ends_with('\n'));

        let parsed = Record::from_line(line.trim_end()).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.field("reviews"), Some(&FieldValue::Integer(120)));
        assert_eq!(parsed.field("rating"), Some(&FieldValue::Float(4.5)));
    }

    #[test]
    fn empty_identifier_is_rejected() {
        let record = Record::new("", ts());
        assert!(record.to_line().is_err());
        let line = r#"{"identifier":"","collected_at":"2024-05-01T12:00:00Z","fields":{}}"#;
        assert!(Record::from_line(line).is_err());
    }

    #[test]
    fn candidate_requires_object() {
        assert!(Candidate::from_json(serde_json::json!(["a"])).is_err());
        let candidate = Candidate::from_json(serde_json::json!({"name": "x"})).unwrap();
        assert_eq!(candidate.fields.len(), 1);
    }
}
