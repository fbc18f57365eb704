//! Shapes raw candidates into canonical [`Record`]s.
//!
//! The normalizer is stateless: the same candidate always yields the same record
//! (apart from `collected_at` when the candidate carries no timestamp), which is what
//! keeps identifiers deterministic across runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

use crate::constants::{DERIVED_ID_PREFIX, DERIVED_NAME_PREFIX_CHARS};
use crate::error::{Result, TrawlError};
use crate::types::{Candidate, FieldValue, NormalizerOptions, Record};

const ARRAY_SEPARATOR: &str = "; ";

#[derive(Debug, Clone, Default)]
pub struct RecordNormalizer {
    options: NormalizerOptions,
}

impl RecordNormalizer {
    #[must_use]
    pub fn new(options: NormalizerOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn options(&self) -> &NormalizerOptions {
        &self.options
    }

    /// Validate and shape a candidate.
    ///
    /// Fails with [`TrawlError::MalformedCandidate`] when the candidate has neither an
    /// identifier nor any key field to derive one from, misses a required field, or
    /// carries values that cannot be expressed as scalars.
    pub fn normalize(&self, candidate: Candidate, now: DateTime<Utc>) -> Result<Record> {
        let mut fields = BTreeMap::new();
        for (key, value) in candidate.fields {
            flatten_into(&mut fields, &clean_key(&key)?, value)?;
        }

        let identifier = match fields.remove(&self.options.identifier_field) {
            Some(value) => {
                let id = clean_text(&value.to_string());
                if id.is_empty() {
                    self.derive_identifier(&fields)?
                } else {
                    id
                }
            }
            None => self.derive_identifier(&fields)?,
        };

        for required in &self.options.required_fields {
            if !fields.contains_key(required) {
                return Err(TrawlError::malformed(format!(
                    "required field `{required}` missing"
                )));
            }
        }

        Ok(Record {
            identifier,
            collected_at: candidate.collected_at.unwrap_or(now),
            fields,
        })
    }

    /// Stable identifier from the configured key fields.
    fn derive_identifier(&self, fields: &BTreeMap<String, FieldValue>) -> Result<String> {
        let mut present = 0usize;
        let parts: Vec<String> = self
            .options
            .key_fields
            .iter()
            .map(|key| match fields.get(key) {
                Some(value) => {
                    present += 1;
                    let text = value.to_string().to_lowercase();
                    if key == "name" {
                        text.chars().take(DERIVED_NAME_PREFIX_CHARS).collect()
                    } else {
                        text
                    }
                }
                None => String::new(),
            })
            .collect();

        if present == 0 {
            return Err(TrawlError::malformed(format!(
                "no `{}` and none of the key fields {:?}",
                self.options.identifier_field, self.options.key_fields
            )));
        }
        let digest = blake3::hash(parts.join("|").as_bytes());
        Ok(format!("{DERIVED_ID_PREFIX}{}", digest.to_hex()))
    }
}

/// NFKC, trimmed, internal whitespace collapsed to single spaces.
#[must_use]
pub fn clean_text(raw: &str) -> String {
    let composed: String = raw.nfkc().collect();
    composed.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_key(raw: &str) -> Result<String> {
    let key = clean_text(raw);
    if key.is_empty() {
        return Err(TrawlError::malformed("empty field name"));
    }
    Ok(key)
}

fn flatten_into(out: &mut BTreeMap<String, FieldValue>, key: &str, value: Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (child, nested) in map {
                let child = clean_key(&child)?;
                flatten_into(out, &format!("{key}.{child}"), nested)?;
            }
        }
        Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                if matches!(item, Value::Object(_) | Value::Array(_)) {
                    return Err(TrawlError::malformed(format!(
                        "field `{key}` holds nested structures"
                    )));
                }
                if let Some(scalar) = scalar(key, item)? {
                    parts.push(scalar.to_string());
                }
            }
            if !parts.is_empty() {
                out.insert(key.to_string(), FieldValue::Text(parts.join(ARRAY_SEPARATOR)));
            }
        }
        other => {
            if let Some(scalar) = scalar(key, other)? {
                out.insert(key.to_string(), scalar);
            }
        }
    }
    Ok(())
}

fn scalar(key: &str, value: Value) -> Result<Option<FieldValue>> {
    Ok(match value {
        Value::Null => None,
        Value::Bool(flag) => Some(FieldValue::Bool(flag)),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Some(FieldValue::Integer(int))
            } else {
                match number.as_f64() {
                    Some(float) if float.is_finite() => Some(FieldValue::Float(float)),
                    _ => {
                        return Err(TrawlError::malformed(format!(
                            "field `{key}` is not a finite number"
                        )));
                    }
                }
            }
        }
        Value::String(text) => {
            let cleaned = clean_text(&text);
            (!cleaned.is_empty()).then_some(FieldValue::Text(cleaned))
        }
        Value::Array(_) | Value::Object(_) => {
            return Err(TrawlError::malformed(format!(
                "field `{key}` is not a scalar"
            )));
        }
    })
}
