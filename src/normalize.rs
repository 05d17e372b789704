//! Response normalization.
//!
//! Servers have answered value, history and related-object queries in three
//! different JSON shapes over time. Every payload is classified once into a
//! [`Dialect`] and only then read, so callers always see the same records
//! regardless of which shape arrived.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::model::{now_rfc3339, HistoricalValue, ObjectInstance, ValueUpdate};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("response did not match any supported shape")]
    UnrecognizedResponseShape,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("failed to decode record: {0}")]
    Record(#[from] serde_json::Error),
}

/// One entry of the `{ "results": [...] }` envelope.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    #[serde(default)]
    pub element_id: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BatchResult {
    /// Data of a successful entry. A missing `success` flag counts as success
    /// when data is present.
    fn successful_data(&self) -> Option<&Value> {
        if self.success == Some(false) {
            return None;
        }
        self.data.as_ref().filter(|data| !data.is_null())
    }
}

/// Known server response shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum Dialect {
    /// Bare array, one record per requested id.
    Positional(Vec<Value>),
    /// `{ "results": [{ elementId, success, data }] }`.
    Envelope(Vec<BatchResult>),
    /// `{ "<elementId>": { "data": [ { value, quality?, timestamp? } ] } }`.
    Keyed(Map<String, Value>),
}

impl Dialect {
    pub fn classify(payload: Value) -> Result<Self, NormalizeError> {
        match payload {
            Value::Array(items) => Ok(Self::Positional(items)),
            Value::Object(mut map) => {
                if let Some(results) = map.remove("results") {
                    return match results {
                        Value::Array(_) => serde_json::from_value(results)
                            .map(Self::Envelope)
                            .map_err(|_| NormalizeError::UnrecognizedResponseShape),
                        _ => Err(NormalizeError::UnrecognizedResponseShape),
                    };
                }
                if map.values().all(is_keyed_entry) {
                    Ok(Self::Keyed(map))
                } else {
                    Err(NormalizeError::UnrecognizedResponseShape)
                }
            }
            _ => Err(NormalizeError::UnrecognizedResponseShape),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Positional(_) => "positional",
            Self::Envelope(_) => "envelope",
            Self::Keyed(_) => "keyed",
        }
    }
}

fn is_keyed_entry(entry: &Value) -> bool {
    entry.as_object().is_some_and(|entry| entry.contains_key("data"))
}

/// Normalizes a current-value response (value query or subscription sync).
///
/// Yields one update per element the server reports a value for and none for
/// failed or absent elements.
pub fn normalize_values(
    payload: Value,
    requested: &[String],
) -> Result<Vec<ValueUpdate>, NormalizeError> {
    let dialect = Dialect::classify(payload)?;
    debug!(
        event = "normalize_values",
        dialect = dialect.name(),
        requested = requested.len()
    );

    let updates = match dialect {
        Dialect::Positional(records) => records
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                let element_id = record_element_id(record).or_else(|| requested.get(index).cloned())?;
                current_value(element_id, record)
            })
            .collect(),
        Dialect::Envelope(results) => results
            .iter()
            .enumerate()
            .filter_map(|(index, result)| {
                let data = result.successful_data()?;
                let element_id = result
                    .element_id
                    .clone()
                    .or_else(|| requested.get(index).cloned())?;
                current_value(element_id, data)
            })
            .collect(),
        Dialect::Keyed(entries) => keyed_values(&entries),
    };

    Ok(updates)
}

/// Normalizes a history response to exactly one record per requested id.
pub fn normalize_history(
    payload: Value,
    requested: &[String],
) -> Result<Vec<HistoricalValue>, NormalizeError> {
    let dialect = Dialect::classify(payload)?;
    debug!(
        event = "normalize_history",
        dialect = dialect.name(),
        requested = requested.len()
    );

    let history = requested
        .iter()
        .enumerate()
        .map(|(index, element_id)| {
            let found = match &dialect {
                Dialect::Positional(records) => records
                    .get(index)
                    .and_then(|record| history_record(element_id, record)),
                Dialect::Envelope(results) => envelope_entry(results, element_id, index)
                    .and_then(BatchResult::successful_data)
                    .and_then(|data| history_record(element_id, data)),
                Dialect::Keyed(entries) => entries
                    .get(element_id)
                    .and_then(|entry| keyed_history(element_id, entry)),
            };
            found.unwrap_or_else(|| HistoricalValue::empty(element_id.as_str()))
        })
        .collect();

    Ok(history)
}

/// Normalizes a related-objects response for a single source element.
pub fn normalize_related(
    payload: Value,
    element_id: &str,
) -> Result<Vec<ObjectInstance>, NormalizeError> {
    let objects = match Dialect::classify(payload)? {
        Dialect::Positional(records) => Value::Array(records),
        Dialect::Envelope(results) => match results
            .first()
            .and_then(BatchResult::successful_data)
        {
            Some(data @ Value::Array(_)) => data.clone(),
            _ => return Ok(Vec::new()),
        },
        Dialect::Keyed(mut entries) => match entries
            .remove(element_id)
            .and_then(|mut entry| entry.get_mut("data").map(Value::take))
        {
            Some(data @ Value::Array(_)) => data,
            _ => return Ok(Vec::new()),
        },
    };

    Ok(serde_json::from_value(objects)?)
}

/// Normalizes one push-channel frame.
///
/// A frame is a JSON array. Entries are keyed maps
/// (`{ "<elementId>": { "data": [...] } }`) or flat items carrying their own
/// `elementId`.
pub fn normalize_frame(text: &str) -> Result<Vec<ValueUpdate>, NormalizeError> {
    let payload: Value = serde_json::from_str(text)
        .map_err(|err| NormalizeError::MalformedFrame(err.to_string()))?;
    let Value::Array(entries) = payload else {
        return Err(NormalizeError::MalformedFrame(
            "expected a JSON array".to_string(),
        ));
    };

    let mut updates = Vec::new();
    for entry in entries {
        let Value::Object(entry) = entry else {
            return Err(NormalizeError::MalformedFrame(
                "frame entries must be objects".to_string(),
            ));
        };
        match entry.get("elementId").and_then(Value::as_str) {
            Some(element_id) => {
                let record = Value::Object(entry.clone());
                updates.extend(current_value(element_id.to_string(), &record));
            }
            None => updates.extend(keyed_values(&entry)),
        }
    }

    Ok(updates)
}

fn keyed_values(entries: &Map<String, Value>) -> Vec<ValueUpdate> {
    entries
        .iter()
        .filter_map(|(element_id, entry)| current_value(element_id.clone(), entry))
        .collect()
}

fn envelope_entry<'a>(
    results: &'a [BatchResult],
    element_id: &str,
    index: usize,
) -> Option<&'a BatchResult> {
    results
        .iter()
        .find(|result| result.element_id.as_deref() == Some(element_id))
        .or_else(|| results.get(index).filter(|result| result.element_id.is_none()))
}

fn record_element_id(record: &Value) -> Option<String> {
    record
        .get("elementId")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Reads the current value out of a flat record (`{ value, ... }`) or a keyed
/// entry (`{ data: [...] }`, first sample only).
fn current_value(element_id: String, record: &Value) -> Option<ValueUpdate> {
    let record = record.as_object()?;
    let sample = match record.get("data") {
        Some(Value::Array(samples)) => samples.first()?.as_object()?,
        Some(_) => return None,
        None => record,
    };
    let value = sample.get("value")?.clone();

    Some(ValueUpdate {
        element_id,
        value,
        timestamp: text_field(sample, "timestamp"),
        quality: text_field(sample, "quality"),
    })
}

fn history_record(element_id: &str, record: &Value) -> Option<HistoricalValue> {
    let fields = record.as_object()?;
    if fields.contains_key("data") && !fields.contains_key("value") {
        return keyed_history(element_id, record);
    }

    Some(HistoricalValue {
        element_id: text_field(fields, "elementId").unwrap_or_else(|| element_id.to_string()),
        value: fields
            .get("value")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new())),
        timestamp: text_field(fields, "timestamp").unwrap_or_else(now_rfc3339),
        parent_id: text_field(fields, "parentId"),
        is_composition: fields
            .get("isComposition")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        namespace_uri: text_field(fields, "namespaceUri").unwrap_or_default(),
        data_type: text_field(fields, "dataType"),
    })
}

fn keyed_history(element_id: &str, entry: &Value) -> Option<HistoricalValue> {
    let fields = entry.as_object()?;
    let samples = fields.get("data")?.as_array()?;
    let timestamp = samples
        .first()
        .and_then(Value::as_object)
        .and_then(|sample| text_field(sample, "timestamp"))
        .unwrap_or_else(now_rfc3339);

    Some(HistoricalValue {
        element_id: element_id.to_string(),
        value: Value::Array(samples.clone()),
        timestamp,
        parent_id: text_field(fields, "parentId"),
        is_composition: fields
            .get("isComposition")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        namespace_uri: text_field(fields, "namespaceUri").unwrap_or_default(),
        data_type: text_field(fields, "dataType"),
    })
}

fn text_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}
