//! Attribute limiting: every attribute list that enters the repository is
//! copied through [`copy_attributes`], which stringifies values, dedupes
//! keys (last value wins), caps the list at `max_attribute_count`, and
//! truncates each value to `max_attribute_length` UTF-16 code units.

use opentelemetry_proto::tonic::common::v1::{any_value::Value as AnyValueKind, AnyValue, KeyValue};
use serde::Serialize;

use crate::config::TelemetryLimitOptions;

/// A stringified, limited attribute. Ordering and hashing are derived so
/// attribute tuples can key metric dimensions directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

impl KeyValuePair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Looks up an attribute value by key.
pub fn get_value<'a>(attributes: &'a [KeyValuePair], key: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|kv| kv.key == key)
        .map(|kv| kv.value.as_str())
}

/// Copies `attributes` into a limited list. `parent` attributes (already
/// limited) are copied first; keys failing `key_filter` are skipped.
/// Returns the list and the number of entries copied into it. Duplicate
/// keys update the existing entry in place, so list order follows the
/// first occurrence of each key.
pub fn copy_attributes(
    attributes: &[KeyValue],
    parent: Option<&[KeyValuePair]>,
    key_filter: Option<&dyn Fn(&str) -> bool>,
    options: &TelemetryLimitOptions,
) -> (Vec<KeyValuePair>, usize) {
    let mut copied = 0usize;
    let mut out: Vec<KeyValuePair> = Vec::new();

    if let Some(parent) = parent {
        for pair in parent.iter().take(options.max_attribute_count) {
            out.push(pair.clone());
            copied += 1;
        }
    }

    for kv in attributes {
        if let Some(filter) = key_filter {
            if !filter(&kv.key) {
                continue;
            }
        }
        let value = truncate_utf16(
            stringify_any_value(kv.value.as_ref()),
            options.max_attribute_length,
        );
        if let Some(existing) = out.iter_mut().find(|e| e.key == kv.key) {
            if existing.value != value {
                tracing::debug!(key = %kv.key, "duplicate attribute key with differing value");
            }
            existing.value = value;
        } else if out.len() < options.max_attribute_count {
            out.push(KeyValuePair {
                key: kv.key.clone(),
                value,
            });
            copied += 1;
        }
    }

    (out, copied)
}

/// Convenience wrapper for the common no-parent, no-filter case.
pub fn to_limited_attributes(
    attributes: &[KeyValue],
    options: &TelemetryLimitOptions,
) -> Vec<KeyValuePair> {
    copy_attributes(attributes, None, None, options).0
}

/// Renders an OTLP `AnyValue` as a display string. Arrays and maps render
/// as JSON; a missing value is the empty string at the top level but JSON
/// `null` once nested.
pub fn stringify_any_value(value: Option<&AnyValue>) -> String {
    match value.and_then(|v| v.value.as_ref()) {
        None => String::new(),
        Some(AnyValueKind::StringValue(s)) => s.clone(),
        Some(AnyValueKind::BoolValue(b)) => b.to_string(),
        Some(AnyValueKind::IntValue(i)) => i.to_string(),
        Some(AnyValueKind::DoubleValue(d)) => d.to_string(),
        Some(AnyValueKind::BytesValue(b)) => hex::encode(b),
        Some(AnyValueKind::ArrayValue(_)) | Some(AnyValueKind::KvlistValue(_)) => {
            serde_json::to_string(&any_value_to_json(value)).unwrap_or_default()
        }
    }
}

fn any_value_to_json(value: Option<&AnyValue>) -> serde_json::Value {
    use serde_json::Value;
    match value.and_then(|v| v.value.as_ref()) {
        None => Value::Null,
        Some(AnyValueKind::StringValue(s)) => Value::String(s.clone()),
        Some(AnyValueKind::BoolValue(b)) => Value::Bool(*b),
        Some(AnyValueKind::IntValue(i)) => Value::Number((*i).into()),
        Some(AnyValueKind::DoubleValue(d)) => serde_json::Number::from_f64(*d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Some(AnyValueKind::BytesValue(b)) => Value::String(hex::encode(b)),
        Some(AnyValueKind::ArrayValue(arr)) => Value::Array(
            arr.values
                .iter()
                .map(|v| any_value_to_json(Some(v)))
                .collect(),
        ),
        Some(AnyValueKind::KvlistValue(kvs)) => Value::Object(
            kvs.values
                .iter()
                .map(|kv| (kv.key.clone(), any_value_to_json(kv.value.as_ref())))
                .collect(),
        ),
    }
}

/// Truncates `s` to at most `max_units` UTF-16 code units. Truncation
/// happens at `char` boundaries, so a supplementary character (a surrogate
/// pair on the wire) is either kept whole or dropped.
pub fn truncate_utf16(s: String, max_units: usize) -> String {
    if max_units == usize::MAX {
        return s;
    }
    let mut units = 0usize;
    for (idx, ch) in s.char_indices() {
        let width = ch.len_utf16();
        if units + width > max_units {
            let mut s = s;
            s.truncate(idx);
            return s;
        }
        units += width;
    }
    s
}
