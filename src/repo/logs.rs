//! Time-ordered log storage. A single global ring buffer holds entries for
//! every resource; per-resource views are produced at query time. Arrival
//! order is not trusted: entries are placed by binary search on timestamp,
//! with a monotonic id breaking ties so equal timestamps keep arrival
//! order.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::logs::v1::LogRecord;

use crate::config::TelemetryLimitOptions;
use crate::repo::attributes::{copy_attributes, stringify_any_value, truncate_utf16, KeyValuePair};
use crate::repo::filters::{FieldFilter, PagedResult};
use crate::repo::resources::{ResourceKey, ResourceView};
use crate::repo::scope::Scope;
use crate::repo::time::unix_nanos_to_datetime;

/// Well-known attribute carrying the message template; surfaced as
/// `original_format` and removed from stored attributes.
pub const ORIGINAL_FORMAT_KEY: &str = "{OriginalFormat}";

const MESSAGE_KEY: &str = "message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Unspecified,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogSeverity {
    /// OTLP severity numbers group in blocks of four per level.
    pub fn from_severity_number(number: i32) -> Self {
        match number {
            1..=4 => LogSeverity::Trace,
            5..=8 => LogSeverity::Debug,
            9..=12 => LogSeverity::Info,
            13..=16 => LogSeverity::Warn,
            17..=20 => LogSeverity::Error,
            21..=24 => LogSeverity::Fatal,
            _ => LogSeverity::Unspecified,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LogSeverity::Unspecified => "unspecified",
            LogSeverity::Trace => "trace",
            LogSeverity::Debug => "debug",
            LogSeverity::Info => "info",
            LogSeverity::Warn => "warn",
            LogSeverity::Error => "error",
            LogSeverity::Fatal => "fatal",
        }
    }

    pub fn is_error(self) -> bool {
        self >= LogSeverity::Error
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: LogSeverity,
    pub message: String,
    pub trace_id: Vec<u8>,
    pub span_id: Vec<u8>,
    pub original_format: Option<String>,
    pub attributes: Vec<KeyValuePair>,
    pub scope: Arc<Scope>,
    pub resource_view: Arc<ResourceView>,
    entry_id: u64,
    viewed: bool,
}

impl LogEntry {
    pub fn trace_id_hex(&self) -> String {
        hex::encode(&self.trace_id)
    }

    pub fn span_id_hex(&self) -> String {
        hex::encode(&self.span_id)
    }
}

#[derive(Debug, Clone)]
pub struct GetLogsRequest {
    pub resource_key: Option<ResourceKey>,
    pub start_index: usize,
    pub count: usize,
    pub filters: Vec<FieldFilter>,
}

pub struct LogStore {
    options: TelemetryLimitOptions,
    entries: VecDeque<LogEntry>,
    next_entry_id: u64,
    property_keys: HashMap<ResourceKey, BTreeSet<String>>,
}

impl LogStore {
    pub fn new(options: TelemetryLimitOptions) -> Self {
        Self {
            options,
            entries: VecDeque::new(),
            next_entry_id: 0,
            property_keys: HashMap::new(),
        }
    }

    /// Inserts one decoded log record. `read_covered` marks the entry
    /// viewed immediately (a Read subscription was watching the resource
    /// when it arrived). Returns the severity of the stored entry.
    pub fn add_log_record(
        &mut self,
        record: &LogRecord,
        resource_view: &Arc<ResourceView>,
        scope: &Arc<Scope>,
        read_covered: bool,
    ) -> LogSeverity {
        let nanos = if record.time_unix_nano != 0 {
            record.time_unix_nano
        } else {
            record.observed_time_unix_nano
        };
        let timestamp = unix_nanos_to_datetime(nanos);
        let severity = LogSeverity::from_severity_number(record.severity_number);

        let original_format = record
            .attributes
            .iter()
            .find(|kv| kv.key == ORIGINAL_FORMAT_KEY)
            .map(|kv| stringify_any_value(kv.value.as_ref()));

        let well_known_filter = |key: &str| key != ORIGINAL_FORMAT_KEY && key != MESSAGE_KEY;
        let (attributes, _) = copy_attributes(
            &record.attributes,
            None,
            Some(&well_known_filter),
            &self.options,
        );

        let keys = self
            .property_keys
            .entry(resource_view.key().clone())
            .or_default();
        for pair in &attributes {
            if !keys.contains(&pair.key) {
                keys.insert(pair.key.clone());
            }
        }

        let entry = LogEntry {
            timestamp,
            severity,
            message: truncate_utf16(
                stringify_any_value(record.body.as_ref()),
                self.options.max_attribute_length,
            ),
            trace_id: record.trace_id.clone(),
            span_id: record.span_id.clone(),
            original_format,
            attributes,
            scope: scope.clone(),
            resource_view: resource_view.clone(),
            entry_id: self.next_entry_id,
            viewed: read_covered,
        };
        self.next_entry_id += 1;

        let position = self.entries.partition_point(|e| e.timestamp <= entry.timestamp);
        self.entries.insert(position, entry);
        if self.entries.len() > self.options.max_log_count {
            self.entries.pop_front();
        }
        severity
    }

    pub fn get_logs(&self, request: &GetLogsRequest) -> PagedResult<LogEntry> {
        let matching: Vec<&LogEntry> = self
            .entries
            .iter()
            .filter(|entry| {
                request
                    .resource_key
                    .as_ref()
                    .is_none_or(|selector| selector.matches(entry.resource_view.key()))
            })
            .filter(|entry| {
                request
                    .filters
                    .iter()
                    .all(|filter| filter.matches(field_value(entry, &filter.field).as_deref()))
            })
            .collect();

        PagedResult {
            total_item_count: matching.len(),
            items: matching
                .into_iter()
                .skip(request.start_index)
                .take(request.count)
                .cloned()
                .collect(),
        }
    }

    /// Sorted union of attribute keys observed for the selection. The
    /// catalog survives ring eviction; it reflects everything ever seen.
    pub fn property_keys(&self, resource_key: Option<&ResourceKey>) -> Vec<String> {
        let mut keys = BTreeSet::new();
        for (key, observed) in &self.property_keys {
            if resource_key.is_none_or(|selector| selector.matches(key)) {
                keys.extend(observed.iter().cloned());
            }
        }
        keys.into_iter().collect()
    }

    /// Unviewed error-log counts per resource; resources with a zero count
    /// are absent from the map.
    pub fn unviewed_error_counts(&self) -> HashMap<ResourceKey, usize> {
        let mut counts: HashMap<ResourceKey, usize> = HashMap::new();
        for entry in &self.entries {
            if entry.severity.is_error() && !entry.viewed {
                *counts.entry(entry.resource_view.key().clone()).or_default() += 1;
            }
        }
        counts
    }

    pub fn mark_viewed(&mut self, resource_key: Option<&ResourceKey>) {
        for entry in &mut self.entries {
            if resource_key.is_none_or(|selector| selector.matches(entry.resource_view.key())) {
                entry.viewed = true;
            }
        }
    }

    pub fn clear(&mut self, resource_key: Option<&ResourceKey>) {
        match resource_key {
            None => {
                self.entries.clear();
                self.property_keys.clear();
            }
            Some(selector) => {
                self.entries
                    .retain(|entry| !selector.matches(entry.resource_view.key()));
                self.property_keys.retain(|key, _| !selector.matches(key));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves a filter field against an entry: known fields first, then
/// entry, scope, and resource attributes in that order.
fn field_value(entry: &LogEntry, field: &str) -> Option<String> {
    let normalized = field.to_ascii_lowercase();
    match normalized.as_str() {
        "message" | "body" => Some(entry.message.clone()),
        "severity" => Some(entry.severity.name().to_string()),
        "traceid" | "trace_id" => Some(entry.trace_id_hex()),
        "spanid" | "span_id" => Some(entry.span_id_hex()),
        "originalformat" | "original_format" => entry.original_format.clone(),
        _ => entry
            .attributes
            .iter()
            .chain(entry.scope.attributes.iter())
            .chain(entry.resource_view.attributes.iter())
            .find(|kv| kv.key == field)
            .map(|kv| kv.value.clone()),
    }
}
