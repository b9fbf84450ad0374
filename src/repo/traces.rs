//! Trace assembly and storage. Spans arrive in any order, possibly before
//! their parents, and are grouped by trace id. The store rejects
//! self-parented and cycle-closing spans, keeps spans sorted by
//! `(start_time, insertion_order)`, maintains a reverse index for span
//! links, and evicts whole traces FIFO by first-span start time once
//! `max_trace_count` is reached.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::trace::v1::Span as OtlpSpan;

use crate::config::TelemetryLimitOptions;
use crate::repo::attributes::{to_limited_attributes, KeyValuePair};
use crate::repo::filters::{contains_ignore_ascii_case, FieldFilter, PagedResult};
use crate::repo::resources::{Resource, ResourceKey, ResourceView};
use crate::repo::scope::Scope;
use crate::repo::time::unix_nanos_to_datetime;
use crate::repo::AddContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    /// Unknown numeric kinds map to `Unspecified`, not `Internal`.
    pub fn from_otlp(kind: i32) -> Self {
        match kind {
            1 => SpanKind::Internal,
            2 => SpanKind::Server,
            3 => SpanKind::Client,
            4 => SpanKind::Producer,
            5 => SpanKind::Consumer,
            _ => SpanKind::Unspecified,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SpanKind::Unspecified => "unspecified",
            SpanKind::Internal => "internal",
            SpanKind::Server => "server",
            SpanKind::Client => "client",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

impl SpanStatus {
    pub fn from_otlp(code: i32) -> Self {
        match code {
            1 => SpanStatus::Ok,
            2 => SpanStatus::Error,
            _ => SpanStatus::Unset,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SpanStatus::Unset => "unset",
            SpanStatus::Ok => "ok",
            SpanStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpanEvent {
    pub name: String,
    pub time: DateTime<Utc>,
    pub attributes: Vec<KeyValuePair>,
}

/// A span-declared pointer to another span. The same shape serves as a
/// backlink, where `(trace_id, span_id)` names the link's source span.
#[derive(Debug, Clone)]
pub struct SpanLink {
    pub trace_id: Vec<u8>,
    pub span_id: Vec<u8>,
    pub attributes: Vec<KeyValuePair>,
}

#[derive(Debug, Clone)]
pub struct Span {
    pub trace_id: Vec<u8>,
    pub span_id: Vec<u8>,
    pub parent_span_id: Option<Vec<u8>>,
    pub name: String,
    pub kind: SpanKind,
    pub status: SpanStatus,
    pub status_message: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub scope: Arc<Scope>,
    pub attributes: Vec<KeyValuePair>,
    pub events: Vec<SpanEvent>,
    pub links: Vec<SpanLink>,
    /// Populated from the backlink index when the span is read out.
    pub backlinks: Vec<SpanLink>,
    pub resource_view: Arc<ResourceView>,
    pub uninstrumented_peer: Option<Arc<Resource>>,
    insertion_order: u64,
}

impl Span {
    /// Converts a decoded OTLP span. Returns `None` when a required id is
    /// missing; the caller counts the rejection.
    pub fn from_otlp(
        span: &OtlpSpan,
        resource_view: &Arc<ResourceView>,
        scope: &Arc<Scope>,
        options: &TelemetryLimitOptions,
    ) -> Option<Span> {
        if span.trace_id.is_empty() || span.span_id.is_empty() {
            return None;
        }
        let parent_span_id = if span.parent_span_id.is_empty() {
            None
        } else {
            Some(span.parent_span_id.clone())
        };

        let mut events: Vec<SpanEvent> = span
            .events
            .iter()
            .take(options.max_span_event_count)
            .map(|event| SpanEvent {
                name: event.name.clone(),
                time: unix_nanos_to_datetime(event.time_unix_nano),
                attributes: to_limited_attributes(&event.attributes, options),
            })
            .collect();
        events.sort_by_key(|e| e.time);

        let links = span
            .links
            .iter()
            .map(|link| SpanLink {
                trace_id: link.trace_id.clone(),
                span_id: link.span_id.clone(),
                attributes: to_limited_attributes(&link.attributes, options),
            })
            .collect();

        Some(Span {
            trace_id: span.trace_id.clone(),
            span_id: span.span_id.clone(),
            parent_span_id,
            name: span.name.clone(),
            kind: SpanKind::from_otlp(span.kind),
            status: SpanStatus::from_otlp(span.status.as_ref().map(|s| s.code).unwrap_or(0)),
            status_message: span
                .status
                .as_ref()
                .map(|s| s.message.clone())
                .unwrap_or_default(),
            start_time: unix_nanos_to_datetime(span.start_time_unix_nano),
            end_time: unix_nanos_to_datetime(span.end_time_unix_nano),
            scope: scope.clone(),
            attributes: to_limited_attributes(&span.attributes, options),
            events,
            links,
            backlinks: Vec::new(),
            resource_view: resource_view.clone(),
            uninstrumented_peer: None,
            insertion_order: 0,
        })
    }

    pub fn trace_id_hex(&self) -> String {
        hex::encode(&self.trace_id)
    }

    pub fn span_id_hex(&self) -> String {
        hex::encode(&self.span_id)
    }
}

#[derive(Debug, Clone)]
pub struct Trace {
    pub trace_id: Vec<u8>,
    pub trace_scope: Arc<Scope>,
    spans: Vec<Span>,
    seq: u64,
}

impl Trace {
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Mutable access for returned snapshots; stored traces are never
    /// handed out, so this cannot touch repository state.
    pub fn spans_mut(&mut self) -> &mut [Span] {
        &mut self.spans
    }

    /// Earliest span by `(start_time, insertion_order)`.
    pub fn first_span(&self) -> &Span {
        &self.spans[0]
    }

    /// Earliest span with no parent; absent while only child spans have
    /// arrived.
    pub fn root_span(&self) -> Option<&Span> {
        self.spans.iter().find(|s| s.parent_span_id.is_none())
    }

    /// Display name, derived from the first span; changes whenever an
    /// earlier span arrives.
    pub fn full_name(&self) -> String {
        let first = self.first_span();
        format!(
            "{}: {}. Id: {}",
            first.resource_view.key().name,
            first.name,
            first.span_id_hex()
        )
    }

    pub fn trace_id_hex(&self) -> String {
        hex::encode(&self.trace_id)
    }

    fn contains_span(&self, span_id: &[u8]) -> bool {
        self.spans.iter().any(|s| s.span_id == span_id)
    }

    fn span(&self, span_id: &[u8]) -> Option<&Span> {
        self.spans.iter().find(|s| s.span_id == span_id)
    }

    /// Would inserting a span with this id under `parent_id` close a loop?
    /// The ancestor walk is bounded by the current trace size; chains
    /// ending at a not-yet-arrived parent terminate early.
    fn creates_cycle(&self, parent_id: &[u8], new_span_id: &[u8]) -> bool {
        let mut current = parent_id;
        for _ in 0..=self.spans.len() {
            if current == new_span_id {
                return true;
            }
            match self.span(current).and_then(|s| s.parent_span_id.as_deref()) {
                Some(next) => current = next,
                None => return false,
            }
        }
        false
    }

    /// Inserts keeping `(start_time, insertion_order)` order; returns true
    /// when the span became the new first span.
    fn insert_span(&mut self, span: Span) -> bool {
        let position = self.spans.partition_point(|s| s.start_time <= span.start_time);
        self.spans.insert(position, span);
        if position == 0 {
            self.trace_scope = self.spans[0].scope.clone();
        }
        position == 0
    }
}

#[derive(Debug, Clone)]
pub struct GetTracesRequest {
    pub resource_key: Option<ResourceKey>,
    pub filter_text: String,
    pub filters: Vec<FieldFilter>,
    pub start_index: usize,
    pub count: usize,
}

struct BacklinkEntry {
    id: u64,
    source_trace_id: Vec<u8>,
    source_span_id: Vec<u8>,
    attributes: Vec<KeyValuePair>,
}

/// Reverse index over span links: target `(trace_id, span_id)` → sources.
/// Ring-bounded by total entry count; the oldest registration falls out
/// first.
struct BacklinkIndex {
    capacity: usize,
    next_id: u64,
    by_target: HashMap<(Vec<u8>, Vec<u8>), Vec<BacklinkEntry>>,
    fifo: VecDeque<(u64, (Vec<u8>, Vec<u8>))>,
}

impl BacklinkIndex {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: 0,
            by_target: HashMap::new(),
            fifo: VecDeque::new(),
        }
    }

    fn register(&mut self, source: &Span, link: &SpanLink) {
        let target = (link.trace_id.clone(), link.span_id.clone());
        let id = self.next_id;
        self.next_id += 1;
        self.by_target.entry(target.clone()).or_default().push(BacklinkEntry {
            id,
            source_trace_id: source.trace_id.clone(),
            source_span_id: source.span_id.clone(),
            attributes: link.attributes.clone(),
        });
        self.fifo.push_back((id, target));
        while self.fifo.len() > self.capacity {
            if let Some((old_id, old_target)) = self.fifo.pop_front() {
                if let Some(entries) = self.by_target.get_mut(&old_target) {
                    entries.retain(|e| e.id != old_id);
                    if entries.is_empty() {
                        self.by_target.remove(&old_target);
                    }
                }
            }
        }
    }

    fn backlinks_for(&self, trace_id: &[u8], span_id: &[u8]) -> Vec<SpanLink> {
        self.by_target
            .get(&(trace_id.to_vec(), span_id.to_vec()))
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| SpanLink {
                        trace_id: e.source_trace_id.clone(),
                        span_id: e.source_span_id.clone(),
                        attributes: e.attributes.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops every entry sourced from or targeting the trace.
    fn prune_trace(&mut self, trace_id: &[u8]) {
        self.by_target.retain(|target, entries| {
            if target.0 == trace_id {
                return false;
            }
            entries.retain(|e| e.source_trace_id != trace_id);
            !entries.is_empty()
        });
        self.retain_fifo();
    }

    /// Drops entries sourced from the given spans of one trace.
    fn prune_sources(&mut self, trace_id: &[u8], span_ids: &HashSet<Vec<u8>>) {
        self.by_target.retain(|_, entries| {
            entries.retain(|e| {
                !(e.source_trace_id == trace_id && span_ids.contains(&e.source_span_id))
            });
            !entries.is_empty()
        });
        self.retain_fifo();
    }

    fn retain_fifo(&mut self) {
        let by_target = &self.by_target;
        self.fifo.retain(|(id, target)| {
            by_target
                .get(target)
                .is_some_and(|entries| entries.iter().any(|e| e.id == *id))
        });
    }

    fn clear(&mut self) {
        self.by_target.clear();
        self.fifo.clear();
    }
}

/// Sort key for the eviction/listing order of traces.
struct OrderKey {
    start: DateTime<Utc>,
    seq: u64,
    trace_id: Vec<u8>,
}

pub struct TraceStore {
    options: TelemetryLimitOptions,
    traces: HashMap<Vec<u8>, Trace>,
    /// Trace ids ordered by `(first_span.start_time, creation seq)`.
    order: Vec<OrderKey>,
    backlinks: BacklinkIndex,
    next_trace_seq: u64,
    next_span_order: u64,
}

impl TraceStore {
    pub fn new(options: TelemetryLimitOptions) -> Self {
        let capacity = options.max_trace_count;
        Self {
            options,
            traces: HashMap::new(),
            order: Vec::new(),
            backlinks: BacklinkIndex::new(capacity),
            next_trace_seq: 0,
            next_span_order: 0,
        }
    }

    /// Inserts a converted span. Rejections (self-parent, cycle closure,
    /// duplicate id) increment `ctx.failure_count`, log at debug with hex
    /// ids, and leave the store untouched; a rejected first span creates
    /// no trace.
    pub fn add_span(&mut self, mut span: Span, ctx: &mut AddContext) -> bool {
        if span
            .parent_span_id
            .as_deref()
            .is_some_and(|parent| parent == span.span_id)
        {
            tracing::debug!(
                trace_id = %span.trace_id_hex(),
                span_id = %span.span_id_hex(),
                "circular loop detected: span is its own parent"
            );
            ctx.failure_count += 1;
            return false;
        }

        if let Some(trace) = self.traces.get(&span.trace_id) {
            if trace.contains_span(&span.span_id) {
                tracing::debug!(
                    trace_id = %span.trace_id_hex(),
                    span_id = %span.span_id_hex(),
                    "duplicate span id in trace"
                );
                ctx.failure_count += 1;
                return false;
            }
            if let Some(parent) = span.parent_span_id.as_deref() {
                if trace.creates_cycle(parent, &span.span_id) {
                    tracing::debug!(
                        trace_id = %span.trace_id_hex(),
                        span_id = %span.span_id_hex(),
                        "circular loop detected in span ancestry"
                    );
                    ctx.failure_count += 1;
                    return false;
                }
            }
        }

        span.insertion_order = self.next_span_order;
        self.next_span_order += 1;

        for link in &span.links {
            self.backlinks.register(&span, link);
        }

        let trace_id = span.trace_id.clone();
        let created = if self.traces.contains_key(&trace_id) {
            false
        } else {
            let seq = self.next_trace_seq;
            self.next_trace_seq += 1;
            self.traces.insert(
                trace_id.clone(),
                Trace {
                    trace_id: trace_id.clone(),
                    trace_scope: span.scope.clone(),
                    spans: Vec::new(),
                    seq,
                },
            );
            true
        };

        let start_time = span.start_time;
        let trace = self.traces.get_mut(&trace_id).expect("trace just ensured");
        let seq = trace.seq;
        let old_start = trace.spans.first().map(|s| s.start_time);
        let first_changed = trace.insert_span(span);

        if created {
            self.insert_order_key(OrderKey {
                start: start_time,
                seq,
                trace_id: trace_id.clone(),
            });
        } else if first_changed {
            self.remove_order_key(&trace_id, old_start);
            self.insert_order_key(OrderKey {
                start: start_time,
                seq,
                trace_id: trace_id.clone(),
            });
        }

        if self.traces.len() > self.options.max_trace_count {
            self.evict_oldest();
        }
        true
    }

    fn insert_order_key(&mut self, key: OrderKey) {
        let position = self
            .order
            .partition_point(|k| (k.start, k.seq) <= (key.start, key.seq));
        self.order.insert(position, key);
    }

    fn remove_order_key(&mut self, trace_id: &[u8], _old_start: Option<DateTime<Utc>>) {
        if let Some(position) = self.order.iter().position(|k| k.trace_id == trace_id) {
            self.order.remove(position);
        }
    }

    fn evict_oldest(&mut self) {
        if self.order.is_empty() {
            return;
        }
        let key = self.order.remove(0);
        if let Some(trace) = self.traces.remove(&key.trace_id) {
            tracing::debug!(
                trace_id = %trace.trace_id_hex(),
                span_count = trace.spans.len(),
                "evicting oldest trace at capacity"
            );
        }
        self.backlinks.prune_trace(&key.trace_id);
    }

    /// Pages traces ordered by first-span start time. Returned traces are
    /// deep copies with backlinks resolved; mutating them cannot touch
    /// stored state.
    pub fn get_traces(&self, request: &GetTracesRequest) -> PagedResult<Trace> {
        let matching: Vec<&Trace> = self
            .order
            .iter()
            .filter_map(|key| self.traces.get(&key.trace_id))
            .filter(|trace| self.trace_matches(trace, request))
            .collect();

        PagedResult {
            total_item_count: matching.len(),
            items: matching
                .into_iter()
                .skip(request.start_index)
                .take(request.count)
                .map(|trace| self.snapshot(trace))
                .collect(),
        }
    }

    pub fn get_trace(&self, trace_id: &[u8]) -> Option<Trace> {
        self.traces.get(trace_id).map(|trace| self.snapshot(trace))
    }

    fn snapshot(&self, trace: &Trace) -> Trace {
        let mut copy = trace.clone();
        for span in &mut copy.spans {
            span.backlinks = self.backlinks.backlinks_for(&span.trace_id, &span.span_id);
        }
        copy
    }

    fn trace_matches(&self, trace: &Trace, request: &GetTracesRequest) -> bool {
        if let Some(selector) = &request.resource_key {
            if !trace
                .spans
                .iter()
                .any(|s| selector.matches(s.resource_view.key()))
            {
                return false;
            }
        }
        if !request.filter_text.is_empty() {
            let text = &request.filter_text;
            let hit = trace.spans.iter().any(|s| {
                contains_ignore_ascii_case(&s.name, text)
                    || s.attributes
                        .iter()
                        .any(|kv| contains_ignore_ascii_case(&kv.value, text))
            });
            if !hit {
                return false;
            }
        }
        request.filters.iter().all(|filter| {
            trace
                .spans
                .iter()
                .any(|span| filter.matches(span_field_value(span, &filter.field).as_deref()))
        })
    }

    /// Sorted union of span attribute keys for the selection.
    pub fn property_keys(&self, resource_key: Option<&ResourceKey>) -> Vec<String> {
        let mut keys = BTreeSet::new();
        for trace in self.traces.values() {
            for span in &trace.spans {
                if resource_key.is_none_or(|selector| selector.matches(span.resource_view.key())) {
                    keys.extend(span.attributes.iter().map(|kv| kv.key.clone()));
                }
            }
        }
        keys.into_iter().collect()
    }

    /// Removes spans for the selection; traces left with no spans are
    /// dropped along with their link index entries.
    pub fn clear(&mut self, resource_key: Option<&ResourceKey>) {
        let Some(selector) = resource_key else {
            self.traces.clear();
            self.order.clear();
            self.backlinks.clear();
            return;
        };

        let trace_ids: Vec<Vec<u8>> = self.traces.keys().cloned().collect();
        for trace_id in trace_ids {
            let trace = self.traces.get_mut(&trace_id).expect("listed above");
            let removed: HashSet<Vec<u8>> = trace
                .spans
                .iter()
                .filter(|s| selector.matches(s.resource_view.key()))
                .map(|s| s.span_id.clone())
                .collect();
            if removed.is_empty() {
                continue;
            }
            let old_start = trace.spans.first().map(|s| s.start_time);
            trace.spans.retain(|s| !removed.contains(&s.span_id));

            if trace.spans.is_empty() {
                self.traces.remove(&trace_id);
                self.remove_order_key(&trace_id, old_start);
                self.backlinks.prune_trace(&trace_id);
                continue;
            }

            self.backlinks.prune_sources(&trace_id, &removed);
            let trace = self.traces.get_mut(&trace_id).expect("still present");
            trace.trace_scope = trace.spans[0].scope.clone();
            let new_start = trace.spans[0].start_time;
            let seq = trace.seq;
            if old_start != Some(new_start) {
                self.remove_order_key(&trace_id, old_start);
                self.insert_order_key(OrderKey {
                    start: new_start,
                    seq,
                    trace_id: trace_id.clone(),
                });
            }
        }
    }

    /// Mutable walk over stored client-kind spans, used when the outgoing
    /// peer resolver announces a change.
    pub fn for_each_client_span(&mut self, mut apply: impl FnMut(&mut Span)) {
        for trace in self.traces.values_mut() {
            for span in &mut trace.spans {
                if span.kind == SpanKind::Client {
                    apply(span);
                }
            }
        }
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }
}

/// Resolves a filter field against a span: known fields first, then span,
/// scope, and resource attributes.
fn span_field_value(span: &Span, field: &str) -> Option<String> {
    let normalized = field.to_ascii_lowercase();
    match normalized.as_str() {
        "traceid" | "trace_id" => Some(span.trace_id_hex()),
        "spanid" | "span_id" => Some(span.span_id_hex()),
        "status" => Some(span.status.name().to_string()),
        "kind" => Some(span.kind.name().to_string()),
        "name" => Some(span.name.clone()),
        "resource.service.name" | "resource" => Some(span.resource_view.key().name.clone()),
        "scope.name" | "scope" => Some(span.scope.name.clone()),
        _ => span
            .attributes
            .iter()
            .chain(span.scope.attributes.iter())
            .chain(span.resource_view.attributes.iter())
            .find(|kv| kv.key == field)
            .map(|kv| kv.value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::filters::FilterCondition;
    use crate::repo::resources::{ResourceRegistry, SERVICE_INSTANCE_ID, SERVICE_NAME};
    use crate::repo::time::datetime_to_unix_nanos;
    use chrono::TimeZone;
    use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
    use opentelemetry_proto::tonic::resource::v1::Resource as OtlpResource;
    use opentelemetry_proto::tonic::trace::v1::span::Link;

    fn test_view(name: &str, instance: &str) -> Arc<ResourceView> {
        let mut registry = ResourceRegistry::new();
        let resource = OtlpResource {
            attributes: vec![
                string_kv(SERVICE_NAME, name),
                string_kv(SERVICE_INSTANCE_ID, instance),
            ],
            ..Default::default()
        };
        registry
            .get_or_create_view(Some(&resource), &TelemetryLimitOptions::default())
            .0
    }

    fn string_kv(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(value.to_string())),
            }),
        }
    }

    fn minute_nanos(minute: u32) -> u64 {
        datetime_to_unix_nanos(Utc.with_ymd_and_hms(2030, 1, 1, 0, minute, 0).unwrap())
    }

    fn otlp_span(trace_id: &str, span_id: &str, parent: Option<&str>, minute: u32) -> OtlpSpan {
        OtlpSpan {
            trace_id: trace_id.as_bytes().to_vec(),
            span_id: span_id.as_bytes().to_vec(),
            parent_span_id: parent.map(|p| p.as_bytes().to_vec()).unwrap_or_default(),
            name: format!("span-{span_id}"),
            start_time_unix_nano: minute_nanos(minute),
            end_time_unix_nano: minute_nanos(minute + 1),
            ..Default::default()
        }
    }

    fn insert(
        store: &mut TraceStore,
        view: &Arc<ResourceView>,
        span: &OtlpSpan,
        ctx: &mut AddContext,
    ) -> bool {
        let options = TelemetryLimitOptions::default();
        match Span::from_otlp(span, view, &Scope::empty(), &options) {
            Some(converted) => store.add_span(converted, ctx),
            None => {
                ctx.failure_count += 1;
                false
            }
        }
    }

    fn span_ids(trace: &Trace) -> Vec<String> {
        trace
            .spans()
            .iter()
            .map(|s| String::from_utf8_lossy(&s.span_id).into_owned())
            .collect()
    }

    #[test]
    fn out_of_order_spans_sort_and_resolve_first_and_root() {
        let view = test_view("app", "1");
        let mut store = TraceStore::new(TelemetryLimitOptions::default());
        let mut ctx = AddContext::default();

        for (id, minute) in [("1-2", 2), ("1-5", 5), ("1-3", 3), ("1-4", 4)] {
            insert(&mut store, &view, &otlp_span("1", id, Some("1-1"), minute), &mut ctx);
        }
        insert(&mut store, &view, &otlp_span("1", "1-1", None, 1), &mut ctx);

        assert_eq!(ctx.failure_count, 0);
        let trace = store.get_trace(b"1").unwrap();
        assert_eq!(span_ids(&trace), vec!["1-1", "1-2", "1-3", "1-4", "1-5"]);
        assert_eq!(trace.first_span().span_id, b"1-1");
        assert_eq!(trace.root_span().unwrap().span_id, b"1-1");
    }

    #[test]
    fn first_and_root_can_differ() {
        let view = test_view("app", "1");
        let mut store = TraceStore::new(TelemetryLimitOptions::default());
        let mut ctx = AddContext::default();

        insert(&mut store, &view, &otlp_span("1", "1-1", None, 5), &mut ctx);
        insert(&mut store, &view, &otlp_span("1", "1-2", Some("1-1"), 3), &mut ctx);
        insert(&mut store, &view, &otlp_span("1", "1-3", None, 4), &mut ctx);

        let trace = store.get_trace(b"1").unwrap();
        assert_eq!(trace.first_span().span_id, b"1-2");
        assert_eq!(trace.root_span().unwrap().span_id, b"1-3");
    }

    #[test]
    fn self_parented_span_creates_no_trace() {
        let view = test_view("app", "1");
        let mut store = TraceStore::new(TelemetryLimitOptions::default());
        let mut ctx = AddContext::default();

        let stored = insert(&mut store, &view, &otlp_span("1", "1-1", Some("1-1"), 1), &mut ctx);
        assert!(!stored);
        assert_eq!(ctx.failure_count, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn multi_span_cycle_rejects_only_the_closing_span() {
        let view = test_view("app", "1");
        let mut store = TraceStore::new(TelemetryLimitOptions::default());
        let mut ctx = AddContext::default();

        insert(&mut store, &view, &otlp_span("1", "a", Some("c"), 1), &mut ctx);
        insert(&mut store, &view, &otlp_span("1", "b", Some("a"), 2), &mut ctx);
        insert(&mut store, &view, &otlp_span("1", "c", Some("b"), 3), &mut ctx);

        assert_eq!(ctx.failure_count, 1);
        let trace = store.get_trace(b"1").unwrap();
        assert_eq!(trace.spans().len(), 2);
        assert!(trace.span(b"c").is_none());
    }

    #[test]
    fn duplicate_span_id_first_wins() {
        let view = test_view("app", "1");
        let mut store = TraceStore::new(TelemetryLimitOptions::default());
        let mut ctx = AddContext::default();

        let mut first = otlp_span("1", "1-1", None, 1);
        first.name = "original".into();
        let mut second = otlp_span("1", "1-1", None, 2);
        second.name = "replacement".into();

        insert(&mut store, &view, &first, &mut ctx);
        insert(&mut store, &view, &second, &mut ctx);

        assert_eq!(ctx.failure_count, 1);
        let trace = store.get_trace(b"1").unwrap();
        assert_eq!(trace.spans().len(), 1);
        assert_eq!(trace.spans()[0].name, "original");
    }

    #[test]
    fn missing_ids_are_rejected() {
        let view = test_view("app", "1");
        let mut store = TraceStore::new(TelemetryLimitOptions::default());
        let mut ctx = AddContext::default();

        let mut span = otlp_span("1", "1-1", None, 1);
        span.span_id = Vec::new();
        insert(&mut store, &view, &span, &mut ctx);
        assert_eq!(ctx.failure_count, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn links_produce_backlinks_on_the_target_span() {
        let view = test_view("app", "1");
        let mut store = TraceStore::new(TelemetryLimitOptions::default());
        let mut ctx = AddContext::default();

        let mut source = otlp_span("1", "1-1", None, 1);
        source.links = vec![Link {
            trace_id: b"1".to_vec(),
            span_id: b"1-2".to_vec(),
            attributes: vec![string_kv("link.kind", "follows")],
            ..Default::default()
        }];
        insert(&mut store, &view, &source, &mut ctx);
        insert(&mut store, &view, &otlp_span("1", "1-2", Some("1-1"), 2), &mut ctx);

        let trace = store.get_trace(b"1").unwrap();
        let target = trace.span(b"1-2").unwrap();
        assert_eq!(target.backlinks.len(), 1);
        assert_eq!(target.backlinks[0].span_id, b"1-1");
        assert_eq!(
            target.backlinks[0].attributes,
            vec![KeyValuePair::new("link.kind", "follows")]
        );
        let source = trace.span(b"1-1").unwrap();
        assert_eq!(source.links.len(), 1);
        assert!(source.backlinks.is_empty());
    }

    #[test]
    fn eviction_drops_oldest_first_span_and_its_backlinks() {
        let view = test_view("app", "1");
        let options = TelemetryLimitOptions {
            max_trace_count: 2,
            ..Default::default()
        };
        let mut store = TraceStore::new(options);
        let mut ctx = AddContext::default();

        let mut linking = otlp_span("t1", "s1", None, 1);
        linking.links = vec![Link {
            trace_id: b"t2".to_vec(),
            span_id: b"s2".to_vec(),
            ..Default::default()
        }];
        insert(&mut store, &view, &linking, &mut ctx);
        insert(&mut store, &view, &otlp_span("t2", "s2", None, 2), &mut ctx);
        insert(&mut store, &view, &otlp_span("t3", "s3", None, 3), &mut ctx);

        assert_eq!(store.trace_count(), 2);
        assert!(store.get_trace(b"t1").is_none());
        // t1's link entry disappeared with it.
        let t2 = store.get_trace(b"t2").unwrap();
        assert!(t2.span(b"s2").unwrap().backlinks.is_empty());
    }

    #[test]
    fn get_traces_orders_by_first_span_and_pages() {
        let view = test_view("app", "1");
        let mut store = TraceStore::new(TelemetryLimitOptions::default());
        let mut ctx = AddContext::default();

        insert(&mut store, &view, &otlp_span("t2", "s2", None, 5), &mut ctx);
        insert(&mut store, &view, &otlp_span("t1", "s1", None, 1), &mut ctx);
        insert(&mut store, &view, &otlp_span("t3", "s3", None, 9), &mut ctx);

        let result = store.get_traces(&GetTracesRequest {
            resource_key: None,
            filter_text: String::new(),
            filters: Vec::new(),
            start_index: 0,
            count: 2,
        });
        assert_eq!(result.total_item_count, 3);
        let ids: Vec<String> = result.items.iter().map(|t| String::from_utf8_lossy(&t.trace_id).into_owned()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[test]
    fn filters_match_known_fields_and_attributes() {
        let view = test_view("app", "1");
        let mut store = TraceStore::new(TelemetryLimitOptions::default());
        let mut ctx = AddContext::default();

        let mut span = otlp_span("t1", "s1", None, 1);
        span.kind = 3; // client
        span.attributes = vec![string_kv("peer.service", "redis")];
        insert(&mut store, &view, &span, &mut ctx);
        insert(&mut store, &view, &otlp_span("t2", "s2", None, 2), &mut ctx);

        let request = |filters: Vec<FieldFilter>, text: &str| GetTracesRequest {
            resource_key: None,
            filter_text: text.to_string(),
            filters,
            start_index: 0,
            count: usize::MAX,
        };

        let by_kind = store.get_traces(&request(
            vec![FieldFilter::new("kind", FilterCondition::Equals, "client")],
            "",
        ));
        assert_eq!(by_kind.total_item_count, 1);

        let by_attr = store.get_traces(&request(
            vec![FieldFilter::new("peer.service", FilterCondition::Contains, "red")],
            "",
        ));
        assert_eq!(by_attr.total_item_count, 1);

        let by_text = store.get_traces(&request(Vec::new(), "span-s2"));
        assert_eq!(by_text.total_item_count, 1);

        // A trace matches when any of its spans satisfies the condition;
        // t1's only span is client-kind, so it drops out.
        let excluded = store.get_traces(&request(
            vec![FieldFilter::new("kind", FilterCondition::NotEqual, "client")],
            "",
        ));
        assert_eq!(excluded.total_item_count, 1);
    }

    #[test]
    fn snapshots_are_deep_copies() {
        let view = test_view("app", "1");
        let mut store = TraceStore::new(TelemetryLimitOptions::default());
        let mut ctx = AddContext::default();
        insert(&mut store, &view, &otlp_span("t1", "s1", None, 1), &mut ctx);

        let request = GetTracesRequest {
            resource_key: None,
            filter_text: String::new(),
            filters: Vec::new(),
            start_index: 0,
            count: usize::MAX,
        };
        let mut first = store.get_traces(&request);
        first.items[0].spans[0].name = "mutated".into();
        first.items[0].spans[0].attributes.push(KeyValuePair::new("x", "y"));

        let second = store.get_traces(&request);
        assert_eq!(second.items[0].spans()[0].name, "span-s1");
        assert!(second.items[0].spans()[0].attributes.is_empty());
    }

    #[test]
    fn clear_by_resource_prunes_spans_and_empty_traces() {
        let view_a = test_view("a", "1");
        let view_b = test_view("b", "1");
        let mut store = TraceStore::new(TelemetryLimitOptions::default());
        let mut ctx = AddContext::default();

        insert(&mut store, &view_a, &otlp_span("t1", "s1", None, 1), &mut ctx);
        let converted = Span::from_otlp(
            &otlp_span("t1", "s2", Some("s1"), 2),
            &view_b,
            &Scope::empty(),
            &TelemetryLimitOptions::default(),
        )
        .unwrap();
        store.add_span(converted, &mut ctx);
        insert(&mut store, &view_a, &otlp_span("t2", "s3", None, 3), &mut ctx);

        store.clear(Some(&ResourceKey::name_only("a")));
        assert_eq!(store.trace_count(), 1);
        let t1 = store.get_trace(b"t1").unwrap();
        assert_eq!(t1.spans().len(), 1);
        assert_eq!(t1.spans()[0].span_id, b"s2");
        assert_eq!(t1.first_span().span_id, b"s2");
        assert!(store.get_trace(b"t2").is_none());

        store.clear(None);
        assert!(store.is_empty());
    }

    #[test]
    fn trace_full_name_follows_the_first_span() {
        let view = test_view("frontend", "1");
        let mut store = TraceStore::new(TelemetryLimitOptions::default());
        let mut ctx = AddContext::default();

        insert(&mut store, &view, &otlp_span("t1", "s2", Some("s1"), 5), &mut ctx);
        let trace = store.get_trace(b"t1").unwrap();
        assert_eq!(trace.full_name(), format!("frontend: span-s2. Id: {}", hex::encode(b"s2")));

        insert(&mut store, &view, &otlp_span("t1", "s1", None, 1), &mut ctx);
        let trace = store.get_trace(b"t1").unwrap();
        assert_eq!(trace.full_name(), format!("frontend: span-s1. Id: {}", hex::encode(b"s1")));
    }

    #[test]
    fn events_are_capped_then_time_sorted() {
        use opentelemetry_proto::tonic::trace::v1::span::Event;
        let view = test_view("app", "1");
        let options = TelemetryLimitOptions {
            max_span_event_count: 2,
            ..Default::default()
        };

        let mut span = otlp_span("t1", "s1", None, 1);
        span.events = vec![
            Event {
                time_unix_nano: minute_nanos(3),
                name: "late".into(),
                ..Default::default()
            },
            Event {
                time_unix_nano: minute_nanos(1),
                name: "early".into(),
                ..Default::default()
            },
            Event {
                time_unix_nano: minute_nanos(2),
                name: "dropped".into(),
                ..Default::default()
            },
        ];
        let converted = Span::from_otlp(&span, &view, &Scope::empty(), &options).unwrap();
        let names: Vec<&str> = converted.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["early", "late"]);
    }

    #[test]
    fn unknown_span_kind_maps_to_unspecified() {
        assert_eq!(SpanKind::from_otlp(1000), SpanKind::Unspecified);
        assert_eq!(SpanKind::from_otlp(0), SpanKind::Unspecified);
        assert_eq!(SpanKind::from_otlp(3), SpanKind::Client);
    }

    #[test]
    fn property_keys_union_is_sorted() {
        let view = test_view("app", "1");
        let mut store = TraceStore::new(TelemetryLimitOptions::default());
        let mut ctx = AddContext::default();

        let mut span = otlp_span("t1", "s1", None, 1);
        span.attributes = vec![string_kv("zeta", "1"), string_kv("alpha", "2")];
        insert(&mut store, &view, &span, &mut ctx);

        assert_eq!(store.property_keys(None), vec!["alpha", "zeta"]);
        assert!(store
            .property_keys(Some(&ResourceKey::name_only("missing")))
            .is_empty());
    }
}
