//! The in-memory telemetry repository: single entry point for OTLP ingest,
//! queries, clearing, pause control, and change subscriptions.
//!
//! Locking model: each store sits behind its own `RwLock`; an ingest takes
//! the resource registry briefly to resolve views, then one store write
//! lock for the whole call, so readers never observe a partially inserted
//! record. Cross-store state (pause flags, subscriptions) is atomic or
//! sharded and never held across a store lock.

pub mod attributes;
pub mod filters;
pub mod logs;
pub mod metrics;
pub mod pause;
pub mod peers;
pub mod resources;
pub mod scope;
pub mod subscriptions;
pub mod time;
pub mod traces;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use opentelemetry_proto::tonic::logs::v1::ResourceLogs;
use opentelemetry_proto::tonic::metrics::v1::ResourceMetrics;
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;

use crate::config::TelemetryLimitOptions;
use crate::repo::filters::PagedResult;
use crate::repo::logs::{GetLogsRequest, LogEntry, LogStore};
use crate::repo::metrics::{
    GetInstrumentRequest, InstrumentSnapshot, InstrumentSummary, MetricStore,
};
use crate::repo::pause::PauseManager;
use crate::repo::peers::{NoopOutgoingPeerResolver, OutgoingPeerResolver};
use crate::repo::resources::{Resource, ResourceKey, ResourceRegistry, ResourceSummary};
use crate::repo::scope::Scope;
use crate::repo::subscriptions::{
    ExecutionContext, SubscriptionCallback, SubscriptionEngine, SubscriptionHandle,
    SubscriptionType,
};
use crate::repo::traces::{GetTracesRequest, Span, SpanKind, Trace, TraceStore};

/// Per-call ingest outcome. Rejected items (cycles, duplicate span ids,
/// missing required ids, unsupported payloads) are counted here; stored
/// items never add, and pause drops leave the count at zero.
#[derive(Debug, Default)]
pub struct AddContext {
    pub failure_count: usize,
}

/// Selectable data categories for [`TelemetryRepository::clear_selected_signals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DataType {
    StructuredLogs,
    Traces,
    Metrics,
    Resource,
}

pub struct TelemetryRepository {
    options: TelemetryLimitOptions,
    registry: RwLock<ResourceRegistry>,
    logs: RwLock<LogStore>,
    traces: RwLock<TraceStore>,
    metrics: RwLock<MetricStore>,
    subscriptions: SubscriptionEngine,
    pause: PauseManager,
    peer_resolver: Arc<dyn OutgoingPeerResolver>,
}

impl TelemetryRepository {
    pub fn new(options: TelemetryLimitOptions) -> Self {
        Self::with_peer_resolver(options, Arc::new(NoopOutgoingPeerResolver::new()))
    }

    pub fn with_peer_resolver(
        options: TelemetryLimitOptions,
        peer_resolver: Arc<dyn OutgoingPeerResolver>,
    ) -> Self {
        Self {
            registry: RwLock::new(ResourceRegistry::new()),
            logs: RwLock::new(LogStore::new(options.clone())),
            traces: RwLock::new(TraceStore::new(options.clone())),
            metrics: RwLock::new(MetricStore::new(options.clone())),
            subscriptions: SubscriptionEngine::new(),
            pause: PauseManager::new(),
            peer_resolver,
            options,
        }
    }

    pub fn options(&self) -> &TelemetryLimitOptions {
        &self.options
    }

    pub fn pause(&self) -> &PauseManager {
        &self.pause
    }

    fn ensure_active(&self) {
        assert!(
            !self.subscriptions.is_shut_down(),
            "telemetry repository used after shutdown"
        );
    }

    // ── ingest ──────────────────────────────────────────────────────────

    pub fn add_logs(&self, _ctx: &mut AddContext, resource_logs: &[ResourceLogs]) {
        self.ensure_active();
        if self.pause.structured_logs_paused() {
            return;
        }

        let mut affected: Vec<ResourceKey> = Vec::new();
        let mut new_resource = false;
        let mut stored = 0usize;

        let mut batches = Vec::new();
        for resource in resource_logs {
            let (view, created) = self
                .write_registry()
                .get_or_create_view(resource.resource.as_ref(), &self.options);
            new_resource |= created;
            let key = view.key().clone();
            let read_covered = self.subscriptions.read_subscription_covers(&key);
            affected.push(key);
            for scope_logs in &resource.scope_logs {
                let scope = Scope::from_otlp(scope_logs.scope.as_ref(), &self.options);
                batches.push((view.clone(), scope, &scope_logs.log_records, read_covered));
            }
        }

        {
            let mut logs = self.write_logs();
            for (view, scope, records, read_covered) in batches {
                for record in records {
                    logs.add_log_record(record, &view, &scope, read_covered);
                    stored += 1;
                }
            }
        }

        if new_resource {
            self.subscriptions.notify_applications();
        }
        if stored > 0 {
            self.subscriptions.notify_logs(&affected);
        }
    }

    pub fn add_traces(&self, ctx: &mut AddContext, resource_spans: &[ResourceSpans]) {
        self.ensure_active();
        if self.pause.traces_paused() {
            return;
        }

        let mut affected: Vec<ResourceKey> = Vec::new();
        let mut new_resource = false;
        let mut converted: Vec<Span> = Vec::new();

        for resource in resource_spans {
            let (view, created) = self
                .write_registry()
                .get_or_create_view(resource.resource.as_ref(), &self.options);
            new_resource |= created;
            affected.push(view.key().clone());
            for scope_spans in &resource.scope_spans {
                let scope = Scope::from_otlp(scope_spans.scope.as_ref(), &self.options);
                for otlp_span in &scope_spans.spans {
                    match Span::from_otlp(otlp_span, &view, &scope, &self.options) {
                        Some(mut span) => {
                            if span.kind == SpanKind::Client {
                                if let Some(name) =
                                    self.peer_resolver.resolve_peer(&span.attributes)
                                {
                                    let (peer, peer_created) =
                                        self.write_registry().get_or_create_peer(&name);
                                    new_resource |= peer_created;
                                    span.uninstrumented_peer = Some(peer);
                                }
                            }
                            converted.push(span);
                        }
                        None => {
                            tracing::debug!(
                                trace_id = %hex::encode(&otlp_span.trace_id),
                                span_id = %hex::encode(&otlp_span.span_id),
                                "span rejected: missing required id"
                            );
                            ctx.failure_count += 1;
                        }
                    }
                }
            }
        }

        let mut stored = 0usize;
        {
            let mut traces = self.write_traces();
            for span in converted {
                if traces.add_span(span, ctx) {
                    stored += 1;
                }
            }
        }

        if new_resource {
            self.subscriptions.notify_applications();
        }
        if stored > 0 {
            self.subscriptions.notify_traces(&affected);
        }
    }

    pub fn add_metrics(&self, ctx: &mut AddContext, resource_metrics: &[ResourceMetrics]) {
        self.ensure_active();
        if self.pause.metrics_paused() {
            return;
        }

        let mut affected: Vec<ResourceKey> = Vec::new();
        let mut new_resource = false;
        let mut stored = 0usize;

        let mut batches = Vec::new();
        for resource in resource_metrics {
            let (view, created) = self
                .write_registry()
                .get_or_create_view(resource.resource.as_ref(), &self.options);
            new_resource |= created;
            affected.push(view.key().clone());
            for scope_metrics in &resource.scope_metrics {
                let scope = Scope::from_otlp(scope_metrics.scope.as_ref(), &self.options);
                batches.push((view.clone(), scope, &scope_metrics.metrics));
            }
        }

        {
            let mut metrics = self.write_metrics();
            for (view, scope, batch) in batches {
                for metric in batch {
                    if metrics.add_metric(&view, &scope, metric, ctx) {
                        stored += 1;
                    }
                }
            }
        }

        if new_resource {
            self.subscriptions.notify_applications();
        }
        if stored > 0 {
            self.subscriptions.notify_metrics(&affected);
        }
    }

    // ── queries ─────────────────────────────────────────────────────────

    pub fn get_resources(&self, include_uninstrumented_peers: bool) -> Vec<ResourceSummary> {
        self.read_registry().summaries(include_uninstrumented_peers)
    }

    pub fn get_resource_by_composite_name(&self, composite_name: &str) -> Option<Arc<Resource>> {
        self.read_registry().get_by_composite_name(composite_name)
    }

    pub fn get_logs(&self, request: &GetLogsRequest) -> PagedResult<LogEntry> {
        self.read_logs().get_logs(request)
    }

    pub fn get_log_property_keys(&self, resource_key: Option<&ResourceKey>) -> Vec<String> {
        self.read_logs().property_keys(resource_key)
    }

    pub fn get_unviewed_error_counts(&self) -> HashMap<ResourceKey, usize> {
        self.read_logs().unviewed_error_counts()
    }

    pub fn mark_viewed_error_logs(&self, resource_key: Option<&ResourceKey>) {
        self.write_logs().mark_viewed(resource_key);
    }

    pub fn get_traces(&self, request: &GetTracesRequest) -> PagedResult<Trace> {
        self.read_traces().get_traces(request)
    }

    pub fn get_trace(&self, trace_id: &[u8]) -> Option<Trace> {
        self.read_traces().get_trace(trace_id)
    }

    pub fn get_trace_property_keys(&self, resource_key: Option<&ResourceKey>) -> Vec<String> {
        self.read_traces().property_keys(resource_key)
    }

    pub fn get_instrument(&self, request: &GetInstrumentRequest) -> Option<InstrumentSnapshot> {
        self.read_metrics().get_instrument(request)
    }

    pub fn get_instruments_summaries(&self, resource_key: &ResourceKey) -> Vec<InstrumentSummary> {
        self.read_metrics().get_instruments_summaries(resource_key)
    }

    // ── clearing ────────────────────────────────────────────────────────

    pub fn clear_structured_logs(&self, resource_key: Option<&ResourceKey>) {
        self.ensure_active();
        self.write_logs().clear(resource_key);
    }

    pub fn clear_traces(&self, resource_key: Option<&ResourceKey>) {
        self.ensure_active();
        self.write_traces().clear(resource_key);
    }

    pub fn clear_metrics(&self, resource_key: Option<&ResourceKey>) {
        self.ensure_active();
        self.write_metrics().clear(resource_key);
    }

    /// Removes the selected signals per composite resource name, all under
    /// the store write locks so the removal is observed as one step. A
    /// resource with all four categories selected disappears from the
    /// registry entirely.
    pub fn clear_selected_signals(&self, selections: &HashMap<String, HashSet<DataType>>) {
        self.ensure_active();
        let mut registry = self.write_registry();
        let mut logs = self.write_logs();
        let mut traces = self.write_traces();
        let mut metrics = self.write_metrics();

        for (composite_name, types) in selections {
            let Some(resource) = registry.get_by_composite_name(composite_name) else {
                continue;
            };
            let key = resource.key.clone();
            if types.contains(&DataType::StructuredLogs) {
                logs.clear(Some(&key));
            }
            if types.contains(&DataType::Traces) {
                traces.clear(Some(&key));
            }
            if types.contains(&DataType::Metrics) {
                metrics.clear(Some(&key));
            }
            if types.contains(&DataType::Resource)
                && types.contains(&DataType::StructuredLogs)
                && types.contains(&DataType::Traces)
                && types.contains(&DataType::Metrics)
            {
                registry.remove(&key);
            }
        }
    }

    // ── subscriptions ───────────────────────────────────────────────────

    pub fn on_new_applications(
        &self,
        name: impl Into<String>,
        min_execute_interval: Duration,
        context: ExecutionContext,
        callback: SubscriptionCallback,
    ) -> SubscriptionHandle {
        self.subscriptions
            .on_new_applications(name, min_execute_interval, context, callback)
    }

    pub fn on_new_logs(
        &self,
        name: impl Into<String>,
        resource_key: Option<ResourceKey>,
        subscription_type: SubscriptionType,
        min_execute_interval: Duration,
        context: ExecutionContext,
        callback: SubscriptionCallback,
    ) -> SubscriptionHandle {
        self.subscriptions.on_new_logs(
            name,
            resource_key,
            subscription_type,
            min_execute_interval,
            context,
            callback,
        )
    }

    pub fn on_new_traces(
        &self,
        name: impl Into<String>,
        resource_key: Option<ResourceKey>,
        subscription_type: SubscriptionType,
        min_execute_interval: Duration,
        context: ExecutionContext,
        callback: SubscriptionCallback,
    ) -> SubscriptionHandle {
        self.subscriptions.on_new_traces(
            name,
            resource_key,
            subscription_type,
            min_execute_interval,
            context,
            callback,
        )
    }

    pub fn on_new_metrics(
        &self,
        name: impl Into<String>,
        resource_key: Option<ResourceKey>,
        subscription_type: SubscriptionType,
        min_execute_interval: Duration,
        context: ExecutionContext,
        callback: SubscriptionCallback,
    ) -> SubscriptionHandle {
        self.subscriptions.on_new_metrics(
            name,
            resource_key,
            subscription_type,
            min_execute_interval,
            context,
            callback,
        )
    }

    // ── peer resolution ─────────────────────────────────────────────────

    /// Re-resolves peer membership for every stored client-kind span. Run
    /// whenever the outgoing peer resolver's configuration changes.
    pub fn peer_resolver_changed(&self) {
        let mut new_resource = false;
        {
            let mut registry = self.write_registry();
            let mut traces = self.write_traces();
            traces.for_each_client_span(|span| {
                span.uninstrumented_peer =
                    self.peer_resolver.resolve_peer(&span.attributes).map(|name| {
                        let (peer, created) = registry.get_or_create_peer(&name);
                        new_resource |= created;
                        peer
                    });
            });
        }
        if new_resource {
            self.subscriptions.notify_applications();
        }
    }

    /// Watches the resolver's change signal and re-resolves on each tick.
    /// Ends when the resolver goes away or the repository shuts down.
    pub fn spawn_peer_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut changes = self.peer_resolver.subscribe_changes();
        let repository = self.clone();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                if repository.subscriptions.is_shut_down() {
                    break;
                }
                repository.peer_resolver_changed();
            }
        })
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Cancels all subscriptions and marks the repository unusable; any
    /// later ingest or clear fails fast.
    pub fn shutdown(&self) {
        self.subscriptions.shutdown();
    }

    // ── lock helpers ────────────────────────────────────────────────────

    fn read_registry(&self) -> RwLockReadGuard<'_, ResourceRegistry> {
        self.registry.read().expect("resource registry lock poisoned")
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, ResourceRegistry> {
        self.registry.write().expect("resource registry lock poisoned")
    }

    fn read_logs(&self) -> RwLockReadGuard<'_, LogStore> {
        self.logs.read().expect("log store lock poisoned")
    }

    fn write_logs(&self) -> RwLockWriteGuard<'_, LogStore> {
        self.logs.write().expect("log store lock poisoned")
    }

    fn read_traces(&self) -> RwLockReadGuard<'_, TraceStore> {
        self.traces.read().expect("trace store lock poisoned")
    }

    fn write_traces(&self) -> RwLockWriteGuard<'_, TraceStore> {
        self.traces.write().expect("trace store lock poisoned")
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, MetricStore> {
        self.metrics.read().expect("metric store lock poisoned")
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, MetricStore> {
        self.metrics.write().expect("metric store lock poisoned")
    }
}
