//! Live change notification. Each signal (applications, logs, traces,
//! metrics) is a named channel of subscriptions; an ingest fires the
//! subscriptions whose resource selector covers an affected resource.
//! Callbacks run on the tokio worker pool under the execution context
//! captured at subscribe time, never on the ingest thread, and each
//! subscription fires at most once per `min_execute_interval`; extra
//! triggers during the quiet period collapse into one trailing fire.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::repo::resources::ResourceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    /// The subscriber is actively viewing the data; error logs arriving
    /// under a Read subscription are auto-viewed.
    Read,
    Other,
}

/// Ambient state restored around each callback execution. Captures the
/// current `tracing` span; subscribers that do not want the subscribe-time
/// context use [`ExecutionContext::suppressed`] explicitly.
#[derive(Clone)]
pub struct ExecutionContext {
    span: tracing::Span,
}

impl ExecutionContext {
    pub fn capture() -> Self {
        Self {
            span: tracing::Span::current(),
        }
    }

    pub fn suppressed() -> Self {
        Self {
            span: tracing::Span::none(),
        }
    }
}

pub type SubscriptionCallback =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct FireState {
    last_fire: Option<Instant>,
    trailing_scheduled: bool,
}

struct SubscriptionInner {
    id: u64,
    name: String,
    resource_key: Option<ResourceKey>,
    subscription_type: SubscriptionType,
    callback: SubscriptionCallback,
    context: ExecutionContext,
    min_execute_interval: Duration,
    cancellation: CancellationToken,
    disposed: AtomicBool,
    fire_state: Mutex<FireState>,
}

impl SubscriptionInner {
    fn covers(&self, key: &ResourceKey) -> bool {
        self.resource_key
            .as_ref()
            .is_none_or(|selector| selector.matches(key))
    }

    fn matches(&self, affected: &[ResourceKey]) -> bool {
        match &self.resource_key {
            None => true,
            Some(selector) => affected.iter().any(|key| selector.matches(key)),
        }
    }
}

#[derive(Clone, Default)]
struct Channel {
    subscriptions: Arc<DashMap<u64, Arc<SubscriptionInner>>>,
}

/// Handle returned by the `on_new_*` operations. Dropping it or calling
/// [`unsubscribe`](SubscriptionHandle::unsubscribe) removes the
/// subscription; removal happens exactly once no matter how often either
/// occurs.
pub struct SubscriptionHandle {
    inner: Arc<SubscriptionInner>,
    channel: Channel,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        if !self.inner.disposed.swap(true, Ordering::SeqCst) {
            self.channel.subscriptions.remove(&self.inner.id);
            self.inner.cancellation.cancel();
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

pub struct SubscriptionEngine {
    next_id: AtomicU64,
    applications: Channel,
    logs: Channel,
    traces: Channel,
    metrics: Channel,
    shutdown: CancellationToken,
}

impl Default for SubscriptionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionEngine {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            applications: Channel::default(),
            logs: Channel::default(),
            traces: Channel::default(),
            metrics: Channel::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn on_new_applications(
        &self,
        name: impl Into<String>,
        min_execute_interval: Duration,
        context: ExecutionContext,
        callback: SubscriptionCallback,
    ) -> SubscriptionHandle {
        self.subscribe(
            &self.applications,
            name.into(),
            None,
            SubscriptionType::Other,
            min_execute_interval,
            context,
            callback,
        )
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
        self.subscribe(
            &self.logs,
            name.into(),
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
        self.subscribe(
            &self.traces,
            name.into(),
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
        self.subscribe(
            &self.metrics,
            name.into(),
            resource_key,
            subscription_type,
            min_execute_interval,
            context,
            callback,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn subscribe(
        &self,
        channel: &Channel,
        name: String,
        resource_key: Option<ResourceKey>,
        subscription_type: SubscriptionType,
        min_execute_interval: Duration,
        context: ExecutionContext,
        callback: SubscriptionCallback,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(SubscriptionInner {
            id,
            name,
            resource_key,
            subscription_type,
            callback,
            context,
            min_execute_interval,
            cancellation: self.shutdown.child_token(),
            disposed: AtomicBool::new(false),
            fire_state: Mutex::new(FireState::default()),
        });
        channel.subscriptions.insert(id, inner.clone());
        SubscriptionHandle {
            inner,
            channel: channel.clone(),
        }
    }

    pub fn notify_applications(&self) {
        Self::fire_channel(&self.applications, &[]);
    }

    pub fn notify_logs(&self, affected: &[ResourceKey]) {
        Self::fire_channel(&self.logs, affected);
    }

    pub fn notify_traces(&self, affected: &[ResourceKey]) {
        Self::fire_channel(&self.traces, affected);
    }

    pub fn notify_metrics(&self, affected: &[ResourceKey]) {
        Self::fire_channel(&self.metrics, affected);
    }

    /// Whether a Read-type log subscription currently covers the resource;
    /// an error log arriving under one is marked viewed on arrival.
    pub fn read_subscription_covers(&self, key: &ResourceKey) -> bool {
        self.logs.subscriptions.iter().any(|entry| {
            let sub = entry.value();
            sub.subscription_type == SubscriptionType::Read && sub.covers(key)
        })
    }

    /// Cancels every subscription and stops trailing fires. Used on
    /// repository shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for channel in [&self.applications, &self.logs, &self.traces, &self.metrics] {
            channel.subscriptions.clear();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn fire_channel(channel: &Channel, affected: &[ResourceKey]) {
        for entry in channel.subscriptions.iter() {
            let sub = entry.value().clone();
            if sub.matches(affected) {
                Self::trigger(sub);
            }
        }
    }

    /// Posts one fire signal for the subscription. Within the quiet period
    /// the fire is deferred to the end of the interval; concurrent
    /// triggers during that window collapse into the already-scheduled
    /// trailing fire.
    fn trigger(sub: Arc<SubscriptionInner>) {
        if sub.disposed.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let mut state = sub
            .fire_state
            .lock()
            .expect("subscription fire state lock poisoned");
        match state.last_fire {
            Some(last) if now.duration_since(last) < sub.min_execute_interval => {
                if state.trailing_scheduled {
                    return;
                }
                state.trailing_scheduled = true;
                let fire_at = last + sub.min_execute_interval;
                drop(state);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep_until(fire_at) => {
                            {
                                let mut state = sub
                                    .fire_state
                                    .lock()
                                    .expect("subscription fire state lock poisoned");
                                state.trailing_scheduled = false;
                                state.last_fire = Some(Instant::now());
                            }
                            Self::execute(sub).await;
                        }
                        _ = sub.cancellation.cancelled() => {}
                    }
                });
            }
            _ => {
                state.last_fire = Some(now);
                drop(state);
                tokio::spawn(async move {
                    Self::execute(sub).await;
                });
            }
        }
    }

    async fn execute(sub: Arc<SubscriptionInner>) {
        if sub.disposed.load(Ordering::SeqCst) {
            tracing::debug!("Callback '{}' has been disposed.", sub.name);
            return;
        }
        let future = (sub.callback)(sub.cancellation.clone());
        let span = sub.context.span.clone();
        if std::panic::AssertUnwindSafe(future.instrument(span))
            .catch_unwind()
            .await
            .is_err()
        {
            tracing::warn!(subscription = %sub.name, "subscription callback panicked");
        }
    }
}
