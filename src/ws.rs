/// HTTP server with WebSocket endpoint for the UI. Each connected client
/// is backed by repository subscriptions; fires are forwarded as small
/// JSON notifications and the client re-queries what it is showing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::repo::resources::ResourceSummary;
use crate::repo::subscriptions::{ExecutionContext, SubscriptionType};
use crate::repo::TelemetryRepository;

type SharedRepository = Arc<TelemetryRepository>;

/// How often, at most, a client is poked per signal.
const NOTIFY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsMessage {
    /// Current resource list; sent on connect and when applications change.
    Resources { resources: Vec<ResourceSummary> },
    NewLogs,
    NewTraces,
    NewMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notification {
    Applications,
    Logs,
    Traces,
    Metrics,
}

pub async fn run_http_server(repository: SharedRepository, bind: &str) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(repository);

    info!("HTTP server listening on {}", bind);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(repository): State<SharedRepository>,
) -> impl IntoResponse {
    let viewing = params.get("viewing").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, repository, viewing))
}

fn subscription_type(viewing: &str, signal: &str) -> SubscriptionType {
    if viewing == signal {
        SubscriptionType::Read
    } else {
        SubscriptionType::Other
    }
}

async fn handle_socket(socket: WebSocket, repository: SharedRepository, viewing: String) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Notification>(16);

    let notify = |notification: Notification| {
        let tx = tx.clone();
        move |_cancel: tokio_util::sync::CancellationToken| {
            // Full channel means a poke is already queued for this client.
            let _ = tx.try_send(notification);
            async {}.boxed()
        }
    };

    // The signal the client declares it is viewing gets a Read
    // subscription, which auto-views incoming error logs for it.
    let _applications = repository.on_new_applications(
        "ws-applications",
        Duration::ZERO,
        ExecutionContext::capture(),
        Arc::new(notify(Notification::Applications)),
    );
    let _logs = repository.on_new_logs(
        "ws-logs",
        None,
        subscription_type(&viewing, "logs"),
        NOTIFY_INTERVAL,
        ExecutionContext::capture(),
        Arc::new(notify(Notification::Logs)),
    );
    let _traces = repository.on_new_traces(
        "ws-traces",
        None,
        subscription_type(&viewing, "traces"),
        NOTIFY_INTERVAL,
        ExecutionContext::capture(),
        Arc::new(notify(Notification::Traces)),
    );
    let _metrics = repository.on_new_metrics(
        "ws-metrics",
        None,
        subscription_type(&viewing, "metrics"),
        NOTIFY_INTERVAL,
        ExecutionContext::capture(),
        Arc::new(notify(Notification::Metrics)),
    );

    // Initial resource snapshot.
    if send_message(&mut sender, &resources_message(&repository)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            notification = rx.recv() => {
                let Some(notification) = notification else { break };
                let message = match notification {
                    Notification::Applications => resources_message(&repository),
                    Notification::Logs => WsMessage::NewLogs,
                    Notification::Traces => WsMessage::NewTraces,
                    Notification::Metrics => WsMessage::NewMetrics,
                };
                if send_message(&mut sender, &message).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.trim() == "resources" {
                            let snapshot = resources_message(&repository);
                            if send_message(&mut sender, &snapshot).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("WebSocket receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Subscription handles unsubscribe on drop.
    info!("WebSocket client disconnected");
}

fn resources_message(repository: &SharedRepository) -> WsMessage {
    WsMessage::Resources {
        resources: repository.get_resources(true),
    }
}

async fn send_message(
    sender: &mut (impl SinkExt<Message> + Unpin),
    message: &WsMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(message).map_err(|_| ())?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}
