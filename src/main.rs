use std::sync::Arc;

use clap::Parser;
use otel_dash::config::TelemetryLimitOptions;
use otel_dash::repo::TelemetryRepository;
use otel_dash::{otlp, ws};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// OTel dashboard backend — receives logs, traces, and metrics via OTLP
/// gRPC, stores them in memory, and serves live change notifications to
/// the dashboard UI over WebSockets.
#[derive(Parser)]
#[command(name = "otel-dash-backend", about = "OTel dashboard telemetry backend")]
struct Args {
    /// OTLP gRPC bind address
    #[arg(long, env = "OTEL_DASH_OTLP_ADDR", default_value = "[::]:4317")]
    otlp_addr: String,

    /// HTTP / WebSocket bind address
    #[arg(long, env = "OTEL_DASH_HTTP_ADDR", default_value = "0.0.0.0:8081")]
    http_addr: String,

    /// Global log ring size
    #[arg(long, env = "OTEL_DASH_MAX_LOG_COUNT", default_value_t = 10_000)]
    max_log_count: usize,

    /// Maximum retained traces
    #[arg(long, env = "OTEL_DASH_MAX_TRACE_COUNT", default_value_t = 10_000)]
    max_trace_count: usize,

    /// Data points retained per metric dimension
    #[arg(long, env = "OTEL_DASH_MAX_METRICS_COUNT", default_value_t = 30_000)]
    max_metrics_count: usize,

    /// Attributes retained per record
    #[arg(long, env = "OTEL_DASH_MAX_ATTRIBUTE_COUNT", default_value_t = 128)]
    max_attribute_count: usize,

    /// Attribute value length cap in UTF-16 units (unlimited if unset)
    #[arg(long, env = "OTEL_DASH_MAX_ATTRIBUTE_LENGTH")]
    max_attribute_length: Option<usize>,

    /// Events retained per span
    #[arg(long, env = "OTEL_DASH_MAX_SPAN_EVENT_COUNT", default_value_t = 128)]
    max_span_event_count: usize,
}

impl Args {
    fn limit_options(&self) -> TelemetryLimitOptions {
        TelemetryLimitOptions {
            max_log_count: self.max_log_count,
            max_trace_count: self.max_trace_count,
            max_metrics_count: self.max_metrics_count,
            max_attribute_count: self.max_attribute_count,
            max_attribute_length: self.max_attribute_length.unwrap_or(usize::MAX),
            max_span_event_count: self.max_span_event_count,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "otel_dash=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let options = args.limit_options();
    options.validate()?;

    let repository = Arc::new(TelemetryRepository::new(options));
    let _peer_watcher = repository.spawn_peer_watcher();

    // Start the OTLP gRPC receiver
    let otlp_repository = repository.clone();
    let otlp_addr = args.otlp_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = otlp::run_otlp_server(otlp_repository, &otlp_addr).await {
            tracing::error!("OTLP server error: {}", e);
        }
    });

    // Stop subscriptions cleanly on ctrl-c
    let shutdown_repository = repository.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            shutdown_repository.shutdown();
            std::process::exit(0);
        }
    });

    // Start the HTTP / WebSocket server
    info!("Starting HTTP/WebSocket server on {}", args.http_addr);
    ws::run_http_server(repository, &args.http_addr).await?;

    Ok(())
}
