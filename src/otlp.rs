/// OTLP gRPC server — receives logs, traces, and metrics from the
/// OpenTelemetry Collector (or SDKs exporting directly) and feeds the
/// decoded requests into the shared telemetry repository.

use std::sync::Arc;

use opentelemetry_proto::tonic::collector::{
    logs::v1::{
        logs_service_server::{LogsService, LogsServiceServer},
        ExportLogsPartialSuccess, ExportLogsServiceRequest, ExportLogsServiceResponse,
    },
    metrics::v1::{
        metrics_service_server::{MetricsService, MetricsServiceServer},
        ExportMetricsPartialSuccess, ExportMetricsServiceRequest, ExportMetricsServiceResponse,
    },
    trace::v1::{
        trace_service_server::{TraceService, TraceServiceServer},
        ExportTracePartialSuccess, ExportTraceServiceRequest, ExportTraceServiceResponse,
    },
};
use tonic::{transport::Server, Request, Response, Status};
use tracing::info;

use crate::repo::{AddContext, TelemetryRepository};

const PARTIAL_SUCCESS_MESSAGE: &str = "some records were rejected";

#[derive(Clone)]
pub struct OtlpLogsReceiver {
    repository: Arc<TelemetryRepository>,
}

#[tonic::async_trait]
impl LogsService for OtlpLogsReceiver {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        let req = request.into_inner();
        let mut ctx = AddContext::default();
        self.repository.add_logs(&mut ctx, &req.resource_logs);

        let partial_success = (ctx.failure_count > 0).then(|| ExportLogsPartialSuccess {
            rejected_log_records: ctx.failure_count as i64,
            error_message: PARTIAL_SUCCESS_MESSAGE.to_string(),
        });
        Ok(Response::new(ExportLogsServiceResponse { partial_success }))
    }
}

#[derive(Clone)]
pub struct OtlpTraceReceiver {
    repository: Arc<TelemetryRepository>,
}

#[tonic::async_trait]
impl TraceService for OtlpTraceReceiver {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let req = request.into_inner();
        let mut ctx = AddContext::default();
        self.repository.add_traces(&mut ctx, &req.resource_spans);

        let partial_success = (ctx.failure_count > 0).then(|| ExportTracePartialSuccess {
            rejected_spans: ctx.failure_count as i64,
            error_message: PARTIAL_SUCCESS_MESSAGE.to_string(),
        });
        Ok(Response::new(ExportTraceServiceResponse { partial_success }))
    }
}

#[derive(Clone)]
pub struct OtlpMetricsReceiver {
    repository: Arc<TelemetryRepository>,
}

#[tonic::async_trait]
impl MetricsService for OtlpMetricsReceiver {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let req = request.into_inner();
        let mut ctx = AddContext::default();
        self.repository.add_metrics(&mut ctx, &req.resource_metrics);

        let partial_success = (ctx.failure_count > 0).then(|| ExportMetricsPartialSuccess {
            rejected_data_points: ctx.failure_count as i64,
            error_message: PARTIAL_SUCCESS_MESSAGE.to_string(),
        });
        Ok(Response::new(ExportMetricsServiceResponse { partial_success }))
    }
}

/// Serves all three collector services on one bind address.
pub async fn run_otlp_server(
    repository: Arc<TelemetryRepository>,
    addr: &str,
) -> anyhow::Result<()> {
    let addr = addr.parse()?;
    info!("OTLP gRPC server listening on {}", addr);

    Server::builder()
        .add_service(LogsServiceServer::new(OtlpLogsReceiver {
            repository: repository.clone(),
        }))
        .add_service(TraceServiceServer::new(OtlpTraceReceiver {
            repository: repository.clone(),
        }))
        .add_service(MetricsServiceServer::new(OtlpMetricsReceiver {
            repository,
        }))
        .serve(addr)
        .await?;

    Ok(())
}
