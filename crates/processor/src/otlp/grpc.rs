use std::sync::Arc;

use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use tonic::{Request, Response, Status};

use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct GrpcIngest {
    pipeline: Arc<Pipeline>,
}

impl GrpcIngest {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn metrics_service(&self) -> MetricsServiceServer<Self> {
        MetricsServiceServer::new(self.clone())
    }
}

#[tonic::async_trait]
impl MetricsService for GrpcIngest {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> std::result::Result<Response<ExportMetricsServiceResponse>, Status> {
        let req = request.into_inner();
        let resources = req.resource_metrics.len();
        let report = self
            .pipeline
            .submit_metrics(req)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        tracing::debug!(
            resources,
            derived = report.derived_metrics,
            "otlp grpc metrics accepted"
        );
        Ok(Response::new(ExportMetricsServiceResponse::default()))
    }
}
