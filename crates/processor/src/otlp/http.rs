use axum::extract::State;
use axum::http::Method;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Router, body::Bytes};
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use prost::Message;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;

use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct HttpIngestState {
    pub pipeline: Pipeline,
}

pub fn router(pipeline: Pipeline) -> Router {
    let state = HttpIngestState { pipeline };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    Router::new()
        .route("/v1/metrics", post(export_metrics))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .on_request(tower_http::trace::DefaultOnRequest::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

async fn export_metrics(State(state): State<HttpIngestState>, body: Bytes) -> StatusCode {
    let Ok(req) = ExportMetricsServiceRequest::decode(body) else {
        tracing::warn!("otlp http metrics decode failed");
        return StatusCode::BAD_REQUEST;
    };

    let resources = req.resource_metrics.len();
    match state.pipeline.submit_metrics(req).await {
        Ok(report) => {
            tracing::debug!(
                resources,
                derived = report.derived_metrics,
                "otlp http metrics accepted"
            );
            StatusCode::OK
        }
        Err(err) => {
            tracing::warn!(error = %err, "otlp http metrics rejected");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
