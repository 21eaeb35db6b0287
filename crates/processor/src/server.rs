use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinError;
use tonic::transport::Server;
use wgage_core::error::{Result, WgageError};

use crate::forward::Forwarder;
use crate::otlp::grpc::GrpcIngest;
use crate::otlp::http;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::transform::MetricTransformer;

/// Serves OTLP metrics over gRPC and HTTP until `shutdown` resolves or either
/// listener fails.
///
/// Both listeners stop together. Batches they already accepted are flushed to
/// `forwarder` before this returns.
pub async fn run_processor_servers<F>(
    transformer: MetricTransformer,
    forwarder: Forwarder,
    grpc_addr: SocketAddr,
    http_addr: SocketAddr,
    cfg: PipelineConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (pipeline, batcher) = Pipeline::new(transformer, forwarder, cfg);
    let grpc = GrpcIngest::new(pipeline.clone());
    let http_router = http::router(pipeline);

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    let signal_stop = Arc::clone(&stop_tx);
    let signal_task = tokio::spawn(async move {
        shutdown.await;
        signal_stop.send_replace(true);
    });

    let grpc_stop = Arc::clone(&stop_tx);
    let grpc_signal = stopped(stop_rx.clone());
    let grpc_task = tokio::spawn(async move {
        let res = Server::builder()
            .add_service(grpc.metrics_service())
            .serve_with_shutdown(grpc_addr, grpc_signal)
            .await;
        grpc_stop.send_replace(true);
        res
    });

    let http_signal = stopped(stop_rx);
    let http_task = tokio::spawn(async move {
        let res = serve_http(http_addr, http_router, http_signal).await;
        stop_tx.send_replace(true);
        res
    });

    let (grpc_res, http_res) = tokio::join!(grpc_task, http_task);
    signal_task.abort();

    // the listeners held the last pipeline handles
    if let Err(err) = batcher.await {
        tracing::warn!(error = %err, "metric batcher did not finish cleanly");
    }

    grpc_res
        .map_err(|e| join_failed("gRPC", e))?
        .map_err(|e| WgageError::Ingest(format!("gRPC server failed: {e}")))?;
    http_res
        .map_err(|e| join_failed("HTTP", e))?
        .map_err(|e| WgageError::Ingest(format!("HTTP server failed: {e}")))?;
    Ok(())
}

async fn serve_http(
    addr: SocketAddr,
    router: Router,
    signal: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .await
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn join_failed(listener: &str, err: JoinError) -> WgageError {
    WgageError::Ingest(format!("{listener} task join failed: {err}"))
}
