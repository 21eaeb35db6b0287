use std::time::Duration;

use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::metrics::v1::ResourceMetrics;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wgage_core::config::Config;
use wgage_core::error::{Result, WgageError};

use crate::forward::Forwarder;
use crate::transform::{MetricTransformer, TransformReport};

#[derive(Clone)]
pub struct Pipeline {
    transformer: MetricTransformer,
    metrics_tx: mpsc::Sender<ExportMetricsServiceRequest>,
}

pub struct PipelineConfig {
    pub channel_capacity: usize,
    pub flush_interval: Duration,
    /// Resource groups per forwarded request.
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            flush_interval: Duration::from_millis(200),
            batch_size: 512,
        }
    }
}

impl PipelineConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            channel_capacity: cfg.channel_capacity,
            flush_interval: cfg.flush_interval,
            batch_size: cfg.batch_size,
        }
    }
}

impl Pipeline {
    /// Spawns the batcher. The returned handle completes once every clone of
    /// the pipeline is dropped and the remaining buffer has been flushed.
    pub fn new(
        transformer: MetricTransformer,
        forwarder: Forwarder,
        cfg: PipelineConfig,
    ) -> (Self, JoinHandle<()>) {
        let (metrics_tx, metrics_rx) = mpsc::channel(cfg.channel_capacity);

        let batcher = tokio::spawn(run_metric_batcher(
            forwarder,
            metrics_rx,
            cfg.batch_size,
            cfg.flush_interval,
        ));

        (
            Self {
                transformer,
                metrics_tx,
            },
            batcher,
        )
    }

    /// A pipeline whose batcher has already gone away.
    #[cfg(test)]
    pub(crate) fn closed(transformer: MetricTransformer) -> Self {
        let (metrics_tx, _) = mpsc::channel(1);
        Self {
            transformer,
            metrics_tx,
        }
    }

    /// Transforms `req` in place and queues it for forwarding.
    pub async fn submit_metrics(
        &self,
        mut req: ExportMetricsServiceRequest,
    ) -> Result<TransformReport> {
        let report = self.transformer.transform(&mut req)?;
        log_report(&report);
        self.metrics_tx
            .send(req)
            .await
            .map_err(|_| WgageError::Ingest("metric pipeline closed".to_string()))?;
        Ok(report)
    }
}

pub fn log_report(report: &TransformReport) {
    if report.is_noop() {
        return;
    }
    for skipped in &report.skipped {
        warn!(error = %skipped, "skipped malformed metric");
    }
    if report.derived_metrics > 0 {
        debug!(
            metrics = report.derived_metrics,
            points = report.derived_points,
            "derived handshake age metrics"
        );
    }
}

async fn run_metric_batcher(
    forwarder: Forwarder,
    mut rx: mpsc::Receiver<ExportMetricsServiceRequest>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    let mut buffer = Vec::new();
    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(req) = maybe else {
                    if !buffer.is_empty() {
                        flush_metrics(&forwarder, &mut buffer).await;
                    }
                    break;
                };
                buffer.extend(req.resource_metrics);
                if buffer.len() >= batch_size {
                    flush_metrics(&forwarder, &mut buffer).await;
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_metrics(&forwarder, &mut buffer).await;
                }
            }
        }
    }
}

async fn flush_metrics(forwarder: &Forwarder, buffer: &mut Vec<ResourceMetrics>) {
    let resource_metrics = std::mem::take(buffer);
    debug!(resources = resource_metrics.len(), "flushing metric batch");
    forwarder
        .submit_metrics(ExportMetricsServiceRequest { resource_metrics })
        .await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use opentelemetry_proto::tonic::metrics::v1::metric::Data;
    use testkit::handshake_request;
    use wgage_core::names::{HANDSHAKE_METRIC, MatchMode, MetricNameSet};
    use wgage_core::time::FixedClock;

    use super::*;

    fn transformer() -> MetricTransformer {
        MetricTransformer::new(
            MetricNameSet::new(["wireguard_latest_handshake_seconds"], MatchMode::Literal),
            Arc::new(FixedClock::at_unix(2500)),
        )
    }

    async fn recv(
        rx: &mut mpsc::Receiver<ExportMetricsServiceRequest>,
    ) -> ExportMetricsServiceRequest {
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("batch not flushed in time")
            .expect("forward channel closed")
    }

    #[tokio::test]
    async fn pipeline_forwards_transformed_batch() {
        let (forwarder, mut rx) = Forwarder::channel(8);
        let (pipeline, _batcher) = Pipeline::new(
            transformer(),
            forwarder,
            PipelineConfig {
                channel_capacity: 8,
                flush_interval: std::time::Duration::from_millis(10),
                batch_size: 64,
            },
        );

        let report = pipeline
            .submit_metrics(handshake_request(&[(1000, "a")]))
            .await
            .unwrap();
        assert_eq!(report.derived_metrics, 1);

        let out = recv(&mut rx).await;
        let metrics = &out.resource_metrics[0].scope_metrics[0].metrics;
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[1].name, HANDSHAKE_METRIC);
        assert!(matches!(metrics[1].data, Some(Data::Gauge(_))));
    }

    #[tokio::test]
    async fn pipeline_flushes_on_batch_size() {
        let (forwarder, mut rx) = Forwarder::channel(8);
        let (pipeline, _batcher) = Pipeline::new(
            transformer(),
            forwarder,
            PipelineConfig {
                channel_capacity: 8,
                flush_interval: std::time::Duration::from_secs(5),
                batch_size: 2,
            },
        );

        // the first tick fires immediately; let it pass on an empty buffer
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        for ts in [1000, 2000] {
            pipeline
                .submit_metrics(handshake_request(&[(ts, "a")]))
                .await
                .unwrap();
        }

        let out = recv(&mut rx).await;
        assert_eq!(out.resource_metrics.len(), 2);
    }

    #[tokio::test]
    async fn pipeline_flushes_remaining_on_close() {
        let (forwarder, mut rx) = Forwarder::channel(8);
        let (pipeline, batcher) = Pipeline::new(
            transformer(),
            forwarder,
            PipelineConfig {
                channel_capacity: 8,
                flush_interval: std::time::Duration::from_secs(60),
                batch_size: 64,
            },
        );

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        pipeline
            .submit_metrics(handshake_request(&[(1000, "a")]))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        drop(pipeline);

        let out = recv(&mut rx).await;
        assert_eq!(out.resource_metrics.len(), 1);
        batcher.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_pipeline_rejects_batches() {
        let err = Pipeline::closed(transformer())
            .submit_metrics(handshake_request(&[(1000, "a")]))
            .await
            .unwrap_err();
        assert!(matches!(err, WgageError::Ingest(_)));
    }
}
