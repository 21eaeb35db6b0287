use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use prost::Message;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::codec::CompressionEncoding;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use wgage_core::config::Config;
use wgage_core::error::{Result, WgageError};

const FORWARD_QUEUE_CAPACITY: usize = 512;
const FORWARD_ATTEMPTS: u64 = 3;

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub endpoint: String,
    pub protocol: ForwardProtocol,
    pub compression: ForwardCompression,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ForwardConfig {
    /// `None` when no downstream endpoint is configured.
    pub fn from_config(cfg: &Config) -> Result<Option<Self>> {
        let Some(endpoint) = cfg.forward_otlp_endpoint.clone() else {
            return Ok(None);
        };
        Ok(Some(Self {
            endpoint,
            protocol: cfg.forward_otlp_protocol.parse()?,
            compression: cfg.forward_otlp_compression.parse()?,
            headers: cfg.forward_otlp_headers.clone(),
            timeout: cfg.forward_otlp_timeout,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardProtocol {
    Grpc,
    HttpProtobuf,
}

impl FromStr for ForwardProtocol {
    type Err = WgageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grpc" => Ok(Self::Grpc),
            "http" | "http/protobuf" => Ok(Self::HttpProtobuf),
            other => Err(WgageError::Config(format!(
                "forward_otlp_protocol must be grpc or http/protobuf, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardCompression {
    None,
    Gzip,
}

impl FromStr for ForwardCompression {
    type Err = WgageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            other => Err(WgageError::Config(format!(
                "forward_otlp_compression must be none or gzip, got {other}"
            ))),
        }
    }
}

/// Handle onto the downstream export queue.
#[derive(Clone)]
pub struct Forwarder {
    tx: mpsc::Sender<ExportMetricsServiceRequest>,
}

impl Forwarder {
    /// A forwarder whose batches land on the returned receiver instead of the
    /// network.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ExportMetricsServiceRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn submit_metrics(&self, req: ExportMetricsServiceRequest) {
        if self.tx.send(req).await.is_err() {
            tracing::warn!("forwarder dropped batch: export loop stopped");
        }
    }
}

/// Spawns the export loop. It drains its queue and finishes once every
/// [`Forwarder`] clone is dropped.
pub fn build_forwarder(cfg: ForwardConfig) -> (Forwarder, JoinHandle<()>) {
    let (forwarder, rx) = Forwarder::channel(FORWARD_QUEUE_CAPACITY);
    let exporter = tokio::spawn(run_export_loop(cfg, rx));
    (forwarder, exporter)
}

async fn run_export_loop(cfg: ForwardConfig, mut rx: mpsc::Receiver<ExportMetricsServiceRequest>) {
    let headers = header_map(&cfg.headers);
    match cfg.protocol {
        ForwardProtocol::Grpc => {
            let endpoint = if cfg.endpoint.contains("://") {
                cfg.endpoint.clone()
            } else {
                format!("http://{}", cfg.endpoint)
            };
            let channel = match Channel::from_shared(endpoint) {
                Ok(c) => c.connect_lazy(),
                Err(err) => {
                    tracing::warn!(error = ?err, "invalid gRPC forward endpoint");
                    return;
                }
            };
            let mut client = MetricsServiceClient::new(channel);
            if cfg.compression == ForwardCompression::Gzip {
                client = client
                    .send_compressed(CompressionEncoding::Gzip)
                    .accept_compressed(CompressionEncoding::Gzip);
            }
            let metadata = MetadataMap::from_headers(headers);

            while let Some(req) = rx.recv().await {
                for attempt in 0..FORWARD_ATTEMPTS {
                    let mut request = tonic::Request::new(req.clone());
                    request.set_timeout(cfg.timeout);
                    *request.metadata_mut() = metadata.clone();
                    match client.export(request).await {
                        Ok(_) => break,
                        Err(status) if attempt + 1 == FORWARD_ATTEMPTS => {
                            tracing::warn!(
                                code = ?status.code(),
                                message = %status.message(),
                                "forward gRPC export failed after retries"
                            );
                        }
                        Err(_) => backoff(attempt).await,
                    }
                }
            }
        }
        ForwardProtocol::HttpProtobuf => {
            let url = format!("{}/v1/metrics", cfg.endpoint.trim_end_matches('/'));
            let client = Client::builder()
                .timeout(cfg.timeout)
                .build()
                .unwrap_or_else(|e| {
                    tracing::warn!(error = ?e, "failed to build forward http client; using defaults");
                    Client::new()
                });

            while let Some(req) = rx.recv().await {
                let body = req.encode_to_vec();
                let body = match cfg.compression {
                    ForwardCompression::None => body,
                    ForwardCompression::Gzip => match gzip(&body) {
                        Ok(compressed) => compressed,
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to gzip forward payload");
                            continue;
                        }
                    },
                };
                post_with_retries(&client, &url, &headers, body, cfg.compression).await;
            }
        }
    }
}

async fn backoff(attempt: u64) {
    tokio::time::sleep(Duration::from_millis(30 * (attempt + 1))).await;
}

async fn post_with_retries(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    body: Vec<u8>,
    compression: ForwardCompression,
) {
    for attempt in 0..FORWARD_ATTEMPTS {
        let mut req = client
            .post(url)
            .header("content-type", "application/x-protobuf")
            .headers(headers.clone());
        if compression == ForwardCompression::Gzip {
            req = req.header("content-encoding", "gzip");
        }
        if let Ok(resp) = req.body(body.clone()).send().await
            && resp.status().is_success()
        {
            return;
        }
        backoff(attempt).await;
    }
    tracing::warn!(url = %url, "forward HTTP export failed after retries");
}

/// Static headers for both transports; gRPC metadata is built from the same
/// map. Entries that are not valid header names or values are skipped.
fn header_map(headers: &[(String, String)]) -> HeaderMap {
    headers
        .iter()
        .filter_map(|(k, v)| {
            let parsed = HeaderName::try_from(k.as_str())
                .ok()
                .zip(HeaderValue::try_from(v.as_str()).ok());
            if parsed.is_none() {
                tracing::warn!(header = %k, "ignored invalid forward header");
            }
            parsed
        })
        .collect()
}

fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}
