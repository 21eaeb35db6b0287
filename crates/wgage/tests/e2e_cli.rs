use std::io::Write;
use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::metrics::v1::metric::Data;
use opentelemetry_proto::tonic::metrics::v1::number_data_point::Value;
use opentelemetry_proto::tonic::metrics::v1::{Metric, NumberDataPoint};
use prost::Message;
use serial_test::serial;
use testkit::{handshake_request, string_attr};
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};

const SOURCE: &str = "wireguard_latest_handshake_seconds";
const DERIVED: &str = "wireguard_handshake_seconds";

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_wgage")
}

/// A `wgage` command isolated from the caller's config file and environment.
fn wgage(temp: &Path) -> Command {
    let mut cmd = Command::new(bin());
    cmd.env("WGAGE_CONFIG", temp.join("absent.toml"))
        .env_remove("WGAGE_METRICS")
        .env_remove("WGAGE_MATCH_MODE")
        .env_remove("WGAGE_FORWARD_OTLP_ENDPOINT")
        .env_remove("OTEL_EXPORTER_OTLP_ENDPOINT");
    cmd
}

fn derived_points(req: &ExportMetricsServiceRequest) -> Vec<NumberDataPoint> {
    req.resource_metrics
        .iter()
        .flat_map(|rm| &rm.scope_metrics)
        .flat_map(|sm| &sm.metrics)
        .filter(|m| m.name == DERIVED)
        .flat_map(|m: &Metric| match &m.data {
            Some(Data::Gauge(g)) => g.data_points.clone(),
            _ => Vec::new(),
        })
        .collect()
}

fn double(point: &NumberDataPoint) -> f64 {
    match point.value {
        Some(Value::AsDouble(v)) => v,
        other => panic!("expected double, got {other:?}"),
    }
}

#[test]
fn e2e_transform_file_round_trip() {
    let temp = tempfile::tempdir().unwrap();
    let input = temp.path().join("in.pb");
    let output = temp.path().join("out.pb");
    std::fs::write(
        &input,
        handshake_request(&[(1000, "a"), (2000, "b")]).encode_to_vec(),
    )
    .unwrap();

    let out = wgage(temp.path())
        .arg("--json")
        .arg("transform")
        .arg("--metric")
        .arg(SOURCE)
        .arg("--now")
        .arg("2500")
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(&output)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "{}",
        String::from_utf8_lossy(&out.stderr)
    );

    let summary: serde_json::Value = serde_json::from_slice(
        String::from_utf8_lossy(&out.stderr)
            .lines()
            .last()
            .unwrap()
            .as_bytes(),
    )
    .unwrap();
    assert_eq!(summary["derived_metrics"], 1);
    assert_eq!(summary["derived_points"], 2);

    let req = ExportMetricsServiceRequest::decode(std::fs::read(&output).unwrap().as_slice())
        .unwrap();
    let metrics = &req.resource_metrics[0].scope_metrics[0].metrics;
    assert_eq!(metrics[0].name, SOURCE);
    assert_eq!(metrics[1].name, DERIVED);
    assert_eq!(metrics[1].unit, "seconds");

    let points = derived_points(&req);
    assert_eq!(points.iter().map(double).collect::<Vec<_>>(), vec![1500.0, 500.0]);
    assert_eq!(points[0].attributes, vec![string_attr("peer", "a")]);
    assert_eq!(points[1].attributes, vec![string_attr("peer", "b")]);
}

#[test]
fn e2e_transform_stdin_to_stdout() {
    let temp = tempfile::tempdir().unwrap();
    let mut child = wgage(temp.path())
        .arg("transform")
        .arg("--metric")
        .arg(SOURCE)
        .arg("--now")
        .arg("1970-01-01T00:16:40Z")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(&handshake_request(&[(400, "a")]).encode_to_vec())
        .unwrap();

    let out = child.wait_with_output().unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("derived 1 metrics (1 points)"));

    let req = ExportMetricsServiceRequest::decode(out.stdout.as_slice()).unwrap();
    assert_eq!(
        derived_points(&req).iter().map(double).collect::<Vec<_>>(),
        vec![600.0]
    );
}

#[test]
fn e2e_run_rejects_missing_metric_names() {
    let temp = tempfile::tempdir().unwrap();
    let out = wgage(temp.path())
        .arg("run")
        .arg("--otlp-grpc-addr")
        .arg(format!("127.0.0.1:{}", free_port()))
        .arg("--otlp-http-addr")
        .arg(format!("127.0.0.1:{}", free_port()))
        .arg("--forward-otlp-endpoint")
        .arg("http://127.0.0.1:1")
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("metric names are missing"));
}

#[test]
fn e2e_run_requires_forward_endpoint() {
    let temp = tempfile::tempdir().unwrap();
    let out = wgage(temp.path())
        .arg("run")
        .arg("--metric")
        .arg(SOURCE)
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("forward_otlp_endpoint is required"));
}

#[test]
fn e2e_config_reads_file_and_prints_json() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(
        &path,
        "metrics = [\"wg0_latest_handshake_seconds\"]\nmatch_mode = \"configured\"\nbatch_size = 7\n",
    )
    .unwrap();

    let out = wgage(temp.path())
        .env("WGAGE_CONFIG", &path)
        .arg("--json")
        .arg("config")
        .output()
        .unwrap();
    assert!(out.status.success());

    let value: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(value["metrics"][0], "wg0_latest_handshake_seconds");
    assert_eq!(value["match_mode"], "configured");
    assert_eq!(value["batch_size"], 7);
}

#[derive(Clone)]
struct DownstreamCollector {
    tx: mpsc::Sender<ExportMetricsServiceRequest>,
}

#[tonic::async_trait]
impl MetricsService for DownstreamCollector {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> std::result::Result<Response<ExportMetricsServiceResponse>, Status> {
        let _ = self.tx.send(request.into_inner()).await;
        Ok(Response::new(ExportMetricsServiceResponse::default()))
    }
}

fn spawn_processor(temp: &Path, downstream_port: u16) -> (Child, u16) {
    let grpc_port = free_port();
    let child = wgage(temp)
        .env("WGAGE_FLUSH_INTERVAL", "20ms")
        .arg("run")
        .arg("--metric")
        .arg(SOURCE)
        .arg("--otlp-grpc-addr")
        .arg(format!("127.0.0.1:{grpc_port}"))
        .arg("--otlp-http-addr")
        .arg(format!("127.0.0.1:{}", free_port()))
        .arg("--forward-otlp-endpoint")
        .arg(format!("http://127.0.0.1:{downstream_port}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    (child, grpc_port)
}

#[tokio::test]
#[serial]
async fn e2e_grpc_ingest_forwards_derived_metric() {
    let (tx, mut rx) = mpsc::channel(8);
    let downstream_port = free_port();
    let collector = DownstreamCollector { tx };
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(MetricsServiceServer::new(collector))
            .serve(format!("127.0.0.1:{downstream_port}").parse().unwrap())
            .await
    });

    let temp = tempfile::tempdir().unwrap();
    let (mut child, grpc_port) = spawn_processor(temp.path(), downstream_port);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let req = handshake_request(&[(now - 120, "a")]);

    let mut exported = false;
    for _ in 0..100 {
        assert!(child.try_wait().unwrap().is_none(), "wgage exited early");
        let endpoint = format!("http://127.0.0.1:{grpc_port}");
        if let Ok(mut client) = MetricsServiceClient::connect(endpoint).await
            && client.export(Request::new(req.clone())).await.is_ok()
        {
            exported = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(exported, "failed to export gRPC metrics to wgage");

    let forwarded = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("nothing forwarded downstream")
        .unwrap();

    let _ = child.kill();
    let _ = child.wait();

    let metrics = &forwarded.resource_metrics[0].scope_metrics[0].metrics;
    assert_eq!(metrics[0], req.resource_metrics[0].scope_metrics[0].metrics[0]);
    let points = derived_points(&forwarded);
    assert_eq!(points.len(), 1);
    let age = double(&points[0]);
    assert!((120.0..130.0).contains(&age), "unexpected age {age}");
    assert_eq!(points[0].attributes, vec![string_attr("peer", "a")]);
}
