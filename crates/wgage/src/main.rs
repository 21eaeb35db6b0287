mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use prost::Message;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wgage_core::config::Config;
use wgage_core::names::{MatchMode, MetricNameSet};
use wgage_core::time::{Clock, FixedClock, SystemClock, parse_time_or_unix};
use wgage_processor::forward::{ForwardConfig, build_forwarder};
use wgage_processor::pipeline::{PipelineConfig, log_report};
use wgage_processor::server::run_processor_servers;
use wgage_processor::{MetricTransformer, TransformReport};

use crate::telemetry::{LogFormat, init_cli_tracing, init_run_tracing, shutdown_tracing};

#[derive(Parser, Debug)]
#[command(name = "wgage")]
#[command(about = "Derive WireGuard handshake age gauges from OTLP metrics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Receive OTLP metrics, derive handshake ages and forward downstream")]
    Run {
        #[command(flatten)]
        names: NameArgs,
        #[arg(long)]
        otlp_grpc_addr: Option<String>,
        #[arg(long)]
        otlp_http_addr: Option<String>,
        #[arg(long)]
        forward_otlp_endpoint: Option<String>,
        #[arg(long)]
        forward_otlp_protocol: Option<String>,
    },
    #[command(about = "Transform one protobuf-encoded OTLP metrics export request")]
    Transform {
        #[command(flatten)]
        names: NameArgs,
        #[arg(long, help = "Read from this file instead of stdin")]
        input: Option<PathBuf>,
        #[arg(long, help = "Write to this file instead of stdout")]
        output: Option<PathBuf>,
        #[arg(long, help = "Pin the current time (RFC3339, unix seconds or e.g. 5m)")]
        now: Option<String>,
    },
    #[command(about = "Print the effective configuration")]
    Config {
        #[command(flatten)]
        names: NameArgs,
    },
}

#[derive(clap::Args, Debug, Default)]
struct NameArgs {
    #[arg(long = "metric", help = "Metric name of interest (repeatable)")]
    metrics: Vec<String>,
    #[arg(long, help = "literal or configured")]
    match_mode: Option<String>,
}

#[derive(Debug, Default)]
struct CliOverrides {
    names: NameArgs,
    otlp_grpc_addr: Option<String>,
    otlp_http_addr: Option<String>,
    forward_otlp_endpoint: Option<String>,
    forward_otlp_protocol: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransformSummary {
    derived_metrics: usize,
    derived_points: usize,
    skipped: Vec<String>,
}

impl From<&TransformReport> for TransformSummary {
    fn from(report: &TransformReport) -> Self {
        Self {
            derived_metrics: report.derived_metrics,
            derived_points: report.derived_points,
            skipped: report.skipped.iter().map(ToString::to_string).collect(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            names,
            otlp_grpc_addr,
            otlp_http_addr,
            forward_otlp_endpoint,
            forward_otlp_protocol,
        } => {
            run_server(CliOverrides {
                names,
                otlp_grpc_addr,
                otlp_http_addr,
                forward_otlp_endpoint,
                forward_otlp_protocol,
            })
            .await
        }
        Commands::Transform {
            names,
            input,
            output,
            now,
        } => {
            init_cli_tracing();
            run_transform(names, input, output, now, cli.json).await
        }
        Commands::Config { names } => {
            init_cli_tracing();
            let cfg = load_config(CliOverrides {
                names,
                ..CliOverrides::default()
            })?;
            print_config(&cfg, cli.json)
        }
    }
}

fn load_config(overrides: CliOverrides) -> anyhow::Result<Config> {
    let mut cfg = Config::load().context("load config")?;
    apply_cli_overrides(&mut cfg, overrides)?;
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}

fn apply_cli_overrides(cfg: &mut Config, overrides: CliOverrides) -> anyhow::Result<()> {
    if !overrides.names.metrics.is_empty() {
        cfg.metrics = overrides.names.metrics;
    }
    if let Some(v) = overrides.names.match_mode {
        cfg.match_mode = v.parse::<MatchMode>().context("bad --match-mode")?;
    }
    if let Some(v) = overrides.otlp_grpc_addr {
        cfg.otlp_grpc_addr = v;
    }
    if let Some(v) = overrides.otlp_http_addr {
        cfg.otlp_http_addr = v;
    }
    if let Some(v) = overrides.forward_otlp_endpoint {
        cfg.forward_otlp_endpoint = Some(v);
    }
    if let Some(v) = overrides.forward_otlp_protocol {
        cfg.forward_otlp_protocol = v;
    }
    Ok(())
}

async fn run_server(overrides: CliOverrides) -> anyhow::Result<()> {
    let cfg = load_config(overrides)?;
    let names = MetricNameSet::from_config(&cfg)?;
    let forward_cfg = ForwardConfig::from_config(&cfg)?
        .context("forward_otlp_endpoint is required to run")?;
    let grpc_addr = cfg
        .otlp_grpc_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("bad otlp_grpc_addr {}", cfg.otlp_grpc_addr))?;
    let http_addr = cfg
        .otlp_http_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("bad otlp_http_addr {}", cfg.otlp_http_addr))?;

    init_run_tracing(LogFormat::from_env());

    eprintln!("wgage run");
    eprintln!("  match mode: {} ({} names)", cfg.match_mode, names.len());
    eprintln!("  ingest grpc: {}", cfg.otlp_grpc_addr);
    eprintln!("  ingest http: {}", cfg.otlp_http_addr);
    eprintln!(
        "  forward: {} ({})",
        forward_cfg.endpoint, cfg.forward_otlp_protocol
    );

    let (forwarder, exporter) = build_forwarder(forward_cfg);
    let transformer = MetricTransformer::with_system_clock(names);

    let served = run_processor_servers(
        transformer,
        forwarder,
        grpc_addr,
        http_addr,
        PipelineConfig::from_config(&cfg),
        ctrl_c(),
    )
    .await;

    // the batcher owned the last forwarder handle; wait for the queue to drain
    if let Err(err) = exporter.await {
        tracing::warn!(error = %err, "forward export loop did not finish cleanly");
    }
    shutdown_tracing();
    served?;
    Ok(())
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received ctrl-c, shutting down"),
        Err(err) => {
            tracing::warn!(error = %err, "cannot listen for ctrl-c; running until a listener fails");
            std::future::pending::<()>().await;
        }
    }
}

async fn run_transform(
    names: NameArgs,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    now: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let cfg = load_config(CliOverrides {
        names,
        ..CliOverrides::default()
    })?;
    let clock: Arc<dyn Clock> = match now {
        Some(raw) => Arc::new(FixedClock(parse_time_or_unix(&raw)?)),
        None => Arc::new(SystemClock),
    };
    let transformer = MetricTransformer::new(MetricNameSet::from_config(&cfg)?, clock);

    let raw = match &input {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("read {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            buf
        }
    };
    let mut req = ExportMetricsServiceRequest::decode(raw.as_slice())
        .context("decode OTLP metrics export request")?;

    let report = transformer.transform(&mut req)?;
    log_report(&report);

    let encoded = req.encode_to_vec();
    match &output {
        Some(path) => tokio::fs::write(path, encoded)
            .await
            .with_context(|| format!("write {}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&encoded).await?;
            stdout.flush().await?;
        }
    }

    print_summary(&TransformSummary::from(&report), json)
}

fn print_summary(summary: &TransformSummary, json: bool) -> anyhow::Result<()> {
    if json {
        eprintln!("{}", serde_json::to_string(summary)?);
        return Ok(());
    }
    eprintln!(
        "derived {} metrics ({} points)",
        summary.derived_metrics, summary.derived_points
    );
    for skipped in &summary.skipped {
        eprintln!("skipped: {skipped}");
    }
    Ok(())
}

fn print_config(cfg: &Config, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(cfg)?);
        return Ok(());
    }
    println!("metrics = {}", cfg.metrics.join(","));
    println!("match_mode = {}", cfg.match_mode);
    println!("otlp_grpc_addr = {}", cfg.otlp_grpc_addr);
    println!("otlp_http_addr = {}", cfg.otlp_http_addr);
    println!("channel_capacity = {}", cfg.channel_capacity);
    println!("batch_size = {}", cfg.batch_size);
    println!("flush_interval = {:?}", cfg.flush_interval);
    println!(
        "forward_otlp_endpoint = {}",
        cfg.forward_otlp_endpoint.as_deref().unwrap_or("-")
    );
    println!("forward_otlp_protocol = {}", cfg.forward_otlp_protocol);
    println!("forward_otlp_compression = {}", cfg.forward_otlp_compression);
    println!("forward_otlp_headers = {}", cfg.forward_otlp_headers.len());
    println!("forward_otlp_timeout = {:?}", cfg.forward_otlp_timeout);
    Ok(())
}
