use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::common::v1::any_value::Value as AnyValueKind;
use opentelemetry_proto::tonic::common::v1::{AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::metrics::v1::metric::Data;
use opentelemetry_proto::tonic::metrics::v1::number_data_point::Value;
use opentelemetry_proto::tonic::metrics::v1::{
    AggregationTemporality, Gauge, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics, Sum,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use wgage_core::names::LATEST_HANDSHAKE_METRIC;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

pub fn string_attr(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(AnyValueKind::StringValue(value.to_string())),
        }),
    }
}

pub fn number_point(ts_secs: u64, value: f64, attributes: Vec<KeyValue>) -> NumberDataPoint {
    NumberDataPoint {
        attributes,
        time_unix_nano: ts_secs * NANOS_PER_SECOND,
        value: Some(Value::AsDouble(value)),
        ..Default::default()
    }
}

pub fn gauge_metric(name: &str, data_points: Vec<NumberDataPoint>) -> Metric {
    Metric {
        name: name.to_string(),
        description: format!("{name} as scraped"),
        data: Some(Data::Gauge(Gauge { data_points })),
        ..Default::default()
    }
}

pub fn sum_metric(name: &str, data_points: Vec<NumberDataPoint>) -> Metric {
    Metric {
        name: name.to_string(),
        data: Some(Data::Sum(Sum {
            data_points,
            aggregation_temporality: AggregationTemporality::Cumulative as i32,
            is_monotonic: true,
        })),
        ..Default::default()
    }
}

pub fn scope(name: &str, metrics: Vec<Metric>) -> ScopeMetrics {
    ScopeMetrics {
        scope: Some(InstrumentationScope {
            name: name.to_string(),
            version: "0.1".to_string(),
            ..Default::default()
        }),
        metrics,
        schema_url: String::new(),
    }
}

pub fn resource(service: &str, scope_metrics: Vec<ScopeMetrics>) -> ResourceMetrics {
    ResourceMetrics {
        resource: Some(Resource {
            attributes: vec![string_attr("service.name", service)],
            ..Default::default()
        }),
        scope_metrics,
        schema_url: String::new(),
    }
}

pub fn batch(resource_metrics: Vec<ResourceMetrics>) -> ExportMetricsServiceRequest {
    ExportMetricsServiceRequest { resource_metrics }
}

/// One resource, one scope, one `wireguard_latest_handshake_seconds` gauge
/// with a point per `(timestamp_secs, peer)` pair.
pub fn handshake_request(peers: &[(u64, &str)]) -> ExportMetricsServiceRequest {
    let points = peers
        .iter()
        .map(|(ts, peer)| number_point(*ts, *ts as f64, vec![string_attr("peer", peer)]))
        .collect();
    batch(vec![resource(
        "wireguard-exporter",
        vec![scope(
            "wireguard",
            vec![gauge_metric(LATEST_HANDSHAKE_METRIC, points)],
        )],
    )])
}
