//! Derives handshake age gauges from handshake timestamp gauges.
//!
//! The transformer walks a batch resource group by resource group and scope
//! by scope. For every gauge whose name the [`MetricNameSet`] recognizes it
//! appends one gauge to the same scope. Each derived point is a copy of its
//! source point with the value replaced by `now - timestamp` in whole seconds.
//! Existing metrics are never modified.

use std::sync::Arc;

use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::metrics::v1::metric::Data;
use opentelemetry_proto::tonic::metrics::v1::number_data_point::Value;
use opentelemetry_proto::tonic::metrics::v1::{Gauge, Metric, ScopeMetrics};
use wgage_core::error::{Result, WgageError};
use wgage_core::names::{DERIVED_UNIT, MetricNameSet};
use wgage_core::time::{Clock, SystemClock, elapsed_whole_seconds};

pub type MetricsBatch = ExportMetricsServiceRequest;

/// What a single [`MetricTransformer::transform`] call did.
#[derive(Debug, Default)]
pub struct TransformReport {
    pub derived_metrics: usize,
    pub derived_points: usize,
    /// Matching definitions that could not be derived. Each entry is a
    /// [`WgageError::MalformedMetric`].
    pub skipped: Vec<WgageError>,
}

impl TransformReport {
    pub fn is_noop(&self) -> bool {
        self.derived_metrics == 0 && self.skipped.is_empty()
    }
}

#[derive(Clone)]
pub struct MetricTransformer {
    names: Arc<MetricNameSet>,
    clock: Arc<dyn Clock>,
}

impl MetricTransformer {
    pub fn new(names: MetricNameSet, clock: Arc<dyn Clock>) -> Self {
        Self {
            names: Arc::new(names),
            clock,
        }
    }

    pub fn with_system_clock(names: MetricNameSet) -> Self {
        Self::new(names, Arc::new(SystemClock))
    }

    /// Appends a derived age gauge after the existing metrics of every scope
    /// that holds a matching gauge.
    ///
    /// Malformed matches are skipped and listed in the report; they never
    /// abort the rest of the batch.
    pub fn transform(&self, batch: &mut MetricsBatch) -> Result<TransformReport> {
        let mut report = TransformReport::default();
        for rm in &mut batch.resource_metrics {
            for sm in &mut rm.scope_metrics {
                self.transform_scope(sm, &mut report);
            }
        }
        Ok(report)
    }

    fn transform_scope(&self, scope: &mut ScopeMetrics, report: &mut TransformReport) {
        // Derived metrics go in after the scan so they are never candidates
        // themselves.
        let mut derived = Vec::new();
        for metric in &scope.metrics {
            let Some(derived_name) = self.names.derived_name(&metric.name) else {
                continue;
            };
            match &metric.data {
                Some(Data::Gauge(gauge)) => {
                    let age = self.derive(derived_name, gauge);
                    report.derived_points += gauge.data_points.len();
                    derived.push(age);
                }
                Some(
                    Data::Sum(_)
                    | Data::Histogram(_)
                    | Data::ExponentialHistogram(_)
                    | Data::Summary(_),
                ) => {}
                None => report.skipped.push(WgageError::malformed(
                    metric.name.clone(),
                    "metric carries no data payload",
                )),
            }
        }
        report.derived_metrics += derived.len();
        scope.metrics.extend(derived);
    }

    fn derive(&self, name: String, gauge: &Gauge) -> Metric {
        let data_points = gauge
            .data_points
            .iter()
            .map(|source| {
                let mut point = source.clone();
                let age = elapsed_whole_seconds(self.clock.now(), source.time_unix_nano);
                point.value = Some(Value::AsDouble(age));
                point
            })
            .collect();

        Metric {
            name,
            unit: DERIVED_UNIT.to_string(),
            data: Some(Data::Gauge(Gauge { data_points })),
            ..Default::default()
        }
    }
}
