pub mod forward;
pub mod otlp;
pub mod pipeline;
pub mod server;
pub mod transform;

pub use transform::{MetricTransformer, MetricsBatch, TransformReport};
