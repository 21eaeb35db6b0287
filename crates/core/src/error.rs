use thiserror::Error;

#[derive(Debug, Error)]
pub enum WgageError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed metric {name}: {reason}")]
    MalformedMetric { name: String, reason: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("ingest error: {0}")]
    Ingest(String),

}

impl WgageError {
    pub fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedMetric {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WgageError>;
