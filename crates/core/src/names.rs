//! Metric names the processor looks for, and the names it derives from them.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Result, WgageError};

pub const LATEST_HANDSHAKE_METRIC: &str = "wireguard_latest_handshake_seconds";
pub const HANDSHAKE_METRIC: &str = "wireguard_handshake_seconds";
pub const LATEST_HANDSHAKE_SUFFIX: &str = "_latest_handshake_seconds";
pub const HANDSHAKE_SUFFIX: &str = "_handshake_seconds";
pub const DERIVED_UNIT: &str = "seconds";

/// Decides which names trigger a derivation.
///
/// `Literal` only ever matches [`LATEST_HANDSHAKE_METRIC`]; the configured
/// names are required but do not gate matching. `Configured` matches every
/// configured name instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Literal,
    Configured,
}

impl FromStr for MatchMode {
    type Err = WgageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "literal" => Ok(Self::Literal),
            "configured" => Ok(Self::Configured),
            other => Err(WgageError::Parse(format!(
                "expected literal or configured, got {other}"
            ))),
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal => write!(f, "literal"),
            Self::Configured => write!(f, "configured"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricNameSet {
    names: HashSet<String>,
    mode: MatchMode,
}

impl MetricNameSet {
    pub fn new<I, S>(names: I, mode: MatchMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            mode,
        }
    }

    /// Builds the set from a config that has passed [`Config::validate`].
    pub fn from_config(cfg: &Config) -> Result<Self> {
        cfg.validate()?;
        Ok(Self::new(cfg.metrics.iter().cloned(), cfg.match_mode))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Returns the name of the age metric to derive from `source`, or `None`
    /// when `source` is not a match.
    pub fn derived_name(&self, source: &str) -> Option<String> {
        match self.mode {
            MatchMode::Literal => {
                (source == LATEST_HANDSHAKE_METRIC).then(|| HANDSHAKE_METRIC.to_string())
            }
            MatchMode::Configured => {
                if !self.contains(source) {
                    return None;
                }
                source
                    .strip_suffix(LATEST_HANDSHAKE_SUFFIX)
                    .map(|prefix| format!("{prefix}{HANDSHAKE_SUFFIX}"))
            }
        }
    }
}
