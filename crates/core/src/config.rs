use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Result, WgageError};
use crate::names::{LATEST_HANDSHAKE_SUFFIX, MatchMode};
use crate::time::parse_duration_str;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Config {
    pub metrics: Vec<String>,
    pub match_mode: MatchMode,
    pub otlp_grpc_addr: String,
    pub otlp_http_addr: String,
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub forward_otlp_endpoint: Option<String>,
    pub forward_otlp_protocol: String,
    pub forward_otlp_compression: String,
    #[serde(serialize_with = "serialize_header_keys")]
    pub forward_otlp_headers: Vec<(String, String)>,
    pub forward_otlp_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metrics: Vec::new(),
            match_mode: MatchMode::Literal,
            otlp_grpc_addr: "127.0.0.1:4317".to_string(),
            otlp_http_addr: "127.0.0.1:4318".to_string(),
            channel_capacity: 256,
            batch_size: 512,
            flush_interval: Duration::from_millis(200),
            forward_otlp_endpoint: None,
            forward_otlp_protocol: "grpc".to_string(),
            forward_otlp_compression: "none".to_string(),
            forward_otlp_headers: Vec::new(),
            forward_otlp_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_layered(&config_file_path(), |key| env::var(key).ok())
    }

    /// Defaults, then the file at `path`, then whatever `var` resolves.
    fn load_layered(path: &Path, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(file_overrides) = load_file_overrides(path)? {
            apply_overrides(&mut cfg, file_overrides, "config file")?;
        }
        apply_overrides(&mut cfg, env_overrides(var)?, "environment")?;
        Ok(cfg)
    }

    /// Checks the invariants the processor relies on. Runs before any
    /// listener is bound or any transformer is built.
    pub fn validate(&self) -> Result<()> {
        if self.metrics.is_empty() {
            return Err(WgageError::Config("metric names are missing".to_string()));
        }
        if let Some(blank) = self.metrics.iter().find(|m| m.trim().is_empty()) {
            return Err(WgageError::Config(format!(
                "metric names cannot be blank (value={blank:?})"
            )));
        }
        if self.match_mode == MatchMode::Configured
            && let Some(bad) = self
                .metrics
                .iter()
                .find(|m| !m.ends_with(LATEST_HANDSHAKE_SUFFIX))
        {
            return Err(WgageError::Config(format!(
                "metric {bad} must end with {LATEST_HANDSHAKE_SUFFIX} when match_mode is configured"
            )));
        }
        if self.batch_size == 0 {
            return Err(WgageError::Config("batch_size must be positive".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(WgageError::Config(
                "channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    metrics: Option<Vec<String>>,
    match_mode: Option<String>,
    otlp_grpc_addr: Option<String>,
    otlp_http_addr: Option<String>,
    channel_capacity: Option<usize>,
    batch_size: Option<usize>,
    flush_interval: Option<String>,
    forward_otlp_endpoint: Option<String>,
    forward_otlp_protocol: Option<String>,
    forward_otlp_compression: Option<String>,
    forward_otlp_headers: Option<String>,
    forward_otlp_timeout: Option<String>,
}

fn config_file_path() -> PathBuf {
    if let Some(path) = env::var_os("WGAGE_CONFIG") {
        return PathBuf::from(path);
    }
    env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("wgage")
        .join("config.toml")
}

fn load_file_overrides(path: &Path) -> Result<Option<ConfigOverrides>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(WgageError::Config(format!(
                "failed reading {}: {e}",
                path.display()
            )));
        }
    };
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| WgageError::Config(format!("failed parsing {}: {e}", path.display())))
}

/// Reads the `WGAGE_*` variables through `var`. Blank values count as unset.
fn env_overrides(var: impl Fn(&str) -> Option<String>) -> Result<ConfigOverrides> {
    let set = |key: &str| var(key).filter(|v| !v.trim().is_empty());
    let count = |key: &str| -> Result<Option<usize>> {
        set(key)
            .map(|v| {
                v.trim().parse::<usize>().map_err(|e| {
                    WgageError::Config(format!("bad {key} in environment: {e} (value={v})"))
                })
            })
            .transpose()
    };

    Ok(ConfigOverrides {
        metrics: set("WGAGE_METRICS").map(|v| parse_metric_list(&v)),
        match_mode: set("WGAGE_MATCH_MODE"),
        otlp_grpc_addr: set("WGAGE_OTLP_GRPC_ADDR"),
        otlp_http_addr: set("WGAGE_OTLP_HTTP_ADDR"),
        channel_capacity: count("WGAGE_CHANNEL_CAPACITY")?,
        batch_size: count("WGAGE_BATCH_SIZE")?,
        flush_interval: set("WGAGE_FLUSH_INTERVAL"),
        forward_otlp_endpoint: set("WGAGE_FORWARD_OTLP_ENDPOINT"),
        forward_otlp_protocol: set("WGAGE_FORWARD_OTLP_PROTOCOL"),
        forward_otlp_compression: set("WGAGE_FORWARD_OTLP_COMPRESSION"),
        forward_otlp_headers: set("WGAGE_FORWARD_OTLP_HEADERS"),
        forward_otlp_timeout: set("WGAGE_FORWARD_OTLP_TIMEOUT"),
    })
}

fn apply_overrides(cfg: &mut Config, overrides: ConfigOverrides, source: &str) -> Result<()> {
    let duration = |field: &str, raw: &str| {
        parse_duration_str(raw)
            .map_err(|e| WgageError::Config(format!("bad {field} in {source}: {e}")))
    };

    if let Some(v) = overrides.metrics {
        cfg.metrics = v;
    }
    if let Some(v) = overrides.match_mode {
        cfg.match_mode = v.parse::<MatchMode>().map_err(|e| {
            WgageError::Config(format!("bad match_mode in {source}: {e}"))
        })?;
    }
    if let Some(v) = overrides.otlp_grpc_addr {
        cfg.otlp_grpc_addr = v;
    }
    if let Some(v) = overrides.otlp_http_addr {
        cfg.otlp_http_addr = v;
    }
    if let Some(v) = overrides.channel_capacity {
        cfg.channel_capacity = v;
    }
    if let Some(v) = overrides.batch_size {
        cfg.batch_size = v;
    }
    if let Some(v) = overrides.flush_interval {
        cfg.flush_interval = duration("flush_interval", &v)?;
    }
    if let Some(v) = overrides.forward_otlp_endpoint {
        cfg.forward_otlp_endpoint = Some(v);
    }
    if let Some(v) = overrides.forward_otlp_protocol {
        cfg.forward_otlp_protocol = v;
    }
    if let Some(v) = overrides.forward_otlp_compression {
        cfg.forward_otlp_compression = v;
    }
    if let Some(v) = overrides.forward_otlp_headers {
        cfg.forward_otlp_headers = parse_otlp_headers(&v).map_err(|e| {
            WgageError::Config(format!("bad forward_otlp_headers in {source}: {e}"))
        })?;
    }
    if let Some(v) = overrides.forward_otlp_timeout {
        cfg.forward_otlp_timeout = duration("forward_otlp_timeout", &v)?;
    }
    Ok(())
}

pub fn parse_metric_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_otlp_headers(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            Some(_) => Err(WgageError::Config("header key cannot be empty".to_string())),
            None => Err(WgageError::Config(
                "header entries must use key=value syntax".to_string(),
            )),
        })
        .collect()
}

/// Header values are usually credentials; only the keys are ever printed.
fn serialize_header_keys<S: Serializer>(
    headers: &[(String, String)],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(headers.iter().map(|(key, _)| (key.as_str(), "<redacted>")))
}
