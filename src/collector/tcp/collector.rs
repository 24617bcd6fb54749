//! TCP port probe collector.
//!
//! Measures TCP connection latency to a target address and emits
//! `tcp.connect.latency_ms` and `tcp.connect.success` lines.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::collector::{Collector, CollectorContext, CollectorError};
use crate::metric::{MetricLine, is_valid_name};
use crate::queue::MetricSink;

/// Default connection timeout (3 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Latency value indicating probe failure (connection refused, timeout, etc.).
/// Using -1.0 to distinguish from valid 0ms latency.
const FAILURE_LATENCY_MS: f64 = -1.0;

const LATENCY_METRIC: &str = "tcp.connect.latency_ms";
const SUCCESS_METRIC: &str = "tcp.connect.success";

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// Options for a TCP port probe (top-level keys of the `.conf` file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Target host (name or IP address).
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Probe timeout (default: 3s).
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra tags attached to every line.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl TcpConfig {
    /// Create a new TCP probe configuration.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_TIMEOUT,
            tags: BTreeMap::new(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.host.trim().is_empty() {
            return Err(CollectorError::Config("tcp host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(CollectorError::Config("tcp port must not be 0".into()));
        }
        if self.timeout.is_zero() {
            return Err(CollectorError::Config("tcp timeout must be > 0".into()));
        }
        for (k, v) in &self.tags {
            if !is_valid_name(k) || v.is_empty() || v.chars().any(char::is_whitespace) {
                return Err(CollectorError::Config(format!("invalid tag '{k}={v}'")));
            }
        }
        Ok(())
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Set the probe timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a static tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// TCP port probe collector.
///
/// Measures TCP connection latency and reports success/failure.
pub struct TcpCollector {
    name: String,
    config: TcpConfig,
    sink: MetricSink,
}

impl TcpCollector {
    /// Create a new TCP collector with the given configuration and sink.
    pub fn new(name: impl Into<String>, config: TcpConfig, sink: MetricSink) -> Self {
        Self {
            name: name.into(),
            config,
            sink,
        }
    }

    /// Registry constructor.
    pub fn from_context(ctx: CollectorContext) -> Result<Box<dyn Collector>, CollectorError> {
        let config: TcpConfig = ctx.options()?;
        config.validate()?;
        let name = ctx.name().to_string();
        Ok(Box::new(Self::new(name, config, ctx.sink)))
    }
}

impl std::fmt::Debug for TcpCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpCollector")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Collector for TcpCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let target = self.config.target();
        let probe_timeout = self.config.timeout;

        let start = Instant::now();
        let result = timeout(probe_timeout, TcpStream::connect(&target)).await;
        let elapsed = start.elapsed();

        let (latency_ms, success) = match result {
            Ok(Ok(_stream)) => {
                let ms = elapsed.as_secs_f64() * 1000.0;
                tracing::debug!(target = %target, latency_ms = ms, "TCP probe successful");
                (ms, true)
            }
            Ok(Err(e)) => {
                tracing::warn!(target = %target, error = %e, "TCP probe failed");
                (FAILURE_LATENCY_MS, false)
            }
            Err(_) => {
                tracing::warn!(target = %target, timeout_ms = probe_timeout.as_millis(), "TCP probe timed out");
                (FAILURE_LATENCY_MS, false)
            }
        };

        let timestamp = chrono::Utc::now().timestamp();
        let latency = MetricLine::new(
            LATENCY_METRIC,
            timestamp,
            (latency_ms * 1000.0).round() / 1000.0,
        )
        .tag("target", target.clone())
        .tags(&self.config.tags);
        let ok = MetricLine::new(SUCCESS_METRIC, timestamp, if success { 1.0 } else { 0.0 })
            .tag("target", target)
            .tags(&self.config.tags);

        self.sink.emit(&latency);
        self.sink.emit(&ok);
        Ok(())
    }
}
