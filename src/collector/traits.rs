//! Core collector traits and types.

use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::CollectorDefinition;
use crate::queue::MetricSink;

/// Errors that can occur during collection.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// I/O error (sockets, subprocess pipes).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout elapsed.
    #[error("timeout elapsed")]
    Timeout,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// No implementation registered under the identifier.
    #[error("unknown collector implementation '{0}'")]
    UnknownImplementation(String),

    /// A pass failed for a collector-specific reason.
    #[error("collection failed: {0}")]
    Failed(String),

    /// The collector asked never to be run again.
    #[error("collector permanently disabled: {0}")]
    PermanentlyDisabled(String),
}

/// Execution schedule derived from a definition's interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// One pass every interval, measured from pass start.
    Interval(Duration),

    /// Long-running collector, re-invoked as soon as a pass returns.
    Continuous,
}

impl Schedule {
    /// Zero means continuous.
    pub fn from_interval(interval: Duration) -> Self {
        if interval.is_zero() {
            Self::Continuous
        } else {
            Self::Interval(interval)
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval(d) => write!(f, "every {:?}", d),
            Self::Continuous => write!(f, "continuous"),
        }
    }
}

/// Everything a collector implementation is constructed with.
#[derive(Debug, Clone)]
pub struct CollectorContext {
    /// Parsed definition (name, interval, options).
    pub definition: CollectorDefinition,
    /// Non-blocking output for metric lines.
    pub sink: MetricSink,
    /// Span every pass runs in; carries the collector name.
    pub span: tracing::Span,
    /// Cancelled when the unit is asked to stop.
    pub stop: CancellationToken,
}

impl CollectorContext {
    pub fn new(definition: CollectorDefinition, sink: MetricSink) -> Self {
        let span = tracing::info_span!("collector", name = %definition.name);
        Self {
            definition,
            sink,
            span,
            stop: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn schedule(&self) -> Schedule {
        Schedule::from_interval(self.definition.interval)
    }

    /// Deserialize the collector-specific options.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T, CollectorError> {
        self.definition
            .options()
            .map_err(|e| CollectorError::Config(format!("collector '{}': {}", self.name(), e)))
    }
}

/// Core collector trait for implementing data collectors.
///
/// Collectors hold their [`MetricSink`] internally and write one metric line
/// per `put`. Each unit runs in its own task; `collect` may block on I/O
/// without affecting other collectors.
///
/// # Error Handling Philosophy
///
/// - **Probe failures** (target unreachable, timeout): valid observations;
///   record them as metrics and return `Ok(())`.
/// - **Collector errors** (bad configuration, broken subprocess): return
///   `Err`. The scheduler logs the error and runs the next pass anyway.
/// - [`CollectorError::PermanentlyDisabled`]: the unit stops for good until
///   its config file changes.
///
/// Long-running collectors (interval zero) must watch
/// [`CollectorContext::stop`] and return from `collect` once it fires.
#[async_trait::async_trait]
pub trait Collector: Send + 'static {
    /// Collector name (config file base name).
    fn name(&self) -> &str;

    /// Perform one collection pass.
    async fn collect(&mut self) -> Result<(), CollectorError>;

    /// Release resources. Called once after the final pass.
    async fn close(&mut self) {}
}
