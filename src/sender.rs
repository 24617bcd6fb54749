//! Sender: drains the delivery queue and ships batches.
//!
//! A single task owns the queue receiver and the destination pool. Each
//! iteration waits for one line, drains more up to a byte budget, parses
//! the batch and sends it to the current destination. A failed destination
//! is blacklisted and the batch is dropped.
//!
//! Failures that are not the destination's fault (panics, encode errors)
//! feed a consecutive-failure counter. Once it passes the threshold the
//! sender trips its circuit breaker and cancels the process shutdown token.

mod transport;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::destination::{Destination, DestinationPool};
use crate::metric::{MetricEntry, Parsed, Tags};
use crate::queue::QueueReceiver;

pub use transport::{DryRunTransport, HttpTransport, Payload, Transport, TransportError};

/// How long one `get` waits before the loop re-checks for stop.
pub const GET_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failed iterations tolerated before the breaker trips.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 100;

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("circuit breaker tripped after {0} consecutive failures")]
    CircuitBreaker(u32),

    #[error("sender task failed: {0}")]
    Join(#[from] JoinError),
}

/// Pre-send stage applied to raw lines after draining, before parsing.
pub trait LineFilter: Send + 'static {
    fn filter(&mut self, lines: Vec<String>) -> Vec<String>;
}

// =============================================================================
// Options / stats
// =============================================================================

/// Batch shaping settings.
#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub global_tags: Tags,
    pub max_tags: usize,
    pub max_batch_bytes: usize,
    pub max_consecutive_failures: u32,
}

impl SenderOptions {
    /// Options from the agent config; `hostname` overrides the lookup used
    /// for the automatic host tag.
    pub fn from_config(config: &AgentConfig, hostname: Option<&str>) -> Self {
        Self {
            global_tags: config.global_tags(hostname),
            max_tags: config.sender.max_tags,
            max_batch_bytes: config.sender.max_batch_bytes,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default(), None)
    }
}

#[derive(Debug, Default)]
struct Counters {
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    lines_sent: AtomicU64,
    lines_malformed: AtomicU64,
}

/// Cloneable view of the sender's counters.
#[derive(Debug, Clone, Default)]
pub struct SenderStats(Arc<Counters>);

/// Point-in-time copy of [`SenderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub lines_sent: u64,
    pub lines_malformed: u64,
}

impl SenderStats {
    pub fn batches_sent(&self) -> u64 {
        self.0.batches_sent.load(Ordering::Relaxed)
    }

    pub fn batches_failed(&self) -> u64 {
        self.0.batches_failed.load(Ordering::Relaxed)
    }

    pub fn lines_sent(&self) -> u64 {
        self.0.lines_sent.load(Ordering::Relaxed)
    }

    pub fn lines_malformed(&self) -> u64 {
        self.0.lines_malformed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_sent: self.batches_sent(),
            batches_failed: self.batches_failed(),
            lines_sent: self.lines_sent(),
            lines_malformed: self.lines_malformed(),
        }
    }
}

// =============================================================================
// Sender
// =============================================================================

/// Queue consumer and batch shipper.
pub struct Sender {
    rx: QueueReceiver,
    pool: DestinationPool,
    transport: Arc<dyn Transport>,
    options: SenderOptions,
    filter: Option<Box<dyn LineFilter>>,
    stats: SenderStats,
    consecutive_failures: u32,
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("pool", &self.pool)
            .field("options", &self.options)
            .field("filter", &self.filter.is_some())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl Sender {
    pub fn new(
        rx: QueueReceiver,
        pool: DestinationPool,
        transport: impl Transport,
        options: SenderOptions,
    ) -> Self {
        Self {
            rx,
            pool,
            transport: Arc::new(transport),
            options,
            filter: None,
            stats: SenderStats::default(),
            consecutive_failures: 0,
        }
    }

    /// Install a pre-send line filter.
    pub fn with_filter(mut self, filter: impl LineFilter) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn stats(&self) -> SenderStats {
        self.stats.clone()
    }

    /// Spawn the sender task. `shutdown` is cancelled if the circuit
    /// breaker trips.
    pub fn spawn(self, shutdown: CancellationToken) -> SenderHandle {
        let stop = CancellationToken::new();
        let stats = self.stats.clone();
        let task = tokio::spawn(self.run(stop.clone(), shutdown));
        SenderHandle { stop, stats, task }
    }

    /// Run until `stop` is cancelled, then flush what is still queued.
    pub async fn run(
        mut self,
        stop: CancellationToken,
        shutdown: CancellationToken,
    ) -> Result<(), SenderError> {
        tracing::info!(
            destinations = self.pool.len(),
            max_batch_bytes = self.options.max_batch_bytes,
            "Sender started"
        );

        loop {
            let first = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                line = self.rx.get(GET_TIMEOUT) => line,
            };
            let Some(first) = first else {
                if self.rx.is_closed() {
                    tracing::debug!("Delivery queue closed");
                    break;
                }
                continue;
            };

            let lines = self.drain(first);
            let clean = match AssertUnwindSafe(self.deliver(lines)).catch_unwind().await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Sender iteration failed");
                    false
                }
                Err(_) => {
                    tracing::error!("Sender iteration panicked");
                    false
                }
            };

            if clean {
                self.consecutive_failures = 0;
                continue;
            }
            self.consecutive_failures += 1;
            if self.consecutive_failures > self.options.max_consecutive_failures {
                tracing::error!(
                    failures = self.consecutive_failures,
                    "Too many consecutive sender failures, shutting down"
                );
                shutdown.cancel();
                return Err(SenderError::CircuitBreaker(self.consecutive_failures));
            }
        }

        self.flush().await;
        let stats = self.stats.snapshot();
        tracing::info!(
            batches_sent = stats.batches_sent,
            batches_failed = stats.batches_failed,
            lines_malformed = stats.lines_malformed,
            "Sender stopped"
        );
        Ok(())
    }

    /// Final delivery attempt for every queued batch.
    async fn flush(&mut self) {
        let mut batches = 0usize;
        while let Some(first) = self.rx.try_get() {
            let lines = self.drain(first);
            if let Ok(Err(e)) = AssertUnwindSafe(self.deliver(lines)).catch_unwind().await {
                tracing::error!(error = %e, "Final delivery failed");
            }
            batches += 1;
        }
        if batches > 0 {
            tracing::info!(batches, "Flushed queued metrics");
        }
    }

    /// Collect `first` plus whatever is queued, up to the byte budget.
    fn drain(&mut self, first: String) -> Vec<String> {
        let mut bytes = first.len();
        let mut lines = vec![first];
        while bytes < self.options.max_batch_bytes {
            let Some(line) = self.rx.try_get() else {
                break;
            };
            bytes += line.len();
            lines.push(line);
        }
        lines
    }

    fn parse(&self, lines: Vec<String>) -> Vec<MetricEntry> {
        let mut batch = Vec::with_capacity(lines.len());
        for line in lines {
            match MetricEntry::parse(&line, &self.options.global_tags, self.options.max_tags) {
                Ok(Parsed {
                    entry,
                    dropped_tags,
                }) => {
                    if !dropped_tags.is_empty() {
                        tracing::warn!(
                            metric = %entry.metric,
                            dropped = ?dropped_tags,
                            max_tags = self.options.max_tags,
                            "Too many tags, dropping extras"
                        );
                    }
                    batch.push(entry);
                }
                Err(e) => {
                    self.stats.0.lines_malformed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(line = %line, error = %e, "Dropping malformed metric line");
                }
            }
        }
        batch
    }

    /// Current destination, or the next eligible one after a failure.
    fn destination(&mut self) -> Destination {
        match self.pool.current() {
            Some(dest) => dest.clone(),
            None => self.pool.pick().clone(),
        }
    }

    /// Filter, parse and send one batch.
    ///
    /// Destination failures are handled here and return `Ok`; only
    /// agent-side errors are returned.
    async fn deliver(&mut self, lines: Vec<String>) -> Result<(), TransportError> {
        let lines = match self.filter.as_mut() {
            Some(filter) => filter.filter(lines),
            None => lines,
        };
        let batch = self.parse(lines);
        if batch.is_empty() {
            return Ok(());
        }

        let destination = self.destination();
        match self.transport.send(&destination, &batch).await {
            Ok(()) => {
                self.stats.0.batches_sent.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .0
                    .lines_sent
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                tracing::debug!(destination = %destination, metrics = batch.len(), "Batch sent");
                Ok(())
            }
            Err(e) => {
                self.stats.0.batches_failed.fetch_add(1, Ordering::Relaxed);
                if !e.is_destination_failure() {
                    return Err(e);
                }
                tracing::warn!(
                    destination = %destination,
                    metrics = batch.len(),
                    error = %e,
                    "Batch delivery failed, dropping batch"
                );
                self.pool.blacklist(&destination);
                Ok(())
            }
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Handle to a spawned [`Sender`].
#[derive(Debug)]
pub struct SenderHandle {
    stop: CancellationToken,
    stats: SenderStats,
    task: JoinHandle<Result<(), SenderError>>,
}

impl SenderHandle {
    pub fn stats(&self) -> SenderStats {
        self.stats.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the sender to flush and exit, then wait for it.
    pub async fn stop(self) -> Result<(), SenderError> {
        self.stop.cancel();
        self.task.await?
    }
}
