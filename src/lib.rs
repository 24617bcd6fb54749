//! Ferry - Host Telemetry Agent
//!
//! This crate provides the core of the `ferry` agent. It can be embedded as a
//! library, or run as the standalone `ferry` executable.
//!
//! # Architecture
//!
//! ```text
//! ConfigWatcher -> Supervisor -> Scheduler (one task per collector)
//!                                    |
//!                                    v
//!                               DeliveryQueue -> Sender -> HTTP destinations
//! ```
//!
//! - **Collectors**: pluggable units producing metric lines ([`collector`])
//! - **Supervision**: config directory watching and hot reload ([`supervisor`])
//! - **Delivery**: bounded queue, batching and destination failover ([`sender`])
//!
//! # Example
//!
//! ```rust,no_run
//! use ferry::{
//!     CollectorRegistry, ConfigWatcher, DeliveryQueue, DestinationPool, DryRunTransport,
//!     Sender, SenderOptions, Supervisor,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let shutdown = CancellationToken::new();
//!     let (sink, rx) = DeliveryQueue::bounded(100_000);
//!
//!     let pool = DestinationPool::new(vec!["localhost:4242".parse()?]);
//!     let sender = Sender::new(rx, pool, DryRunTransport::default(), SenderOptions::default())
//!         .spawn(shutdown.clone());
//!
//!     let mut supervisor = Supervisor::new(
//!         ConfigWatcher::new("/etc/ferry/collectors"),
//!         CollectorRegistry::with_builtins(),
//!         sink,
//!     )
//!     .with_sender(sender);
//!     supervisor.poll().await?;
//!     supervisor.run(shutdown).await?;
//!     Ok(())
//! }
//! ```

pub mod collector;
pub mod config;
pub mod daemon;
pub mod destination;
pub mod logging;
pub mod metric;
pub mod queue;
pub mod scheduler;
pub mod sender;
pub mod supervisor;
pub mod watcher;

pub use collector::{Collector, CollectorContext, CollectorError, CollectorRegistry, Schedule};
pub use config::{AgentConfig, CollectorDefinition, ConfigError};
pub use destination::{Destination, DestinationPool};
pub use metric::{MetricEntry, MetricLine, ParseError, Tags};
pub use queue::{DeliveryQueue, MetricSink, QueueReceiver};
pub use scheduler::{CollectorUnit, Scheduler, SchedulerError, UnitState};
pub use sender::{
    DryRunTransport, HttpTransport, LineFilter, Sender, SenderError, SenderHandle,
    SenderOptions, SenderStats, Transport, TransportError,
};
pub use supervisor::Supervisor;
pub use watcher::{ConfigDiff, ConfigWatcher};
