//! Collector Layer
//!
//! Pluggable collectors that write metric lines to the delivery queue.
//! Each configured collector runs in its own Tokio task (see
//! [`crate::scheduler`]).
//!
//! # Architecture
//!
//! - [`Collector`]: Core trait for implementing data collectors
//! - [`Schedule`]: Execution schedule (interval or continuous)
//! - [`CollectorRegistry`]: Maps implementation identifiers to constructors
//!
//! # Example
//!
//! ```rust,no_run
//! use ferry::{CollectorContext, CollectorDefinition, CollectorRegistry, DeliveryQueue};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _rx) = DeliveryQueue::bounded(1024);
//! let definition = CollectorDefinition::new("redis")
//!     .with_class("tcp")
//!     .with_option("host", "127.0.0.1")
//!     .with_option("port", 6379);
//! let collector = CollectorRegistry::with_builtins()
//!     .instantiate(CollectorContext::new(definition, sink))?;
//! assert_eq!(collector.name(), "redis");
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod exec;
mod registry;
pub mod tcp;
mod traits;

pub use registry::{CollectorFactory, CollectorRegistry};
pub use traits::{Collector, CollectorContext, CollectorError, Schedule};
