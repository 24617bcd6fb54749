//! Configuration module for the ferry agent.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Agent settings (collector directory, destinations, queue, logging)
//! - Collector definitions (`<name>.conf` files)

mod app;
mod collector;
mod validation;

pub use app::{
    AgentConfig, CollectorsSection, DaemonSection, HttpSection, LoggingSection, SenderSection,
    system_hostname,
};
pub use collector::{CollectorDefinition, DefinitionError, definition_name};
pub use validation::{ConfigError, expand_env_vars, parse_duration, parse_global_tag};

// Re-export constants
pub use app::{
    DEFAULT_COLLECTOR_DIR, DEFAULT_HTTP_PATH, DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_TAGS,
    DEFAULT_POLL_INTERVAL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_STOP_TIMEOUT, HOST_TAG,
    MIN_POLL_INTERVAL,
};
pub use collector::{DEFAULT_COLLECTOR_INTERVAL, DEFINITION_EXTENSION};
