//! Agent configuration structures.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::destination::Destination;
use crate::metric::Tags;
use crate::queue::DEFAULT_QUEUE_CAPACITY;

use super::validation::{ConfigError, expand_env_vars, parse_global_tag};

// =============================================================================
// Constants
// =============================================================================

/// Default collector config directory.
pub const DEFAULT_COLLECTOR_DIR: &str = "/etc/ferry/collectors";

/// Default reconcile poll interval (5 seconds).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum reconcile poll interval (1 second).
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default bounded wait for one unit to stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Default destination when none is configured.
pub const DEFAULT_DESTINATION: &str = "localhost:4242";

/// Default maximum number of tags per entry.
pub const DEFAULT_MAX_TAGS: usize = 8;

/// Default drain budget per batch (raw line bytes).
pub const DEFAULT_MAX_BATCH_BYTES: usize = 64 * 1024;

/// Default HTTP request path.
pub const DEFAULT_HTTP_PATH: &str = "/api/put";

/// Default HTTP request timeout (10 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default log file size before rotation (64 MiB).
pub const DEFAULT_LOG_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Default number of rotated log files kept.
pub const DEFAULT_LOG_BACKUPS: usize = 1;

/// Tag key added automatically with the system hostname.
pub const HOST_TAG: &str = "host";

fn default_collector_dir() -> PathBuf {
    PathBuf::from(DEFAULT_COLLECTOR_DIR)
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_stop_timeout() -> Duration {
    DEFAULT_STOP_TIMEOUT
}

fn default_hosts() -> Vec<Destination> {
    vec![Destination::new("localhost", crate::destination::DEFAULT_PORT)]
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_max_tags() -> usize {
    DEFAULT_MAX_TAGS
}

fn default_max_batch_bytes() -> usize {
    DEFAULT_MAX_BATCH_BYTES
}

fn default_http_path() -> String {
    DEFAULT_HTTP_PATH.to_string()
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_true() -> bool {
    true
}

fn default_log_max_bytes() -> u64 {
    DEFAULT_LOG_MAX_BYTES
}

fn default_log_backups() -> usize {
    DEFAULT_LOG_BACKUPS
}

// =============================================================================
// Collectors
// =============================================================================

/// Collector supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorsSection {
    /// Directory holding `<name>.conf` files.
    #[serde(default = "default_collector_dir")]
    pub dir: PathBuf,

    /// Reconcile poll interval (default: 5s, minimum: 1s).
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Bounded wait for a unit to stop before it is aborted (default: 60s).
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for CollectorsSection {
    fn default() -> Self {
        Self {
            dir: default_collector_dir(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

// =============================================================================
// Sender
// =============================================================================

/// HTTP transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSection {
    /// Request path (default: "/api/put").
    #[serde(default = "default_http_path")]
    pub path: String,

    /// Basic auth user name.
    #[serde(default)]
    pub username: Option<String>,

    /// Basic auth password; `${VAR}` is expanded.
    #[serde(default)]
    pub password: Option<String>,

    /// Token sent in every request body; `${VAR}` is expanded.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Use HTTPS.
    #[serde(default)]
    pub ssl: bool,

    /// Verify certificates and hostnames when `ssl` is on (default: true).
    #[serde(default = "default_true")]
    pub ssl_verify: bool,

    /// Per-request timeout (default: 10s).
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            path: default_http_path(),
            username: None,
            password: None,
            auth_token: None,
            ssl: false,
            ssl_verify: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Queue and delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderSection {
    /// Destination pool.
    #[serde(default = "default_hosts")]
    pub hosts: Vec<Destination>,

    /// Global tags added to every entry.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Skip the automatic `host=<hostname>` tag.
    #[serde(default)]
    pub remove_host_tag: bool,

    /// Delivery queue capacity (default: 100000).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum tags per entry (default: 8).
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,

    /// Raw bytes drained into one batch (default: 64 KiB).
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    /// Log batches instead of sending them.
    #[serde(default)]
    pub dry_run: bool,

    /// HTTP transport settings.
    #[serde(default)]
    pub http: HttpSection,
}

impl Default for SenderSection {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            tags: BTreeMap::new(),
            remove_host_tag: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_tags: DEFAULT_MAX_TAGS,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            dry_run: false,
            http: HttpSection::default(),
        }
    }
}

// =============================================================================
// Logging / process
// =============================================================================

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log file; stderr when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Rotate when the file would exceed this size (default: 64 MiB).
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,

    /// Rotated files kept (default: 1).
    #[serde(default = "default_log_backups")]
    pub backups: usize,

    /// Debug logging for the agent.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            file: None,
            max_bytes: DEFAULT_LOG_MAX_BYTES,
            backups: DEFAULT_LOG_BACKUPS,
            verbose: false,
        }
    }
}

/// Process settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonSection {
    /// Detach from the terminal.
    #[serde(default)]
    pub daemonize: bool,

    /// Pid file written after startup.
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
}

// =============================================================================
// Agent Configuration
// =============================================================================

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub collectors: CollectorsSection,

    #[serde(default)]
    pub sender: SenderSection,

    #[serde(default)]
    pub logging: LoggingSection,

    #[serde(default)]
    pub daemon: DaemonSection,
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    ///
    /// Validation is left to the caller so that CLI overrides can be
    /// applied first.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Expand `${VAR}` references in credential values.
    pub fn expand_secrets(&mut self) {
        let http = &mut self.sender.http;
        for value in [&mut http.password, &mut http.auth_token, &mut http.username]
            .into_iter()
            .flatten()
        {
            *value = expand_env_vars(value);
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.collectors.poll_interval < MIN_POLL_INTERVAL {
            return invalid(format!(
                "collectors.poll_interval must be at least {:?}",
                MIN_POLL_INTERVAL
            ));
        }

        let sender = &self.sender;
        if sender.hosts.is_empty() {
            return invalid("sender.hosts must contain at least one destination".to_string());
        }
        if sender.queue_capacity == 0 {
            return invalid("sender.queue_capacity must be positive".to_string());
        }
        if sender.max_batch_bytes == 0 {
            return invalid("sender.max_batch_bytes must be positive".to_string());
        }

        // Same rule as `--tag` on the command line.
        for (key, value) in &sender.tags {
            let tag = format!("{key}={value}");
            match parse_global_tag(&tag) {
                Ok((parsed, _)) if parsed == *key => {}
                _ => return invalid(format!("invalid global tag '{tag}'")),
            }
        }

        let global_count = self.global_tags(None).len();
        if sender.max_tags == 0 || sender.max_tags < global_count {
            return invalid(format!(
                "sender.max_tags ({}) must be positive and at least the number of global tags ({})",
                sender.max_tags, global_count
            ));
        }

        if !sender.http.path.starts_with('/') {
            return invalid(format!(
                "sender.http.path must start with '/': '{}'",
                sender.http.path
            ));
        }
        if sender.http.password.is_some() && sender.http.username.is_none() {
            return invalid("sender.http.password requires sender.http.username".to_string());
        }

        if self.logging.file.is_some() && self.logging.max_bytes == 0 {
            return invalid("logging.max_bytes must be positive".to_string());
        }

        Ok(())
    }

    /// Resolve relative paths against the current directory.
    ///
    /// Must run before daemonizing, which changes directory to `/`.
    pub fn make_paths_absolute(&mut self) -> Result<(), ConfigError> {
        self.collectors.dir = std::path::absolute(&self.collectors.dir)?;
        for path in [&mut self.logging.file, &mut self.daemon.pidfile]
            .into_iter()
            .flatten()
        {
            *path = std::path::absolute(&*path)?;
        }
        Ok(())
    }

    /// Global tags including the automatic host tag.
    ///
    /// `hostname` overrides the system hostname lookup.
    pub fn global_tags(&self, hostname: Option<&str>) -> Tags {
        let mut tags = self.sender.tags.clone();
        if !self.sender.remove_host_tag && !tags.contains_key(HOST_TAG) {
            let host = hostname.map(str::to_string).or_else(system_hostname);
            if let Some(host) = host {
                tags.insert(HOST_TAG.to_string(), host);
            }
        }
        tags
    }
}

/// Short hostname of this machine.
pub fn system_hostname() -> Option<String> {
    #[cfg(unix)]
    {
        let name = nix::unistd::gethostname().ok()?.into_string().ok()?;
        let short = name.split('.').next().unwrap_or(&name).to_string();
        (!short.is_empty()).then_some(short)
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").ok()
    }
}
