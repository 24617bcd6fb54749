//! Collector definitions loaded from `<name>.conf` files.
//!
//! Each file is a YAML document with a `base` section and free-form
//! collector-specific keys:
//!
//! ```yaml
//! base:
//!   enabled: true
//!   interval: 15
//!   collectorclass: tcp
//! host: 127.0.0.1
//! port: 6379
//! ```

use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

/// File extension of collector definition files.
pub const DEFINITION_EXTENSION: &str = "conf";

/// Default pass interval when `base.interval` is absent.
pub const DEFAULT_COLLECTOR_INTERVAL: Duration = Duration::from_secs(15);

/// Errors raised while loading a single definition file.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// File could not be read or stat'ed.
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// File is not valid YAML or has mistyped base keys.
    #[error("failed to parse '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// File name does not yield a usable collector name.
    #[error("invalid collector file name '{0}'")]
    InvalidName(String),
}

fn default_interval_secs() -> u64 {
    DEFAULT_COLLECTOR_INTERVAL.as_secs()
}

#[derive(Debug, Default, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    base: BaseSection,
    #[serde(flatten)]
    options: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct BaseSection {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_interval_secs")]
    interval: u64,
    #[serde(default, rename = "collectorclass", alias = "collector_class")]
    collector_class: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Default for BaseSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_interval_secs(),
            collector_class: None,
            extra: Map::new(),
        }
    }
}

/// One collector as described by its config file.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorDefinition {
    /// Collector name (file base name).
    pub name: String,
    /// Whether the collector should run.
    pub enabled: bool,
    /// Pause between pass starts; zero means long-running.
    pub interval: Duration,
    /// Explicit implementation identifier.
    pub collector_class: Option<String>,
    /// Extra keys found in the `base` section.
    pub base: Map<String, Value>,
    /// Collector-specific top-level keys.
    pub options: Map<String, Value>,
    /// Modification time of the source file when it was parsed.
    pub source_mtime: SystemTime,
    /// Watcher generation in which the file was last seen.
    pub generation: u64,
}

impl CollectorDefinition {
    /// Create an in-memory definition (used by tests and embedders).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: false,
            interval: DEFAULT_COLLECTOR_INTERVAL,
            collector_class: None,
            base: Map::new(),
            options: Map::new(),
            source_mtime: SystemTime::UNIX_EPOCH,
            generation: 0,
        }
    }

    /// Parse a definition from YAML text.
    pub fn from_yaml(
        name: impl Into<String>,
        content: &str,
        source_mtime: SystemTime,
    ) -> Result<Self, serde_yaml::Error> {
        let file: DefinitionFile = if content.trim().is_empty() {
            DefinitionFile::default()
        } else {
            serde_yaml::from_str(content)?
        };

        Ok(Self {
            name: name.into(),
            enabled: file.base.enabled,
            interval: Duration::from_secs(file.base.interval),
            collector_class: file
                .base
                .collector_class
                .filter(|c| !c.trim().is_empty()),
            base: file.base.extra,
            options: file.options,
            source_mtime,
            generation: 0,
        })
    }

    /// Load a definition from `<dir>/<name>.conf`.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let name = definition_name(path)
            .ok_or_else(|| DefinitionError::InvalidName(path.display().to_string()))?;
        let io_err = |source| DefinitionError::Io {
            path: path.display().to_string(),
            source,
        };

        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(io_err)?;
        let content = std::fs::read_to_string(path).map_err(io_err)?;

        Self::from_yaml(name, &content, mtime).map_err(|source| DefinitionError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Identifier used to resolve the implementation in the registry.
    ///
    /// `collectorclass` when set, otherwise the collector name; lowercased
    /// with `-` folded to `_`.
    pub fn implementation_id(&self) -> String {
        self.collector_class
            .as_deref()
            .unwrap_or(&self.name)
            .trim()
            .to_lowercase()
            .replace('-', "_")
    }

    /// Deserialize the collector-specific keys into a typed config.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.options.clone()))
    }

    /// Builder: set enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Builder: set the pass interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Builder: set the implementation identifier.
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.collector_class = Some(class.into());
        self
    }

    /// Builder: add a collector-specific option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Collector name for a definition file path, if it follows `<name>.conf`.
pub fn definition_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(DEFINITION_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}
