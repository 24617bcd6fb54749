//! Collector config directory scanning.
//!
//! [`ConfigWatcher::scan`] diffs the directory against the caller's known
//! definitions and updates that map in place. Stale entries are found with a
//! generation counter: every scan bumps it, every file still on disk is
//! stamped with it, and anything left with an older stamp was removed.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::config::{CollectorDefinition, ConfigError, definition_name};

/// Known definitions keyed by collector name.
pub type Definitions = HashMap<String, CollectorDefinition>;

/// Result of one directory scan.
#[derive(Debug, Default)]
pub struct ConfigDiff {
    /// New or modified definitions.
    pub changed: BTreeMap<String, CollectorDefinition>,
    /// Definitions whose file disappeared.
    pub removed: BTreeMap<String, CollectorDefinition>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Scans a collector config directory for `<name>.conf` files.
#[derive(Debug)]
pub struct ConfigWatcher {
    dir: PathBuf,
    generation: u64,
    /// Files that failed to parse, with the mtime that failed.
    rejected: HashMap<String, SystemTime>,
}

impl ConfigWatcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            generation: 0,
            rejected: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generation of the most recent scan.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Scan the directory and diff it against `known`.
    ///
    /// Malformed files are logged and skipped. A known file that becomes
    /// malformed keeps its previous definition.
    ///
    /// # Errors
    /// Returns `ConfigError::IoError` if the directory cannot be listed.
    pub fn scan(&mut self, known: &mut Definitions) -> Result<ConfigDiff, ConfigError> {
        let entries = std::fs::read_dir(&self.dir)?;
        self.generation += 1;
        let generation = self.generation;
        let mut diff = ConfigDiff::default();
        let mut rejected_seen = Vec::new();

        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to read directory entry");
                    continue;
                }
            };
            let Some(name) = definition_name(&path) else {
                continue;
            };
            if !path.is_file() {
                continue;
            }

            let mtime = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(mtime) => mtime,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to stat collector config");
                    if let Some(def) = known.get_mut(&name) {
                        def.generation = generation;
                    }
                    continue;
                }
            };

            if let Some(def) = known.get_mut(&name) {
                def.generation = generation;
                if mtime <= def.source_mtime {
                    continue;
                }
            }

            if self.rejected.get(&name) == Some(&mtime) {
                rejected_seen.push(name);
                continue;
            }

            match CollectorDefinition::load(&path) {
                Ok(mut def) => {
                    tracing::debug!(collector = %name, path = %path.display(), "Loaded collector config");
                    self.rejected.remove(&name);
                    def.generation = generation;
                    known.insert(name.clone(), def.clone());
                    diff.changed.insert(name, def);
                }
                Err(e) => {
                    tracing::error!(collector = %name, error = %e, "Skipping malformed collector config");
                    self.rejected.insert(name.clone(), mtime);
                    rejected_seen.push(name);
                }
            }
        }

        self.rejected.retain(|name, _| rejected_seen.contains(name));

        let stale: Vec<String> = known
            .iter()
            .filter(|(_, def)| def.generation < generation)
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(def) = known.remove(&name) {
                tracing::debug!(collector = %name, "Collector config removed");
                diff.removed.insert(name, def);
            }
        }

        Ok(diff)
    }
}
