//! Configuration validation utilities.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Parse duration string using humantime.
///
/// Supports various formats: `30s`, `1m`, `5m30s`, `1h`, `100ms`, etc.
///
/// # Examples
///
/// ```
/// use ferry::config::parse_duration;
///
/// assert_eq!(parse_duration("30s").unwrap().as_secs(), 30);
/// assert_eq!(parse_duration("1m").unwrap().as_secs(), 60);
/// assert_eq!(parse_duration("1h30m").unwrap().as_secs(), 5400);
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string is empty".to_string());
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Parse a global tag given as `key=value`.
///
/// The whole argument must match `^[-_.a-zA-Z0-9]+=\S+$`.
///
/// ```
/// use ferry::config::parse_global_tag;
///
/// assert_eq!(
///     parse_global_tag("env=prod").unwrap(),
///     ("env".to_string(), "prod".to_string())
/// );
/// assert!(parse_global_tag("bad tag=x").is_err());
/// ```
pub fn parse_global_tag(s: &str) -> Result<(String, String), String> {
    static TAG_REGEX: OnceLock<Regex> = OnceLock::new();

    let regex = TAG_REGEX.get_or_init(|| {
        Regex::new(r"^[-_.a-zA-Z0-9]+=\S+$").expect("failed to compile tag regex")
    });

    if !regex.is_match(s) {
        return Err(format!("tag '{s}' must match key=value"));
    }
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("tag '{s}' must match key=value"))?;
    Ok((key.to_string(), value.to_string()))
}

/// Expand environment variables in a string.
/// Supports ${VAR} and ${VAR:-default} syntax.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: OnceLock<Regex> = OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}
