// sqlbridge-core/src/config.rs
//! Bridge configuration
//!
//! Defaults match the stock managed class layout. A host can override them
//! from JSON (e.g. a resource bundled next to the shared library) or from
//! `SQLBRIDGE_*` environment variables.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::logging::LogLevel;

pub const DEFAULT_CLASS_PREFIX: &str = "org/sqlite/jni/capi/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Package (slash-separated, trailing slash) holding the wrapper classes
    pub class_prefix: String,

    /// Initial log level name ("ERROR" .. "TRACE")
    pub log_level: String,

    /// Treat cross-boundary allocation failure as fatal instead of NOMEM
    pub fatal_on_oom: bool,

    /// Maintain the atomic counters in [`crate::metrics`]
    pub metrics: bool,

    /// Connection-state blocks reserved up front
    pub initial_connection_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            class_prefix: DEFAULT_CLASS_PREFIX.to_string(),
            log_level: LogLevel::Warn.as_str().to_string(),
            fatal_on_oom: false,
            metrics: true,
            initial_connection_capacity: 4,
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON document; missing keys keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(json)
            .map_err(|e| BridgeError::Error(format!("invalid bridge config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `SQLBRIDGE_LOG`, `SQLBRIDGE_FATAL_OOM`,
    /// `SQLBRIDGE_CLASS_PREFIX`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = BridgeConfig::default();
        if let Some(level) = lookup("SQLBRIDGE_LOG") {
            config.log_level = level;
        }
        if let Some(flag) = lookup("SQLBRIDGE_FATAL_OOM") {
            config.fatal_on_oom = matches!(flag.trim(), "1" | "true" | "yes" | "on");
        }
        if let Some(prefix) = lookup("SQLBRIDGE_CLASS_PREFIX") {
            config.class_prefix = prefix;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if LogLevel::parse(&self.log_level).is_none() {
            return Err(BridgeError::Error(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        if !self.class_prefix.is_empty() && !self.class_prefix.ends_with('/') {
            return Err(BridgeError::Error(format!(
                "class prefix '{}' must end with '/'",
                self.class_prefix
            )));
        }
        Ok(())
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::parse(&self.log_level).unwrap_or(LogLevel::Warn)
    }

    /// Fully qualified managed class name for a simple wrapper name
    pub fn class_name(&self, simple: &str) -> String {
        format!("{}{}", self.class_prefix, simple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.class_name("sqlite3"), "org/sqlite/jni/capi/sqlite3");
        assert_eq!(config.level(), LogLevel::Warn);
        assert!(!config.fatal_on_oom);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = BridgeConfig::from_json(r#"{"log_level": "debug", "metrics": false}"#).unwrap();
        assert_eq!(config.level(), LogLevel::Debug);
        assert!(!config.metrics);
        assert_eq!(config.class_prefix, DEFAULT_CLASS_PREFIX);
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(BridgeConfig::from_json(r#"{"log_level": "chatty"}"#).is_err());
        assert!(BridgeConfig::from_json(r#"{"class_prefix": "org/x"}"#).is_err());
        assert!(BridgeConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SQLBRIDGE_LOG", "trace"),
            ("SQLBRIDGE_FATAL_OOM", "1"),
            ("SQLBRIDGE_CLASS_PREFIX", "com/example/db/"),
        ]);
        let config = BridgeConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.level(), LogLevel::Trace);
        assert!(config.fatal_on_oom);
        assert_eq!(config.class_name("sqlite3_stmt"), "com/example/db/sqlite3_stmt");
    }
}
