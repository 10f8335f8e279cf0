//! Configuration resolution for pipebridge.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Config file (explicit path, or the global `settings.json`)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::policy::{FanoutPolicy, OverflowPolicy};

/// Complete pipebridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub process: ProcessSettings,
    #[serde(default)]
    pub queues: QueueSettings,
    #[serde(default)]
    pub fanout: FanoutPolicy,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            process: ProcessSettings::default(),
            queues: QueueSettings::default(),
            fanout: FanoutPolicy::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Listening endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Maximum simultaneous websocket connections.
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_connections: 16,
        }
    }
}

/// The bridged child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Executable to spawn. `None` means the bundled `pipebridge-ticker`.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    /// Seconds to wait for the child to exit before escalating (SIGINT, then kill).
    pub terminate_timeout_secs: u64,
    /// Output lines longer than this are delivered in several messages.
    pub max_line_bytes: usize,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            terminate_timeout_secs: 5,
            max_line_bytes: 64 * 1024,
        }
    }
}

/// Bounds on the internal queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Lines waiting to be written to stdin.
    pub input_capacity: usize,
    /// Messages waiting to be picked up by connections.
    pub output_capacity: usize,
    /// Applied when the input queue is full.
    pub overflow: OverflowPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            input_capacity: 256,
            output_capacity: 256,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl Config {
    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queues.input_capacity == 0 {
            return Err(Error::Config("queues.input_capacity must be > 0".into()));
        }
        if self.queues.output_capacity == 0 {
            return Err(Error::Config("queues.output_capacity must be > 0".into()));
        }
        if self.process.max_line_bytes == 0 {
            return Err(Error::Config("process.max_line_bytes must be > 0".into()));
        }
        if self.server.max_connections == 0 {
            return Err(Error::Config("server.max_connections must be > 0".into()));
        }
        if self
            .process
            .program
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            return Err(Error::Config("process.program must not be empty".into()));
        }
        Ok(())
    }

    /// `host:port` string suitable for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `config_path` must exist; the global file is optional.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => load_config_file(path)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path: `<config dir>/pipebridge/settings.json`.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pipebridge").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `PIPEBRIDGE_*` overrides read through `lookup`.
///
/// Unparseable values are ignored with a warning, leaving the lower layer in place.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("PIPEBRIDGE_HOST") {
        config.server.host = val;
    }
    if let Some(val) = lookup("PIPEBRIDGE_PORT") {
        match val.parse() {
            Ok(n) => config.server.port = n,
            Err(_) => tracing::warn!(value = %val, "Ignoring invalid PIPEBRIDGE_PORT"),
        }
    }
    if let Some(val) = lookup("PIPEBRIDGE_PROGRAM") {
        config.process.program = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("PIPEBRIDGE_INPUT_CAPACITY") {
        match val.parse() {
            Ok(n) => config.queues.input_capacity = n,
            Err(_) => tracing::warn!(value = %val, "Ignoring invalid PIPEBRIDGE_INPUT_CAPACITY"),
        }
    }
    if let Some(val) = lookup("PIPEBRIDGE_OVERFLOW") {
        match val.parse() {
            Ok(policy) => config.queues.overflow = policy,
            Err(e) => tracing::warn!(error = %e, "Ignoring PIPEBRIDGE_OVERFLOW"),
        }
    }
    if let Some(val) = lookup("PIPEBRIDGE_FANOUT") {
        match val.parse() {
            Ok(policy) => config.fanout = policy,
            Err(e) => tracing::warn!(error = %e, "Ignoring PIPEBRIDGE_FANOUT"),
        }
    }
    if let Some(val) = lookup("PIPEBRIDGE_LOG_LEVEL") {
        config.log_level = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_listens_on_localhost_8000() {
        let config = Config::default();
        assert_eq!(config.bind_address(), "127.0.0.1:8000");
        assert_eq!(config.fanout, FanoutPolicy::SingleConsumer);
        assert_eq!(config.queues.overflow, OverflowPolicy::Block);
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{ "server": { "port": 9001 }, "queues": { "overflow": "drop-oldest" }, "fanout": "broadcast" }"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.queues.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.queues.input_capacity, 256);
        assert_eq!(config.fanout, FanoutPolicy::Broadcast);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("nope.json")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let env: HashMap<&str, &str> = [
            ("PIPEBRIDGE_PORT", "not-a-port"),
            ("PIPEBRIDGE_HOST", "0.0.0.0"),
            ("PIPEBRIDGE_PROGRAM", "/bin/cat"),
            ("PIPEBRIDGE_OVERFLOW", "reject"),
            ("PIPEBRIDGE_FANOUT", "broadcast"),
            ("PIPEBRIDGE_INPUT_CAPACITY", "8"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| env.get(key).map(ToString::to_string));

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.process.program, Some(PathBuf::from("/bin/cat")));
        assert_eq!(config.queues.overflow, OverflowPolicy::Reject);
        assert_eq!(config.fanout, FanoutPolicy::Broadcast);
        assert_eq!(config.queues.input_capacity, 8);
    }

    #[test]
    fn validate_rejects_zero_capacity_and_empty_program() {
        let mut config = Config::default();
        config.queues.input_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.process.program = Some(PathBuf::new());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.process.max_line_bytes = 0;
        assert!(config.validate().is_err());
    }
}
