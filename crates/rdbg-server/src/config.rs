//! Configuration for the debugger TCP server.
//!
//! Sources, later ones win:
//!
//! 1. built-in defaults,
//! 2. a TOML file named by `RDBG_CONFIG` (keys as in [`Config`]),
//! 3. environment variables:
//!    - `RDBG_TCP_HOST`              (default: "" = all interfaces)
//!    - `RDBG_TCP_PORT`              (default: "8089", "0" = ephemeral)
//!    - `RDBG_TCP_BUFFER_SIZE`       (default: 50 MiB)
//!    - `RDBG_MAX_CLIENTS`           (default: "1024")
//!    - `RDBG_CLIENT_QUEUE_CAPACITY` (default: "4096")
//!    - `RDBG_QUEUE_WARN_THRESHOLD`  (default: "2", "0" = never warn)

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rdbg_core::{
    ErrorCode, RegistrySettings, DEFAULT_CLIENT_QUEUE_CAPACITY, DEFAULT_MAX_CLIENTS,
    DEFAULT_QUEUE_WARN_THRESHOLD,
};
use rdbg_protocol::{DEFAULT_BUFFER_SIZE, DEFAULT_TCP_PORT};
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_PATH_VAR: &str = "RDBG_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value `{value}` for {key}")]
    Env { key: &'static str, value: String },
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ConfigError::Read { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                ErrorCode::FileNotFound
            }
            ConfigError::Read { .. } => ErrorCode::CannotReadFile,
            ConfigError::Parse { .. } | ConfigError::Env { .. } => ErrorCode::IllegalArgument,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface to bind to. Empty means all interfaces.
    pub tcp_host: String,

    /// TCP port to listen on; `0` lets the OS pick one.
    pub tcp_port: u16,

    /// Per-connection read and write buffer capacity, in bytes.
    pub tcp_buffer_size: usize,

    pub max_clients: usize,

    /// Capacity of each client's input and output queue.
    pub client_queue_capacity: usize,

    /// Capacity of each session's action queue; unbounded when absent.
    pub action_queue_capacity: Option<usize>,

    pub queue_warn_threshold: usize,

    /// Extra attempts at removing borrowed clients on shutdown.
    pub shutdown_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_host: String::new(),
            tcp_port: DEFAULT_TCP_PORT,
            tcp_buffer_size: DEFAULT_BUFFER_SIZE,
            max_clients: DEFAULT_MAX_CLIENTS,
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
            action_queue_capacity: None,
            queue_warn_threshold: DEFAULT_QUEUE_WARN_THRESHOLD,
            shutdown_retries: 4,
        }
    }
}

impl Config {
    /// Defaults, then `RDBG_CONFIG`, then individual environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var(CONFIG_PATH_VAR) {
            Ok(path) if !path.is_empty() => Config::from_file(&path)?,
            _ => Config::default(),
        };

        if let Ok(host) = env::var("RDBG_TCP_HOST") {
            config.tcp_host = host;
        }
        config.tcp_port = read_env_or_default("RDBG_TCP_PORT", config.tcp_port)?;
        config.tcp_buffer_size = read_env_or_default("RDBG_TCP_BUFFER_SIZE", config.tcp_buffer_size)?;
        config.max_clients = read_env_or_default("RDBG_MAX_CLIENTS", config.max_clients)?;
        config.client_queue_capacity =
            read_env_or_default("RDBG_CLIENT_QUEUE_CAPACITY", config.client_queue_capacity)?;
        config.queue_warn_threshold =
            read_env_or_default("RDBG_QUEUE_WARN_THRESHOLD", config.queue_warn_threshold)?;

        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Config::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// `host:port` string to bind to.
    pub fn socket_addr_string(&self) -> String {
        let host = if self.tcp_host.is_empty() {
            "0.0.0.0"
        } else {
            self.tcp_host.as_str()
        };
        format!("{}:{}", host, self.tcp_port)
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            action_queue_capacity: self.action_queue_capacity,
            queue_warn_threshold: self.queue_warn_threshold,
        }
    }
}

fn read_env_or_default<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Env { key, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_defaults() {
        let config = Config::default();
        assert_eq!(config.tcp_port, 8089);
        assert_eq!(config.tcp_buffer_size, 50 * 1024 * 1024);
        assert_eq!(config.queue_warn_threshold, 2);
        assert_eq!(config.socket_addr_string(), "0.0.0.0:8089");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            tcp_host = "127.0.0.1"
            tcp_port = 0
            action_queue_capacity = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.socket_addr_string(), "127.0.0.1:0");
        assert_eq!(config.action_queue_capacity, Some(64));
        assert_eq!(config.max_clients, DEFAULT_MAX_CLIENTS);
    }

    #[test]
    fn unknown_file_maps_to_file_not_found() {
        let err = Config::from_file("/definitely/not/here.toml").unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
    }

    #[test]
    fn bad_toml_is_rejected() {
        assert!(Config::from_toml("tcp_port = \"high\"").is_err());
    }
}
