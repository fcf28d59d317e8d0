// crates/rdbg-client/src/types.rs

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rdbg_protocol::DEFAULT_TCP_PORT;
use serde::{Deserialize, Serialize};

/// Configuration for the debugger client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Context selected at startup.
    pub default_context: Option<i32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_TCP_PORT,
            default_context: None,
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: ClientConfig = toml::from_str("default_context = 3").unwrap();
        assert_eq!(config.default_context, Some(3));
        assert_eq!(config.server_addr(), "127.0.0.1:8089");
    }
}
