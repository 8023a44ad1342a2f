use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

/// Optional JSON configuration. Every field has a default that preserves
/// stock behavior; command-line flags override whatever is loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Root nameserver, hostname or address literal.
    #[serde(default)]
    pub root_server: Option<String>,
    /// Print every query and response while resolving.
    #[serde(default)]
    pub trace: bool,
    /// How long one attempt waits for a reply, in milliseconds.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Datagram sends per query; only timeouts consume attempts.
    #[serde(default = "default_query_attempts")]
    pub query_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            root_server: None,
            trace: false,
            query_timeout_ms: default_query_timeout_ms(),
            query_attempts: default_query_attempts(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: ClientConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    info!(target = "config", path = %path.display(), "config loaded");

    Ok(cfg)
}

fn default_query_timeout_ms() -> u64 {
    5000
}

fn default_query_attempts() -> u32 {
    2
}
