use anyhow::{anyhow, Context, Result};
use fcx_core::connection::{Capabilities, ConnectionConfig};
use fcx_core::RequestLimits;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::envsubst::expand_env;

/// Top-level fcxd configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FcxdConfig {
    /// TCP ("127.0.0.1:9000") or Unix socket ("unix:///run/fcxd.sock").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Allow binding to non-loopback TCP addresses.
    #[serde(default)]
    pub allow_insecure_tcp: bool,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Keep-alive cap: requests served on one connection before it is closed.
    #[serde(default = "default_max_requests_per_connection")]
    pub max_requests_per_connection: usize,

    /// Bytes requested from the socket per read.
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,

    /// Cap on received bytes not yet forming a complete record.
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,

    #[serde(default = "default_max_params_bytes")]
    pub max_params_bytes: usize,

    #[serde(default = "default_max_stdin_bytes")]
    pub max_stdin_bytes: usize,

    /// Filter used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerConfig {
    #[serde(default)]
    pub r#match: MatchConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchConfig {
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub path_regex: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum BackendConfig {
    #[serde(rename = "static")]
    Static(StaticBackendConfig),
    #[serde(rename = "echo")]
    Echo,
    #[serde(rename = "files")]
    Files(FilesBackendConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticBackendConfig {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesBackendConfig {
    pub root: PathBuf,
    #[serde(default = "default_index")]
    pub index: String,
}

fn default_listen() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_max_connections() -> usize {
    64
}

fn default_max_requests_per_connection() -> usize {
    64
}

fn default_read_chunk_bytes() -> usize {
    4096
}

fn default_max_buffered_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_max_params_bytes() -> usize {
    1_048_576 // 1 MiB
}

fn default_max_stdin_bytes() -> usize {
    33_554_432 // 32 MiB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_status() -> u16 {
    200
}

fn default_content_type() -> String {
    "text/plain; charset=utf-8".to_string()
}

fn default_index() -> String {
    "index.html".to_string()
}

impl FcxdConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("max_connections", self.max_connections),
            ("max_requests_per_connection", self.max_requests_per_connection),
            ("read_chunk_bytes", self.read_chunk_bytes),
            ("max_buffered_bytes", self.max_buffered_bytes),
            ("max_params_bytes", self.max_params_bytes),
            ("max_stdin_bytes", self.max_stdin_bytes),
        ] {
            if value == 0 {
                return Err(anyhow!("{name} must be >= 1"));
            }
        }
        if self.read_chunk_bytes > self.max_buffered_bytes {
            return Err(anyhow!(
                "read_chunk_bytes ({}) must not exceed max_buffered_bytes ({})",
                self.read_chunk_bytes,
                self.max_buffered_bytes
            ));
        }

        if let Some(path) = self.listen.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(anyhow!("unix listen address needs a socket path"));
            }
            return Ok(());
        }

        let addr: SocketAddr = self
            .listen
            .parse()
            .map_err(|e| anyhow!("invalid listen address '{}': {}", self.listen, e))?;
        if !addr.ip().is_loopback() && !self.allow_insecure_tcp {
            return Err(anyhow!(
                "refusing to bind fcxd to non-loopback address '{}' without allow_insecure_tcp=true",
                self.listen
            ));
        }
        Ok(())
    }

    /// Per-connection settings handed to the protocol engine.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            read_chunk_bytes: self.read_chunk_bytes,
            max_buffered_bytes: self.max_buffered_bytes,
            max_requests_per_connection: self.max_requests_per_connection,
            request_limits: RequestLimits {
                max_params_bytes: self.max_params_bytes,
                max_stdin_bytes: self.max_stdin_bytes,
            },
            capabilities: Capabilities {
                max_conns: self.max_connections,
                max_reqs: self.max_connections,
            },
        }
    }
}

pub fn parse_config(raw: &str) -> Result<FcxdConfig> {
    let expanded = expand_env(raw)?;
    let config: FcxdConfig = serde_yaml::from_str(&expanded)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<FcxdConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("invalid config {}", path.display()))
}
