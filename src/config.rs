//! Configuration types: server registration and gateway-wide settings.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Session multiplexing mode for a stdio-backed server (spec.md §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// One subprocess serves every session.
    Shared,
    /// One subprocess per session, subject to an LRU cap.
    Isolated,
}

/// Server configuration, tagged by transport (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerConfig {
    Http {
        name: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Stdio {
        name: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(rename = "sessionMode", default = "default_session_mode")]
        session_mode: SessionMode,
        /// Per-server override of the stdio request deadline (spec.md §4.4.5).
        #[serde(default)]
        request_timeout_secs: Option<u64>,
        /// Per-server override of the health-check interval (spec.md §4.9).
        #[serde(default)]
        health_interval_secs: Option<u64>,
    },
}

fn default_session_mode() -> SessionMode {
    SessionMode::Shared
}

impl ServerConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Http { name, .. } => name,
            Self::Stdio { name, .. } => name,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        match self {
            Self::Http { .. } => Duration::from_secs(30),
            Self::Stdio { request_timeout_secs, .. } => {
                Duration::from_secs(request_timeout_secs.unwrap_or(30))
            }
        }
    }

    pub fn health_interval(&self) -> Duration {
        match self {
            Self::Http { .. } => Duration::from_secs(30),
            Self::Stdio { health_interval_secs, .. } => {
                Duration::from_secs(health_interval_secs.unwrap_or(30))
            }
        }
    }

    /// Validate the server name and transport-specific fields.
    ///
    /// Names must be unique (checked by the caller, `StorageManager`),
    /// lowercased, trimmed, and match `^[a-zA-Z0-9][a-zA-Z0-9-_]*$`.
    pub fn validate(&self) -> GatewayResult<()> {
        validate_name(self.name())?;
        match self {
            Self::Http { url, .. } => {
                url::Url::parse(url)
                    .map_err(|e| GatewayError::configuration(format!("invalid url: {e}")))?;
            }
            Self::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(GatewayError::configuration("command must not be empty"));
                }
            }
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> GatewayResult<()> {
    if name.trim() != name || name.is_empty() {
        return Err(GatewayError::configuration(
            "server name must be non-empty and free of surrounding whitespace",
        ));
    }
    if name != name.to_lowercase() {
        return Err(GatewayError::configuration("server name must be lowercase"));
    }
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(GatewayError::configuration("server name must be non-empty"));
    };
    if !first.is_ascii_alphanumeric() {
        return Err(GatewayError::configuration(
            "server name must start with a letter or digit",
        ));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(GatewayError::configuration(
            "server name must match ^[a-zA-Z0-9][a-zA-Z0-9-_]*$",
        ));
    }
    Ok(())
}

/// Environment variables passed through unchanged to every stdio subprocess,
/// regardless of per-server `env` overrides (spec.md §4.4.1).
pub const ENV_WHITELIST: &[&str] = &[
    "PATH", "HOME", "USER", "LANG", "TMPDIR", "TMP", "TEMP", "SHELL", "TERM", "COLORTERM",
    "NODE_ENV",
];

pub fn env_key_allowed(key: &str) -> bool {
    ENV_WHITELIST.contains(&key) || key.starts_with("LC_")
}

/// Gateway-wide settings, sourced from CLI flags / environment (spec.md §6).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub storage_dir: PathBuf,
    pub bind: String,
    pub port: u16,
    /// Bearer token for `/gateway/mcp` and proxied routes. Generated and
    /// logged once at startup if `MCP_GATEWAY_TOKEN` is unset.
    pub auth_token: secrecy::SecretString,
    /// Maximum number of concurrent isolated-mode stdio sessions per server.
    pub isolated_session_cap: usize,
    /// Maximum inbound request body size (spec.md §9 Open Question: 8 MiB).
    pub max_body_bytes: usize,
}

impl GatewayConfig {
    pub const DEFAULT_PORT: u16 = 3333;
    pub const DEFAULT_ISOLATED_CAP: usize = 100;
    pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

    pub fn default_storage_dir() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mcp-gateway")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_names() {
        assert!(validate_name("demo").is_ok());
        assert!(validate_name("demo-server_2").is_ok());
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(validate_name("Demo").is_err());
        assert!(validate_name("-demo").is_err());
        assert!(validate_name(" demo").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name("demo server").is_err());
    }

    #[test]
    fn env_whitelist_allows_lc_prefix() {
        assert!(env_key_allowed("LC_ALL"));
        assert!(env_key_allowed("PATH"));
        assert!(!env_key_allowed("AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn http_config_rejects_bad_url() {
        let cfg = ServerConfig::Http {
            name: "demo".to_string(),
            url: "not a url".to_string(),
            headers: HashMap::new(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stdio_config_requires_command() {
        let cfg = ServerConfig::Stdio {
            name: "demo".to_string(),
            command: "".to_string(),
            args: vec![],
            cwd: None,
            env: HashMap::new(),
            session_mode: SessionMode::Shared,
            request_timeout_secs: None,
            health_interval_secs: None,
        };
        assert!(cfg.validate().is_err());
    }
}
