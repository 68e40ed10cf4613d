//! Server binary configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/tunnel-relay/server.toml`.

use serde::Deserialize;
use std::path::Path;

/// Validated server binary configuration.
#[derive(Debug, Clone)]
pub struct ServerBinConfig {
    pub bind: String,
    pub poll_timeout_secs: u64,
    pub cache_max_entries: usize,
    pub cache_ttl_secs: u64,
    pub reassembler_max_groups: usize,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    bind: Option<String>,
    poll_timeout_secs: Option<u64>,
    cache_max_entries: Option<usize>,
    cache_ttl_secs: Option<u64>,
    reassembler_max_groups: Option<usize>,
}

/// Load server config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ServerBinConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load server config from the default path `/etc/tunnel-relay/server.toml`,
/// falling back to built-in defaults when the file does not exist.
pub fn load_config() -> Result<ServerBinConfig, ConfigError> {
    let path = Path::new("/etc/tunnel-relay/server.toml");
    if !path.exists() {
        return load_config_from_str("");
    }
    load_config_from_path(path)
}

fn load_config_from_str(toml_str: &str) -> Result<ServerBinConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    Ok(ServerBinConfig {
        bind: raw.bind.unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
        poll_timeout_secs: raw.poll_timeout_secs.unwrap_or(28),
        cache_max_entries: raw.cache_max_entries.unwrap_or(1000),
        cache_ttl_secs: raw.cache_ttl_secs.unwrap_or(60),
        reassembler_max_groups: raw.reassembler_max_groups.unwrap_or(100),
    })
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_fields_absent() {
        let cfg = load_config_from_str("").unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:8080");
        assert_eq!(cfg.poll_timeout_secs, 28);
        assert_eq!(cfg.cache_max_entries, 1000);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let cfg = load_config_from_str("bind = \"127.0.0.1:9000\"\npoll_timeout_secs = 10\n").unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:9000");
        assert_eq!(cfg.poll_timeout_secs, 10);
    }

    #[test]
    fn malformed_toml_is_rejected() {
        let result = load_config_from_str("bind = [this is not valid");
        assert!(result.is_err());
    }
}
