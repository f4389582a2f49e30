//! Typed server configuration (SPEC_FULL.md §6.1): defaults, a TOML file
//! layer, and a `clap`-derived CLI layer, in that precedence order (CLI
//! overrides file overrides defaults).

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    pub max_connections: usize,
    pub allowed_ips: Vec<String>,
    pub connection_timeout_s: u64,
    pub device_password: String,
    pub primary_server_ip: String,
    pub primary_server_port: u16,
    pub backup_server_ip: String,
    pub backup_server_port: u16,
    pub low_battery_volts: f32,
    pub persistence_uri: String,
    /// Namespace passed to [`crate::store::open_store`]. For the `file://`
    /// backend this is a subdirectory under `persistence_uri`'s path, so
    /// multiple services can share a root path without clobbering each
    /// other's journal/snapshot files.
    pub persistence_db: String,
    pub notifications_enabled: bool,
    pub fcm_credentials_path: Option<String>,
    pub default_topic: String,
    pub log_level: String,
    pub shutdown_grace_s: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            listen_port: 8000,
            max_connections: 1000,
            allowed_ips: Vec::new(),
            connection_timeout_s: 3600,
            device_password: "gv50".to_string(),
            primary_server_ip: String::new(),
            primary_server_port: 0,
            backup_server_ip: String::new(),
            backup_server_port: 0,
            low_battery_volts: 11.5,
            persistence_uri: "memory://".to_string(),
            persistence_db: "gv50".to_string(),
            notifications_enabled: false,
            fcm_credentials_path: None,
            default_topic: "gv50-fleet".to_string(),
            log_level: "info".to_string(),
            shutdown_grace_s: 10,
        }
    }
}

impl Config {
    /// Whether `allowed_ips` permits a connection from `ip`. An empty list,
    /// or a list containing the literal `0.0.0.0/0`, means allow-all;
    /// otherwise membership is an exact-string match against the source IP
    /// (SPEC_FULL.md §6.1).
    pub fn is_ip_allowed(&self, ip: &IpAddr) -> bool {
        if self.allowed_ips.is_empty()
            || self.allowed_ips.iter().any(|a| a == "0.0.0.0/0")
        {
            return true;
        }
        let ip_str = ip.to_string();
        self.allowed_ips.iter().any(|a| a == &ip_str)
    }

    pub fn load_from_file(path: &std::path::Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        Ok(config)
    }
}

/// Fleet ingestion server for the Queclink `@Track` (GV50-class) protocol.
#[derive(Parser, Debug)]
#[command(name = "gv50d", version, about)]
pub struct Cli {
    /// Path to a TOML config file. Omit to use built-in defaults.
    #[arg(long, env = "GV50_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override `listen_ip:listen_port`, e.g. `0.0.0.0:8000`.
    #[arg(long, env = "GV50_LISTEN")]
    pub listen: Option<String>,

    /// Override `log_level`.
    #[arg(long, env = "GV50_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run the TCP server (default when no subcommand is given).
    Serve,
    /// Load and validate configuration, print it, and exit without binding
    /// a socket. Useful for operators checking a config file before a
    /// deploy.
    CheckConfig,
}

impl Cli {
    /// Resolve the final [`Config`] from file + environment + CLI flags,
    /// in ascending precedence.
    pub fn resolve_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from_file(path)?,
            None => Config::default(),
        };
        if let Some(listen) = &self.listen {
            let addr: std::net::SocketAddr = listen.parse()?;
            config.listen_ip = addr.ip();
            config.listen_port = addr.port();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_allows_everything() {
        let config = Config::default();
        assert!(config.is_ip_allowed(&"198.51.100.9".parse().unwrap()));
    }

    #[test]
    fn nonempty_allowlist_rejects_unlisted_ip() {
        let config = Config {
            allowed_ips: vec!["203.0.113.7".to_string()],
            ..Config::default()
        };
        assert!(config.is_ip_allowed(&"203.0.113.7".parse().unwrap()));
        assert!(!config.is_ip_allowed(&"198.51.100.9".parse().unwrap()));
    }

    #[test]
    fn wildcard_entry_allows_everything() {
        let config = Config {
            allowed_ips: vec!["0.0.0.0/0".to_string()],
            ..Config::default()
        };
        assert!(config.is_ip_allowed(&"198.51.100.9".parse().unwrap()));
    }

    #[test]
    fn toml_roundtrip_matches_defaults_for_empty_file() {
        let text = toml::to_string(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
