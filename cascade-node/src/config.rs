//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/cascade/config.toml or
/// /etc/cascade/config.toml.
/// Env overrides: CASCADE_ADDR, CASCADE_PORT, CASCADE_SUBNET, CASCADE_BOOTSTRAP.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address to bind the TCP listener to (default 0.0.0.0).
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Port to bind to (default 44565).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Overlay subnet name (default "mesh"). Nodes on other subnets are
    /// rejected at handshake.
    #[serde(default = "default_subnet")]
    pub subnet: String,
    /// Outward-facing address to advertise, if different from the bind
    /// address (port forwarding).
    #[serde(default)]
    pub out_addr: Option<String>,
    /// Peers to dial at startup, as host:port strings.
    #[serde(default)]
    pub bootstrap: Vec<String>,
}

fn default_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    44565
}
fn default_subnet() -> String {
    "mesh".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: default_port(),
            subnet: default_subnet(),
            out_addr: None,
            bootstrap: Vec::new(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("CASCADE_ADDR") {
        c.addr = s;
    }
    if let Ok(s) = std::env::var("CASCADE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Ok(s) = std::env::var("CASCADE_SUBNET") {
        c.subnet = s;
    }
    if let Ok(s) = std::env::var("CASCADE_BOOTSTRAP") {
        c.bootstrap = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/cascade/config.toml"));
    }
    out.push(PathBuf::from("/etc/cascade/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.addr, "0.0.0.0");
        assert_eq!(c.port, 44565);
        assert_eq!(c.subnet, "mesh");
        assert!(c.bootstrap.is_empty());
    }

    #[test]
    fn parse_full_file() {
        let c: Config = toml::from_str(
            r#"
            addr = "192.168.1.10"
            port = 5000
            subnet = "lab"
            out_addr = "203.0.113.7:5000"
            bootstrap = ["192.168.1.11:5000", "192.168.1.12:5000"]
            "#,
        )
        .unwrap();
        assert_eq!(c.addr, "192.168.1.10");
        assert_eq!(c.port, 5000);
        assert_eq!(c.subnet, "lab");
        assert_eq!(c.out_addr.as_deref(), Some("203.0.113.7:5000"));
        assert_eq!(c.bootstrap.len(), 2);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("nonsense = true").is_err());
    }
}
