//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/sidecall/config.toml or
/// /etc/sidecall/config.toml. Env overrides: SIDECALL_DISCOVERY_PORT,
/// SIDECALL_TRANSPORT_PORT, SIDECALL_DEVICE_NAME, SIDECALL_USERNAME,
/// SIDECALL_PIN.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 47201).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transport TCP port (default 47202).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Display name advertised to the peer; defaults to the hostname.
    #[serde(default)]
    pub device_name: Option<String>,
    /// Pairing username; the channel id is derived from username + pin.
    #[serde(default)]
    pub username: Option<String>,
    /// Pairing PIN.
    #[serde(default)]
    pub pin: Option<String>,
}

fn default_discovery_port() -> u16 {
    47201
}
fn default_transport_port() -> u16 {
    47202
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            device_name: None,
            username: None,
            pin: None,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("SIDECALL_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("SIDECALL_TRANSPORT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transport_port = p;
        }
    }
    if let Ok(s) = std::env::var("SIDECALL_DEVICE_NAME") {
        c.device_name = Some(s);
    }
    if let Ok(s) = std::env::var("SIDECALL_USERNAME") {
        c.username = Some(s);
    }
    if let Ok(s) = std::env::var("SIDECALL_PIN") {
        c.pin = Some(s);
    }
    c
}

/// Resolve the display name advertised to the peer. Preference order: the
/// configured name, the hostname, a generic device string. Resolved at each
/// start so a rename takes effect without a restart.
pub fn resolve_device_name(config: &Config) -> String {
    if let Some(name) = &config.device_name {
        if !name.trim().is_empty() {
            return name.clone();
        }
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "SideCall Device".to_string())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/sidecall/config.toml"));
    }
    out.push(PathBuf::from("/etc/sidecall/config.toml"));
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
