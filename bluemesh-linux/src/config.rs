//! Load config from file, environment and command line.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bluemesh_core::RouterConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/bluemesh/config.toml or /etc/bluemesh/config.toml.
/// Env overrides: BLUEMESH_NAME, BLUEMESH_LISTEN, BLUEMESH_HISTORY_LEN, BLUEMESH_INBOX_CAPACITY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Identity sent to peers in the hello unit (default: hostname or "bluemesh").
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// TCP listen address (default 0.0.0.0:45700).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Peers dialled at startup and re-dialled after disconnect.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    /// How often the application loop drains delivered messages (default 100 ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delay between dial attempts (default 2000 ms).
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,
    #[serde(default)]
    pub router: RouterConfig,
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "bluemesh".to_owned())
}
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 45700))
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_connect_retry_ms() -> u64 {
    2000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            listen_addr: default_listen_addr(),
            peers: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
            connect_retry_ms: default_connect_retry_ms(),
            router: RouterConfig::default(),
        }
    }
}

/// Command-line overrides, applied last.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub node_name: Option<String>,
    pub listen_addr: Option<SocketAddr>,
    pub peers: Vec<SocketAddr>,
}

/// Load config: defaults, then config file (if present), then env vars, then CLI.
pub fn load(overrides: &Overrides) -> Result<Config> {
    let mut c = match find_file(overrides.config_path.as_deref()) {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    if let Some(name) = &overrides.node_name {
        c.node_name = name.clone();
    }
    if let Some(addr) = overrides.listen_addr {
        c.listen_addr = addr;
    }
    for p in &overrides.peers {
        if !c.peers.contains(p) {
            c.peers.push(*p);
        }
    }
    c.router
        .validate()
        .context("invalid [router] configuration")?;
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("BLUEMESH_NAME") {
        if !s.is_empty() {
            c.node_name = s;
        }
    }
    if let Some(s) = var("BLUEMESH_LISTEN") {
        if let Ok(a) = s.parse::<SocketAddr>() {
            c.listen_addr = a;
        }
    }
    if let Some(s) = var("BLUEMESH_HISTORY_LEN") {
        if let Ok(n) = s.parse::<usize>() {
            c.router.history_len = n;
        }
    }
    if let Some(s) = var("BLUEMESH_INBOX_CAPACITY") {
        if let Ok(n) = s.parse::<usize>() {
            c.router.inbox_capacity = n;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/bluemesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/bluemesh/config.toml"));
    out
}

/// An explicit path is used as given; otherwise the first existing default path.
fn find_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    config_paths().into_iter().find(|p| p.exists())
}

fn load_file(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse(&s).with_context(|| format!("parsing {}", path.display()))
}

fn parse(s: &str) -> Result<Config> {
    Ok(toml::from_str::<Config>(s)?)
}
