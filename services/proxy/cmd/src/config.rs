//! Configuration handling for the proxy service.
//!
//! Settings come from a YAML file, then environment variables, then command
//! line flags (applied in `main`). A missing or unparsable file falls back to
//! defaults; values that are present but invalid are errors.

use anyhow::{bail, Context, Result};
use proxy_routing::StreamShape;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Proxy service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    /// Address the front end listens on
    pub bind_addr: SocketAddr,
    /// Timeout for dialing a downstream peer
    pub connect_timeout: Duration,
    /// Largest message accepted or sent, in bytes
    pub max_message_size: usize,
    /// Caller messages buffered ahead of a slow downstream peer
    pub request_buffer: usize,
    /// Metrics reporting interval, `None` when disabled
    pub metrics_interval: Option<Duration>,
    /// Methods always sent to one upstream
    pub fixed_routes: Vec<FixedRoute>,
    /// Methods routed by a key read from the first message
    pub keyed_routes: Vec<KeyedRoute>,
}

/// A method proxied to a single upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedRoute {
    /// Method path, `/package.Service/Method`
    pub method: String,
    /// Streaming shape of the method
    pub shape: StreamShape,
    /// Upstream URI, e.g. `http://10.0.0.5:50051`
    pub upstream: String,
}

/// A method proxied to the upstream registered under its key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedRoute {
    /// Method path, `/package.Service/Method`
    pub method: String,
    /// Streaming shape of the method
    pub shape: StreamShape,
    /// Number of the string field holding the key
    pub key_field: u32,
    /// Key -> upstream URI
    #[serde(default)]
    pub upstreams: BTreeMap<String, String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 50051)),
            connect_timeout: Duration::from_secs(5),
            max_message_size: 4 * 1024 * 1024, // 4MB
            request_buffer: 32,
            metrics_interval: Some(Duration::from_secs(30)),
            fixed_routes: Vec::new(),
            keyed_routes: Vec::new(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    proxy: Option<ServerSection>,
    routes: Option<RoutesSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    bind_addr: Option<String>,
    connect_timeout: Option<String>,
    max_message_size: Option<usize>,
    request_buffer: Option<usize>,
    metrics_interval: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RoutesSection {
    #[serde(default)]
    fixed: Vec<FixedRoute>,
    #[serde(default)]
    keyed: Vec<KeyedRoute>,
}

impl ProxyConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?} ({}), using defaults",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", config_path.as_ref()),
        }

        config.apply_environment_overrides(|key| std::env::var(key).ok())?;

        info!(
            "Final proxy configuration: bind={}, connect_timeout={:?}, fixed_routes={}, keyed_routes={}",
            config.bind_addr,
            config.connect_timeout,
            config.fixed_routes.len(),
            config.keyed_routes.len()
        );

        Ok(config)
    }

    /// Apply configuration from the root config structure
    fn apply_root_config(&mut self, root_config: RootConfig) -> Result<()> {
        if let Some(server) = root_config.proxy {
            if let Some(addr) = server.bind_addr {
                self.bind_addr = parse_addr(&addr)?;
            }
            if let Some(timeout) = server.connect_timeout {
                self.connect_timeout = parse_duration("proxy.connect_timeout", &timeout)?;
            }
            if let Some(size) = server.max_message_size {
                self.max_message_size = size;
            }
            if let Some(buffer) = server.request_buffer {
                self.request_buffer = buffer;
            }
            if let Some(interval) = server.metrics_interval {
                self.metrics_interval = match interval.as_str() {
                    "off" | "disabled" => None,
                    _ => Some(parse_duration("proxy.metrics_interval", &interval)?),
                };
            }
        }

        if let Some(routes) = root_config.routes {
            self.fixed_routes = routes.fixed;
            self.keyed_routes = routes.keyed;
        }

        Ok(())
    }

    /// Apply environment variable overrides, reading variables through `lookup`
    fn apply_environment_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("PROXY_BIND_ADDR") {
            self.bind_addr = parse_addr(&addr).context("PROXY_BIND_ADDR")?;
            info!("Bind address overridden by environment: {}", self.bind_addr);
        }

        if let Some(timeout) = lookup("PROXY_CONNECT_TIMEOUT") {
            self.connect_timeout = parse_duration("PROXY_CONNECT_TIMEOUT", &timeout)?;
            info!("Connect timeout overridden by environment: {:?}", self.connect_timeout);
        }

        Ok(())
    }

    /// Check the route set for mistakes that would only show up at call time
    pub fn validate(&self) -> Result<()> {
        let mut methods = HashSet::new();
        let all = self
            .fixed_routes
            .iter()
            .map(|r| r.method.as_str())
            .chain(self.keyed_routes.iter().map(|r| r.method.as_str()));

        for method in all {
            if !is_method_path(method) {
                bail!("invalid method path {:?}, expected /package.Service/Method", method);
            }
            if !methods.insert(method) {
                bail!("method {} is routed more than once", method);
            }
        }

        for route in &self.keyed_routes {
            if route.key_field == 0 {
                bail!("keyed route {} has key_field 0; field numbers start at 1", route.method);
            }
            if route.upstreams.is_empty() {
                warn!("Keyed route {} has no upstreams; every call will be NOT_FOUND", route.method);
            }
        }

        if self.request_buffer == 0 {
            bail!("proxy.request_buffer must be at least 1");
        }

        Ok(())
    }
}

fn is_method_path(method: &str) -> bool {
    match method.strip_prefix('/').and_then(|rest| rest.split_once('/')) {
        Some((service, name)) => !service.is_empty() && !name.is_empty() && !name.contains('/'),
        None => false,
    }
}

fn parse_addr(value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("invalid bind address {:?}", value))
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {}: {:?}", name, value))
}
