//! Builds the routing table from the configured routes

use crate::config::ProxyConfig;
use anyhow::{bail, Context, Result};
use proxy_grpc::GrpcConnection;
use proxy_routing::{field_key, Connection, FixedResolver, KeyResolver, RoutingTable, Target};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Upstream connections by URI, one channel per upstream
struct Upstreams {
    connect_timeout: Duration,
    connections: HashMap<String, Arc<dyn Connection>>,
}

impl Upstreams {
    fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            connections: HashMap::new(),
        }
    }

    fn get(&mut self, uri: &str) -> Result<Arc<dyn Connection>> {
        if let Some(connection) = self.connections.get(uri) {
            return Ok(connection.clone());
        }

        let connection: Arc<dyn Connection> = Arc::new(
            GrpcConnection::lazy(uri, self.connect_timeout)
                .with_context(|| format!("upstream {}", uri))?,
        );
        debug!("Created upstream channel for {}", uri);
        self.connections.insert(uri.to_string(), connection.clone());
        Ok(connection)
    }

    fn len(&self) -> usize {
        self.connections.len()
    }
}

/// Build a routing table for every configured route.
///
/// Routes sharing an upstream URI share its channel. Must be called inside a
/// tokio runtime since channels spawn their connection workers.
pub fn build_routes(config: &ProxyConfig) -> Result<RoutingTable> {
    let table = RoutingTable::new();
    let mut upstreams = Upstreams::new(config.connect_timeout);

    for route in &config.fixed_routes {
        let resolver = Arc::new(FixedResolver::new(upstreams.get(&route.upstream)?));
        if !table.add(route.method.clone(), Target::new(route.shape, resolver)) {
            bail!("method {} is routed more than once", route.method);
        }
        debug!("Route {} ({}) -> {}", route.method, route.shape, route.upstream);
    }

    for route in &config.keyed_routes {
        let resolver = Arc::new(KeyResolver::new(field_key(route.key_field)));
        for (key, uri) in &route.upstreams {
            resolver.set(key.clone(), upstreams.get(uri)?);
        }
        if !table.add(route.method.clone(), Target::new(route.shape, resolver)) {
            bail!("method {} is routed more than once", route.method);
        }
        debug!(
            "Route {} ({}) keyed on field {} across {} keys",
            route.method,
            route.shape,
            route.key_field,
            route.upstreams.len()
        );
    }

    debug!("Built {} routes over {} upstreams", table.len(), upstreams.len());
    Ok(table)
}
