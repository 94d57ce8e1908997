//! Method routing table

use crate::resolver::Resolver;
use crate::target::{StreamShape, Target};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use prost_types::ServiceDescriptorProto;
use std::sync::Arc;
use tracing::{debug, info};

/// Build the `/package.Service/Method` path of a method
pub fn method_path(package: &str, service: &str, method: &str) -> String {
    if package.is_empty() {
        format!("/{}/{}", service, method)
    } else {
        format!("/{}.{}/{}", package, service, method)
    }
}

/// Concurrent registry mapping method paths to targets.
///
/// Lookups for different methods proceed in parallel; writes to the same
/// method are serialized. Stored targets are shared, never mutated.
#[derive(Debug, Default)]
pub struct RoutingTable {
    /// Routes: method path -> target
    routes: DashMap<String, Arc<Target>>,
}

impl RoutingTable {
    /// Create an empty routing table
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    /// Target registered for `method`
    pub fn get(&self, method: &str) -> Option<Arc<Target>> {
        self.routes.get(method).map(|entry| entry.value().clone())
    }

    /// Register `target` unless `method` already has one.
    ///
    /// Returns `false`, leaving the existing target in place, when the method
    /// is already registered. Whether that is an error is up to the caller.
    pub fn add(&self, method: impl Into<String>, target: Target) -> bool {
        match self.routes.entry(method.into()) {
            Entry::Occupied(entry) => {
                debug!("Route for {} already registered", entry.key());
                false
            }
            Entry::Vacant(entry) => {
                debug!("Adding {} route for {}", target.shape(), entry.key());
                entry.insert(Arc::new(target));
                true
            }
        }
    }

    /// Register or replace the target for `method`
    pub fn set(&self, method: impl Into<String>, target: Target) {
        let method = method.into();
        debug!("Setting {} route for {}", target.shape(), method);
        self.routes.insert(method, Arc::new(target));
    }

    /// Remove the target for `method`, returning whether one existed
    pub fn delete(&self, method: &str) -> bool {
        let existed = self.routes.remove(method).is_some();
        if existed {
            debug!("Removed route for {}", method);
        }
        existed
    }

    /// Register every method of a service descriptor with `resolver`.
    ///
    /// Each method gets the shape declared by its descriptor. Methods that
    /// already have a route are left alone. Returns how many were added.
    pub fn add_service(
        &self,
        package: &str,
        service: &ServiceDescriptorProto,
        resolver: Arc<dyn Resolver>,
    ) -> usize {
        let mut added = 0;

        for method in &service.method {
            let path = method_path(package, service.name(), method.name());
            let shape = StreamShape::new(method.client_streaming(), method.server_streaming());
            if self.add(path, Target::new(shape, resolver.clone())) {
                added += 1;
            }
        }

        info!(
            "Registered {} of {} methods for service {}",
            added,
            service.method.len(),
            service.name()
        );
        added
    }

    /// All registered method paths, sorted
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .routes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        methods.sort();
        methods
    }

    /// Number of registered methods
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no method is registered
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
