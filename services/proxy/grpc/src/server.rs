//! gRPC server implementation

use crate::metrics::{ProxyMetrics, DEFAULT_METRICS_INTERVAL};
use crate::service::ProxyService;
use proxy_routing::RoutingTable;
use proxy_stream::{PumpConfig, StreamPump, DEFAULT_REQUEST_BUFFER};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Routes;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tracing::{error, info};

/// Server failures
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Socket failure
        source: std::io::Error,
    },

    /// The transport failed while serving
    #[error("gRPC server error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// gRPC server configuration
#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Bind address
    pub bind_addr: SocketAddr,
    /// Maximum message receive size
    pub max_recv_message_size: Option<usize>,
    /// Maximum message send size
    pub max_send_message_size: Option<usize>,
    /// Maximum concurrent calls per caller connection
    pub max_concurrent_streams: Option<u32>,
    /// Caller messages buffered ahead of a slow downstream peer
    pub request_buffer: usize,
    /// Metrics reporting interval, `None` to disable reporting
    pub metrics_interval: Option<Duration>,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 50051)),
            max_recv_message_size: Some(4 * 1024 * 1024), // 4MB
            max_send_message_size: Some(4 * 1024 * 1024), // 4MB
            max_concurrent_streams: None,
            request_buffer: DEFAULT_REQUEST_BUFFER,
            metrics_interval: Some(DEFAULT_METRICS_INTERVAL),
        }
    }
}

/// Front-end server accepting calls for any method and proxying them
#[derive(Debug)]
pub struct ProxyGrpcServer {
    /// Server configuration
    config: ProxyServerConfig,
    /// Catch-all proxy service
    service: ProxyService,
}

impl ProxyGrpcServer {
    /// Create a server proxying calls through `routes`
    pub fn new(config: ProxyServerConfig, routes: Arc<RoutingTable>) -> Self {
        let pump = StreamPump::with_config(
            routes,
            PumpConfig {
                request_buffer: config.request_buffer,
            },
        );

        let mut service = ProxyService::new(pump, Arc::new(ProxyMetrics::new()));
        if let Some(limit) = config.max_recv_message_size {
            service = service.max_decoding_message_size(limit);
        }
        if let Some(limit) = config.max_send_message_size {
            service = service.max_encoding_message_size(limit);
        }

        Self { config, service }
    }

    /// Server configuration
    pub fn config(&self) -> &ProxyServerConfig {
        &self.config
    }

    /// Call counters
    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        self.service.metrics().clone()
    }

    /// The catch-all service, for mounting into another server
    pub fn service(&self) -> ProxyService {
        self.service.clone()
    }

    fn router(&self) -> Router {
        if let Some(period) = self.config.metrics_interval {
            self.metrics().start_collection_task(period);
        }

        // Every path falls through to the proxy; there are no fixed services
        let routes = Routes::from(axum::Router::new().fallback_service(self.service.clone()));

        let mut builder = Server::builder()
            .tcp_nodelay(true)
            .max_concurrent_streams(self.config.max_concurrent_streams);
        builder.add_routes(routes)
    }

    /// Serve on the configured address until `signal` completes
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.serve_with_listener(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` completes
    pub async fn serve_with_listener<F>(self, listener: TcpListener, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr().ok();
        let router = self.router();
        info!("gRPC proxy listening on {:?}", local);

        if let Err(e) = router
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await
        {
            error!("gRPC server error: {}", e);
            return Err(e.into());
        }

        info!("gRPC proxy stopped");
        Ok(())
    }
}
