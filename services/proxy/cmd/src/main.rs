//! BMS gateway proxy binary.
//!
//! Accepts gRPC calls for any method and forwards each one, streaming in both
//! directions, to the downstream service its route selects.

use clap::Parser;
use proxy_grpc::{ProxyGrpcServer, ProxyServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod routes;

use config::ProxyConfig;
use logging::ProxyLogFormatter;

// Component logging macros are defined in logging.rs and available via #[macro_export]

/// Streaming gRPC reverse proxy
#[derive(Parser, Debug)]
#[command(name = "bms-proxy", version, about = "Streaming gRPC reverse proxy")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "proxy.yaml")]
    config: PathBuf,

    /// Listen address, e.g. 0.0.0.0:50051; overrides the config file
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Downstream connect timeout, e.g. 5s; overrides the config file
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("bms_proxy={}", args.log_level).parse()?)
        .add_directive(format!("proxy_wire={}", args.log_level).parse()?)
        .add_directive(format!("proxy_routing={}", args.log_level).parse()?)
        .add_directive(format!("proxy_stream={}", args.log_level).parse()?)
        .add_directive(format!("proxy_grpc={}", args.log_level).parse()?);

    let formatter = ProxyLogFormatter::new("bms-proxy");

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    info!("Starting BMS proxy v{}", env!("CARGO_PKG_VERSION"));

    let mut proxy_config = ProxyConfig::load_from_file(&args.config)?;
    if let Some(bind) = args.bind {
        proxy_config.bind_addr = bind;
    }
    if let Some(timeout) = args.connect_timeout {
        proxy_config.connect_timeout = timeout.into();
    }
    proxy_config.validate()?;

    let routes = Arc::new(routes::build_routes(&proxy_config)?);
    if routes.is_empty() {
        component_warn!("routing", "No routes configured; every call will be UNIMPLEMENTED");
    }
    for method in routes.methods() {
        component_info!("routing", "Proxying {}", method);
    }

    let server_config = ProxyServerConfig {
        bind_addr: proxy_config.bind_addr,
        max_recv_message_size: Some(proxy_config.max_message_size),
        max_send_message_size: Some(proxy_config.max_message_size),
        request_buffer: proxy_config.request_buffer,
        metrics_interval: proxy_config.metrics_interval,
        ..Default::default()
    };

    component_info!("server", "Listening on {}", server_config.bind_addr);
    ProxyGrpcServer::new(server_config, routes)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("BMS proxy shut down");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
