//! Downstream connections over tonic channels

use async_trait::async_trait;
use proxy_routing::{Connection, DownstreamResponse, RequestStream, ResponseStream};
use proxy_wire::RawCodec;
use std::time::Duration;
use thiserror::Error;
use tonic::client::Grpc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};
use tracing::debug;

/// Failure to set up a downstream connection
#[derive(Error, Debug)]
pub enum ClientError {
    /// The peer address is not a valid URI
    #[error("invalid downstream address {address}: {source}")]
    Address {
        /// Address as configured
        address: String,
        /// Parse failure
        source: tonic::transport::Error,
    },

    /// Connecting to the peer failed
    #[error("failed to connect to {address}: {source}")]
    Connect {
        /// Address as configured
        address: String,
        /// Transport failure
        source: tonic::transport::Error,
    },
}

/// Connection to a downstream gRPC server.
///
/// Wraps a tonic [`Channel`], which multiplexes every call opened through it
/// over the same HTTP/2 connection and reconnects on its own.
#[derive(Debug, Clone)]
pub struct GrpcConnection {
    peer: String,
    channel: Channel,
}

impl GrpcConnection {
    /// Connection that dials `address` on first use
    pub fn lazy(address: &str, connect_timeout: Duration) -> Result<Self, ClientError> {
        let endpoint = endpoint(address, connect_timeout)?;
        Ok(Self {
            peer: address.to_string(),
            channel: endpoint.connect_lazy(),
        })
    }

    /// Connection that dials `address` now, failing if it is unreachable
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<Self, ClientError> {
        let channel = endpoint(address, connect_timeout)?
            .connect()
            .await
            .map_err(|source| ClientError::Connect {
                address: address.to_string(),
                source,
            })?;
        debug!("Connected to downstream {}", address);
        Ok(Self {
            peer: address.to_string(),
            channel,
        })
    }

    /// Wrap an existing channel
    pub fn from_channel(peer: impl Into<String>, channel: Channel) -> Self {
        Self {
            peer: peer.into(),
            channel,
        }
    }
}

fn endpoint(address: &str, connect_timeout: Duration) -> Result<Endpoint, ClientError> {
    let endpoint = Endpoint::from_shared(address.to_string()).map_err(|source| ClientError::Address {
        address: address.to_string(),
        source,
    })?;
    Ok(endpoint.connect_timeout(connect_timeout).tcp_nodelay(true))
}

#[async_trait]
impl Connection for GrpcConnection {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn open_stream(
        &self,
        method: &str,
        request: Request<RequestStream>,
    ) -> Result<DownstreamResponse, Status> {
        let path = PathAndQuery::try_from(method)
            .map_err(|e| Status::internal(format!("invalid method path {}: {}", method, e)))?;

        let mut client = Grpc::new(self.channel.clone());
        client.ready().await.map_err(|e| {
            Status::unavailable(format!("downstream {} not ready: {}", self.peer, e))
        })?;

        let response = client.streaming(request, path, RawCodec).await?;
        Ok(response.map(|stream| Box::new(stream) as Box<dyn ResponseStream>))
    }
}
