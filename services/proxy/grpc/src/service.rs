//! Catch-all gRPC service that hands every call to the stream pump

use crate::metrics::ProxyMetrics;
use futures::StreamExt;
use proxy_stream::{InboundCall, OutboundStream, StreamPump};
use proxy_wire::{RawCodec, RawMessage};
use std::convert::Infallible;
use std::sync::Arc;
use tonic::body::BoxBody;
use tonic::codegen::{http, Body, BoxFuture, Context, Poll, Service, StdError};
use tonic::server::{Grpc, StreamingService};
use tonic::{Request, Response, Status, Streaming};

/// Accepts calls for any method path and proxies them.
///
/// Every method is served as a bidirectional stream of raw messages; the
/// routing table decides where it goes and what shape it must have.
#[derive(Debug, Clone)]
pub struct ProxyService {
    pump: StreamPump,
    metrics: Arc<ProxyMetrics>,
    max_decoding_message_size: Option<usize>,
    max_encoding_message_size: Option<usize>,
}

impl ProxyService {
    /// Create a service proxying through `pump`
    pub fn new(pump: StreamPump, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            pump,
            metrics,
            max_decoding_message_size: None,
            max_encoding_message_size: None,
        }
    }

    /// Limit the size of a single caller message
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.max_decoding_message_size = Some(limit);
        self
    }

    /// Limit the size of a single message sent to the caller
    pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
        self.max_encoding_message_size = Some(limit);
        self
    }

    /// Call counters
    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }
}

impl<B> Service<http::Request<B>> for ProxyService
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let call = ProxyCall {
            method: req.uri().path().to_string(),
            pump: self.pump.clone(),
            metrics: self.metrics.clone(),
        };
        let decoding = self.max_decoding_message_size;
        let encoding = self.max_encoding_message_size;

        Box::pin(async move {
            let mut grpc = Grpc::new(RawCodec).apply_max_message_size_config(decoding, encoding);
            Ok(grpc.streaming(call, req).await)
        })
    }
}

/// One accepted call on its way into the pump
struct ProxyCall {
    method: String,
    pump: StreamPump,
    metrics: Arc<ProxyMetrics>,
}

impl StreamingService<RawMessage> for ProxyCall {
    type Response = RawMessage;
    type ResponseStream = OutboundStream;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<RawMessage>>) -> Self::Future {
        let call = InboundCall::from_request(self.method.clone(), request);
        let pump = self.pump.clone();
        let metrics = self.metrics.clone();

        Box::pin(async move { proxy_counted(&pump, &metrics, call).await })
    }
}

/// Proxy `call`, counting its outcome once the final status is known or the
/// call is dropped
async fn proxy_counted(
    pump: &StreamPump,
    metrics: &Arc<ProxyMetrics>,
    call: InboundCall,
) -> Result<Response<OutboundStream>, Status> {
    let mut record = metrics.track();
    match pump.proxy(call).await {
        Ok(response) => Ok(response.map(|stream| {
            stream
                .map(move |item| {
                    if let Err(status) = &item {
                        record.finish(status.code());
                    }
                    item
                })
                .boxed()
        })),
        Err(status) => {
            record.finish(status.code());
            Err(status)
        }
    }
}
