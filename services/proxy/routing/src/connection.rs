//! Downstream connection seam.
//!
//! A [`Connection`] is whatever can open a new call to a downstream peer: a
//! tonic channel in production, an in-process fake in tests. Connections are
//! owned by the component that registers them with a resolver; the proxy only
//! opens streams on them and never closes them.

use async_trait::async_trait;
use futures::stream::BoxStream;
use proxy_wire::RawMessage;
use std::fmt;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status, Streaming};

/// Messages sent from the proxy to a downstream peer. The stream ending is
/// the half-close.
pub type RequestStream = BoxStream<'static, RawMessage>;

/// Messages received from the caller of a proxied call
pub type InboundStream = BoxStream<'static, Result<RawMessage, Status>>;

/// Response side of an opened downstream call. Response headers are carried
/// by the surrounding [`Response`].
pub type DownstreamResponse = Response<Box<dyn ResponseStream>>;

/// Message and trailer source for the response half of a downstream call
#[async_trait]
pub trait ResponseStream: Send {
    /// Next message; `Ok(None)` once the peer has finished cleanly.
    ///
    /// A non-OK status from the peer is returned as `Err` carrying the peer's
    /// code, message and trailers.
    async fn message(&mut self) -> Result<Option<RawMessage>, Status>;

    /// Trailers sent by the peer, available after `message` returned `Ok(None)`
    async fn trailers(&mut self) -> Result<Option<MetadataMap>, Status>;
}

#[async_trait]
impl ResponseStream for Streaming<RawMessage> {
    async fn message(&mut self) -> Result<Option<RawMessage>, Status> {
        Streaming::message(self).await
    }

    async fn trailers(&mut self) -> Result<Option<MetadataMap>, Status> {
        Streaming::trailers(self).await
    }
}

/// Handle to a downstream peer able to open new calls
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Human readable peer identity for logs
    fn peer(&self) -> &str;

    /// Open a call for `method` (`/service/Method`).
    ///
    /// Resolves once the peer has sent its response headers. The request
    /// stream is polled concurrently, so peers that read all input before
    /// answering do not deadlock the call.
    async fn open_stream(
        &self,
        method: &str,
        request: Request<RequestStream>,
    ) -> Result<DownstreamResponse, Status>;
}
