//! Bidirectional stream pump.
//!
//! Every proxied call runs two loops:
//!
//! ```text
//!  caller ──messages──► downstream-bound loop ──► resolve ──► open ──► peer
//!                               │                                      │
//!                          one-shot handle                             │
//!                               ▼                                      │
//!  caller ◄──headers, messages, trailers── caller-facing loop ◄────────┘
//! ```
//!
//! The downstream-bound loop runs as its own task. It resolves the target,
//! forwards the first message captured during resolution, then relays the
//! rest of the caller's messages. The caller-facing loop waits on the handle,
//! forwards the peer's headers and messages, and ends with the peer's status
//! and trailers. Either loop failing ends the call, and the caller going away
//! cancels both.

use crate::handle::{one_shot, Resolve};
use crate::metadata;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use proxy_routing::{
    DownstreamResponse, InboundStream, MessageSource, RequestStream, ResponseStream, RoutingTable,
    StreamShape, Target,
};
use proxy_wire::RawMessage;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::metadata::MetadataMap;
use tonic::{Code, Extensions, Request, Response, Status};
use tracing::{debug, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Caller messages buffered ahead of a slow downstream peer
pub const DEFAULT_REQUEST_BUFFER: usize = 32;

/// Response side of a proxied call as seen by the caller.
///
/// Yields the peer's messages in order and always ends with exactly one
/// `Err(Status)` carrying the final status and trailers of the call, with
/// code [`Code::Ok`] when the call succeeded.
pub type OutboundStream = BoxStream<'static, Result<RawMessage, Status>>;

/// Pump tuning
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Caller messages buffered ahead of the downstream peer
    pub request_buffer: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            request_buffer: DEFAULT_REQUEST_BUFFER,
        }
    }
}

/// An accepted call waiting to be proxied
pub struct InboundCall {
    method: String,
    metadata: MetadataMap,
    extensions: Extensions,
    messages: InboundStream,
}

impl InboundCall {
    /// Create a call for `method` with no metadata
    pub fn new(method: impl Into<String>, messages: InboundStream) -> Self {
        Self {
            method: method.into(),
            metadata: MetadataMap::new(),
            extensions: Extensions::new(),
            messages,
        }
    }

    /// Create a call from an accepted request
    pub fn from_request<S>(method: impl Into<String>, request: Request<S>) -> Self
    where
        S: Stream<Item = Result<RawMessage, Status>> + Send + 'static,
    {
        let (metadata, extensions, messages) = request.into_parts();
        Self {
            method: method.into(),
            metadata,
            extensions,
            messages: messages.boxed(),
        }
    }

    /// Replace the call's metadata
    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Method path being called
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Metadata sent by the caller
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }
}

impl fmt::Debug for InboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundCall")
            .field("method", &self.method)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Proxies calls to the targets registered in a routing table
#[derive(Debug, Clone)]
pub struct StreamPump {
    routes: Arc<RoutingTable>,
    config: PumpConfig,
}

impl StreamPump {
    /// Create a pump over `routes` with default tuning
    pub fn new(routes: Arc<RoutingTable>) -> Self {
        Self::with_config(routes, PumpConfig::default())
    }

    /// Create a pump over `routes`
    pub fn with_config(routes: Arc<RoutingTable>, config: PumpConfig) -> Self {
        Self { routes, config }
    }

    /// Routing table consulted for every call
    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    /// Proxy one call.
    ///
    /// Returns once the downstream peer has sent its response headers, with
    /// those headers and the stream of its responses. Calls to unknown methods
    /// fail with `UNIMPLEMENTED` before any resolver runs; resolution failures
    /// come back as the resolver reported them, and no downstream call is
    /// opened for them.
    ///
    /// Dropping the returned future or stream cancels the call in both
    /// directions.
    pub async fn proxy(&self, call: InboundCall) -> Result<Response<OutboundStream>, Status> {
        let Some(target) = self.routes.get(&call.method) else {
            debug!("No route for {}", call.method);
            return Err(Status::unimplemented(format!(
                "unknown method {}",
                call.method
            )));
        };

        let span = info_span!("call", method = %call.method, id = %Uuid::new_v4());
        self.start(target, call, span.clone()).instrument(span).await
    }

    async fn start(
        &self,
        target: Arc<Target>,
        call: InboundCall,
        span: Span,
    ) -> Result<Response<OutboundStream>, Status> {
        let InboundCall {
            method,
            metadata: caller_metadata,
            extensions,
            messages,
        } = call;
        let shape = target.shape();
        let deadline = metadata::timeout(&caller_metadata).map(|timeout| Instant::now() + timeout);

        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let (resolve, pending) = one_shot();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        debug!("Proxying {} call", shape);
        let forward = DownstreamBound {
            method,
            target,
            metadata: metadata::request_metadata(caller_metadata),
            extensions,
            inbound: messages,
            deadline,
            cancel: cancel.clone(),
            buffer: self.config.request_buffer.max(1),
        };
        tokio::spawn(forward.run(resolve, outcome_tx).instrument(span.clone()));

        let mut watch = CallWatch {
            cancel: cancel.clone(),
            deadline,
            outcome: Some(outcome_rx),
        };
        let downstream = watch.run(pending.wait(&cancel)).await?;
        let peer = downstream.peer;
        let response = watch.run(downstream.opened).await?;
        debug!("Downstream {} accepted the call", peer);

        let (headers, messages, _) = response.into_parts();
        let outbound = CallerFacing {
            messages,
            watch,
            shape,
            peer,
            received: 0,
            finished: false,
            span,
            _guard: guard,
        };
        let stream = stream::unfold(outbound, |mut outbound| {
            let span = outbound.span.clone();
            async move {
                if outbound.finished {
                    return None;
                }
                let item = outbound.next_item().await;
                Some((item, outbound))
            }
            .instrument(span)
        })
        .boxed();

        Ok(Response::from_parts(
            metadata::response_metadata(headers),
            stream,
            Extensions::new(),
        ))
    }
}

/// Downstream peer as published through the one-shot handle
struct Downstream {
    peer: String,
    opened: BoxFuture<'static, Result<DownstreamResponse, Status>>,
}

/// Caller-to-peer half of a call
struct DownstreamBound {
    method: String,
    target: Arc<Target>,
    metadata: MetadataMap,
    extensions: Extensions,
    inbound: InboundStream,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    buffer: usize,
}

impl DownstreamBound {
    async fn run(self, resolve: Resolve<Downstream>, outcome: oneshot::Sender<Result<(), Status>>) {
        let cancel = self.cancel.clone();
        let failed = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.buffer);
        let requests = ReceiverStream::new(rx)
            .chain(hold_if_failed(failed.clone()))
            .boxed();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Status::cancelled("call cancelled")),
            result = self.forward(resolve, &tx, requests) => result,
        };
        if let Err(status) = &result {
            debug!("Request forwarding ended with {:?}: {}", status.code(), status.message());
            // Must be set before the channel closes
            failed.cancel();
        }

        let _ = outcome.send(result);
        drop(tx);
    }

    async fn forward(
        self,
        resolve: Resolve<Downstream>,
        tx: &mpsc::Sender<RawMessage>,
        requests: RequestStream,
    ) -> Result<(), Status> {
        let DownstreamBound {
            method,
            target,
            metadata: mut headers,
            extensions,
            mut inbound,
            deadline,
            ..
        } = self;
        let shape = target.shape();

        let mut source = MessageSource::new(&mut inbound);
        let connection = match target.resolver().resolve(&mut source).await {
            Ok(connection) => connection,
            Err(err) => {
                let status = Status::from(err);
                debug!("Resolution failed: {}", status.message());
                resolve.abandon(status.clone());
                return Err(status);
            }
        };
        let first = source.into_captured();

        if let Some(deadline) = deadline {
            metadata::set_timeout(&mut headers, deadline.saturating_duration_since(Instant::now()));
        }

        let peer = connection.peer().to_string();
        let request = Request::from_parts(headers, extensions, requests);
        let path = method.clone();
        let opened = async move { connection.open_stream(&path, request).await }.boxed();
        resolve.resolve(Downstream {
            peer: peer.clone(),
            opened,
        });
        debug!("Resolved {} to {}", method, peer);

        let mut sent = 0usize;
        if let Some(first) = first {
            if tx.send(first).await.is_err() {
                debug!("Downstream {} stopped reading requests", peer);
                return Ok(());
            }
            sent += 1;
        }

        while let Some(message) = inbound.next().await {
            let message = message?;
            if !shape.client_streaming() && sent > 0 {
                warn!("Caller sent a second request message on a {} call", shape);
                return Err(Status::internal(format!(
                    "protocol violation: {} call carried more than one request message",
                    shape
                )));
            }
            if tx.send(message).await.is_err() {
                debug!("Downstream {} stopped reading requests", peer);
                return Ok(());
            }
            sent += 1;
        }

        if !shape.client_streaming() && sent == 0 {
            warn!("Caller half-closed a {} call without a request message", shape);
            return Err(Status::internal(format!(
                "protocol violation: {} call carried no request message",
                shape
            )));
        }

        debug!("Caller half-closed after {} messages", sent);
        Ok(())
    }
}

/// Tail of the request stream sent downstream.
///
/// Ends at once when the caller's messages ended cleanly. After a failure it
/// never ends, so the peer sees the call reset when it is torn down instead
/// of a half-close.
fn hold_if_failed(failed: CancellationToken) -> impl Stream<Item = RawMessage> + Send {
    stream::once(async move {
        if failed.is_cancelled() {
            std::future::pending::<()>().await;
        }
    })
    .filter_map(|()| async { None::<RawMessage> })
}

/// Peer-to-caller half of a call
struct CallerFacing {
    messages: Box<dyn ResponseStream>,
    watch: CallWatch,
    shape: StreamShape,
    peer: String,
    received: usize,
    finished: bool,
    span: Span,
    _guard: DropGuard,
}

impl CallerFacing {
    async fn next_item(&mut self) -> Result<RawMessage, Status> {
        match self.watch.run(self.messages.message()).await {
            Ok(Some(message)) => {
                self.received += 1;
                if !self.shape.server_streaming() && self.received > 1 {
                    warn!("Downstream {} sent a second response on a {} call", self.peer, self.shape);
                    return Err(self.finish(Status::internal(format!(
                        "protocol violation: {} call carried more than one response message",
                        self.shape
                    ))));
                }
                Ok(message)
            }
            Ok(None) => {
                let trailers = match self.watch.run(self.messages.trailers()).await {
                    Ok(trailers) => trailers.unwrap_or_default(),
                    Err(status) => return Err(self.finish(status)),
                };
                if !self.shape.server_streaming() && self.received == 0 {
                    warn!("Downstream {} finished a {} call without a response", self.peer, self.shape);
                    return Err(self.finish(Status::internal(format!(
                        "protocol violation: {} call carried no response message",
                        self.shape
                    ))));
                }
                debug!("Downstream {} finished after {} messages", self.peer, self.received);
                Err(self.finish(Status::with_metadata(Code::Ok, "", trailers)))
            }
            Err(status) => {
                debug!("Downstream {} failed with {:?}", self.peer, status.code());
                Err(self.finish(downstream_status(status)))
            }
        }
    }

    /// Mark the call complete and stop the downstream-bound loop
    fn finish(&mut self, status: Status) -> Status {
        self.finished = true;
        self.watch.cancel.cancel();
        status
    }
}

/// Statuses produced locally by the transport rather than sent by the peer
/// are reported as internal errors
fn downstream_status(status: Status) -> Status {
    if status.code() == Code::Unknown && std::error::Error::source(&status).is_some() {
        Status::internal(format!("downstream transport failure: {}", status.message()))
    } else {
        status
    }
}

/// Races the caller-facing loop's work against cancellation, the deadline
/// and failure of the downstream-bound loop
struct CallWatch {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    outcome: Option<oneshot::Receiver<Result<(), Status>>>,
}

impl CallWatch {
    async fn run<T>(&mut self, work: impl Future<Output = Result<T, Status>>) -> Result<T, Status> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Status::cancelled("call cancelled")),
                _ = expire(self.deadline) => {
                    return Err(Status::deadline_exceeded("deadline exceeded while proxying"));
                }
                outcome = settle(&mut self.outcome) => {
                    if let Err(status) = outcome {
                        return Err(status);
                    }
                }
                result = &mut work => return result,
            }
        }
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Wait for the downstream-bound loop to finish; pends forever once it has
/// finished cleanly
async fn settle(outcome: &mut Option<oneshot::Receiver<Result<(), Status>>>) -> Result<(), Status> {
    let Some(receiver) = outcome.as_mut() else {
        return std::future::pending().await;
    };
    let result = match receiver.await {
        Ok(result) => result,
        Err(_) => Err(Status::internal("request forwarding stopped without an outcome")),
    };
    *outcome = None;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{DescriptorProto, FieldDescriptorProto};
    use proxy_routing::{
        field_key, name_key, Connection, FixedResolver, KeyResolver, RequestStream, Resolver,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Debug, Clone)]
    enum Mode {
        /// Echo every request, finish after the caller half-closes
        Echo,
        /// Answer with the number of requests after the caller half-closes
        Count,
        /// Fail with the given status on the first request
        Fail(Code, &'static str),
        /// Answer twice after the caller half-closes
        Twice,
        /// Never answer
        Hang,
    }

    #[derive(Debug)]
    struct FakePeer {
        name: &'static str,
        mode: Mode,
        opened: AtomicUsize,
        seen: Mutex<Option<MetadataMap>>,
        /// Notified when the request stream ends cleanly
        half_closed: Arc<Notify>,
        /// Notified when the proxy drops the response stream
        aborted: Arc<Notify>,
    }

    impl FakePeer {
        fn new(name: &'static str, mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                name,
                mode,
                opened: AtomicUsize::new(0),
                seen: Mutex::new(None),
                half_closed: Arc::new(Notify::new()),
                aborted: Arc::new(Notify::new()),
            })
        }

        fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        fn seen_header(&self, key: &'static str) -> Option<String> {
            let seen = self.seen.lock().unwrap();
            let value = seen.as_ref()?.get(key)?.to_str().unwrap().to_string();
            Some(value)
        }
    }

    struct FakeResponse {
        rx: mpsc::Receiver<Result<RawMessage, Status>>,
        trailers: Option<MetadataMap>,
    }

    #[async_trait]
    impl ResponseStream for FakeResponse {
        async fn message(&mut self) -> Result<Option<RawMessage>, Status> {
            match self.rx.recv().await {
                Some(Ok(message)) => Ok(Some(message)),
                Some(Err(status)) => Err(status),
                None => Ok(None),
            }
        }

        async fn trailers(&mut self) -> Result<Option<MetadataMap>, Status> {
            Ok(self.trailers.take())
        }
    }

    /// Request loop of a fake peer
    async fn serve(
        mode: Mode,
        requests: &mut RequestStream,
        tx: &mpsc::Sender<Result<RawMessage, Status>>,
        half_closed: Arc<Notify>,
    ) {
        let mut count = 0usize;
        while let Some(message) = requests.next().await {
            count += 1;
            match &mode {
                Mode::Echo => {
                    if tx.send(Ok(message)).await.is_err() {
                        return;
                    }
                }
                Mode::Fail(code, text) => {
                    let _ = tx.send(Err(Status::new(*code, *text))).await;
                    return;
                }
                _ => {}
            }
        }
        half_closed.notify_one();

        match mode {
            Mode::Count => {
                let _ = tx.send(Ok(RawMessage::new(count.to_string().into_bytes()))).await;
            }
            Mode::Twice => {
                for _ in 0..2 {
                    let _ = tx.send(Ok(RawMessage::new(b"reply".to_vec()))).await;
                }
            }
            Mode::Hang => std::future::pending::<()>().await,
            _ => {}
        }
    }

    #[async_trait]
    impl Connection for FakePeer {
        fn peer(&self) -> &str {
            self.name
        }

        async fn open_stream(
            &self,
            _method: &str,
            request: Request<RequestStream>,
        ) -> Result<DownstreamResponse, Status> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (metadata, _, mut requests) = request.into_parts();
            *self.seen.lock().unwrap() = Some(metadata);

            let (tx, rx) = mpsc::channel(64);
            let mode = self.mode.clone();
            let half_closed = self.half_closed.clone();
            let aborted = self.aborted.clone();
            tokio::spawn(async move {
                let work = serve(mode, &mut requests, &tx, half_closed);
                tokio::select! {
                    _ = tx.closed() => aborted.notify_one(),
                    _ = work => {}
                }
            });

            let mut trailers = MetadataMap::new();
            trailers.insert("x-peer", self.name.parse().unwrap());
            let stream: Box<dyn ResponseStream> = Box::new(FakeResponse {
                rx,
                trailers: Some(trailers),
            });
            let mut response = Response::new(stream);
            response
                .metadata_mut()
                .insert("x-served-by", self.name.parse().unwrap());
            Ok(response)
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Command {
        #[prost(string, tag = "1")]
        name: String,
        #[prost(bytes = "vec", tag = "2")]
        payload: Vec<u8>,
    }

    fn command(name: &str, payload: &[u8]) -> RawMessage {
        RawMessage::from_message(&Command {
            name: name.to_string(),
            payload: payload.to_vec(),
        })
    }

    fn caller() -> (mpsc::Sender<Result<RawMessage, Status>>, InboundStream) {
        let (tx, rx) = mpsc::channel(256);
        (tx, ReceiverStream::new(rx).boxed())
    }

    const METHOD: &str = "/bms.v1.Plant/Control";

    fn pump(shape: StreamShape, resolver: Arc<dyn Resolver>) -> StreamPump {
        let routes = Arc::new(RoutingTable::new());
        routes.set(METHOD, Target::new(shape, resolver));
        StreamPump::new(routes)
    }

    fn fixed(peer: &Arc<FakePeer>) -> Arc<dyn Resolver> {
        Arc::new(FixedResolver::new(peer.clone()))
    }

    /// Collect the responses of a call and its final status, whether the call
    /// failed before or after the response headers
    async fn outcome(
        result: Result<Response<OutboundStream>, Status>,
    ) -> (Vec<RawMessage>, Status) {
        let mut stream = match result {
            Ok(response) => response.into_inner(),
            Err(status) => return (Vec::new(), status),
        };
        let mut messages = Vec::new();
        loop {
            match stream.next().await {
                Some(Ok(message)) => messages.push(message),
                Some(Err(status)) => {
                    assert!(stream.next().await.is_none());
                    return (messages, status);
                }
                None => panic!("stream ended without a final status"),
            }
        }
    }

    #[tokio::test]
    async fn test_echo_forwards_headers_messages_and_trailers() {
        let peer = FakePeer::new("echo", Mode::Echo);
        let pump = pump(StreamShape::BidiStreaming, fixed(&peer));

        let (tx, inbound) = caller();
        let mut headers = MetadataMap::new();
        headers.insert("x-site", "plant-3".parse().unwrap());
        headers.insert("te", "trailers".parse().unwrap());
        let call = InboundCall::new(METHOD, inbound).with_metadata(headers);

        let sent = vec![command("a", b"1"), command("b", b""), command("c", &[0u8; 300])];
        for message in &sent {
            tx.send(Ok(message.clone())).await.unwrap();
        }
        drop(tx);

        let response = pump.proxy(call).await.unwrap();
        assert_eq!(
            response.metadata().get("x-served-by").unwrap().to_str().unwrap(),
            "echo"
        );

        let (received, status) = outcome(Ok(response)).await;
        assert_eq!(received, sent);
        assert_eq!(status.code(), Code::Ok);
        assert_eq!(status.metadata().get("x-peer").unwrap().to_str().unwrap(), "echo");

        assert_eq!(peer.opened(), 1);
        assert_eq!(peer.seen_header("x-site").as_deref(), Some("plant-3"));
        assert_eq!(peer.seen_header("te"), None);
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let peer = FakePeer::new("echo", Mode::Echo);
        let pump = pump(StreamShape::BidiStreaming, fixed(&peer));

        let (_tx, inbound) = caller();
        let status = pump
            .proxy(InboundCall::new("/bms.v1.Plant/Missing", inbound))
            .await
            .err()
            .unwrap();
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(peer.opened(), 0);
    }

    #[tokio::test]
    async fn test_key_resolver_picks_peer_per_call() {
        let a = FakePeer::new("tenant-a", Mode::Echo);
        let b = FakePeer::new("tenant-b", Mode::Echo);
        let resolver = Arc::new(KeyResolver::new(field_key(1)));
        resolver.set("A", a.clone());
        resolver.set("B", b.clone());
        let pump = pump(StreamShape::BidiStreaming, resolver);

        let (tx, inbound) = caller();
        tx.send(Ok(command("B", b"first"))).await.unwrap();
        tx.send(Ok(command("A", b"second"))).await.unwrap();
        drop(tx);

        let (received, status) = outcome(pump.proxy(InboundCall::new(METHOD, inbound)).await).await;
        assert_eq!(status.code(), Code::Ok);
        assert_eq!(status.metadata().get("x-peer").unwrap().to_str().unwrap(), "tenant-b");
        // Only the first message picks the peer; the whole call goes there
        assert_eq!(received, vec![command("B", b"first"), command("A", b"second")]);
        assert_eq!(a.opened(), 0);
        assert_eq!(b.opened(), 1);
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Echo {
        #[prost(string, tag = "1")]
        name: String,
        #[prost(string, tag = "2")]
        data: String,
    }

    #[tokio::test]
    async fn test_schema_name_key_routes_echo_call() {
        let descriptor = DescriptorProto {
            name: Some("Echo".to_string()),
            field: vec![
                FieldDescriptorProto {
                    name: Some("name".to_string()),
                    number: Some(1),
                    r#type: Some(Type::String as i32),
                    label: Some(Label::Optional as i32),
                    ..Default::default()
                },
                FieldDescriptorProto {
                    name: Some("data".to_string()),
                    number: Some(2),
                    r#type: Some(Type::String as i32),
                    label: Some(Label::Optional as i32),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let a = FakePeer::new("A", Mode::Echo);
        let resolver = Arc::new(KeyResolver::new(name_key(&descriptor).unwrap()));
        resolver.set("A", a.clone());
        let routes = Arc::new(RoutingTable::new());
        routes.set("/svc/Echo", Target::new(StreamShape::BidiStreaming, resolver));
        let pump = StreamPump::new(routes);

        let first = RawMessage::from_message(&Echo {
            name: "A".to_string(),
            data: "x".to_string(),
        });
        let (tx, inbound) = caller();
        tx.send(Ok(first.clone())).await.unwrap();
        drop(tx);

        let response = pump.proxy(InboundCall::new("/svc/Echo", inbound)).await.unwrap();
        assert_eq!(
            response.metadata().get("x-served-by").unwrap().to_str().unwrap(),
            "A"
        );
        let (received, status) = outcome(Ok(response)).await;
        assert_eq!(received, vec![first]);
        assert_eq!(status.code(), Code::Ok);
        assert_eq!(status.metadata().get("x-peer").unwrap().to_str().unwrap(), "A");
        assert_eq!(a.opened(), 1);
    }

    #[tokio::test]
    async fn test_deleted_key_does_not_affect_call_in_flight() {
        let a = FakePeer::new("tenant-a", Mode::Echo);
        let resolver = Arc::new(KeyResolver::new(field_key(1)));
        resolver.set("A", a.clone());
        let pump = pump(StreamShape::BidiStreaming, resolver.clone());

        let (tx, inbound) = caller();
        tx.send(Ok(command("A", b"1"))).await.unwrap();
        let response = pump.proxy(InboundCall::new(METHOD, inbound)).await.unwrap();
        let mut stream = response.into_inner();
        assert_eq!(stream.next().await.unwrap().unwrap(), command("A", b"1"));

        assert!(resolver.delete("A"));
        tx.send(Ok(command("A", b"2"))).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), command("A", b"2"));
        drop(tx);

        let status = stream.next().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Ok);
        assert_eq!(a.opened(), 1);
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_found_without_opening() {
        let a = FakePeer::new("tenant-a", Mode::Echo);
        let resolver = Arc::new(KeyResolver::new(field_key(1)));
        resolver.set("A", a.clone());
        let pump = pump(StreamShape::BidiStreaming, resolver);

        let (tx, inbound) = caller();
        tx.send(Ok(command("Z", b""))).await.unwrap();

        let (received, status) = outcome(pump.proxy(InboundCall::new(METHOD, inbound)).await).await;
        assert!(received.is_empty());
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("\"Z\""));
        assert_eq!(a.opened(), 0);
    }

    #[tokio::test]
    async fn test_missing_key_is_invalid_argument() {
        let a = FakePeer::new("tenant-a", Mode::Echo);
        let resolver = Arc::new(KeyResolver::new(field_key(1)));
        resolver.set("A", a.clone());
        let pump = pump(StreamShape::BidiStreaming, resolver);

        let (tx, inbound) = caller();
        tx.send(Ok(RawMessage::new(vec![0x0a, 0x7f]))).await.unwrap();

        let (_, status) = outcome(pump.proxy(InboundCall::new(METHOD, inbound)).await).await;
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(a.opened(), 0);
    }

    #[tokio::test]
    async fn test_many_messages_arrive_in_order() {
        let peer = FakePeer::new("echo", Mode::Echo);
        let pump = pump(StreamShape::BidiStreaming, fixed(&peer));

        let sent: Vec<RawMessage> = (0..500)
            .map(|i| command(&format!("m{}", i), &vec![(i % 251) as u8; i * 7]))
            .collect();

        let (tx, inbound) = caller();
        let feed = sent.clone();
        tokio::spawn(async move {
            for message in feed {
                tx.send(Ok(message)).await.unwrap();
            }
        });

        let (received, status) = outcome(pump.proxy(InboundCall::new(METHOD, inbound)).await).await;
        assert_eq!(status.code(), Code::Ok);
        assert_eq!(received.len(), sent.len());
        for (got, want) in received.iter().zip(&sent) {
            assert_eq!(got.as_bytes(), want.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_half_close_reaches_peer() {
        let peer = FakePeer::new("counter", Mode::Count);
        let pump = pump(StreamShape::ClientStreaming, fixed(&peer));

        let (tx, inbound) = caller();
        for i in 0..5 {
            tx.send(Ok(command("reading", &[i]))).await.unwrap();
        }
        drop(tx);

        let (received, status) = outcome(pump.proxy(InboundCall::new(METHOD, inbound)).await).await;
        assert_eq!(status.code(), Code::Ok);
        assert_eq!(received, vec![RawMessage::new(b"5".to_vec())]);
    }

    #[tokio::test]
    async fn test_peer_status_passes_through() {
        let peer = FakePeer::new("locked", Mode::Fail(Code::PermissionDenied, "zone locked"));
        let pump = pump(StreamShape::BidiStreaming, fixed(&peer));

        let (tx, inbound) = caller();
        tx.send(Ok(command("door", b"open"))).await.unwrap();

        let (received, status) = outcome(pump.proxy(InboundCall::new(METHOD, inbound)).await).await;
        assert!(received.is_empty());
        assert_eq!(status.code(), Code::PermissionDenied);
        assert_eq!(status.message(), "zone locked");
    }

    #[tokio::test]
    async fn test_caller_failure_aborts_call() {
        let peer = FakePeer::new("echo", Mode::Echo);
        let pump = pump(StreamShape::BidiStreaming, fixed(&peer));

        let (tx, inbound) = caller();
        tx.send(Ok(command("a", b""))).await.unwrap();
        tx.send(Err(Status::data_loss("caller stream torn"))).await.unwrap();

        let (_, status) = outcome(pump.proxy(InboundCall::new(METHOD, inbound)).await).await;
        assert_eq!(status.code(), Code::DataLoss);
    }

    #[tokio::test]
    async fn test_second_request_on_unary_call_is_rejected() {
        let peer = FakePeer::new("counter", Mode::Count);
        let pump = pump(StreamShape::Unary, fixed(&peer));

        let (tx, inbound) = caller();
        tx.send(Ok(command("a", b""))).await.unwrap();
        tx.send(Ok(command("b", b""))).await.unwrap();
        drop(tx);

        let (_, status) = outcome(pump.proxy(InboundCall::new(METHOD, inbound)).await).await;
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("protocol violation"));
    }

    #[tokio::test]
    async fn test_second_response_on_unary_call_is_rejected() {
        let peer = FakePeer::new("chatty", Mode::Twice);
        let pump = pump(StreamShape::Unary, fixed(&peer));

        let (tx, inbound) = caller();
        tx.send(Ok(command("a", b""))).await.unwrap();
        drop(tx);

        let (received, status) = outcome(pump.proxy(InboundCall::new(METHOD, inbound)).await).await;
        assert_eq!(received.len(), 1);
        assert_eq!(status.code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_cancel_before_first_message_abandons_resolution() {
        let a = FakePeer::new("tenant-a", Mode::Echo);
        let resolver = Arc::new(KeyResolver::new(field_key(1)));
        resolver.set("A", a.clone());
        let pump = pump(StreamShape::BidiStreaming, resolver);

        // The caller never sends anything, so the key cannot be read
        let (tx, inbound) = caller();
        let proxied = tokio::time::timeout(
            Duration::from_millis(50),
            pump.proxy(InboundCall::new(METHOD, inbound)),
        )
        .await;
        assert!(proxied.is_err());

        // Dropping the call released the inbound stream
        tokio::time::timeout(Duration::from_secs(5), tx.closed())
            .await
            .unwrap();
        assert_eq!(a.opened(), 0);
    }

    #[tokio::test]
    async fn test_dropping_response_stream_aborts_peer_call() {
        let peer = FakePeer::new("silent", Mode::Hang);
        let pump = pump(StreamShape::BidiStreaming, fixed(&peer));

        let (tx, inbound) = caller();
        tx.send(Ok(command("a", b""))).await.unwrap();
        let response = pump.proxy(InboundCall::new(METHOD, inbound)).await.unwrap();
        drop(response);

        tokio::time::timeout(Duration::from_secs(5), peer.aborted.notified())
            .await
            .unwrap();
        assert_no_half_close(&peer).await;
        drop(tx);
    }

    async fn assert_no_half_close(peer: &FakePeer) {
        let half_closed =
            tokio::time::timeout(Duration::from_millis(100), peer.half_closed.notified()).await;
        assert!(half_closed.is_err(), "peer saw a clean end of input");
    }

    #[tokio::test]
    async fn test_late_caller_failure_aborts_peer() {
        let peer = FakePeer::new("counter", Mode::Count);
        let pump = pump(StreamShape::ClientStreaming, fixed(&peer));

        let (tx, inbound) = caller();
        tx.send(Ok(command("a", b""))).await.unwrap();
        let response = pump.proxy(InboundCall::new(METHOD, inbound)).await.unwrap();

        tx.send(Ok(command("b", b""))).await.unwrap();
        tx.send(Err(Status::data_loss("caller stream torn"))).await.unwrap();

        let (received, status) = outcome(Ok(response)).await;
        assert!(received.is_empty());
        assert_eq!(status.code(), Code::DataLoss);

        tokio::time::timeout(Duration::from_secs(5), peer.aborted.notified())
            .await
            .unwrap();
        assert_no_half_close(&peer).await;
    }

    #[tokio::test]
    async fn test_late_second_request_on_unary_call_aborts_peer() {
        let peer = FakePeer::new("counter", Mode::Count);
        let pump = pump(StreamShape::Unary, fixed(&peer));

        let (tx, inbound) = caller();
        tx.send(Ok(command("a", b""))).await.unwrap();
        let response = pump.proxy(InboundCall::new(METHOD, inbound)).await.unwrap();

        tx.send(Ok(command("b", b""))).await.unwrap();

        let (received, status) = outcome(Ok(response)).await;
        assert!(received.is_empty());
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("protocol violation"));

        tokio::time::timeout(Duration::from_secs(5), peer.aborted.notified())
            .await
            .unwrap();
        assert_no_half_close(&peer).await;
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_enforced_and_propagated() {
        let peer = FakePeer::new("silent", Mode::Hang);
        let pump = pump(StreamShape::BidiStreaming, fixed(&peer));

        let (tx, inbound) = caller();
        tx.send(Ok(command("a", b""))).await.unwrap();
        let mut headers = MetadataMap::new();
        headers.insert(metadata::GRPC_TIMEOUT, "200m".parse().unwrap());
        let call = InboundCall::new(METHOD, inbound).with_metadata(headers);

        let (_, status) = outcome(pump.proxy(call).await).await;
        assert_eq!(status.code(), Code::DeadlineExceeded);

        let forwarded = peer.seen_header(metadata::GRPC_TIMEOUT).unwrap();
        let remaining = metadata::parse_timeout(&forwarded).unwrap();
        assert!(remaining <= Duration::from_millis(200));
        drop(tx);
    }
}
