//! Stream pump for the proxy.
//!
//! Given an accepted call and the routing table, [`StreamPump`] resolves the
//! downstream peer, opens the call there, and relays messages both ways until
//! either side finishes:
//!
//! - caller messages are forwarded in order, the first one included even when
//!   a resolver had to read it to pick the peer
//! - the caller's half-close becomes the downstream half-close
//! - the peer's headers, messages, status and trailers come back unchanged
//! - cancellation, `grpc-timeout` deadlines and failures on either side end
//!   both halves of the call
//!
//! Messages are never decoded; see [`proxy_wire::RawMessage`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handle;
pub mod metadata;
pub mod pump;

pub use handle::{one_shot, Pending, Resolve};
pub use pump::{InboundCall, OutboundStream, PumpConfig, StreamPump, DEFAULT_REQUEST_BUFFER};
