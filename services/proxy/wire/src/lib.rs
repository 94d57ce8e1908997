//! Schema-unaware message handling for the proxy.
//!
//! The proxy forwards protobuf messages whose types it was never compiled
//! against. This crate provides the pieces that make that safe:
//!
//! - **[`RawMessage`]**: an envelope holding the exact encoded bytes, so
//!   unknown and future fields are re-emitted untouched
//! - **Field peeking**: on-demand decode of a single field by number, used by
//!   resolvers that route on message content
//! - **[`RawCodec`]**: a tonic codec that moves envelopes on and off the wire
//!   without transforming them
//!
//! ## Wire Format
//!
//! ```text
//! +-----------+----------------+----------------------------+
//! | u8 flag   | u32 length     | message bytes (RawMessage) |
//! +-----------+----------------+----------------------------+
//!   ^ handled by tonic           ^ opaque to the proxy
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod message;

// Re-export main types
pub use codec::{RawCodec, RawDecoder, RawEncoder};
pub use error::WireError;
pub use message::RawMessage;
