//! Tonic front end and downstream connections for the proxy.
//!
//! The front end is a single catch-all service: every `/service/Method` path
//! is accepted as a bidirectional stream of raw messages and handed to the
//! stream pump, so new methods only need a routing table entry. Downstream,
//! [`GrpcConnection`] opens calls on a tonic channel with the same raw codec,
//! keeping message bytes untouched end to end.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod metrics;
pub mod server;
pub mod service;

pub use client::*;
pub use metrics::*;
pub use server::*;
pub use service::*;
