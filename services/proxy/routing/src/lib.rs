//! Method routing, downstream connections, and resolver strategies for the proxy.
//!
//! This crate holds the registration side of the proxy: the routing table
//! mapping `/service/Method` paths to targets, the [`Connection`] seam that
//! downstream transports implement, and the resolvers that pick a connection
//! for each call (optionally by peeking at its first message).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod key;
pub mod resolver;
pub mod table;
pub mod target;

pub use connection::*;
pub use key::*;
pub use resolver::*;
pub use table::*;
pub use target::*;
