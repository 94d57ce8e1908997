//! Call shapes and routing targets

use crate::resolver::Resolver;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Whether a method streams its request, its response, both, or neither
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamShape {
    /// One request, one response
    Unary,
    /// Many requests, one response
    ClientStreaming,
    /// One request, many responses
    ServerStreaming,
    /// Many requests, many responses
    BidiStreaming,
}

impl StreamShape {
    /// Build a shape from the streaming flags found in a method descriptor
    pub fn new(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => StreamShape::Unary,
            (true, false) => StreamShape::ClientStreaming,
            (false, true) => StreamShape::ServerStreaming,
            (true, true) => StreamShape::BidiStreaming,
        }
    }
    
    /// Whether the caller may send more than one message
    pub fn client_streaming(self) -> bool {
        matches!(self, StreamShape::ClientStreaming | StreamShape::BidiStreaming)
    }
    
    /// Whether the downstream peer may send more than one message
    pub fn server_streaming(self) -> bool {
        matches!(self, StreamShape::ServerStreaming | StreamShape::BidiStreaming)
    }
}

impl fmt::Display for StreamShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamShape::Unary => write!(f, "unary"),
            StreamShape::ClientStreaming => write!(f, "client-streaming"),
            StreamShape::ServerStreaming => write!(f, "server-streaming"),
            StreamShape::BidiStreaming => write!(f, "bidi-streaming"),
        }
    }
}

/// Registered routing target for one method.
///
/// A target never changes once stored in the routing table; replacing it is
/// done by storing a new one.
#[derive(Debug, Clone)]
pub struct Target {
    shape: StreamShape,
    resolver: Arc<dyn Resolver>,
}

impl Target {
    /// Create a new target
    pub fn new(shape: StreamShape, resolver: Arc<dyn Resolver>) -> Self {
        Self { shape, resolver }
    }
    
    /// Call shape of the method
    pub fn shape(&self) -> StreamShape {
        self.shape
    }
    
    /// Strategy used to find the downstream connection
    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }
}
