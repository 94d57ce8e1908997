//! Resolver strategies mapping an inbound call to a downstream connection

use crate::connection::{Connection, InboundStream};
use crate::key::KeyExtractor;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use proxy_wire::{RawMessage, WireError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tonic::Status;
use tracing::debug;

/// Why a call could not be mapped to a connection
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The key was read but nothing is registered under it
    #[error("no connection registered for key {0:?}")]
    NotFound(String),

    /// The first message could not be decoded or carried no usable key
    #[error("{0}")]
    InvalidArgument(String),

    /// The caller's stream failed while its first message was being read
    #[error("inbound stream failed: {0}")]
    Inbound(Status),
}

impl From<WireError> for ResolveError {
    fn from(err: WireError) -> Self {
        ResolveError::InvalidArgument(err.to_string())
    }
}

impl From<ResolveError> for Status {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound(_) => Status::not_found(err.to_string()),
            ResolveError::InvalidArgument(msg) => Status::invalid_argument(msg),
            ResolveError::Inbound(status) => status,
        }
    }
}

#[derive(Debug)]
enum FirstMessage {
    Unread,
    Captured(RawMessage),
    Ended,
}

/// Gives a resolver access to the first message of the inbound call.
///
/// The source owns whatever it captures. Resolvers only borrow the first
/// message; the pump takes it back with [`MessageSource::into_captured`] and
/// forwards it as the first downstream message. A resolver that never asks
/// leaves the inbound stream untouched.
pub struct MessageSource<'a> {
    inbound: &'a mut InboundStream,
    first: FirstMessage,
}

impl<'a> MessageSource<'a> {
    /// Wrap the inbound stream of a call
    pub fn new(inbound: &'a mut InboundStream) -> Self {
        Self {
            inbound,
            first: FirstMessage::Unread,
        }
    }

    /// Read (once) and borrow the first inbound message
    pub async fn first_message(&mut self) -> Result<&RawMessage, ResolveError> {
        if matches!(self.first, FirstMessage::Unread) {
            self.first = match self.inbound.next().await {
                Some(Ok(message)) => FirstMessage::Captured(message),
                Some(Err(status)) => return Err(ResolveError::Inbound(status)),
                None => FirstMessage::Ended,
            };
        }

        match &self.first {
            FirstMessage::Captured(message) => Ok(message),
            _ => Err(ResolveError::InvalidArgument(
                "call ended before its first message".to_string(),
            )),
        }
    }

    /// Whether the first message has been read from the inbound stream
    pub fn is_captured(&self) -> bool {
        matches!(self.first, FirstMessage::Captured(_))
    }

    /// Hand back the captured first message, if one was read
    pub fn into_captured(self) -> Option<RawMessage> {
        match self.first {
            FirstMessage::Captured(message) => Some(message),
            _ => None,
        }
    }
}

/// Strategy that finds the downstream connection for a call.
///
/// Implementations are invoked concurrently by many calls, must not mutate
/// the message they inspect, and must return the same answer for the same
/// first message while their registrations are unchanged.
#[async_trait]
pub trait Resolver: Send + Sync + fmt::Debug {
    /// Resolve the connection for the call behind `source`
    async fn resolve(
        &self,
        source: &mut MessageSource<'_>,
    ) -> Result<Arc<dyn Connection>, ResolveError>;
}

/// Always resolves to one statically configured connection
#[derive(Debug, Clone)]
pub struct FixedResolver {
    connection: Arc<dyn Connection>,
}

impl FixedResolver {
    /// Create a resolver for `connection`
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Resolver for FixedResolver {
    async fn resolve(
        &self,
        _source: &mut MessageSource<'_>,
    ) -> Result<Arc<dyn Connection>, ResolveError> {
        Ok(self.connection.clone())
    }
}

/// Resolves by reading a key from the first message and looking it up.
///
/// Registrations may change at any time; a call keeps the connection it
/// resolved even if its key is deleted while the call is in flight.
#[derive(Debug)]
pub struct KeyResolver {
    key: KeyExtractor,
    connections: DashMap<String, Arc<dyn Connection>>,
}

impl KeyResolver {
    /// Create an empty resolver using `key` to read keys from messages
    pub fn new(key: KeyExtractor) -> Self {
        Self {
            key,
            connections: DashMap::new(),
        }
    }

    /// Register or replace the connection for `key`
    pub fn set(&self, key: impl Into<String>, connection: Arc<dyn Connection>) {
        let key = key.into();
        debug!("Registering connection {} under key {:?}", connection.peer(), key);
        self.connections.insert(key, connection);
    }

    /// Remove the connection for `key`, returning whether one existed
    pub fn delete(&self, key: &str) -> bool {
        let existed = self.connections.remove(key).is_some();
        if existed {
            debug!("Removed connection for key {:?}", key);
        }
        existed
    }

    /// Connection currently registered for `key`
    pub fn get(&self, key: &str) -> Option<Arc<dyn Connection>> {
        self.connections.get(key).map(|entry| entry.value().clone())
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// The extractor used to read keys
    pub fn extractor(&self) -> &KeyExtractor {
        &self.key
    }
}

#[async_trait]
impl Resolver for KeyResolver {
    async fn resolve(
        &self,
        source: &mut MessageSource<'_>,
    ) -> Result<Arc<dyn Connection>, ResolveError> {
        let first = source.first_message().await?;
        let key = self.key.extract(first)?;

        match self.get(&key) {
            Some(connection) => {
                debug!("Resolved key {:?} to {}", key, connection.peer());
                Ok(connection)
            }
            None => Err(ResolveError::NotFound(key)),
        }
    }
}
