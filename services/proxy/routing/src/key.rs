//! Key extraction for content-based routing.
//!
//! A [`KeyExtractor`] turns the first message of a call into the string key a
//! [`KeyResolver`](crate::KeyResolver) looks up. Extractors built from a
//! schema are validated when they are built, so a bad registration fails at
//! startup instead of on every call.

use crate::resolver::ResolveError;
use prost::Message;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{DescriptorProto, FileDescriptorSet};
use proxy_wire::RawMessage;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Name of the field read by [`name_key`]
pub const NAME_FIELD: &str = "name";

/// Schema problems detected while building an extractor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The message declares no field with the required name
    #[error("message {message} has no field named {field:?}")]
    MissingField {
        /// Message type name
        message: String,
        /// Required field name
        field: String,
    },

    /// The field exists but is not a string
    #[error("field {field:?} of {message} is {found:?}, expected string")]
    NotString {
        /// Message type name
        message: String,
        /// Field name
        field: String,
        /// Declared type
        found: Type,
    },

    /// The field exists but is repeated
    #[error("field {field:?} of {message} is repeated")]
    Repeated {
        /// Message type name
        message: String,
        /// Field name
        field: String,
    },

    /// The field has no valid field number
    #[error("field {field:?} of {message} has invalid number {number}")]
    InvalidNumber {
        /// Message type name
        message: String,
        /// Field name
        field: String,
        /// Declared number
        number: i32,
    },

    /// An encoded descriptor set could not be decoded
    #[error("invalid descriptor set: {0}")]
    DescriptorSet(String),

    /// A message type was not found in a descriptor set
    #[error("message type {0} not found in descriptor set")]
    UnknownMessage(String),
}

type ExtractFn = dyn Fn(&RawMessage) -> Result<String, ResolveError> + Send + Sync;

/// Reads a routing key from a message
#[derive(Clone)]
pub struct KeyExtractor {
    description: String,
    extract: Arc<ExtractFn>,
}

impl KeyExtractor {
    /// Wrap an arbitrary extraction function.
    ///
    /// `description` only shows up in logs and debug output.
    pub fn new<F>(description: impl Into<String>, extract: F) -> Self
    where
        F: Fn(&RawMessage) -> Result<String, ResolveError> + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            extract: Arc::new(extract),
        }
    }

    /// Read the key from `message`
    pub fn extract(&self, message: &RawMessage) -> Result<String, ResolveError> {
        (self.extract)(message)
    }

    /// What this extractor reads
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExtractor")
            .field("description", &self.description)
            .finish()
    }
}

/// Extractor reading the string field `field` as the key.
///
/// An absent field and an empty string are the same thing on the wire in
/// proto3, so both are rejected as a missing key.
pub fn field_key(field: u32) -> KeyExtractor {
    KeyExtractor::new(format!("string field #{}", field), move |message| {
        match message.peek_string(field)? {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(ResolveError::InvalidArgument(format!(
                "message has no key in field #{}",
                field
            ))),
        }
    })
}

/// Extractor reading the message's `name` field, validated against its schema.
///
/// The schema must declare a non-repeated `string` field called `name`. At
/// call time only that one field is decoded.
pub fn name_key(descriptor: &DescriptorProto) -> Result<KeyExtractor, SchemaError> {
    let message = descriptor.name().to_string();
    let field = descriptor
        .field
        .iter()
        .find(|field| field.name() == NAME_FIELD)
        .ok_or_else(|| SchemaError::MissingField {
            message: message.clone(),
            field: NAME_FIELD.to_string(),
        })?;

    if field.label() == Label::Repeated {
        return Err(SchemaError::Repeated {
            message,
            field: NAME_FIELD.to_string(),
        });
    }
    if field.r#type() != Type::String {
        return Err(SchemaError::NotString {
            message,
            field: NAME_FIELD.to_string(),
            found: field.r#type(),
        });
    }
    let number = field.number();
    if number <= 0 {
        return Err(SchemaError::InvalidNumber {
            message,
            field: NAME_FIELD.to_string(),
            number,
        });
    }

    let number = number as u32;
    Ok(KeyExtractor::new(
        format!("{}.{} (#{})", message, NAME_FIELD, number),
        move |raw| match raw.peek_string(number)? {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(ResolveError::InvalidArgument(format!(
                "{} has no {:?} value",
                message, NAME_FIELD
            ))),
        },
    ))
}

/// Decode an encoded `FileDescriptorSet`, as produced by `protoc
/// --descriptor_set_out` or `tonic-build`'s `file_descriptor_set_path`
pub fn decode_descriptor_set(bytes: &[u8]) -> Result<FileDescriptorSet, SchemaError> {
    FileDescriptorSet::decode(bytes).map_err(|e| SchemaError::DescriptorSet(e.to_string()))
}

/// Find a message type by its fully-qualified name (`pkg.Outer.Inner`)
pub fn descriptor_by_name<'a>(
    set: &'a FileDescriptorSet,
    full_name: &str,
) -> Result<&'a DescriptorProto, SchemaError> {
    let full_name = full_name.trim_start_matches('.');

    for file in &set.file {
        let package = file.package();
        let relative = if package.is_empty() {
            Some(full_name)
        } else {
            full_name
                .strip_prefix(package)
                .and_then(|rest| rest.strip_prefix('.'))
        };
        let Some(relative) = relative else {
            continue;
        };
        if let Some(found) = find_nested(&file.message_type, relative) {
            return Ok(found);
        }
    }

    Err(SchemaError::UnknownMessage(full_name.to_string()))
}

fn find_nested<'a>(messages: &'a [DescriptorProto], path: &str) -> Option<&'a DescriptorProto> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let message = messages.iter().find(|m| m.name() == head)?;
    match rest {
        Some(rest) => find_nested(&message.nested_type, rest),
        None => Some(message),
    }
}
