//! Wire-level error types.

use prost::encoding::WireType;
use thiserror::Error;

/// Errors raised while inspecting raw wire messages
#[derive(Error, Debug, Clone)]
pub enum WireError {
    /// The bytes are not a well-formed protobuf message
    #[error("malformed message: {0}")]
    Malformed(#[from] prost::DecodeError),

    /// A field was present with a wire type that cannot hold the requested value
    #[error("field {field} has wire type {wire_type:?}, expected length-delimited")]
    FieldType {
        /// Field number
        field: u32,
        /// Wire type found on the wire
        wire_type: WireType,
    },
}

impl From<WireError> for tonic::Status {
    fn from(err: WireError) -> Self {
        tonic::Status::invalid_argument(err.to_string())
    }
}
