//! Metadata hygiene and deadline handling for proxied calls

use std::time::Duration;
use tonic::metadata::MetadataMap;
use tracing::debug;

/// Header carrying the caller's remaining time budget
pub const GRPC_TIMEOUT: &str = "grpc-timeout";

/// Connection-specific headers that describe one hop and must not be copied
/// onto the next one
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "host",
    "content-length",
];

/// Encoding negotiation is per hop; each side of the proxy negotiates its own
const ENCODING: &[&str] = &["grpc-encoding", "grpc-accept-encoding"];

/// Set by the server side of each hop
const RESPONSE_FRAMING: &[&str] = &["content-type"];

/// Largest value allowed by the 8 digit `grpc-timeout` format
const MAX_TIMEOUT_VALUE: u128 = 99_999_999;

/// Prepare caller metadata for the downstream request
pub fn request_metadata(metadata: MetadataMap) -> MetadataMap {
    strip(metadata, HOP_BY_HOP.iter().chain(ENCODING))
}

/// Prepare downstream response headers for the caller
pub fn response_metadata(metadata: MetadataMap) -> MetadataMap {
    strip(metadata, HOP_BY_HOP.iter().chain(ENCODING).chain(RESPONSE_FRAMING))
}

fn strip<'a>(metadata: MetadataMap, names: impl Iterator<Item = &'a &'static str>) -> MetadataMap {
    let mut headers = metadata.into_headers();
    for name in names {
        if headers.remove(*name).is_some() {
            debug!("Dropped {} header", name);
        }
    }
    MetadataMap::from_headers(headers)
}

/// Parse a `grpc-timeout` value: up to 8 digits followed by one of the units
/// `H`, `M`, `S`, `m`, `u`, `n`
pub fn parse_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    match unit {
        "H" => Some(Duration::from_secs(amount * 3600)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

/// Encode a duration as a `grpc-timeout` value, using the finest unit that fits
pub fn encode_timeout(timeout: Duration) -> String {
    let candidates = [
        (timeout.as_nanos(), "n"),
        (timeout.as_micros(), "u"),
        (timeout.as_millis(), "m"),
        (timeout.as_secs() as u128, "S"),
        ((timeout.as_secs() / 60) as u128, "M"),
    ];
    for (amount, unit) in candidates {
        if amount <= MAX_TIMEOUT_VALUE {
            return format!("{}{}", amount, unit);
        }
    }
    let hours = (timeout.as_secs() / 3600) as u128;
    format!("{}H", hours.min(MAX_TIMEOUT_VALUE))
}

/// Time budget announced by the caller, if any.
///
/// A malformed value is ignored rather than failing the call.
pub fn timeout(metadata: &MetadataMap) -> Option<Duration> {
    let value = metadata.get(GRPC_TIMEOUT)?;
    match value.to_str().ok().and_then(parse_timeout) {
        Some(timeout) => Some(timeout),
        None => {
            debug!("Ignoring malformed {} header {:?}", GRPC_TIMEOUT, value);
            None
        }
    }
}

/// Replace the announced budget with what is left of it
pub fn set_timeout(metadata: &mut MetadataMap, remaining: Duration) {
    match encode_timeout(remaining).parse() {
        Ok(value) => {
            metadata.insert(GRPC_TIMEOUT, value);
        }
        Err(_) => {
            metadata.remove(GRPC_TIMEOUT);
        }
    }
}
