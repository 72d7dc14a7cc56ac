//! Error types for value parsing in gattbridge-types.

use thiserror::Error;

/// Errors that can occur when parsing identifiers handed in by a caller.
///
/// These are pure validation failures; BLE stack errors live in
/// gattbridge-core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The string is neither a 16/32-bit short form nor a full 128-bit UUID.
    #[error("Invalid UUID: {0:?}")]
    InvalidUuid(String),

    /// A device identifier was empty or contained only whitespace.
    #[error("Invalid device id: {0:?}")]
    InvalidDeviceId(String),
}

/// Result type alias using gattbridge-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
