//! Error types for the cohort engine

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Time range is empty or reversed
    #[error("Invalid time range: start {start} >= end {end}")]
    InvalidRange {
        /// Range start (inclusive)
        start: DateTime<Utc>,
        /// Range end (exclusive)
        end: DateTime<Utc>,
    },

    /// Granularity cannot be used for the requested operation
    #[error("Unsupported granularity: {0}")]
    UnsupportedGranularity(String),

    /// Entity id cannot be addressed as a bit offset
    #[error("Entity id {0} exceeds the largest addressable id {}", crate::types::MAX_ENTITY_ID)]
    EntityOutOfRange(u64),

    /// Category or action name cannot be encoded into a key
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// General error
    #[error("{0}")]
    General(String),
}

/// Errors raised by a [`BitStore`](crate::store::BitStore) implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection to the store failed or timed out
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The store rejected or failed a command
    #[error("Command error: {0}")]
    CommandError(String),

    /// Key holds a value that is not a byte string
    #[error("Type mismatch for key {key}: found {found}")]
    TypeMismatch {
        /// Key that was read
        key: String,
        /// Kind of value found at the key
        found: String,
    },

    /// Arguments are not valid for the command
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Validation errors
///
/// Raised while validating configuration files and environment overrides.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Value is out of allowed range
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Field name being validated
        field: String,
        /// The invalid value
        value: String,
        /// Minimum allowed value
        min: String,
        /// Maximum allowed value
        max: String,
    },

    /// Required field is missing
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Invalid format
    #[error("Invalid format for {field}: {message}")]
    InvalidFormat {
        /// Field name being validated
        field: String,
        /// Description of the format error
        message: String,
    },
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Configuration(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
