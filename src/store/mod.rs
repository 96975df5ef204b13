//! Bitmap store abstraction
//!
//! The engine talks to storage only through [`BitStore`], a five-command
//! subset of the Redis string/bit API:
//!
//! ```text
//! SETBIT   key offset value        -> previous bit
//! GETBIT   key offset              -> bit
//! BITCOUNT key start end           -> set bits in byte range
//! BITOP    op dest src [src ...]   -> length of dest
//! GET      key                     -> raw bytes
//! ```
//!
//! Two implementations are provided: [`InMemoryBitStore`] for tests and
//! embedding, and [`RedisBitStore`] for a real server. Missing keys behave
//! as empty bitmaps in both.

pub mod memory;
pub mod redis;

pub use memory::InMemoryBitStore;
pub use self::redis::{RedisBitStore, RedisConfig, RedisPool, RetryPolicy};

use crate::bits::BitOp;
use crate::error::StoreError;
use crate::types::EntityId;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Byte-string store with bit-level commands
///
/// Offsets address bits MSB-first within each byte. Writes are atomic per
/// bit; nothing is atomic across keys.
#[async_trait]
pub trait BitStore: Send + Sync {
    /// Set or clear one bit, returning its previous value
    async fn set_bit(&self, key: &str, offset: EntityId, value: bool) -> StoreResult<bool>;

    /// Read one bit; missing keys and offsets past the end read as `false`
    async fn get_bit(&self, key: &str, offset: EntityId) -> StoreResult<bool>;

    /// Count set bits between byte indexes `start` and `end` inclusive
    ///
    /// Negative indexes count from the end, `-1` being the last byte.
    async fn bit_count(&self, key: &str, start: i64, end: i64) -> StoreResult<u64>;

    /// Combine `sources` with `op` into `dest`, returning the byte length of `dest`
    async fn bit_op(&self, op: BitOp, dest: &str, sources: &[String]) -> StoreResult<u64>;

    /// Fetch the raw bytes stored at `key`, empty if missing
    async fn get_bytes(&self, key: &str) -> StoreResult<Bytes>;

    /// Short identifier used in logs
    fn store_id(&self) -> &str;
}

/// Decoded reply of a raw store read
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    /// Key does not exist
    Nil,
    /// UTF-8 string
    String(String),
    /// Integer reply
    Int64(i64),
    /// Floating point reply
    Double(f64),
    /// Arbitrary bytes
    Bytes(Bytes),
}

impl StoreValue {
    /// Name of the variant for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            StoreValue::Nil => "nil",
            StoreValue::String(_) => "string",
            StoreValue::Int64(_) => "int64",
            StoreValue::Double(_) => "double",
            StoreValue::Bytes(_) => "bytes",
        }
    }

    /// Interpret the value as a bitmap byte string
    ///
    /// `Nil` becomes an empty buffer; numeric replies are a type mismatch.
    pub fn into_bytes(self, key: &str) -> StoreResult<Bytes> {
        match self {
            StoreValue::Nil => Ok(Bytes::new()),
            StoreValue::String(s) => Ok(Bytes::from(s.into_bytes())),
            StoreValue::Bytes(b) => Ok(b),
            other => Err(StoreError::TypeMismatch {
                key: key.to_string(),
                found: other.kind().to_string(),
            }),
        }
    }
}

impl fmt::Display for StoreValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreValue::Nil => write!(f, "(nil)"),
            StoreValue::String(s) => write!(f, "{:?}", s),
            StoreValue::Int64(i) => write!(f, "(integer) {}", i),
            StoreValue::Double(d) => write!(f, "(double) {}", d),
            StoreValue::Bytes(b) => write!(f, "({} bytes)", b.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_bytes_accepts_byte_like_values() {
        assert!(StoreValue::Nil.into_bytes("k").unwrap().is_empty());
        assert_eq!(
            StoreValue::String("ab".to_string()).into_bytes("k").unwrap(),
            Bytes::from_static(b"ab")
        );
        assert_eq!(
            StoreValue::Bytes(Bytes::from_static(&[0xff])).into_bytes("k").unwrap(),
            Bytes::from_static(&[0xff])
        );
    }

    #[test]
    fn test_into_bytes_rejects_numbers() {
        let err = StoreValue::Int64(7).into_bytes("cohort:a:b:2024").unwrap_err();
        assert_eq!(
            err,
            StoreError::TypeMismatch {
                key: "cohort:a:b:2024".to_string(),
                found: "int64".to_string(),
            }
        );
        assert!(StoreValue::Double(1.5).into_bytes("k").is_err());
    }
}
