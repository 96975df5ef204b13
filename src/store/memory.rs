//! In-memory bitmap store
//!
//! Keeps every bitmap in a `HashMap` behind a `parking_lot::RwLock`. Bit
//! addressing, BITCOUNT ranges and BITOP semantics follow Redis, so code
//! tested against this store behaves the same against a server.
//!
//! Data is lost when the store is dropped.

use super::{BitStore, StoreResult};
use crate::bits::{self, BitOp};
use crate::error::StoreError;
use crate::types::{EntityId, MAX_ENTITY_ID};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bitmap store held entirely in process memory
#[derive(Debug, Default)]
pub struct InMemoryBitStore {
    /// key -> bitmap bytes
    data: RwLock<HashMap<String, Vec<u8>>>,

    /// Keys containing this fragment fail every command
    failing: RwLock<Option<String>>,

    /// Commands served, including failed ones
    commands: AtomicU64,
}

impl InMemoryBitStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently holding a bitmap
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if no key is stored
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Sorted list of stored keys
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Total commands issued against the store
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Make every command that touches a key containing `fragment` fail
    ///
    /// Passing `None` clears the injected failure.
    pub fn fail_keys_containing(&self, fragment: Option<&str>) {
        *self.failing.write() = fragment.map(str::to_string);
    }

    fn check(&self, key: &str) -> StoreResult<()> {
        self.commands.fetch_add(1, Ordering::Relaxed);
        match self.failing.read().as_deref() {
            Some(fragment) if key.contains(fragment) => Err(StoreError::CommandError(format!(
                "injected failure for key {}",
                key
            ))),
            _ => Ok(()),
        }
    }
}

fn check_offset(offset: EntityId) -> StoreResult<()> {
    if offset > MAX_ENTITY_ID {
        return Err(StoreError::InvalidArgument(format!(
            "bit offset {} exceeds {}",
            offset, MAX_ENTITY_ID
        )));
    }
    Ok(())
}

#[async_trait]
impl BitStore for InMemoryBitStore {
    async fn set_bit(&self, key: &str, offset: EntityId, value: bool) -> StoreResult<bool> {
        self.check(key)?;
        check_offset(offset)?;

        let mut data = self.data.write();
        let bytes = data.entry(key.to_string()).or_default();
        bits::set_bit(bytes, offset, value).map_err(|e| StoreError::InvalidArgument(e.to_string()))
    }

    async fn get_bit(&self, key: &str, offset: EntityId) -> StoreResult<bool> {
        self.check(key)?;
        check_offset(offset)?;

        Ok(self
            .data
            .read()
            .get(key)
            .map(|bytes| bits::get_bit(bytes, offset))
            .unwrap_or(false))
    }

    async fn bit_count(&self, key: &str, start: i64, end: i64) -> StoreResult<u64> {
        self.check(key)?;

        Ok(self
            .data
            .read()
            .get(key)
            .map(|bytes| bits::population_count(bytes, start, end))
            .unwrap_or(0))
    }

    async fn bit_op(&self, op: BitOp, dest: &str, sources: &[String]) -> StoreResult<u64> {
        self.check(dest)?;
        for source in sources {
            self.check(source)?;
        }
        if sources.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "BITOP {} requires at least one source key",
                op
            )));
        }
        if op == BitOp::Not && sources.len() != 1 {
            return Err(StoreError::InvalidArgument(
                "BITOP NOT must be called with a single source key".to_string(),
            ));
        }

        let mut data = self.data.write();
        let result = {
            let inputs: Vec<&[u8]> = sources
                .iter()
                .map(|key| data.get(key).map(Vec::as_slice).unwrap_or(&[]))
                .collect();
            bits::apply(op, &inputs)
        };

        let len = result.len() as u64;
        if result.is_empty() {
            data.remove(dest);
        } else {
            data.insert(dest.to_string(), result);
        }
        Ok(len)
    }

    async fn get_bytes(&self, key: &str) -> StoreResult<Bytes> {
        self.check(key)?;

        Ok(self
            .data
            .read()
            .get(key)
            .map(|bytes| Bytes::copy_from_slice(bytes))
            .unwrap_or_default())
    }

    fn store_id(&self) -> &str {
        "in-memory-v1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get_bit() {
        let store = InMemoryBitStore::new();

        assert!(!store.set_bit("k", 9, true).await.unwrap());
        assert!(store.set_bit("k", 9, true).await.unwrap());
        assert!(store.get_bit("k", 9).await.unwrap());
        assert!(!store.get_bit("k", 8).await.unwrap());
        assert!(!store.get_bit("missing", 0).await.unwrap());

        // MSB-first: offset 9 is bit 0x40 of byte 1
        assert_eq!(store.get_bytes("k").await.unwrap().as_ref(), &[0x00, 0x40]);
    }

    #[tokio::test]
    async fn test_bit_count_ranges() {
        let store = InMemoryBitStore::new();
        for offset in [0, 1, 8, 23] {
            store.set_bit("k", offset, true).await.unwrap();
        }

        assert_eq!(store.bit_count("k", 0, -1).await.unwrap(), 4);
        assert_eq!(store.bit_count("k", 1, 1).await.unwrap(), 1);
        assert_eq!(store.bit_count("k", -1, -1).await.unwrap(), 1);
        assert_eq!(store.bit_count("missing", 0, -1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bit_op() {
        let store = InMemoryBitStore::new();
        store.set_bit("a", 1, true).await.unwrap();
        store.set_bit("a", 12, true).await.unwrap();
        store.set_bit("b", 12, true).await.unwrap();

        let len = store
            .bit_op(BitOp::And, "dest", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(len, 2);
        assert_eq!(store.bit_count("dest", 0, -1).await.unwrap(), 1);

        let len = store
            .bit_op(BitOp::Not, "inv", &["missing".to_string()])
            .await
            .unwrap();
        assert_eq!(len, 0);
        assert!(!store.keys().contains(&"inv".to_string()));
    }

    #[tokio::test]
    async fn test_bit_op_arguments() {
        let store = InMemoryBitStore::new();
        assert!(matches!(
            store.bit_op(BitOp::Or, "d", &[]).await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            store
                .bit_op(BitOp::Not, "d", &["a".to_string(), "b".to_string()])
                .await,
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_offset_limit() {
        let store = InMemoryBitStore::new();
        assert!(matches!(
            store.set_bit("k", MAX_ENTITY_ID + 1, true).await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = InMemoryBitStore::new();
        store.fail_keys_containing(Some(":broken:"));

        assert!(store.get_bytes("cohort:broken:x:2024").await.is_err());
        assert!(store.get_bytes("cohort:fine:x:2024").await.is_ok());

        store.fail_keys_containing(None);
        assert!(store.get_bytes("cohort:broken:x:2024").await.is_ok());
        assert_eq!(store.command_count(), 3);
    }
}
