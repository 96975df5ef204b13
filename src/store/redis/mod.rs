//! Redis-backed bitmap store
//!
//! Maps each [`BitStore`] command one-to-one onto a Redis command issued
//! through the pooled multiplexed connection:
//!
//! ```text
//! set_bit    -> SETBIT key offset 0|1
//! get_bit    -> GETBIT key offset
//! bit_count  -> BITCOUNT key start end
//! bit_op     -> BITOP AND|OR|XOR|NOT dest src...
//! get_bytes  -> GET key
//! ```
//!
//! Retries, timeouts and credential-safe errors are handled by
//! [`RedisPool`]; the store only shapes commands and decodes replies.

pub mod pool;
pub mod util;

pub use pool::{HealthStatus, RedisConfig, RedisPool, RetryPolicy};

use super::{BitStore, StoreResult, StoreValue};
use crate::bits::BitOp;
use crate::error::StoreError;
use crate::types::{EntityId, MAX_ENTITY_ID};
use async_trait::async_trait;
use bytes::Bytes;
use redis::{ErrorKind, FromRedisValue, RedisResult, Value};
use std::sync::Arc;
use tracing::debug;

impl FromRedisValue for StoreValue {
    fn from_redis_value(v: &Value) -> RedisResult<Self> {
        match v {
            Value::Nil => Ok(StoreValue::Nil),
            Value::BulkString(bytes) => Ok(StoreValue::Bytes(Bytes::copy_from_slice(bytes))),
            Value::SimpleString(s) => Ok(StoreValue::String(s.clone())),
            Value::VerbatimString { text, .. } => Ok(StoreValue::String(text.clone())),
            Value::Okay => Ok(StoreValue::String("OK".to_string())),
            Value::Int(i) => Ok(StoreValue::Int64(*i)),
            Value::Double(d) => Ok(StoreValue::Double(*d)),
            other => Err((
                ErrorKind::TypeError,
                "Reply cannot be represented as a store value",
                format!("{:?}", other),
            )
                .into()),
        }
    }
}

/// [`BitStore`] backed by a Redis server
#[derive(Clone)]
pub struct RedisBitStore {
    pool: Arc<RedisPool>,
}

impl RedisBitStore {
    /// Connect using `config`
    pub async fn connect(config: RedisConfig) -> StoreResult<Self> {
        let pool = RedisPool::new(config).await?;
        Ok(Self::with_pool(Arc::new(pool)))
    }

    /// Wrap an existing pool
    pub fn with_pool(pool: Arc<RedisPool>) -> Self {
        Self { pool }
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &Arc<RedisPool> {
        &self.pool
    }

    /// Raw GET reply of `key`
    pub async fn get_value(&self, key: &str) -> StoreResult<StoreValue> {
        let key = key.to_string();
        self.pool
            .execute("GET", |mut conn| {
                let key = key.clone();
                async move { redis::cmd("GET").arg(&key).query_async(&mut conn).await }
            })
            .await
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
impl BitStore for RedisBitStore {
    async fn set_bit(&self, key: &str, offset: EntityId, value: bool) -> StoreResult<bool> {
        check_offset(offset)?;
        let key = key.to_string();
        let previous: i64 = self
            .pool
            .execute("SETBIT", |mut conn| {
                let key = key.clone();
                async move {
                    redis::cmd("SETBIT")
                        .arg(&key)
                        .arg(offset)
                        .arg(u8::from(value))
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(previous == 1)
    }

    async fn get_bit(&self, key: &str, offset: EntityId) -> StoreResult<bool> {
        check_offset(offset)?;
        let key = key.to_string();
        let bit: i64 = self
            .pool
            .execute("GETBIT", |mut conn| {
                let key = key.clone();
                async move {
                    redis::cmd("GETBIT")
                        .arg(&key)
                        .arg(offset)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(bit == 1)
    }

    async fn bit_count(&self, key: &str, start: i64, end: i64) -> StoreResult<u64> {
        let key = key.to_string();
        let count: i64 = self
            .pool
            .execute("BITCOUNT", |mut conn| {
                let key = key.clone();
                async move {
                    redis::cmd("BITCOUNT")
                        .arg(&key)
                        .arg(start)
                        .arg(end)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn bit_op(&self, op: BitOp, dest: &str, sources: &[String]) -> StoreResult<u64> {
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

        debug!(op = %op, dest, sources = sources.len(), "BITOP");
        let dest = dest.to_string();
        let len: i64 = self
            .pool
            .execute("BITOP", |mut conn| {
                let dest = dest.clone();
                let sources = sources.to_vec();
                async move {
                    redis::cmd("BITOP")
                        .arg(op.as_str())
                        .arg(&dest)
                        .arg(&sources)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(len.max(0) as u64)
    }

    async fn get_bytes(&self, key: &str) -> StoreResult<Bytes> {
        self.get_value(key).await?.into_bytes(key)
    }

    fn store_id(&self) -> &str {
        "redis-bitmap-v1"
    }
}
