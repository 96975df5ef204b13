//! Kuba Cohort - time-bucketed bitmap cohort analytics
//!
//! This library records "entity X performed action Y at time T" as single
//! bits in per-time-bucket bitmaps and answers cohort questions by
//! combining those bitmaps:
//! - Bucket keys at fifteen-minute, hour, day, week and month resolution
//! - Minimal coarse-to-fine bucket covering of arbitrary time ranges
//! - AND/OR/XOR/NOT cohort expressions with counts and member listing
//! - Pluggable bit store: in-memory or Redis
//!
//! # Example
//!
//! ```rust
//! use kuba_cohort::{CohortEngine, CohortExpr, Granularity, InMemoryBitStore, TimeRange};
//! use chrono::{TimeZone, Utc};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> kuba_cohort::Result<()> {
//! let engine = CohortEngine::with_store(Arc::new(InMemoryBitStore::new()));
//! let at = Utc.with_ymd_and_hms(2024, 3, 5, 10, 7, 0).unwrap();
//!
//! engine.track_event_at("video", "watch", 1, Granularity::FifteenMinutes, at).await?;
//! engine.track_event_at("video", "watch", 2, Granularity::FifteenMinutes, at).await?;
//! engine.track_event_at("shop", "purchase", 2, Granularity::FifteenMinutes, at).await?;
//!
//! let day = TimeRange::day_of(at);
//! let watched_not_bought = CohortExpr::and([
//!     engine.event("video", "watch", day).into(),
//!     CohortExpr::not(engine.event("shop", "purchase", day).into()),
//! ]);
//! assert_eq!(engine.count(&watched_not_bought).await?, 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bits;
pub mod cohort;
pub mod engine;
pub mod error;
pub mod keys;
pub mod range;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Bit store abstraction with in-memory and Redis implementations
pub mod store;

// Re-export main types
pub use bits::{BitOp, Bitmap, SetBits};
pub use cohort::{CohortExpr, Event};
pub use config::CohortConfig;
pub use engine::{CohortEngine, CountsQuery, EngineConfig, PeriodCount};
pub use error::{Error, Result, StoreError};
pub use keys::KeyCodec;
pub use store::{BitStore, InMemoryBitStore, StoreValue};
pub use types::{EntityId, Granularity, TimeRange};
