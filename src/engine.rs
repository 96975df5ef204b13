//! Event store and query API
//!
//! [`CohortEngine`] ties the key codec, the range decomposer and the bit
//! algebra to an injected [`BitStore`]:
//!
//! ```text
//! track_event ──► KeyCodec ──► SETBIT per stored granularity
//!
//! count/entities/evaluate
//!   CohortExpr ──► events() ──► min_keys_for_range ──► GET (bounded fan-out)
//!              ◄── evaluate ◄── OR per event ◄────────────┘
//! ```
//!
//! Every call is independent; the engine holds no mutable state. A failed
//! bucket read fails the whole call, and dropping the returned future
//! abandons all in-flight reads.

use crate::bits::{BitOp, Bitmap, SetBits};
use crate::cohort::{CohortExpr, Event};
use crate::error::{Error, Result};
use crate::keys::{KeyCodec, DEFAULT_NAMESPACE};
use crate::metrics;
use crate::range::{min_keys_for_range, BucketSpan};
use crate::store::BitStore;
use crate::types::{EntityId, Granularity, TimeRange};
use bytes::Bytes;
use chrono::{DateTime, Utc, Weekday};
use futures::future::{try_join_all, BoxFuture};
use futures::{stream, FutureExt, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Default bound on concurrent bucket reads per call
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 32;

// ============================================================================
// Configuration
// ============================================================================

/// Runtime settings of a [`CohortEngine`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Key prefix shared by every bucket
    pub namespace: String,

    /// Day weeks start on
    pub first_day_of_week: Weekday,

    /// Granularity used by `track_event` and as the query leaf
    pub default_granularity: Granularity,

    /// Maximum bucket reads in flight for one call
    pub max_concurrent_fetches: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            first_day_of_week: Weekday::Sun,
            default_granularity: Granularity::FifteenMinutes,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
        }
    }
}

impl EngineConfig {
    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        crate::keys::validate_name("namespace", &self.namespace)?;
        if !self.default_granularity.is_stored() {
            return Err(Error::Configuration(format!(
                "default granularity {} is not stored",
                self.default_granularity
            )));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(Error::Configuration(
                "max_concurrent_fetches must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Count queries
// ============================================================================

/// Parameters of a per-period count report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountsQuery {
    /// Action category
    pub category: String,

    /// Action name
    pub action: String,

    /// Reporting window; periods are aligned to `granularity`
    pub range: TimeRange,

    /// Report 0/1 presence of this entity instead of population counts
    pub entity: Option<EntityId>,

    /// Reporting granularity
    pub granularity: Granularity,

    /// Override of the engine's first day of week
    pub first_day_of_week: Option<Weekday>,
}

impl CountsQuery {
    /// Population counts of `category:action` per `granularity` period of `range`
    pub fn new(
        category: impl Into<String>,
        action: impl Into<String>,
        range: TimeRange,
        granularity: Granularity,
    ) -> Self {
        Self {
            category: category.into(),
            action: action.into(),
            range,
            entity: None,
            granularity,
            first_day_of_week: None,
        }
    }

    /// Report presence of `entity` instead of counts
    #[must_use]
    pub fn for_entity(mut self, entity: EntityId) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Use a different first day of week for this query
    #[must_use]
    pub fn with_first_day_of_week(mut self, weekday: Weekday) -> Self {
        self.first_day_of_week = Some(weekday);
        self
    }
}

/// Count for one reporting period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodCount {
    /// Start of the period
    pub period_start: DateTime<Utc>,

    /// Set bits in the period, or 0/1 presence for entity queries
    pub count: u64,
}

// ============================================================================
// Engine
// ============================================================================

/// Cohort analytics over a bitmap store
pub struct CohortEngine {
    store: Arc<dyn BitStore>,
    codec: KeyCodec,
    config: EngineConfig,
}

impl CohortEngine {
    /// Create an engine over `store`
    pub fn new(store: Arc<dyn BitStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let codec = KeyCodec::new(config.namespace.clone(), config.first_day_of_week);
        info!(
            store = store.store_id(),
            namespace = %config.namespace,
            first_day_of_week = %config.first_day_of_week,
            granularity = %config.default_granularity,
            "Cohort engine initialized"
        );
        Ok(Self {
            store,
            codec,
            config,
        })
    }

    /// Create an engine over `store` with default settings
    pub fn with_store(store: Arc<dyn BitStore>) -> Self {
        let config = EngineConfig::default();
        Self {
            store,
            codec: KeyCodec::new(config.namespace.clone(), config.first_day_of_week),
            config,
        }
    }

    /// Key codec in use
    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    /// Engine settings
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Event over `range` using the engine's default granularity as leaf
    pub fn event(
        &self,
        category: impl Into<String>,
        action: impl Into<String>,
        range: TimeRange,
    ) -> Event {
        Event::new(category, action, range).with_granularity(self.config.default_granularity)
    }

    // ------------------------------------------------------------------------
    // Tracking
    // ------------------------------------------------------------------------

    /// Record that `entity` performed `category:action` now
    ///
    /// Returns `true` if the entity was not yet recorded in the current
    /// bucket.
    pub async fn track_event(&self, category: &str, action: &str, entity: EntityId) -> Result<bool> {
        self.track_event_at(
            category,
            action,
            entity,
            self.config.default_granularity,
            Utc::now(),
        )
        .await
    }

    /// Record that `entity` performed `category:action` at `at`
    ///
    /// The bit is set in the `granularity` bucket and in the bucket of every
    /// coarser stored granularity containing `at`, all concurrently, so one
    /// call writes up to five buckets rather than one. Coarse buckets picked
    /// by range decomposition rely on this. The writes are not atomic as a
    /// group: if one fails the others may already have landed, and repeating
    /// the call is safe because setting a bit is idempotent.
    ///
    /// Returns whether the bit was newly set at `granularity`. Buckets finer
    /// than `granularity` are not written, so queries for this event must use
    /// a leaf no finer than `granularity`
    /// (see [`has_event_with_granularity`](Self::has_event_with_granularity)
    /// and [`Event::with_granularity`]).
    pub async fn track_event_at(
        &self,
        category: &str,
        action: &str,
        entity: EntityId,
        granularity: Granularity,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if !granularity.is_stored() {
            return Err(Error::UnsupportedGranularity(format!(
                "cannot track at {} granularity",
                granularity
            )));
        }

        let keys = granularity
            .stored_down_to()
            .map(|g| self.codec.key_for(category, action, g, at).map(|b| b.key))
            .collect::<Result<Vec<_>>>()?;

        let writes = keys
            .iter()
            .map(|key| self.store.set_bit(key, entity, true));
        let previous = try_join_all(writes).await.map_err(|e| {
            metrics::record_error("store", "track_event");
            Error::from(e)
        })?;

        let newly_set = !previous.last().copied().unwrap_or(true);
        metrics::record_track(granularity.as_str(), newly_set);
        debug!(
            category,
            action,
            entity,
            %granularity,
            buckets = keys.len(),
            newly_set,
            "Tracked event"
        );
        Ok(newly_set)
    }

    // ------------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------------

    /// Check whether `entity` performed `category:action` within `range`
    ///
    /// Assumes the event was tracked at the default granularity; use
    /// [`has_event_with_granularity`](Self::has_event_with_granularity) for
    /// events tracked coarser.
    pub async fn has_event(
        &self,
        category: &str,
        action: &str,
        entity: EntityId,
        range: &TimeRange,
    ) -> Result<bool> {
        self.has_event_with_granularity(
            category,
            action,
            entity,
            self.config.default_granularity,
            range,
        )
        .await
    }

    /// Check whether `entity` performed `category:action` within `range`,
    /// for events tracked at `granularity`
    ///
    /// `granularity` is the finest bucket read. Parts of `range` shorter than
    /// one `granularity` period read the whole bucket that contains them.
    pub async fn has_event_with_granularity(
        &self,
        category: &str,
        action: &str,
        entity: EntityId,
        granularity: Granularity,
        range: &TimeRange,
    ) -> Result<bool> {
        let start = Instant::now();
        let spans = self.spans(category, action, range, granularity)?;

        let bits: Vec<bool> = stream::iter(spans.iter())
            .map(|span| self.store.get_bit(&span.key, entity))
            .buffered(self.config.max_concurrent_fetches)
            .try_collect()
            .await
            .map_err(|e| self.store_failure("has_event", e))?;

        metrics::record_bucket_reads("GETBIT", spans.len());
        metrics::record_query("has_event", start.elapsed());
        Ok(bits.into_iter().any(|bit| bit))
    }

    /// Check the single `granularity` bucket containing `at`
    pub async fn has_event_at(
        &self,
        category: &str,
        action: &str,
        entity: EntityId,
        granularity: Granularity,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let bucket = self.codec.key_for(category, action, granularity, at)?;
        metrics::record_bucket_reads("GETBIT", 1);
        self.store
            .get_bit(&bucket.key, entity)
            .await
            .map_err(|e| self.store_failure("has_event_at", e))
    }

    /// Check whether `entity` performed `category:action` during the current UTC day
    pub async fn has_event_today(
        &self,
        category: &str,
        action: &str,
        entity: EntityId,
    ) -> Result<bool> {
        let today = TimeRange::day_of(Utc::now());
        self.has_event(category, action, entity, &today).await
    }

    // ------------------------------------------------------------------------
    // Cohorts
    // ------------------------------------------------------------------------

    /// Bitmap of every entity that performed the event in its range
    pub async fn resolve_event(&self, event: &Event) -> Result<Bitmap> {
        self.evaluate(&CohortExpr::Event(event.clone())).await
    }

    /// Evaluate a cohort expression to its bitmap
    ///
    /// Bucket keys of all events are collected first, deduplicated and
    /// fetched with at most `max_concurrent_fetches` reads in flight.
    pub async fn evaluate(&self, expr: &CohortExpr) -> Result<Bitmap> {
        let start = Instant::now();

        let plans = expr
            .events()
            .into_iter()
            .map(|event| {
                let spans = self.spans(&event.category, &event.action, &event.range, event.granularity)?;
                Ok((event, spans))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut seen = HashSet::new();
        let keys: Vec<&str> = plans
            .iter()
            .flat_map(|(_, spans)| spans.iter().map(|s| s.key.as_str()))
            .filter(|key| seen.insert(*key))
            .collect();

        let fetched = self.fetch_all(&keys).await.map_err(|e| {
            metrics::record_error("store", "evaluate");
            e
        })?;
        let buckets: HashMap<&str, Bitmap> = keys.iter().copied().zip(fetched).collect();

        let resolved: HashMap<&Event, Bitmap> = plans
            .iter()
            .map(|(event, spans)| {
                let bitmaps: Vec<&Bitmap> = spans
                    .iter()
                    .filter_map(|span| buckets.get(span.key.as_str()))
                    .collect();
                (*event, Bitmap::combine(BitOp::Or, bitmaps))
            })
            .collect();

        let result = expr.evaluate(&|event: &Event| resolved.get(event).cloned().unwrap_or_default());

        metrics::record_query("evaluate", start.elapsed());
        debug!(
            events = plans.len(),
            buckets = keys.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "Evaluated cohort {}",
            expr
        );
        Ok(result)
    }

    /// Number of entities in the cohort
    pub async fn count(&self, expr: &CohortExpr) -> Result<u64> {
        Ok(self.evaluate(expr).await?.population_count())
    }

    /// Ascending iterator over the cohort's entity ids
    pub async fn entities(&self, expr: &CohortExpr) -> Result<SetBits> {
        Ok(self.evaluate(expr).await?.set_bits())
    }

    /// Per-period counts of `category:action`
    ///
    /// Periods start at the `granularity` period containing `range.start`
    /// and continue while they begin before `range.end`. Quarters are
    /// reported as the union of their three month buckets.
    pub async fn get_counts(&self, query: &CountsQuery) -> Result<Vec<PeriodCount>> {
        if query.range.start >= query.range.end {
            return Err(Error::InvalidRange {
                start: query.range.start,
                end: query.range.end,
            });
        }
        let start = Instant::now();
        let codec = match query.first_day_of_week {
            Some(weekday) => self.codec.with_first_day_of_week(weekday),
            None => self.codec.clone(),
        };

        let mut periods: Vec<(DateTime<Utc>, Vec<String>)> = Vec::new();
        let mut cursor = codec.period_start(query.granularity, query.range.start)?;
        while cursor < query.range.end {
            let keys = if query.granularity.is_stored() {
                vec![codec.key_for(&query.category, &query.action, query.granularity, cursor)?.key]
            } else {
                codec
                    .sub_periods(query.granularity, cursor)?
                    .into_iter()
                    .map(|(g, at)| codec.key_for(&query.category, &query.action, g, at).map(|b| b.key))
                    .collect::<Result<Vec<_>>>()?
            };
            periods.push((cursor, keys));
            cursor = codec.period_end(query.granularity, cursor)?;
        }

        let reads = periods.iter().map(|(_, keys)| keys.len()).sum::<usize>();
        let counts: Vec<PeriodCount> = stream::iter(periods.iter())
            .map(|(period_start, keys)| async move {
                let count = self.period_count(keys, query.entity).await?;
                Ok::<_, Error>(PeriodCount {
                    period_start: *period_start,
                    count,
                })
            })
            .buffered(self.config.max_concurrent_fetches)
            .try_collect()
            .await
            .map_err(|e| {
                metrics::record_error("store", "get_counts");
                e
            })?;

        metrics::record_bucket_reads(if query.entity.is_some() { "GETBIT" } else { "BITCOUNT" }, reads);
        metrics::record_query("get_counts", start.elapsed());
        debug!(
            category = %query.category,
            action = %query.action,
            granularity = %query.granularity,
            periods = counts.len(),
            "Computed period counts"
        );
        Ok(counts)
    }

    async fn period_count(&self, keys: &[String], entity: Option<EntityId>) -> Result<u64> {
        match (entity, keys) {
            (Some(entity), _) => {
                let bits = try_join_all(keys.iter().map(|key| self.store.get_bit(key, entity))).await?;
                Ok(u64::from(bits.into_iter().any(|bit| bit)))
            },
            (None, [key]) => Ok(self.store.bit_count(key, 0, -1).await?),
            (None, _) => {
                let bytes = try_join_all(keys.iter().map(|key| self.store.get_bytes(key))).await?;
                let bitmaps: Vec<Bitmap> = bytes.into_iter().map(Bitmap::from).collect();
                Ok(Bitmap::combine(BitOp::Or, &bitmaps).population_count())
            },
        }
    }

    /// Store the cohort at `dest` using server-side BITOP
    ///
    /// Inner nodes are written to `{dest}:{index}` keys first. Returns the
    /// byte length of `dest`; an operator without operands writes nothing
    /// and returns 0.
    pub async fn materialize(&self, expr: &CohortExpr, dest: &str) -> Result<u64> {
        if dest.is_empty() {
            return Err(Error::InvalidName("destination key cannot be empty".to_string()));
        }
        let start = Instant::now();
        let len = self.materialize_node(expr, dest.to_string()).await?;
        metrics::record_query("materialize", start.elapsed());
        info!(dest, bytes = len, "Materialized cohort {}", expr);
        Ok(len)
    }

    fn materialize_node<'a>(&'a self, expr: &'a CohortExpr, dest: String) -> BoxFuture<'a, Result<u64>> {
        async move {
            let (op, sources) = match expr {
                CohortExpr::Event(event) => {
                    let spans = self.spans(&event.category, &event.action, &event.range, event.granularity)?;
                    (BitOp::Or, spans.into_iter().map(|s| s.key).collect::<Vec<_>>())
                },
                CohortExpr::Not(inner) => {
                    let child = format!("{}:0", dest);
                    self.materialize_node(inner, child.clone()).await?;
                    (BitOp::Not, vec![child])
                },
                CohortExpr::And(children) | CohortExpr::Or(children) | CohortExpr::Xor(children) => {
                    if children.is_empty() {
                        warn!(dest = %dest, "Operator without operands, nothing materialized");
                        return Ok(0);
                    }
                    let op = match expr {
                        CohortExpr::And(_) => BitOp::And,
                        CohortExpr::Or(_) => BitOp::Or,
                        _ => BitOp::Xor,
                    };
                    let child_keys: Vec<String> =
                        (0..children.len()).map(|i| format!("{}:{}", dest, i)).collect();
                    try_join_all(
                        children
                            .iter()
                            .zip(child_keys.iter())
                            .map(|(child, key)| self.materialize_node(child, key.clone())),
                    )
                    .await?;
                    (op, child_keys)
                },
            };

            let len = self.store.bit_op(op, &dest, &sources).await?;
            Ok::<u64, Error>(len)
        }
        .boxed()
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn spans(
        &self,
        category: &str,
        action: &str,
        range: &TimeRange,
        leaf: Granularity,
    ) -> Result<Vec<BucketSpan>> {
        min_keys_for_range(&self.codec, category, action, range, leaf)
    }

    async fn fetch_all(&self, keys: &[&str]) -> Result<Vec<Bitmap>> {
        let bytes: Vec<Bytes> = stream::iter(keys.iter().copied())
            .map(|key| self.store.get_bytes(key))
            .buffered(self.config.max_concurrent_fetches)
            .try_collect()
            .await?;
        metrics::record_bucket_reads("GET", keys.len());
        Ok(bytes.into_iter().map(Bitmap::from).collect())
    }

    fn store_failure(&self, operation: &str, e: crate::error::StoreError) -> Error {
        metrics::record_error("store", operation);
        warn!(operation, store = self.store.store_id(), error = %e, "Store command failed");
        Error::Store(e)
    }
}
