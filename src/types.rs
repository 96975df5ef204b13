//! Core data types used throughout the engine
//!
//! # Key Types
//!
//! - **`Granularity`**: Bucket resolution, ordered coarsest to finest
//! - **`EntityId`**: Bit position of an entity inside a bucket bitmap
//! - **`TimeRange`**: Half-open time window `[start, end)` for queries
//!
//! # Example
//!
//! ```rust
//! use kuba_cohort::types::{Granularity, TimeRange};
//! use chrono::{TimeZone, Utc};
//!
//! let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
//! let end = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
//! let range = TimeRange::new(start, end).unwrap();
//! assert!(range.contains(start));
//! assert!(!range.contains(end));
//!
//! assert!(Granularity::Month.is_coarser_than(Granularity::Day));
//! ```

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a tracked entity
///
/// The id is used verbatim as the bit offset inside every bucket bitmap, so
/// dense ids starting near zero keep bitmaps small.
pub type EntityId = u64;

/// Largest entity id a Redis-compatible store can address (`2^32 - 1`)
pub const MAX_ENTITY_ID: EntityId = u32::MAX as EntityId;

/// Bucket resolution
///
/// Variants are declared coarsest first, so the derived `Ord` sorts
/// `Quarter < Month < ... < FifteenMinutes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// Calendar quarter (never stored, expands into months)
    Quarter,
    /// Calendar month
    Month,
    /// Week anchored to the configured first day of week, clipped to the year
    Week,
    /// UTC day
    Day,
    /// UTC hour
    Hour,
    /// Quarter hour
    FifteenMinutes,
}

impl Granularity {
    /// Every granularity, coarsest first
    pub const ALL: [Granularity; 6] = [
        Granularity::Quarter,
        Granularity::Month,
        Granularity::Week,
        Granularity::Day,
        Granularity::Hour,
        Granularity::FifteenMinutes,
    ];

    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Quarter => "quarter",
            Granularity::Month => "month",
            Granularity::Week => "week",
            Granularity::Day => "day",
            Granularity::Hour => "hour",
            Granularity::FifteenMinutes => "fifteen_minutes",
        }
    }

    /// True if `self` has longer periods than `other`
    pub fn is_coarser_than(&self, other: Granularity) -> bool {
        *self < other
    }

    /// Whether buckets of this granularity are written to the store
    pub fn is_stored(&self) -> bool {
        !matches!(self, Granularity::Quarter)
    }

    /// Next finer granularity used to split one period into sub-periods
    ///
    /// Months and weeks both split into days; weeks do not tile months.
    pub fn sub_granularity(&self) -> Option<Granularity> {
        match self {
            Granularity::Quarter => Some(Granularity::Month),
            Granularity::Month => Some(Granularity::Day),
            Granularity::Week => Some(Granularity::Day),
            Granularity::Day => Some(Granularity::Hour),
            Granularity::Hour => Some(Granularity::FifteenMinutes),
            Granularity::FifteenMinutes => None,
        }
    }

    /// Fixed period length, if the granularity has one
    pub fn fixed_duration(&self) -> Option<Duration> {
        match self {
            Granularity::Day => Some(Duration::days(1)),
            Granularity::Hour => Some(Duration::hours(1)),
            Granularity::FifteenMinutes => Some(Duration::minutes(15)),
            _ => None,
        }
    }

    /// Stored granularities from coarsest down to and including `self`
    pub fn stored_down_to(self) -> impl Iterator<Item = Granularity> {
        Self::ALL
            .into_iter()
            .filter(move |g| g.is_stored() && *g <= self)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quarter" | "q" => Ok(Granularity::Quarter),
            "month" | "mon" => Ok(Granularity::Month),
            "week" | "w" => Ok(Granularity::Week),
            "day" | "d" => Ok(Granularity::Day),
            "hour" | "h" => Ok(Granularity::Hour),
            "fifteen_minutes" | "fifteenminutes" | "15m" | "15min" => {
                Ok(Granularity::FifteenMinutes)
            },
            other => Err(Error::UnsupportedGranularity(other.to_string())),
        }
    }
}

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start instant (inclusive)
    pub start: DateTime<Utc>,

    /// End instant (exclusive)
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Create a new time range
    ///
    /// # Returns
    ///
    /// - `Ok(TimeRange)` if `start < end`
    /// - `Err(Error::InvalidRange)` otherwise
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// The UTC day containing `at`
    pub fn day_of(at: DateTime<Utc>) -> Self {
        let start = at
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(at);
        Self {
            start,
            end: start + Duration::days(1),
        }
    }

    /// Check whether `at` falls inside the range
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// Length of the range
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Check whether two ranges share any instant
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_granularity_order() {
        assert!(Granularity::Quarter.is_coarser_than(Granularity::Month));
        assert!(Granularity::Week.is_coarser_than(Granularity::Day));
        assert!(!Granularity::FifteenMinutes.is_coarser_than(Granularity::Hour));

        let mut sorted = vec![Granularity::Hour, Granularity::Quarter, Granularity::Day];
        sorted.sort();
        assert_eq!(
            sorted,
            vec![Granularity::Quarter, Granularity::Day, Granularity::Hour]
        );
    }

    #[test]
    fn test_granularity_parse() {
        assert_eq!("15m".parse::<Granularity>().unwrap(), Granularity::FifteenMinutes);
        assert_eq!("Week".parse::<Granularity>().unwrap(), Granularity::Week);
        assert!(matches!(
            "fortnight".parse::<Granularity>(),
            Err(Error::UnsupportedGranularity(_))
        ));
    }

    #[test]
    fn test_stored_down_to() {
        let hour: Vec<_> = Granularity::Hour.stored_down_to().collect();
        assert_eq!(
            hour,
            vec![
                Granularity::Month,
                Granularity::Week,
                Granularity::Day,
                Granularity::Hour
            ]
        );
        let month: Vec<_> = Granularity::Month.stored_down_to().collect();
        assert_eq!(month, vec![Granularity::Month]);
    }

    #[test]
    fn test_time_range_validation() {
        let a = at(2024, 1, 1, 0, 0);
        let b = at(2024, 1, 1, 1, 0);

        assert!(TimeRange::new(a, b).is_ok());
        assert!(matches!(TimeRange::new(b, a), Err(Error::InvalidRange { .. })));
        assert!(matches!(TimeRange::new(a, a), Err(Error::InvalidRange { .. })));
    }

    #[test]
    fn test_time_range_half_open() {
        let range = TimeRange::new(at(2024, 1, 1, 0, 0), at(2024, 1, 1, 1, 0)).unwrap();
        assert!(range.contains(at(2024, 1, 1, 0, 0)));
        assert!(range.contains(at(2024, 1, 1, 0, 59)));
        assert!(!range.contains(at(2024, 1, 1, 1, 0)));
        assert_eq!(range.duration(), Duration::hours(1));
    }

    #[test]
    fn test_day_of() {
        let range = TimeRange::day_of(at(2024, 2, 29, 17, 45));
        assert_eq!(range.start, at(2024, 2, 29, 0, 0));
        assert_eq!(range.end, at(2024, 3, 1, 0, 0));
    }
}
