//! Range decomposition
//!
//! Turns a half-open time range into the smallest ordered set of buckets
//! that covers it, preferring coarse buckets wherever the range contains a
//! complete, aligned period.
//!
//! # Algorithm
//!
//! Greedy, left to right. At each cursor position granularities are tried
//! coarsest first down to the leaf granularity; a granularity is usable when
//! the cursor sits on one of its period boundaries and the whole period fits
//! before the range end. If none is usable the leaf bucket containing the
//! cursor is emitted for the remainder of its period (clipped to the range).
//!
//! ```text
//! [09:59 ─────────────── 11:00)
//!  └ 15m 09:45 (covers 09:59..10:00)
//!        └ hour 10:00 (covers 10:00..11:00)
//! ```
//!
//! A usable quarter is emitted as its three month buckets, since quarter
//! buckets are never stored.

use crate::error::{Error, Result};
use crate::keys::KeyCodec;
use crate::types::{Granularity, TimeRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One bucket period selected by the decomposer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    /// Granularity of the bucket
    pub granularity: Granularity,

    /// First instant of the bucket's full period
    pub period_start: DateTime<Utc>,

    /// Part of the requested range this bucket accounts for
    pub covered: TimeRange,
}

/// A decomposed period together with its store key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketSpan {
    /// Granularity of the bucket
    pub granularity: Granularity,

    /// Canonical store key
    pub key: String,

    /// First instant of the bucket's full period
    pub period_start: DateTime<Utc>,

    /// Part of the requested range this bucket accounts for
    pub covered: TimeRange,
}

/// Decompose `range` into bucket periods, finest allowed granularity `leaf`
///
/// The returned periods are time ordered and their `covered` intervals are
/// contiguous, non-overlapping and union to exactly `range`.
pub fn decompose(codec: &KeyCodec, range: &TimeRange, leaf: Granularity) -> Result<Vec<Period>> {
    if !leaf.is_stored() {
        return Err(Error::UnsupportedGranularity(format!(
            "{} cannot be used as a leaf granularity",
            leaf
        )));
    }
    if range.start >= range.end {
        return Err(Error::InvalidRange {
            start: range.start,
            end: range.end,
        });
    }

    let mut periods = Vec::new();
    let mut cursor = range.start;

    while cursor < range.end {
        match largest_fit(codec, cursor, range.end, leaf)? {
            Some((Granularity::Quarter, period_end)) => {
                for (month, start) in codec.sub_periods(Granularity::Quarter, cursor)? {
                    let end = codec.period_end(month, start)?;
                    periods.push(Period {
                        granularity: month,
                        period_start: start,
                        covered: TimeRange { start, end },
                    });
                }
                cursor = period_end;
            },
            Some((granularity, period_end)) => {
                periods.push(Period {
                    granularity,
                    period_start: cursor,
                    covered: TimeRange {
                        start: cursor,
                        end: period_end,
                    },
                });
                cursor = period_end;
            },
            None => {
                let period_start = codec.period_start(leaf, cursor)?;
                let end = codec.period_end(leaf, cursor)?.min(range.end);
                periods.push(Period {
                    granularity: leaf,
                    period_start,
                    covered: TimeRange { start: cursor, end },
                });
                cursor = end;
            },
        }
    }

    Ok(periods)
}

/// Coarsest granularity whose period starts at `cursor` and ends by `end`
fn largest_fit(
    codec: &KeyCodec,
    cursor: DateTime<Utc>,
    end: DateTime<Utc>,
    leaf: Granularity,
) -> Result<Option<(Granularity, DateTime<Utc>)>> {
    for granularity in Granularity::ALL.into_iter().filter(|g| *g <= leaf) {
        if !codec.is_boundary(granularity, cursor)? {
            continue;
        }
        let period_end = codec.period_end(granularity, cursor)?;
        if period_end <= end {
            return Ok(Some((granularity, period_end)));
        }
    }
    Ok(None)
}

/// Minimal ordered bucket covering of `range` for one category and action
pub fn min_keys_for_range(
    codec: &KeyCodec,
    category: &str,
    action: &str,
    range: &TimeRange,
    leaf: Granularity,
) -> Result<Vec<BucketSpan>> {
    decompose(codec, range, leaf)?
        .into_iter()
        .map(|period| {
            let bucket = codec.key_for(category, action, period.granularity, period.period_start)?;
            Ok(BucketSpan {
                granularity: period.granularity,
                key: bucket.key,
                period_start: period.period_start,
                covered: period.covered,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn grains(periods: &[Period]) -> Vec<Granularity> {
        periods.iter().map(|p| p.granularity).collect()
    }

    fn run(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Period> {
        let range = TimeRange::new(start, end).unwrap();
        decompose(&KeyCodec::default(), &range, Granularity::FifteenMinutes).unwrap()
    }

    #[test]
    fn test_single_aligned_hour() {
        let periods = run(at(2024, 3, 5, 10, 0), at(2024, 3, 5, 11, 0));
        assert_eq!(grains(&periods), vec![Granularity::Hour]);
        assert_eq!(periods[0].period_start, at(2024, 3, 5, 10, 0));
    }

    #[test]
    fn test_sixteen_minutes() {
        let periods = run(at(2024, 3, 5, 10, 0), at(2024, 3, 5, 10, 16));
        assert_eq!(
            grains(&periods),
            vec![Granularity::FifteenMinutes, Granularity::FifteenMinutes]
        );
        assert_eq!(periods[1].period_start, at(2024, 3, 5, 10, 15));
        assert_eq!(periods[1].covered.end, at(2024, 3, 5, 10, 16));
    }

    #[test]
    fn test_leading_remainder_then_hour() {
        let periods = run(at(2024, 3, 5, 9, 59), at(2024, 3, 5, 11, 0));
        assert_eq!(
            grains(&periods),
            vec![Granularity::FifteenMinutes, Granularity::Hour]
        );
        assert_eq!(periods[0].period_start, at(2024, 3, 5, 9, 45));
        assert_eq!(periods[0].covered.start, at(2024, 3, 5, 9, 59));
        assert_eq!(periods[1].period_start, at(2024, 3, 5, 10, 0));
    }

    #[test]
    fn test_quarter_expands_to_months() {
        let periods = run(at(2024, 4, 1, 0, 0), at(2024, 7, 1, 0, 0));
        assert_eq!(
            grains(&periods),
            vec![Granularity::Month, Granularity::Month, Granularity::Month]
        );
        assert_eq!(periods[2].period_start, at(2024, 6, 1, 0, 0));
    }

    #[test]
    fn test_mixed_granularities() {
        // Sunday 2024-03-03 .. Sunday 2024-03-17 11:30
        let periods = run(at(2024, 3, 3, 0, 0), at(2024, 3, 17, 11, 30));
        assert_eq!(
            grains(&periods),
            vec![
                Granularity::Week,
                Granularity::Week,
                Granularity::Hour,
                Granularity::Hour,
                Granularity::Hour,
                Granularity::Hour,
                Granularity::Hour,
                Granularity::Hour,
                Granularity::Hour,
                Granularity::Hour,
                Granularity::Hour,
                Granularity::Hour,
                Granularity::Hour,
                Granularity::FifteenMinutes,
                Granularity::FifteenMinutes,
            ]
        );
    }

    #[test]
    fn test_month_preferred_over_week() {
        let periods = run(at(2024, 2, 1, 0, 0), at(2024, 3, 3, 0, 0));
        // February, then Mar 1 (Fri) and Mar 2 (Sat) as days
        assert_eq!(
            grains(&periods),
            vec![Granularity::Month, Granularity::Day, Granularity::Day]
        );
    }

    #[test]
    fn test_leaf_day() {
        let range = TimeRange::new(at(2024, 3, 5, 6, 0), at(2024, 3, 7, 6, 0)).unwrap();
        let periods = decompose(&KeyCodec::default(), &range, Granularity::Day).unwrap();
        assert_eq!(grains(&periods), vec![Granularity::Day; 3]);
        assert_eq!(periods[0].period_start, at(2024, 3, 5, 0, 0));
        assert_eq!(periods[2].covered.end, at(2024, 3, 7, 6, 0));
    }

    #[test]
    fn test_year_boundary_week() {
        // Week of Sunday 2024-12-29 is split at the year boundary
        let periods = run(at(2024, 12, 29, 0, 0), at(2025, 1, 5, 0, 0));
        assert_eq!(grains(&periods), vec![Granularity::Week, Granularity::Week]);
        assert_eq!(periods[1].period_start, at(2025, 1, 1, 0, 0));
    }

    #[test]
    fn test_contiguous_cover() {
        let start = at(2023, 11, 17, 13, 7);
        let end = at(2024, 2, 3, 4, 44);
        let periods = run(start, end);

        assert_eq!(periods.first().unwrap().covered.start, start);
        assert_eq!(periods.last().unwrap().covered.end, end);
        for pair in periods.windows(2) {
            assert_eq!(pair[0].covered.end, pair[1].covered.start);
        }
    }

    #[test]
    fn test_invalid_range() {
        let range = TimeRange {
            start: at(2024, 1, 1, 1, 0),
            end: at(2024, 1, 1, 0, 0),
        };
        assert!(matches!(
            decompose(&KeyCodec::default(), &range, Granularity::Hour),
            Err(Error::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_quarter_leaf_rejected() {
        let range = TimeRange::new(at(2024, 1, 1, 0, 0), at(2024, 4, 1, 0, 0)).unwrap();
        assert!(matches!(
            decompose(&KeyCodec::default(), &range, Granularity::Quarter),
            Err(Error::UnsupportedGranularity(_))
        ));
    }

    #[test]
    fn test_min_keys_for_range() {
        let range = TimeRange::new(at(2024, 3, 5, 9, 59), at(2024, 3, 5, 11, 0)).unwrap();
        let spans = min_keys_for_range(
            &KeyCodec::default(),
            "video",
            "watch",
            &range,
            Granularity::FifteenMinutes,
        )
        .unwrap();
        let keys: Vec<_> = spans.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["cohort:video:watch:202403050945", "cohort:video:watch:2024030510"]
        );
    }
}
