//! Bucket key codec
//!
//! Maps `(category, action, granularity, instant)` to the canonical store key
//! of the bucket containing the instant, and to that bucket's period.
//!
//! # Key Schema
//!
//! ```text
//! {namespace}:{category}:{action}:YYYYMMDDHHmm   → 15-minute bucket (mm ∈ 00/15/30/45)
//! {namespace}:{category}:{action}:YYYYMMDDHH     → hour bucket
//! {namespace}:{category}:{action}:YYYYMMDD       → day bucket
//! {namespace}:{category}:{action}:YYYYWwww       → week bucket (week 001..054)
//! {namespace}:{category}:{action}:YYYYMM         → month bucket
//! ```
//!
//! Quarters are never stored; they are always read through their months.
//!
//! Weeks start on the configured first day of week and are clipped to the
//! calendar year: the days of a week that fall in the previous year belong
//! to that year's last week bucket.
//!
//! # Example
//!
//! ```rust
//! use kuba_cohort::keys::KeyCodec;
//! use kuba_cohort::types::Granularity;
//! use chrono::{TimeZone, Utc};
//!
//! let codec = KeyCodec::default();
//! let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 37, 12).unwrap();
//!
//! let key = codec.key_for("video", "watch", Granularity::FifteenMinutes, at).unwrap();
//! assert_eq!(key.key, "cohort:video:watch:202403051430");
//! assert_eq!(key.period_start, Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap());
//! ```

use crate::error::{Error, Result};
use crate::types::Granularity;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Default key namespace
pub const DEFAULT_NAMESPACE: &str = "cohort";

/// Separator between key segments
const SEPARATOR: char = ':';

/// A fully addressed bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    /// Granularity of the bucket
    pub granularity: Granularity,

    /// Canonical store key
    pub key: String,

    /// First instant of the bucket's period
    pub period_start: DateTime<Utc>,
}

/// Deterministic bucket addressing
///
/// Cheap to clone; use [`KeyCodec::with_first_day_of_week`] to override the
/// week anchor for a single query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    namespace: String,
    first_day_of_week: Weekday,
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE, Weekday::Sun)
    }
}

impl KeyCodec {
    /// Create a codec for the given namespace and first day of week
    pub fn new(namespace: impl Into<String>, first_day_of_week: Weekday) -> Self {
        Self {
            namespace: namespace.into(),
            first_day_of_week,
        }
    }

    /// Same codec with a different first day of week
    pub fn with_first_day_of_week(&self, first_day_of_week: Weekday) -> Self {
        Self {
            namespace: self.namespace.clone(),
            first_day_of_week,
        }
    }

    /// Key namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Configured first day of week
    pub fn first_day_of_week(&self) -> Weekday {
        self.first_day_of_week
    }

    /// Address the bucket of `granularity` containing `at`
    ///
    /// Fails with [`Error::UnsupportedGranularity`] for quarters and with
    /// [`Error::InvalidName`] if category or action cannot be encoded.
    pub fn key_for(
        &self,
        category: &str,
        action: &str,
        granularity: Granularity,
        at: DateTime<Utc>,
    ) -> Result<BucketKey> {
        validate_name("category", category)?;
        validate_name("action", action)?;

        let label = self.bucket_label(granularity, at)?;
        let period_start = self.period_start(granularity, at)?;

        Ok(BucketKey {
            granularity,
            key: format!(
                "{ns}{sep}{category}{sep}{action}{sep}{label}",
                ns = self.namespace,
                sep = SEPARATOR
            ),
            period_start,
        })
    }

    /// Time component of a bucket key
    pub fn bucket_label(&self, granularity: Granularity, at: DateTime<Utc>) -> Result<String> {
        match granularity {
            Granularity::FifteenMinutes => Ok(format!(
                "{}{:02}",
                at.format("%Y%m%d%H"),
                at.minute() / 15 * 15
            )),
            Granularity::Hour => Ok(at.format("%Y%m%d%H").to_string()),
            Granularity::Day => Ok(at.format("%Y%m%d").to_string()),
            Granularity::Week => Ok(self.week_label(at)),
            Granularity::Month => Ok(at.format("%Y%m").to_string()),
            Granularity::Quarter => Err(Error::UnsupportedGranularity(
                "quarter buckets are not stored; query their months instead".to_string(),
            )),
        }
    }

    /// Week number of `at` within its year, 1-based
    ///
    /// Week 1 is the (possibly partial) week containing January 1st.
    pub fn week_number(&self, at: DateTime<Utc>) -> u32 {
        let ordinal0 = at.ordinal0();
        // Position of January 1st within its week, counted back from `at`
        let jan1_offset = (self.days_into_week(at.weekday()) + 7 - ordinal0 % 7) % 7;
        (ordinal0 + jan1_offset) / 7 + 1
    }

    /// Week label `YYYYWwww` of the week bucket containing `at`
    pub fn week_label(&self, at: DateTime<Utc>) -> String {
        format!("{:04}W{:03}", at.year(), self.week_number(at))
    }

    /// First instant of the period of `granularity` containing `at`
    pub fn period_start(&self, granularity: Granularity, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let day = midnight(at.year(), at.month(), at.day())?;
        match granularity {
            Granularity::FifteenMinutes => Ok(day
                + Duration::hours(at.hour() as i64)
                + Duration::minutes((at.minute() / 15 * 15) as i64)),
            Granularity::Hour => Ok(day + Duration::hours(at.hour() as i64)),
            Granularity::Day => Ok(day),
            Granularity::Week => {
                let back = self.days_into_week(at.weekday());
                let week_start = day - Duration::days(back as i64);
                let year_start = midnight(at.year(), 1, 1)?;
                Ok(week_start.max(year_start))
            },
            Granularity::Month => midnight(at.year(), at.month(), 1),
            Granularity::Quarter => midnight(at.year(), quarter_first_month(at.month()), 1),
        }
    }

    /// First instant after the period of `granularity` containing `at`
    pub fn period_end(&self, granularity: Granularity, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let start = self.period_start(granularity, at)?;
        match granularity {
            Granularity::FifteenMinutes | Granularity::Hour | Granularity::Day => {
                // fixed_duration is Some for these three
                let step = granularity
                    .fixed_duration()
                    .ok_or_else(|| Error::UnsupportedGranularity(granularity.to_string()))?;
                Ok(start + step)
            },
            Granularity::Week => {
                let back = self.days_into_week(at.weekday());
                let week_end = midnight(at.year(), at.month(), at.day())?
                    + Duration::days(7 - back as i64);
                let next_year = midnight(at.year() + 1, 1, 1)?;
                Ok(week_end.min(next_year))
            },
            Granularity::Month => add_months(start, 1),
            Granularity::Quarter => add_months(start, 3),
        }
    }

    /// Check whether `at` is exactly the start of a `granularity` period
    pub fn is_boundary(&self, granularity: Granularity, at: DateTime<Utc>) -> Result<bool> {
        Ok(self.period_start(granularity, at)? == at)
    }

    /// Next-finer period starts covering the period containing `at`
    ///
    /// Quarter → its months, month → days, week → days (clipped to the
    /// year), day → hours, hour → quarter hours.
    pub fn sub_periods(
        &self,
        granularity: Granularity,
        at: DateTime<Utc>,
    ) -> Result<Vec<(Granularity, DateTime<Utc>)>> {
        let child = granularity.sub_granularity().ok_or_else(|| {
            Error::UnsupportedGranularity(format!("{} has no finer sub-periods", granularity))
        })?;

        let end = self.period_end(granularity, at)?;
        let mut cursor = self.period_start(granularity, at)?;
        let mut periods = Vec::new();
        while cursor < end {
            periods.push((child, cursor));
            cursor = self.period_end(child, cursor)?;
        }
        Ok(periods)
    }

    /// Days `weekday` lies after the configured first day of week (0..=6)
    fn days_into_week(&self, weekday: Weekday) -> u32 {
        (weekday.num_days_from_sunday() + 7 - self.first_day_of_week.num_days_from_sunday()) % 7
    }
}

/// Quarter number (1..=4) of `at`
pub fn quarter_number(at: DateTime<Utc>) -> u32 {
    (at.month() + 2) / 3
}

/// Label `YYYYQn` for the quarter containing `at`
pub fn quarter_label(at: DateTime<Utc>) -> String {
    format!("{:04}Q{}", at.year(), quarter_number(at))
}

/// Reject names that would make keys ambiguous
pub fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidName(format!("{} cannot be empty", field)));
    }
    if value.contains(SEPARATOR) {
        return Err(Error::InvalidName(format!(
            "{} '{}' cannot contain '{}'",
            field, value, SEPARATOR
        )));
    }
    Ok(())
}

fn quarter_first_month(month: u32) -> u32 {
    (month - 1) / 3 * 3 + 1
}

fn midnight(year: i32, month: u32, day: u32) -> Result<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| Error::General(format!("date out of range: {}-{}-{}", year, month, day)))
}

fn add_months(month_start: DateTime<Utc>, months: u32) -> Result<DateTime<Utc>> {
    let index = month_start.month0() + months;
    midnight(
        month_start.year() + (index / 12) as i32,
        index % 12 + 1,
        1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn label(g: Granularity, t: DateTime<Utc>) -> String {
        KeyCodec::default().bucket_label(g, t).unwrap()
    }

    #[test]
    fn test_bucket_formats() {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 14, 37, 12).unwrap();
        assert_eq!(label(Granularity::FifteenMinutes, t), "202403051430");
        assert_eq!(label(Granularity::Hour, t), "2024030514");
        assert_eq!(label(Granularity::Day, t), "20240305");
        assert_eq!(label(Granularity::Month, t), "202403");
        assert_eq!(label(Granularity::Week, t), "2024W010");
    }

    #[test]
    fn test_quarter_hour_slots() {
        assert_eq!(label(Granularity::FifteenMinutes, at(2024, 1, 1, 0, 0)), "202401010000");
        assert_eq!(label(Granularity::FifteenMinutes, at(2024, 1, 1, 0, 14)), "202401010000");
        assert_eq!(label(Granularity::FifteenMinutes, at(2024, 1, 1, 0, 15)), "202401010015");
        assert_eq!(label(Granularity::FifteenMinutes, at(2024, 1, 1, 0, 59)), "202401010045");
    }

    #[test]
    fn test_week_numbers() {
        assert_eq!(label(Granularity::Week, at(2000, 1, 1, 0, 0)), "2000W001");
        assert_eq!(label(Granularity::Week, at(2000, 12, 30, 0, 0)), "2000W053");
        // 2000-01-02 is the first Sunday
        assert_eq!(label(Granularity::Week, at(2000, 1, 2, 0, 0)), "2000W002");
        assert_eq!(label(Granularity::Week, at(2000, 12, 31, 0, 0)), "2000W054");
    }

    #[test]
    fn test_week_numbers_match_calendar() {
        for first_day in [Weekday::Sun, Weekday::Mon, Weekday::Thu, Weekday::Sat] {
            let codec = KeyCodec::new(DEFAULT_NAMESPACE, first_day);
            for year in [1999, 2000, 2021, 2024, 2025] {
                let jan1 = NaiveDate::from_ymd_opt(year, 1, 1).unwrap();
                let offset = codec.days_into_week(jan1.weekday());
                for day in [0u32, 1, 6, 7, 100, 364] {
                    let t = jan1.and_hms_opt(12, 0, 0).unwrap().and_utc() + Duration::days(day as i64);
                    if t.year() != year {
                        continue;
                    }
                    assert_eq!(codec.week_number(t), (day + offset) / 7 + 1);
                }
            }
        }
    }

    #[test]
    fn test_week_number_at_calendar_limits() {
        let codec = KeyCodec::default();
        for date in [NaiveDate::MIN, NaiveDate::MAX] {
            let t = date.and_hms_opt(0, 0, 0).unwrap().and_utc();
            assert!((1..=54).contains(&codec.week_number(t)));
        }
    }

    #[test]
    fn test_week_first_day_monday() {
        let codec = KeyCodec::new(DEFAULT_NAMESPACE, Weekday::Mon);
        // 2024-01-01 is a Monday
        assert_eq!(codec.week_label(at(2024, 1, 1, 0, 0)), "2024W001");
        assert_eq!(codec.week_label(at(2024, 1, 7, 0, 0)), "2024W001");
        assert_eq!(codec.week_label(at(2024, 1, 8, 0, 0)), "2024W002");
    }

    #[test]
    fn test_week_period_clipped_to_year() {
        let codec = KeyCodec::default();
        // Wednesday 2025-01-01; the Sunday-first week started 2024-12-29
        let t = at(2025, 1, 1, 12, 0);
        assert_eq!(codec.period_start(Granularity::Week, t).unwrap(), at(2025, 1, 1, 0, 0));
        assert_eq!(codec.period_end(Granularity::Week, t).unwrap(), at(2025, 1, 5, 0, 0));

        let t = at(2024, 12, 30, 12, 0);
        assert_eq!(codec.period_start(Granularity::Week, t).unwrap(), at(2024, 12, 29, 0, 0));
        assert_eq!(codec.period_end(Granularity::Week, t).unwrap(), at(2025, 1, 1, 0, 0));
    }

    #[test]
    fn test_period_bounds() {
        let codec = KeyCodec::default();
        let t = at(2024, 2, 15, 9, 44);
        assert_eq!(codec.period_start(Granularity::Hour, t).unwrap(), at(2024, 2, 15, 9, 0));
        assert_eq!(codec.period_end(Granularity::Month, t).unwrap(), at(2024, 3, 1, 0, 0));
        assert_eq!(codec.period_start(Granularity::Quarter, t).unwrap(), at(2024, 1, 1, 0, 0));
        assert_eq!(codec.period_end(Granularity::Quarter, t).unwrap(), at(2024, 4, 1, 0, 0));

        let december = at(2024, 12, 3, 0, 0);
        assert_eq!(codec.period_end(Granularity::Month, december).unwrap(), at(2025, 1, 1, 0, 0));
        assert_eq!(codec.period_end(Granularity::Quarter, december).unwrap(), at(2025, 1, 1, 0, 0));
    }

    #[test]
    fn test_key_for() {
        let codec = KeyCodec::new("app", Weekday::Sun);
        let key = codec
            .key_for("video", "watch", Granularity::Day, at(2024, 6, 1, 23, 59))
            .unwrap();
        assert_eq!(key.key, "app:video:watch:20240601");
        assert_eq!(key.period_start, at(2024, 6, 1, 0, 0));
        assert_eq!(key.granularity, Granularity::Day);
    }

    #[test]
    fn test_key_for_is_deterministic() {
        let codec = KeyCodec::default();
        let a = codec
            .key_for("video", "watch", Granularity::Hour, at(2024, 6, 1, 10, 5))
            .unwrap();
        let b = codec
            .key_for("video", "watch", Granularity::Hour, at(2024, 6, 1, 10, 55))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_quarter_not_stored() {
        let codec = KeyCodec::default();
        let result = codec.key_for("video", "watch", Granularity::Quarter, at(2024, 6, 1, 0, 0));
        assert!(matches!(result, Err(Error::UnsupportedGranularity(_))));
        assert_eq!(quarter_label(at(2024, 6, 1, 0, 0)), "2024Q2");
        assert_eq!(quarter_number(at(2024, 10, 1, 0, 0)), 4);
    }

    #[test]
    fn test_invalid_names() {
        let codec = KeyCodec::default();
        let t = at(2024, 6, 1, 0, 0);
        assert!(matches!(
            codec.key_for("", "watch", Granularity::Day, t),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            codec.key_for("video:hd", "watch", Granularity::Day, t),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn test_sub_periods() {
        let codec = KeyCodec::default();

        let quarters = codec.sub_periods(Granularity::Quarter, at(2024, 5, 20, 0, 0)).unwrap();
        assert_eq!(
            quarters,
            vec![
                (Granularity::Month, at(2024, 4, 1, 0, 0)),
                (Granularity::Month, at(2024, 5, 1, 0, 0)),
                (Granularity::Month, at(2024, 6, 1, 0, 0)),
            ]
        );

        assert_eq!(codec.sub_periods(Granularity::Month, at(2000, 2, 10, 0, 0)).unwrap().len(), 29);
        assert_eq!(codec.sub_periods(Granularity::Day, at(2000, 2, 10, 0, 0)).unwrap().len(), 24);
        assert_eq!(codec.sub_periods(Granularity::Hour, at(2000, 2, 10, 3, 0)).unwrap().len(), 4);
        assert_eq!(codec.sub_periods(Granularity::Week, at(2024, 6, 12, 0, 0)).unwrap().len(), 7);
        // 2000-01-01 is a Saturday: its week holds a single day
        assert_eq!(codec.sub_periods(Granularity::Week, at(2000, 1, 1, 0, 0)).unwrap().len(), 1);

        assert!(matches!(
            codec.sub_periods(Granularity::FifteenMinutes, at(2024, 1, 1, 0, 0)),
            Err(Error::UnsupportedGranularity(_))
        ));
    }

    #[test]
    fn test_keys_sort_chronologically() {
        let codec = KeyCodec::default();
        let times = [
            at(2023, 12, 31, 23, 45),
            at(2024, 1, 1, 0, 0),
            at(2024, 1, 1, 9, 15),
            at(2024, 10, 2, 0, 0),
        ];
        for g in [Granularity::FifteenMinutes, Granularity::Hour, Granularity::Day, Granularity::Week] {
            let keys: Vec<_> = times
                .iter()
                .map(|t| codec.key_for("c", "a", g, *t).unwrap().key)
                .collect();
            let mut sorted = keys.clone();
            sorted.sort();
            assert_eq!(keys, sorted, "keys for {} must sort chronologically", g);
        }
    }
}
