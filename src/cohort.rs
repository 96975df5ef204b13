//! Cohort descriptors and expressions
//!
//! An [`Event`] names one (category, action) over a time range; its bitmap
//! is the union of every bucket covering the range, so an entity counts as
//! present if it was tracked at any point inside it.
//!
//! A [`CohortExpr`] combines events with AND/OR/XOR/NOT. Evaluation is a
//! pure fold over already resolved event bitmaps, so the evaluator can run
//! without a store.
//!
//! # Example
//!
//! ```rust
//! use kuba_cohort::bits::Bitmap;
//! use kuba_cohort::cohort::{CohortExpr, Event};
//! use kuba_cohort::types::TimeRange;
//! use chrono::{TimeZone, Utc};
//!
//! let range = TimeRange::new(
//!     Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
//!     Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(),
//! ).unwrap();
//!
//! let watched = Event::new("video", "watch", range);
//! let bought = Event::new("shop", "purchase", range);
//! let expr = CohortExpr::and([watched.clone().into(), CohortExpr::not(bought.clone().into())]);
//!
//! let cohort = expr.evaluate(&|event: &Event| {
//!     if event == &watched {
//!         Bitmap::from_bits([1, 2, 3]).unwrap()
//!     } else {
//!         Bitmap::from_bits([2]).unwrap()
//!     }
//! });
//! assert_eq!(cohort.set_bits().collect::<Vec<_>>(), vec![1, 3]);
//! ```

use crate::bits::{BitOp, Bitmap};
use crate::error::Result;
use crate::keys::validate_name;
use crate::types::{Granularity, TimeRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Query-time descriptor of one action over a time range
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    /// Action category (e.g. "video")
    pub category: String,

    /// Action name (e.g. "watch")
    pub action: String,

    /// Half-open range the action must fall in
    pub range: TimeRange,

    /// Finest granularity used to cover the range
    pub granularity: Granularity,
}

impl Event {
    /// Create an event at the default leaf granularity (15 minutes)
    ///
    /// The leaf must be no finer than the granularity the action was
    /// tracked at, since finer buckets are never written; call
    /// [`with_granularity`](Self::with_granularity) for actions tracked
    /// hourly or daily.
    pub fn new(category: impl Into<String>, action: impl Into<String>, range: TimeRange) -> Self {
        Self {
            category: category.into(),
            action: action.into(),
            range,
            granularity: Granularity::FifteenMinutes,
        }
    }

    /// Create an event from raw bounds, validating names and range
    pub fn try_new(
        category: impl Into<String>,
        action: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self> {
        let category = category.into();
        let action = action.into();
        validate_name("category", &category)?;
        validate_name("action", &action)?;
        Ok(Self::new(category, action, TimeRange::new(start, end)?))
    }

    /// Use a different leaf granularity
    #[must_use]
    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{}/{}",
            self.category, self.action, self.range, self.granularity
        )
    }
}

/// Boolean expression over events
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CohortExpr {
    /// Entities present in the event's range
    Event(Event),

    /// Entities present in every operand
    And(Vec<CohortExpr>),

    /// Entities present in any operand
    Or(Vec<CohortExpr>),

    /// Entities present in an odd number of operands
    Xor(Vec<CohortExpr>),

    /// Complement of the operand over its own allocated bitmap length
    Not(Box<CohortExpr>),
}

impl CohortExpr {
    /// AND of the given expressions
    ///
    /// A single operand is returned unwrapped; no operands evaluates to the
    /// empty cohort.
    #[must_use]
    pub fn and<I: IntoIterator<Item = CohortExpr>>(operands: I) -> Self {
        Self::nary(operands, CohortExpr::And)
    }

    /// OR of the given expressions
    #[must_use]
    pub fn or<I: IntoIterator<Item = CohortExpr>>(operands: I) -> Self {
        Self::nary(operands, CohortExpr::Or)
    }

    /// XOR of the given expressions
    #[must_use]
    pub fn xor<I: IntoIterator<Item = CohortExpr>>(operands: I) -> Self {
        Self::nary(operands, CohortExpr::Xor)
    }

    /// Complement of an expression
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(operand: CohortExpr) -> Self {
        CohortExpr::Not(Box::new(operand))
    }

    fn nary<I, F>(operands: I, build: F) -> Self
    where
        I: IntoIterator<Item = CohortExpr>,
        F: FnOnce(Vec<CohortExpr>) -> CohortExpr,
    {
        let mut operands: Vec<CohortExpr> = operands.into_iter().collect();
        if operands.len() == 1 {
            return operands.remove(0);
        }
        build(operands)
    }

    /// Distinct events referenced by the expression, in first-seen order
    pub fn events(&self) -> Vec<&Event> {
        let mut out = Vec::new();
        self.collect_events(&mut out);
        out
    }

    fn collect_events<'a>(&'a self, out: &mut Vec<&'a Event>) {
        match self {
            CohortExpr::Event(event) => {
                if !out.contains(&event) {
                    out.push(event);
                }
            },
            CohortExpr::And(operands) | CohortExpr::Or(operands) | CohortExpr::Xor(operands) => {
                for operand in operands {
                    operand.collect_events(out);
                }
            },
            CohortExpr::Not(inner) => inner.collect_events(out),
        }
    }

    /// Evaluate bottom-up, resolving each event through `resolve`
    pub fn evaluate<F>(&self, resolve: &F) -> Bitmap
    where
        F: Fn(&Event) -> Bitmap,
    {
        match self {
            CohortExpr::Event(event) => resolve(event),
            CohortExpr::And(operands) => Self::fold(BitOp::And, operands, resolve),
            CohortExpr::Or(operands) => Self::fold(BitOp::Or, operands, resolve),
            CohortExpr::Xor(operands) => Self::fold(BitOp::Xor, operands, resolve),
            CohortExpr::Not(inner) => inner.evaluate(resolve).not(),
        }
    }

    fn fold<F>(op: BitOp, operands: &[CohortExpr], resolve: &F) -> Bitmap
    where
        F: Fn(&Event) -> Bitmap,
    {
        let resolved: Vec<Bitmap> = operands.iter().map(|o| o.evaluate(resolve)).collect();
        Bitmap::combine(op, &resolved)
    }
}

impl From<Event> for CohortExpr {
    fn from(event: Event) -> Self {
        CohortExpr::Event(event)
    }
}

impl fmt::Display for CohortExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, operands: &[CohortExpr], op: &str| {
            if operands.is_empty() {
                return write!(f, "(empty {})", op);
            }
            let parts: Vec<_> = operands.iter().map(|o| o.to_string()).collect();
            write!(f, "({})", parts.join(&format!(" {} ", op)))
        };

        match self {
            CohortExpr::Event(event) => write!(f, "{}", event),
            CohortExpr::And(operands) => join(f, operands, "AND"),
            CohortExpr::Or(operands) => join(f, operands, "OR"),
            CohortExpr::Xor(operands) => join(f, operands, "XOR"),
            CohortExpr::Not(inner) => write!(f, "NOT {}", inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn range() -> TimeRange {
        TimeRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn fixtures() -> (Event, Event, Event, HashMap<Event, Bitmap>) {
        let a = Event::new("video", "watch", range());
        let b = Event::new("shop", "purchase", range());
        let c = Event::new("app", "open", range()).with_granularity(Granularity::Hour);

        let mut bitmaps = HashMap::new();
        bitmaps.insert(a.clone(), Bitmap::from_bits([1, 2, 3, 12, 77]).unwrap());
        bitmaps.insert(b.clone(), Bitmap::from_bits([1, 3, 12]).unwrap());
        bitmaps.insert(c.clone(), Bitmap::from_bits([3, 40]).unwrap());
        (a, b, c, bitmaps)
    }

    fn ids(bitmap: &Bitmap) -> Vec<u64> {
        bitmap.set_bits().collect()
    }

    #[test]
    fn test_evaluate_operators() {
        let (a, b, c, bitmaps) = fixtures();
        let resolve = |e: &Event| bitmaps.get(e).cloned().unwrap_or_default();

        let and = CohortExpr::and([a.clone().into(), b.clone().into()]);
        assert_eq!(ids(&and.evaluate(&resolve)), vec![1, 3, 12]);

        let or = CohortExpr::or([b.clone().into(), c.clone().into()]);
        assert_eq!(ids(&or.evaluate(&resolve)), vec![1, 3, 12, 40]);

        let xor = CohortExpr::xor([a.clone().into(), b.clone().into()]);
        assert_eq!(ids(&xor.evaluate(&resolve)), vec![2, 77]);

        let nested = CohortExpr::and([
            a.clone().into(),
            CohortExpr::not(CohortExpr::or([b.into(), c.into()])),
        ]);
        // NOT only spans the operand's allocated bytes (ids 0..48)
        assert_eq!(ids(&nested.evaluate(&resolve)), vec![2]);
    }

    #[test]
    fn test_and_is_commutative() {
        let (a, b, _, bitmaps) = fixtures();
        let resolve = |e: &Event| bitmaps.get(e).cloned().unwrap_or_default();

        let ab = CohortExpr::and([a.clone().into(), b.clone().into()]).evaluate(&resolve);
        let ba = CohortExpr::and([b.into(), a.into()]).evaluate(&resolve);
        assert_eq!(ab.population_count(), ba.population_count());
        assert_eq!(ids(&ab), ids(&ba));
    }

    #[test]
    fn test_constructors() {
        let (a, b, _, _) = fixtures();

        assert_eq!(
            CohortExpr::and([a.clone().into()]),
            CohortExpr::Event(a.clone())
        );
        assert_eq!(CohortExpr::or([]), CohortExpr::Or(vec![]));
        assert!(CohortExpr::or([]).evaluate(&|_: &Event| Bitmap::from_bits([1]).unwrap()).is_empty());

        let expr = CohortExpr::xor([a.clone().into(), b.into(), a.into()]);
        assert_eq!(expr.events().len(), 2);
    }

    #[test]
    fn test_event_try_new() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(Event::try_new("video", "watch", start, start + chrono::Duration::hours(1)).is_ok());
        assert!(matches!(
            Event::try_new("video", "watch", start, start),
            Err(Error::InvalidRange { .. })
        ));
        assert!(matches!(
            Event::try_new("vi:deo", "watch", start, start + chrono::Duration::hours(1)),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn test_display() {
        let (a, b, _, _) = fixtures();
        let expr = CohortExpr::and([a.into(), CohortExpr::not(b.into())]);
        let rendered = expr.to_string();
        assert!(rendered.starts_with("(video:watch@"));
        assert!(rendered.contains(" AND NOT shop:purchase@"));
    }
}
