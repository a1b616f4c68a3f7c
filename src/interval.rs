//! Relative time deltas used for time-triggered transitions.
//!
//! Minutes, hours and days are fixed-length durations. Months and years
//! are calendar steps, so adding one month to January 31st lands on the
//! last day of February.

use std::fmt;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
    Months,
    Years,
}

impl IntervalUnit {
    /// Human readable label, as shown in transition names.
    pub fn label(&self) -> &'static str {
        match self {
            IntervalUnit::Minutes => "Minute(s)",
            IntervalUnit::Hours => "Hour(s)",
            IntervalUnit::Days => "Day(s)",
            IntervalUnit::Months => "Month(s)",
            IntervalUnit::Years => "Year(s)",
        }
    }
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntervalUnit::Minutes => write!(f, "minutes"),
            IntervalUnit::Hours => write!(f, "hours"),
            IntervalUnit::Days => write!(f, "days"),
            IntervalUnit::Months => write!(f, "months"),
            IntervalUnit::Years => write!(f, "years"),
        }
    }
}

/// A count of [`IntervalUnit`]s. The count is unsigned, so it is never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub count: u32,
    pub unit: IntervalUnit,
}

impl Interval {
    pub fn new(count: u32, unit: IntervalUnit) -> Self {
        Self { count, unit }
    }

    pub fn delta(&self) -> RelativeDelta {
        delta(self.unit, self.count)
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self {
            count: 1,
            unit: IntervalUnit::Minutes,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.count, self.unit)
    }
}

/// A time step that can be added to a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativeDelta {
    Fixed(Duration),
    Calendar(Months),
}

impl RelativeDelta {
    /// Returns `start` moved forward by this delta.
    pub fn after(&self, start: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let shifted = match self {
            RelativeDelta::Fixed(d) => start.checked_add_signed(*d),
            RelativeDelta::Calendar(m) => start.checked_add_months(*m),
        };
        shifted.ok_or_else(|| EngineError::validation(format!("interval {self:?} overflows {start}")))
    }
}

/// Maps `(unit, count)` to the delta it represents.
pub fn delta(unit: IntervalUnit, count: u32) -> RelativeDelta {
    let n = i64::from(count);
    match unit {
        IntervalUnit::Minutes => RelativeDelta::Fixed(Duration::minutes(n)),
        IntervalUnit::Hours => RelativeDelta::Fixed(Duration::hours(n)),
        IntervalUnit::Days => RelativeDelta::Fixed(Duration::days(n)),
        IntervalUnit::Months => RelativeDelta::Calendar(Months::new(count)),
        IntervalUnit::Years => RelativeDelta::Calendar(Months::new(count.saturating_mul(12))),
    }
}
