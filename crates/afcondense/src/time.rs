//! Timestamp conversion between the data source and the display timezone
//!
//! The data source reports timezone-naive UTC timestamps and marks "still
//! open" with its maximum representable date. Everything the engine hands back
//! to callers is expressed in one configured display timezone.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use std::fmt;

/// First instant the data source uses to mean "unbounded".
pub fn source_max_date() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .unwrap_or(NaiveDateTime::MAX)
}

/// True when a raw source timestamp is the open-ended sentinel.
#[must_use]
pub fn is_open_sentinel(raw: NaiveDateTime) -> bool {
    raw >= source_max_date()
}

/// Interpret a raw source timestamp as UTC, mapping the sentinel to `None`.
#[must_use]
pub fn from_source(raw: NaiveDateTime) -> Option<DateTime<Utc>> {
    if is_open_sentinel(raw) {
        None
    } else {
        Some(raw.and_utc())
    }
}

/// Convert a raw source timestamp into the display timezone.
#[must_use]
pub fn to_display(raw: NaiveDateTime, tz: Tz) -> Option<DateTime<Tz>> {
    from_source(raw).map(|utc| utc.with_timezone(&tz))
}

/// Current time in the display timezone.
#[must_use]
pub fn now_in(tz: Tz) -> DateTime<Tz> {
    Utc::now().with_timezone(&tz)
}

/// Closed time interval handed to the data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn span(&self) -> TimeDelta {
        self.end - self.start
    }

    #[must_use]
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} .. {}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Start and optional end of an event. `end == None` means still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBounds {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeBounds {
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    /// Build from raw source timestamps, treating the sentinel end as open.
    #[must_use]
    pub fn from_source(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            start: start.and_utc(),
            end: from_source(end),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Resolve an open end against `now`.
    #[must_use]
    pub fn range(&self, now: DateTime<Utc>) -> TimeRange {
        TimeRange::new(self.start, self.end.unwrap_or(now))
    }
}

/// Human-readable duration for log records, e.g. "61d 4h".
#[must_use]
pub fn format_span(span: TimeDelta) -> String {
    let days = span.num_days();
    let hours = span.num_hours() - days * 24;
    let minutes = span.num_minutes() - span.num_hours() * 60;
    if days > 0 {
        format!("{days}d {hours}h")
    } else {
        format!("{hours}h {minutes}m")
    }
}
