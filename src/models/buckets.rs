//! Business-timezone time arithmetic: usage buckets, the budget month and
//! admin query ranges.
//!
//! The account timezone is Asia/Seoul, which has had a fixed +09:00 offset
//! with no DST since 1988, so it is modelled as a `FixedOffset`.

use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

pub const BUSINESS_TZ_OFFSET_SECS: i32 = 9 * 3600;
pub const BUSINESS_TZ_LABEL: &str = "KST";

static BUSINESS_TZ: Lazy<FixedOffset> =
    Lazy::new(|| FixedOffset::east_opt(BUSINESS_TZ_OFFSET_SECS).expect("+09:00 is in range"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketType {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl BucketType {
    pub const ALL: [BucketType; 5] = [
        BucketType::Minute,
        BucketType::Hour,
        BucketType::Day,
        BucketType::Week,
        BucketType::Month,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BucketType::Minute => "minute",
            BucketType::Hour => "hour",
            BucketType::Day => "day",
            BucketType::Week => "week",
            BucketType::Month => "month",
        }
    }
}

impl FromStr for BucketType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(BucketType::Minute),
            "hour" => Ok(BucketType::Hour),
            "day" => Ok(BucketType::Day),
            "week" => Ok(BucketType::Week),
            "month" => Ok(BucketType::Month),
            other => anyhow::bail!("invalid bucket_type: {}", other),
        }
    }
}

// ── Local/UTC conversion ─────────────────────────────────────

pub fn to_local(ts: DateTime<Utc>) -> NaiveDateTime {
    ts.with_timezone(&*BUSINESS_TZ).naive_local()
}

/// `None` when the UTC instant falls outside chrono's range.
pub fn try_from_local(local: NaiveDateTime) -> Option<DateTime<Utc>> {
    BUSINESS_TZ
        .from_local_datetime(&local)
        .single()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Local timestamps derived from a real instant always convert; the ends of
/// chrono's range saturate.
pub fn from_local(local: NaiveDateTime) -> DateTime<Utc> {
    try_from_local(local).unwrap_or(if local.year() < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

fn local_midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn truncate_to_minute(local: NaiveDateTime) -> NaiveDateTime {
    local - Duration::seconds(local.second() as i64) - Duration::nanoseconds(local.nanosecond() as i64)
}

/// Sunday of the same week at local midnight.
pub fn week_start_local(local: NaiveDateTime) -> NaiveDateTime {
    let days_since_sunday = (local.weekday().num_days_from_monday() + 1) % 7;
    local_midnight(local.date() - Duration::days(days_since_sunday as i64))
}

fn month_start_local(local: NaiveDateTime) -> NaiveDateTime {
    local_midnight(local.date() - Duration::days(local.day0() as i64))
}

/// Start of the bucket containing `ts`, returned in UTC.
pub fn bucket_start(ts: DateTime<Utc>, bucket: BucketType) -> DateTime<Utc> {
    let local = to_local(ts);
    let start = match bucket {
        BucketType::Minute => truncate_to_minute(local),
        BucketType::Hour => truncate_to_minute(local) - Duration::minutes(local.minute() as i64),
        BucketType::Day => local_midnight(local.date()),
        BucketType::Week => week_start_local(local),
        BucketType::Month => month_start_local(local),
    };
    from_local(start)
}

/// Every bucket a usage event at `ts` increments.
pub fn all_bucket_starts(ts: DateTime<Utc>) -> Vec<(BucketType, DateTime<Utc>)> {
    BucketType::ALL
        .iter()
        .map(|b| (*b, bucket_start(ts, *b)))
        .collect()
}

/// Calendar month containing `now` as `[start, end)` in UTC.
pub fn month_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = month_start_local(to_local(now));
    // 32 days past the 1st always lands in the following month.
    let next = month_start_local(start + Duration::days(32));
    (from_local(start), from_local(next))
}

/// `YYYY-MM-DD HH:MM:SS KST` rendering of a UTC instant.
pub fn format_local(ts: DateTime<Utc>) -> String {
    format!("{} {}", to_local(ts).format("%Y-%m-%d %H:%M:%S"), BUSINESS_TZ_LABEL)
}

// ── Query ranges ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Day,
    Week,
    Month,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("Invalid date range")]
    PartialDates,
    #[error("start_date must not be after end_date")]
    StartAfterEnd,
    #[error("Date out of supported range")]
    OutOfRange,
}

/// Resolve an admin usage query to a UTC `[start, end)` range.
///
/// Explicit dates win over `period`; a lone start or end date is rejected.
/// With neither, the range is the trailing 24 hours.
pub fn resolve_time_range(
    period: Option<Period>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), RangeError> {
    let now_local = to_local(now);

    match (start_date, end_date) {
        (Some(start), Some(end)) => {
            if start > end {
                return Err(RangeError::StartAfterEnd);
            }
            let end_exclusive = end
                .checked_add_signed(Duration::days(1))
                .ok_or(RangeError::OutOfRange)?;
            let start = try_from_local(local_midnight(start)).ok_or(RangeError::OutOfRange)?;
            let end = try_from_local(local_midnight(end_exclusive)).ok_or(RangeError::OutOfRange)?;
            Ok((start, end))
        }
        (Some(_), None) | (None, Some(_)) => Err(RangeError::PartialDates),
        (None, None) => {
            let start_local = match period {
                Some(Period::Day) => local_midnight(now_local.date()),
                Some(Period::Week) => week_start_local(now_local),
                Some(Period::Month) => month_start_local(now_local),
                None => now_local - Duration::hours(24),
            };
            Ok((from_local(start_local), now))
        }
    }
}
