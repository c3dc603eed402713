//! Minute-threshold rules shared by the booking transitions.
//!
//! Both helpers take `now` explicitly: transitions capture the clock once per
//! atomic unit and use that instant for every check inside it. A window too
//! large for a [`TimeDelta`] is never exceeded.

use chrono::{DateTime, TimeDelta, Utc};

/// `true` when strictly more than `minutes` remain before `start`.
pub fn is_more_than_minutes_left(start: DateTime<Utc>, now: DateTime<Utc>, minutes: i64) -> bool {
    TimeDelta::try_minutes(minutes).is_some_and(|window| start - now > window)
}

/// `true` when strictly more than `minutes` have elapsed since `start`.
pub fn has_passed_minutes(start: DateTime<Utc>, now: DateTime<Utc>, minutes: i64) -> bool {
    TimeDelta::try_minutes(minutes).is_some_and(|window| now - start > window)
}
