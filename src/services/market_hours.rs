//! NYSE session gate for the scan loop.
//!
//! Active window is 09:15–16:15 America/New_York on non-holiday weekdays:
//! the regular 09:30–16:00 session plus a 15-minute warm-up and a 15-minute
//! post-close grace. All decisions are pure functions of the supplied instant
//! so the loop stays trivially testable.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use std::collections::HashSet;

use crate::storage::models::MarketStatus;

/// Full NYSE holiday closures, 2025–2026.
static HOLIDAYS: Lazy<HashSet<NaiveDate>> = Lazy::new(|| {
    [
        (2025, 1, 1),
        (2025, 1, 20),
        (2025, 2, 17),
        (2025, 4, 18),
        (2025, 5, 26),
        (2025, 6, 19),
        (2025, 7, 4),
        (2025, 9, 1),
        (2025, 11, 27),
        (2025, 12, 25),
        (2026, 1, 1),
        (2026, 1, 19),
        (2026, 2, 16),
        (2026, 4, 3),
        (2026, 5, 25),
        (2026, 6, 19),
        (2026, 7, 3),
        (2026, 9, 7),
        (2026, 11, 26),
        (2026, 12, 25),
    ]
    .iter()
    .filter_map(|&(y, m, d)| NaiveDate::from_ymd_opt(y, m, d))
    .collect()
});

fn warmup_start() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 15, 0).unwrap()
}

fn market_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).unwrap()
}

fn market_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).unwrap()
}

fn grace_end() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 15, 0).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Active,
    SleepUntil(DateTime<Utc>),
}

pub fn is_holiday(date: NaiveDate) -> bool {
    HOLIDAYS.contains(&date)
}

fn is_trading_day(date: NaiveDate) -> bool {
    date.weekday().number_from_monday() <= 5 && !is_holiday(date)
}

fn in_new_york(now: DateTime<Utc>) -> DateTime<Tz> {
    now.with_timezone(&New_York)
}

/// Trading date in New York for the given instant.
pub fn trading_date(now: DateTime<Utc>) -> NaiveDate {
    in_new_york(now).date_naive()
}

/// True inside the warm-up + session + grace window on a trading day.
pub fn is_active(now: DateTime<Utc>) -> bool {
    let local = in_new_york(now);
    if !is_trading_day(local.date_naive()) {
        return false;
    }
    let t = local.time();
    t >= warmup_start() && t < grace_end()
}

pub fn market_status(now: DateTime<Utc>) -> MarketStatus {
    let local = in_new_york(now);
    if !is_trading_day(local.date_naive()) {
        return MarketStatus::Closed;
    }
    let t = local.time();
    if t >= market_open() && t <= market_close() {
        MarketStatus::Open
    } else if t >= warmup_start() && t < market_open() {
        MarketStatus::Premarket
    } else {
        MarketStatus::Closed
    }
}

/// Seconds until the next active window opens; 0 when already active.
pub fn seconds_until_active(now: DateTime<Utc>) -> i64 {
    next_active_start(now)
        .map(|start| (start - now).num_seconds().max(0))
        .unwrap_or(0)
}

pub fn gate(now: DateTime<Utc>) -> Gate {
    match next_active_start(now) {
        None => Gate::Active,
        Some(start) => Gate::SleepUntil(start),
    }
}

fn next_active_start(now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if is_active(now) {
        return None;
    }
    let local = in_new_york(now);
    let mut date = local.date_naive();
    if !is_trading_day(date) || local.time() >= warmup_start() {
        date = date.succ_opt()?;
    }
    // walk forward past weekends/holidays (bounded; the calendar never has
    // more than a handful of consecutive closed days)
    for _ in 0..14 {
        if is_trading_day(date) {
            let start = New_York
                .with_ymd_and_hms(date.year(), date.month(), date.day(), 9, 15, 0)
                .single()?;
            return Some(start.with_timezone(&Utc));
        }
        date = date.succ_opt()?;
    }
    None
}

/// Most recent regular-session close (16:00 New York) at or before `now`.
/// Weekend- and holiday-aware; used to fence "recent" queries.
pub fn last_session_close(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = in_new_york(now);
    let mut date = local.date_naive();
    for _ in 0..14 {
        if is_trading_day(date) {
            if let Some(close) = New_York
                .with_ymd_and_hms(date.year(), date.month(), date.day(), 16, 0, 0)
                .single()
            {
                let close = close.with_timezone(&Utc);
                if close <= now {
                    return close;
                }
            }
        }
        match date.pred_opt() {
            Some(d) => date = d,
            None => break,
        }
    }
    now - Duration::hours(24)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ny(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(y, m, d, hh, mm, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    // Monday 2026-03-02 is a plain trading day
    #[test]
    fn monday_before_warmup_is_inactive_with_exact_countdown() {
        let now = ny(2026, 3, 2, 8, 59);
        assert!(!is_active(now));
        assert_eq!(seconds_until_active(now), 960);
    }

    #[test]
    fn warmup_start_is_active() {
        let now = ny(2026, 3, 2, 9, 15);
        assert!(is_active(now));
        assert_eq!(seconds_until_active(now), 0);
        assert_eq!(gate(now), Gate::Active);
    }

    #[test]
    fn premarket_vs_open_status() {
        assert_eq!(market_status(ny(2026, 3, 2, 9, 20)), MarketStatus::Premarket);
        assert_eq!(market_status(ny(2026, 3, 2, 10, 0)), MarketStatus::Open);
        // grace window: loop runs but the session is closed
        let grace = ny(2026, 3, 2, 16, 10);
        assert!(is_active(grace));
        assert_eq!(market_status(grace), MarketStatus::Closed);
    }

    #[test]
    fn holiday_is_inactive_all_day() {
        // 2026-07-03, Independence Day observed
        for (hh, mm) in [(8, 0), (10, 0), (15, 59)] {
            let now = ny(2026, 7, 3, hh, mm);
            assert!(!is_active(now));
            assert_eq!(market_status(now), MarketStatus::Closed);
        }
    }

    #[test]
    fn friday_evening_sleeps_until_monday() {
        let now = ny(2026, 3, 6, 18, 0);
        match gate(now) {
            Gate::SleepUntil(start) => {
                assert_eq!(start, ny(2026, 3, 9, 9, 15));
            }
            Gate::Active => panic!("friday evening must not be active"),
        }
    }

    #[test]
    fn last_close_steps_over_weekend() {
        // Sunday afternoon -> previous Friday 16:00
        let now = ny(2026, 3, 8, 15, 0);
        assert_eq!(last_session_close(now), ny(2026, 3, 6, 16, 0));
        // mid-session -> yesterday's close
        let now = ny(2026, 3, 3, 11, 0);
        assert_eq!(last_session_close(now), ny(2026, 3, 2, 16, 0));
    }
}
