#![forbid(unsafe_code)]

//! Hybrid logical clock for transaction timestamps.
//!
//! A timestamp packs whole seconds since a local epoch (high part) and a per-second
//! counter (low part) into one integer that stays inside the 53-bit safe range, so it
//! survives a round trip through JSON clients. Packing uses multiply/add, not shifts.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub type Timestamp = i64;

/// Largest integer exactly representable in an IEEE double.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Counter values per second; also the multiplier for the time component.
pub const COUNTER_LIMIT: i64 = 0x0F_FFFF;

pub const BEGINNING_OF_TIME: Timestamp = 0;
pub const END_OF_TIME: Timestamp = MAX_SAFE_INTEGER;

/// 2020-01-01T00:00:00Z
pub const LOCAL_EPOCH_START_UNIX_SECS: i64 = 1_577_836_800;

/// Largest time component that still leaves room for a full counter below `END_OF_TIME`.
pub const MAX_TIME_COMPONENT: i64 = END_OF_TIME / COUNTER_LIMIT - 1;

/// Default freeze point: 1024 seconds of counter budget (~1 billion events) are left
/// once wall time stops advancing the time component.
pub const DEFAULT_FREEZE_AFTER: i64 = MAX_TIME_COMPONENT - 1024;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    #[error("timestamp space exhausted after {last}")]
    Exhausted { last: Timestamp },
    #[error("invalid time component {time}")]
    InvalidTime { time: i64 },
    #[error("invalid counter component {counter}")]
    InvalidCounter { counter: i64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub epoch_start_unix_secs: i64,
    pub freeze_after: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            epoch_start_unix_secs: LOCAL_EPOCH_START_UNIX_SECS,
            freeze_after: DEFAULT_FREEZE_AFTER,
        }
    }
}

pub fn make_timestamp(time: i64, counter: i64) -> Result<Timestamp, ClockError> {
    if !(0..=MAX_TIME_COMPONENT).contains(&time) {
        return Err(ClockError::InvalidTime { time });
    }
    if !(0..COUNTER_LIMIT).contains(&counter) {
        return Err(ClockError::InvalidCounter { counter });
    }
    Ok(time * COUNTER_LIMIT + counter)
}

pub fn extract_time(timestamp: Timestamp) -> i64 {
    timestamp.div_euclid(COUNTER_LIMIT)
}

pub fn extract_counter(timestamp: Timestamp) -> i64 {
    timestamp.rem_euclid(COUNTER_LIMIT)
}

/// Returns a timestamp strictly greater than `last`.
///
/// `now` is the wall time in seconds since the local epoch. When it is ahead of the time
/// component of `last` the result is `(now, 0)`; otherwise the counter is bumped, which
/// borrows from the following second once a second's budget is spent.
pub fn next_time(last: Timestamp, now: i64, freeze_after: i64) -> Result<Timestamp, ClockError> {
    let now = now.min(freeze_after).min(MAX_TIME_COMPONENT).max(0);
    if now > extract_time(last) {
        return make_timestamp(now, 0);
    }
    match last.checked_add(1) {
        Some(next) if next < END_OF_TIME => Ok(next),
        _ => Err(ClockError::Exhausted { last }),
    }
}

pub trait WallClock {
    fn now_unix_secs(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_unix_secs(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(duration) => i64::try_from(duration.as_secs()).unwrap_or(i64::MAX),
            Err(_) => 0,
        }
    }
}

#[derive(Debug)]
pub struct Clock<W = SystemWallClock> {
    config: ClockConfig,
    last: Timestamp,
    wall: W,
}

impl Clock<SystemWallClock> {
    pub fn new(config: ClockConfig, last: Timestamp) -> Self {
        Self::with_wall_clock(config, last, SystemWallClock)
    }
}

impl<W: WallClock> Clock<W> {
    pub fn with_wall_clock(config: ClockConfig, last: Timestamp, wall: W) -> Self {
        Self { config, last, wall }
    }

    pub fn last(&self) -> Timestamp {
        self.last
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Raises the floor so later allocations never reuse an already observed timestamp.
    pub fn observe(&mut self, seen: Timestamp) {
        if seen != END_OF_TIME && seen > self.last {
            self.last = seen;
        }
    }

    pub fn next_time(&mut self) -> Result<Timestamp, ClockError> {
        let now = self
            .wall
            .now_unix_secs()
            .saturating_sub(self.config.epoch_start_unix_secs);
        let next = next_time(self.last, now, self.config.freeze_after)?;
        self.last = next;
        Ok(next)
    }
}

pub fn format_timestamp_utc(timestamp: Timestamp, config: &ClockConfig) -> String {
    match timestamp {
        BEGINNING_OF_TIME => "BEGINNING_OF_TIME".to_string(),
        END_OF_TIME => "END_OF_TIME".to_string(),
        _ => {
            let secs = config
                .epoch_start_unix_secs
                .saturating_add(extract_time(timestamp));
            let counter = extract_counter(timestamp);
            match OffsetDateTime::from_unix_timestamp(secs)
                .ok()
                .and_then(|at| at.format(&Rfc3339).ok())
            {
                Some(text) => format!("{text}-{counter}"),
                None => format!("{timestamp}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct ManualWallClock(Cell<i64>);

    impl WallClock for &ManualWallClock {
        fn now_unix_secs(&self) -> i64 {
            self.0.get()
        }
    }

    fn config() -> ClockConfig {
        ClockConfig::default()
    }

    #[test]
    fn packs_and_unpacks_components() {
        let ts = make_timestamp(12_345, 67).unwrap();
        assert_eq!(extract_time(ts), 12_345);
        assert_eq!(extract_counter(ts), 67);
        assert_eq!(
            make_timestamp(1, COUNTER_LIMIT).unwrap_err(),
            ClockError::InvalidCounter {
                counter: COUNTER_LIMIT
            }
        );
        assert!(make_timestamp(-1, 0).is_err());
        assert!(make_timestamp(MAX_TIME_COMPONENT, COUNTER_LIMIT - 1).unwrap() < END_OF_TIME);
    }

    #[test]
    fn strictly_increasing_within_one_second() {
        let wall = ManualWallClock(Cell::new(LOCAL_EPOCH_START_UNIX_SECS + 1_000));
        let mut clock = Clock::with_wall_clock(config(), BEGINNING_OF_TIME, &wall);

        let first = clock.next_time().unwrap();
        assert_eq!(first, make_timestamp(1_000, 0).unwrap());

        let mut prev = first;
        for _ in 0..10_000 {
            let next = clock.next_time().unwrap();
            assert!(next > prev);
            prev = next;
        }
        assert_eq!(extract_time(prev), 1_000);
        assert_eq!(extract_counter(prev), 10_000);

        wall.0.set(LOCAL_EPOCH_START_UNIX_SECS + 1_001);
        let jumped = clock.next_time().unwrap();
        assert_eq!(jumped, make_timestamp(1_001, 0).unwrap());
    }

    #[test]
    fn counter_overflow_borrows_from_next_second() {
        let last = make_timestamp(500, COUNTER_LIMIT - 1).unwrap();
        let next = next_time(last, 500, DEFAULT_FREEZE_AFTER).unwrap();
        assert_eq!(next, make_timestamp(501, 0).unwrap());

        // Wall clock has not caught up with the borrowed second yet.
        let after = next_time(next, 501, DEFAULT_FREEZE_AFTER).unwrap();
        assert_eq!(after, make_timestamp(501, 1).unwrap());
    }

    #[test]
    fn never_goes_backwards_when_wall_clock_lags() {
        let last = make_timestamp(9_000, 3).unwrap();
        let next = next_time(last, 10, DEFAULT_FREEZE_AFTER).unwrap();
        assert_eq!(next, last + 1);
    }

    #[test]
    fn time_freezes_past_threshold() {
        let freeze_after = 2_000;
        let first = next_time(BEGINNING_OF_TIME, 5_000, freeze_after).unwrap();
        assert_eq!(first, make_timestamp(2_000, 0).unwrap());
        let second = next_time(first, 6_000, freeze_after).unwrap();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let last = END_OF_TIME - 1;
        assert_eq!(
            next_time(last, 0, DEFAULT_FREEZE_AFTER).unwrap_err(),
            ClockError::Exhausted { last }
        );
    }

    #[test]
    fn observe_raises_floor() {
        let wall = ManualWallClock(Cell::new(LOCAL_EPOCH_START_UNIX_SECS + 10));
        let seen = make_timestamp(50, 7).unwrap();
        let mut clock = Clock::with_wall_clock(config(), BEGINNING_OF_TIME, &wall);
        clock.observe(seen);
        clock.observe(END_OF_TIME);
        clock.observe(3);
        assert_eq!(clock.last(), seen);
        assert_eq!(clock.next_time().unwrap(), seen + 1);
    }

    #[test]
    fn formats_sentinels_and_wall_time() {
        let config = config();
        assert_eq!(
            format_timestamp_utc(BEGINNING_OF_TIME, &config),
            "BEGINNING_OF_TIME"
        );
        assert_eq!(format_timestamp_utc(END_OF_TIME, &config), "END_OF_TIME");
        let ts = make_timestamp(86_400, 4).unwrap();
        assert_eq!(format_timestamp_utc(ts, &config), "2020-01-02T00:00:00Z-4");
    }
}
