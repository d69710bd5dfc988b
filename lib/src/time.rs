//! Simulation time.
//!
//! [`UT`] counts seconds past the J2000 epoch (2000-01-01 12:00:00) on a
//! uniform scale; leap seconds are not modelled.

use std::{fmt, ops};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{format_description, Date, Duration, Month, PrimitiveDateTime, Time};

/// Largest single clock step accepted, in seconds.
const MAX_STEP_SECONDS: f64 = 1.0e12;

#[derive(Debug, Error)]
pub enum TimeError {
    #[error("invalid calendar format description: {0}")]
    Format(#[from] time::error::InvalidFormatDescription),
    #[error("could not parse calendar epoch: {0}")]
    Parse(#[from] time::error::Parse),
    #[error("calendar component out of range: {0}")]
    Range(#[from] time::error::ComponentRange),
    #[error("calendar epoch `{0}` is outside the supported range")]
    OutOfRange(String),
    #[error("time warp must be finite and non-negative, got {0}")]
    InvalidWarp(f64),
}

#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct UT(Duration);

impl UT {
    pub const J2000: UT = UT(Duration::ZERO);

    pub fn new_dhms(days: u32, hours: u8, minutes: u8, seconds: u8, millis: u16) -> Self {
        Self(Duration::new(
            seconds as i64
                + 60 * minutes as i64
                + 60 * 60 * hours as i64
                + 60 * 60 * 24 * days as i64,
            millis as i32 * 1_000_000,
        ))
    }

    pub fn new_seconds(sec: f64) -> UT {
        UT::from_duration(Duration::seconds_f64(sec))
    }

    pub fn is_negative(self) -> bool {
        self.0.is_negative()
    }

    pub fn into_duration(self) -> Duration {
        self.0
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self(duration)
    }

    /// `self + duration`, or `None` when the result does not fit.
    pub fn checked_add(self, duration: Duration) -> Option<UT> {
        self.0.checked_add(duration).map(UT)
    }

    /// Seconds past J2000.
    pub fn as_seconds_f64(self) -> f64 {
        self.0.as_seconds_f64()
    }

    /// Days past J2000.
    pub fn as_days_f64(self) -> f64 {
        self.0.as_seconds_f64() / 86_400.0
    }

    /// Parse a calendar epoch such as `2025-05-11T00:00:00` or `2025-05-11`.
    pub fn from_calendar(epoch: &str) -> Result<UT, TimeError> {
        let epoch = epoch.trim();
        let datetime = if epoch.contains('T') {
            let format =
                format_description::parse("[year]-[month]-[day]T[hour]:[minute]:[second]")?;
            PrimitiveDateTime::parse(epoch, &format)?
        } else {
            let format = format_description::parse("[year]-[month]-[day]")?;
            Date::parse(epoch, &format)?.midnight()
        };
        Ok(UT(datetime - j2000()?))
    }

    /// The calendar date and time of this instant, if representable.
    pub fn to_calendar(self) -> Option<PrimitiveDateTime> {
        j2000().ok()?.checked_add(self.0)
    }
}

fn j2000() -> Result<PrimitiveDateTime, TimeError> {
    Ok(PrimitiveDateTime::new(
        Date::from_calendar_date(2000, Month::January, 1)?,
        Time::from_hms(12, 0, 0)?,
    ))
}

impl ops::Sub<UT> for UT {
    type Output = Duration;

    fn sub(self, rhs: UT) -> Self::Output {
        self.0 - rhs.0
    }
}

impl ops::Sub<Duration> for UT {
    type Output = UT;

    fn sub(self, rhs: Duration) -> Self::Output {
        UT(self.0 - rhs)
    }
}

impl ops::Add<Duration> for UT {
    type Output = UT;

    fn add(self, rhs: Duration) -> Self::Output {
        UT(self.0 + rhs)
    }
}

impl fmt::Display for UT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UT({}s)", self.0.as_seconds_f64())
    }
}

impl fmt::Debug for UT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Simulation time provider.
///
/// Time advances by wall-clock seconds scaled by the time warp and never
/// moves backwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimClock {
    now: UT,
    warp: f64,
    paused: bool,
}

impl SimClock {
    pub fn new(start: UT) -> Self {
        Self {
            now: start,
            warp: 1.0,
            paused: false,
        }
    }

    pub fn now(&self) -> UT {
        self.now
    }

    pub fn time_warp(&self) -> f64 {
        self.warp
    }

    pub fn set_time_warp(&mut self, warp: f64) -> Result<(), TimeError> {
        if !warp.is_finite() || warp < 0.0 {
            return Err(TimeError::InvalidWarp(warp));
        }
        self.warp = warp;
        Ok(())
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Advance by `wall_dt` wall-clock seconds and return the new time.
    ///
    /// Negative, non-finite and oversized steps leave the clock untouched.
    pub fn advance(&mut self, wall_dt: f64) -> UT {
        if self.paused || !wall_dt.is_finite() || wall_dt <= 0.0 {
            return self.now;
        }
        let dt = wall_dt * self.warp;
        if !dt.is_finite() || dt > MAX_STEP_SECONDS {
            tracing::debug!(wall_dt, warp = self.warp, "ignoring out-of-range clock step");
            return self.now;
        }
        if let Some(next) = self.now.checked_add(Duration::seconds_f64(dt)) {
            self.now = next;
        }
        self.now
    }
}

#[test]
fn calendar_epoch_round_trips_through_j2000() {
    let j2000 = UT::from_calendar("2000-01-01T12:00:00").unwrap();
    assert_eq!(j2000, UT::J2000);

    let epoch = UT::from_calendar("2025-05-11T00:00:00").unwrap();
    // 9261.5 days after J2000
    assert!((epoch.as_days_f64() - 9261.5).abs() < 1e-9);
    let date = epoch.to_calendar().unwrap();
    assert_eq!(date.year(), 2025);
    assert_eq!(date.month(), Month::May);
    assert_eq!(date.day(), 11);

    let midnight = UT::from_calendar("2025-05-11").unwrap();
    assert_eq!(midnight, epoch);
}

#[test]
fn bad_calendar_epoch_is_rejected() {
    assert!(UT::from_calendar("yesterday").is_err());
    assert!(UT::from_calendar("2025-13-40T00:00:00").is_err());
}

#[test]
fn clock_never_moves_backwards() {
    let mut clock = SimClock::new(UT::new_seconds(100.0));
    clock.set_time_warp(10.0).unwrap();
    assert_eq!(clock.advance(1.5), UT::new_seconds(115.0));
    assert_eq!(clock.advance(-5.0), UT::new_seconds(115.0));
    assert_eq!(clock.advance(f64::NAN), UT::new_seconds(115.0));
    assert!(clock.set_time_warp(-1.0).is_err());
    assert_eq!(clock.time_warp(), 10.0);

    clock.pause();
    assert_eq!(clock.advance(10.0), UT::new_seconds(115.0));
    clock.resume();
    clock.set_time_warp(0.0).unwrap();
    assert_eq!(clock.advance(10.0), UT::new_seconds(115.0));
}
