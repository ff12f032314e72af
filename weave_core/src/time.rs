//! Simulation virtual time.
//!
//! Time is a fixed-point signed count of base ticks, 10⁹ ticks per second, so
//! a tick is one nanosecond and the representable range is roughly ±292
//! years of simulated time. All coordination messages carry times in this
//! form; floating-point seconds only appear at the user API boundary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of base ticks per simulated second.
pub const TICKS_PER_SECOND: i64 = 1_000_000_000;

/// A point in (or span of) simulated time, in base ticks.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Time(i64);

impl Time {
    pub const ZERO: Time = Time(0);
    /// The minimum resolvable time step.
    pub const EPSILON: Time = Time(1);
    pub const NEG_EPSILON: Time = Time(-1);
    /// Sentinel meaning "unbounded"; arithmetic saturates here.
    pub const MAX_TIME: Time = Time(i64::MAX);
    /// Marker for end-of-simulation requests. Distinct from [`Time::MAX_TIME`]
    /// so that adding delays to it cannot wrap.
    pub const BIG_TIME: Time = Time(9_223_372_036_000_000_000);
    /// The time value federates hold before entering execution.
    pub const INITIALIZATION: Time = Time::NEG_EPSILON;

    pub const fn from_ticks(ticks: i64) -> Self {
        Time(ticks)
    }

    pub const fn ticks(self) -> i64 {
        self.0
    }

    /// Whole milliseconds, used for wall-clock pacing.
    pub const fn from_millis(ms: i64) -> Self {
        Time(ms * (TICKS_PER_SECOND / 1000))
    }

    pub fn from_seconds(seconds: f64) -> Self {
        if seconds >= Self::BIG_TIME.to_seconds() {
            Self::MAX_TIME
        } else {
            Time((seconds * TICKS_PER_SECOND as f64).round() as i64)
        }
    }

    pub fn to_seconds(self) -> f64 {
        self.0 as f64 / TICKS_PER_SECOND as f64
    }

    pub fn is_max(self) -> bool {
        self >= Self::BIG_TIME
    }

    /// Addition saturating at [`Time::MAX_TIME`]; the sentinel is absorbing.
    pub fn saturating_add(self, rhs: Time) -> Time {
        if self.is_max() || rhs.is_max() {
            Self::MAX_TIME
        } else {
            Time(self.0.saturating_add(rhs.0))
        }
    }

    pub fn saturating_sub(self, rhs: Time) -> Time {
        if self.is_max() {
            Self::MAX_TIME
        } else {
            Time(self.0.saturating_sub(rhs.0))
        }
    }
}

impl std::ops::Add for Time {
    type Output = Time;

    fn add(self, rhs: Time) -> Time {
        self.saturating_add(rhs)
    }
}

impl std::ops::Sub for Time {
    type Output = Time;

    fn sub(self, rhs: Time) -> Time {
        self.saturating_sub(rhs)
    }
}

impl std::ops::AddAssign for Time {
    fn add_assign(&mut self, rhs: Time) {
        *self = *self + rhs;
    }
}

impl From<Duration> for Time {
    fn from(d: Duration) -> Self {
        Time(d.as_nanos().min(i64::MAX as u128) as i64)
    }
}

impl TryFrom<Time> for Duration {
    type Error = std::num::TryFromIntError;

    fn try_from(t: Time) -> Result<Self, Self::Error> {
        u64::try_from(t.0).map(Duration::from_nanos)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_max() {
            write!(f, "maxTime")
        } else {
            write!(f, "{}s", self.to_seconds())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(Time::from_seconds(1.0).ticks(), TICKS_PER_SECOND);
        assert_eq!(Time::from_seconds(0.25).to_seconds(), 0.25);
        assert_eq!(Time::from(Duration::from_millis(1)), Time::from_millis(1));
        assert_eq!(
            Duration::try_from(Time::from_seconds(2.0)).unwrap(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn sentinel_is_absorbing() {
        assert_eq!(Time::MAX_TIME + Time::from_seconds(1.0), Time::MAX_TIME);
        assert_eq!(Time::BIG_TIME + Time::EPSILON, Time::MAX_TIME);
        assert_eq!(Time::MAX_TIME - Time::EPSILON, Time::MAX_TIME);
        assert!(Time::BIG_TIME.is_max());
    }

    #[test]
    fn ordering() {
        assert!(Time::NEG_EPSILON < Time::ZERO);
        assert!(Time::ZERO < Time::EPSILON);
        assert_eq!(Time::ZERO.max(Time::EPSILON), Time::EPSILON);
    }
}
