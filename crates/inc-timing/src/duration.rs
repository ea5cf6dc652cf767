use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Sub, SubAssign};
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};

/// Wall-clock duration used for operation timeouts, reconnect intervals, and
/// ACK windows. A thin newtype over [`std::time::Duration`] so callers have a
/// single duration type to depend on across the fabric.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct Duration(StdDuration);

impl Duration {
    pub const MAX: Self = Self(StdDuration::MAX);
    pub const ZERO: Self = Self(StdDuration::ZERO);
    pub const MIN: Self = Self(StdDuration::ZERO);
    pub const MILLIS_10: Self = Self::from_millis(10);
    pub const MILLIS_5: Self = Self::from_millis(5);

    #[inline]
    pub fn saturating_sub(self, rhs: Duration) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub fn saturating_add(self, rhs: Duration) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Self(StdDuration::from_secs(s))
    }

    #[inline]
    pub const fn from_mins(m: u64) -> Self {
        Self::from_secs(m * 60)
    }

    #[inline]
    pub fn from_secs_f64(s: f64) -> Self {
        Self(StdDuration::from_secs_f64(s))
    }

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Self(StdDuration::from_millis(ms))
    }

    #[inline]
    pub const fn from_micros(us: u64) -> Self {
        Self(StdDuration::from_micros(us))
    }

    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(StdDuration::from_nanos(ns))
    }

    #[inline]
    pub fn as_secs(&self) -> f64 {
        self.0.as_secs_f64()
    }

    #[inline]
    pub fn as_millis(&self) -> f64 {
        self.0.as_secs_f64() * 1_000.0
    }

    #[inline]
    pub fn as_micros(&self) -> f64 {
        self.0.as_secs_f64() * 1_000_000.0
    }

    #[inline]
    pub fn as_micros_u128(&self) -> u128 {
        self.0.as_micros()
    }

    #[inline]
    pub fn as_nanos(&self) -> f64 {
        self.0.as_nanos() as f64
    }
}

impl std::fmt::Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<u64> for Duration {
    fn from(nanos: u64) -> Self {
        Self::from_nanos(nanos)
    }
}

impl From<Duration> for u64 {
    fn from(value: Duration) -> Self {
        value.0.as_nanos() as u64
    }
}

impl Add for Duration {
    type Output = Duration;

    #[inline]
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Duration {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Duration {
    #[inline]
    fn sub_assign(&mut self, rhs: Duration) {
        *self = *self - rhs;
    }
}

impl Mul<u32> for Duration {
    type Output = Duration;

    #[inline]
    fn mul(self, rhs: u32) -> Duration {
        Duration(self.0 * rhs)
    }
}

impl Mul<Duration> for u32 {
    type Output = Duration;

    #[inline]
    fn mul(self, rhs: Duration) -> Duration {
        rhs * self
    }
}

impl MulAssign<u32> for Duration {
    #[inline]
    fn mul_assign(&mut self, rhs: u32) {
        *self = *self * rhs;
    }
}

impl Div<u32> for Duration {
    type Output = Duration;

    #[inline]
    fn div(self, rhs: u32) -> Duration {
        Duration(self.0 / rhs)
    }
}

impl DivAssign<u32> for Duration {
    #[inline]
    fn div_assign(&mut self, rhs: u32) {
        *self = *self / rhs;
    }
}

impl Div<Duration> for Duration {
    type Output = f64;

    #[inline]
    fn div(self, rhs: Duration) -> f64 {
        self.0.as_secs_f64() / rhs.0.as_secs_f64()
    }
}

impl PartialEq for Duration {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Duration {}

impl PartialOrd for Duration {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Duration {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl From<Duration> for f64 {
    #[inline]
    fn from(value: Duration) -> f64 {
        value.as_nanos()
    }
}

impl std::iter::Sum for Duration {
    #[inline]
    fn sum<I>(iter: I) -> Self
    where
        I: Iterator<Item = Self>,
    {
        Duration(iter.map(|v| v.0).sum())
    }
}

impl<'a> std::iter::Sum<&'a Self> for Duration {
    #[inline]
    fn sum<I>(iter: I) -> Self
    where
        I: Iterator<Item = &'a Self>,
    {
        Duration(iter.map(|v| v.0).sum())
    }
}

impl From<Duration> for StdDuration {
    #[inline]
    fn from(value: Duration) -> Self {
        value.0
    }
}

impl From<StdDuration> for Duration {
    #[inline]
    fn from(value: StdDuration) -> Self {
        Self(value)
    }
}
