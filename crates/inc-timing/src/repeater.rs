use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::{Duration, Instant};

/// Polls an interval against a wall clock without owning a background timer
/// thread. `Context`'s reconnect timer and `Operation`'s timeout check both
/// drive this from their own `poll`/tick call.
#[derive(Clone, Copy, Debug)]
pub struct Repeater {
    interval: Duration,
    last_acted: Option<Instant>,
}

impl Default for Repeater {
    fn default() -> Self {
        Self { interval: Duration::ZERO, last_acted: None }
    }
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: None }
    }

    #[inline]
    pub fn maybe<F>(&mut self, mut f: F)
    where
        F: FnMut(Duration),
    {
        let el = self.last_acted.map_or(Duration::MAX, |t| t.elapsed());
        if el >= self.interval {
            f(el);
            self.last_acted = Some(Instant::now());
        }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        let el = self.last_acted.map_or(Duration::MAX, |t| t.elapsed());
        if el >= self.interval {
            self.last_acted = Some(Instant::now());
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval
    }

    pub fn reset(&mut self) {
        self.last_acted = Some(Instant::now())
    }

    pub fn force_fire(&mut self) {
        self.last_acted = None
    }
}

impl Add<Duration> for Repeater {
    type Output = Repeater;
    fn add(self, rhs: Duration) -> Self::Output {
        Repeater { interval: self.interval.saturating_add(rhs), ..self }
    }
}

impl Sub<Duration> for Repeater {
    type Output = Repeater;
    fn sub(self, rhs: Duration) -> Self::Output {
        Repeater { interval: self.interval.saturating_sub(rhs), ..self }
    }
}

impl AddAssign<Duration> for Repeater {
    fn add_assign(&mut self, rhs: Duration) {
        self.interval = self.interval.saturating_add(rhs);
    }
}

impl SubAssign<Duration> for Repeater {
    fn sub_assign(&mut self, rhs: Duration) {
        self.interval = self.interval.saturating_sub(rhs);
    }
}
