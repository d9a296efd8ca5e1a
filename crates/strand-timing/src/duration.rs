use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::clock::{cycles_per_usec, nanos_for_1m};

/// A cycle-counter delta.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
pub struct Duration(pub u64);

impl Duration {
    pub const MAX: Self = Self(u64::MAX);
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn from_usecs(us: u64) -> Self {
        Self(us.saturating_mul(cycles_per_usec()))
    }

    #[inline]
    pub fn from_millis(ms: u64) -> Self {
        Self::from_usecs(ms.saturating_mul(1_000))
    }

    #[inline]
    pub fn as_usecs(&self) -> u64 {
        self.0 / cycles_per_usec()
    }

    #[inline]
    pub fn as_nanos(&self) -> u64 {
        // nanos = cycles * nanos_for_1m / 1M, in u128 to dodge overflow
        ((self.0 as u128 * nanos_for_1m() as u128) / 1_000_000) as u64
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Duration) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub fn saturating_add(self, rhs: Duration) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl From<Duration> for std::time::Duration {
    fn from(value: Duration) -> Self {
        std::time::Duration::from_nanos(value.as_nanos())
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

impl Sub for Duration {
    type Output = Duration;

    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Duration) {
        self.0 = self.0.saturating_sub(rhs.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn usec_round_trip() {
        let d = Duration::from_usecs(250);
        let us = d.as_usecs();
        assert!((249..=251).contains(&us), "got {us}us");
    }

    #[test]
    fn millis_to_std() {
        let d = Duration::from_millis(50);
        let std: std::time::Duration = d.into();
        let ms = std.as_millis();
        assert!((49..=51).contains(&ms), "got {ms}ms");
    }
}
