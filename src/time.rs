/*! Time structures.

The protocol runs on a 32-bit millisecond clock that is allowed to wrap:
all arithmetic on [Instant] is performed modulo 2³², the same way sequence
numbers wrap. An `Instant` is only meaningful relative to other instants
from the same clock; there is no epoch.
*/

use core::{fmt, ops};

/// A point in time, expressed in milliseconds on a wrapping 32-bit
/// monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Instant {
    millis: u32,
}

impl Instant {
    /// Create an instant from a raw millisecond counter value.
    pub const fn from_millis(millis: u32) -> Instant {
        Instant { millis }
    }

    /// Sample the operating system's monotonic clock.
    ///
    /// The value wraps roughly every 49.7 days, which the wrapped
    /// arithmetic below is built to tolerate.
    pub fn now() -> Instant {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        let millis = (ts.tv_sec as u64)
            .wrapping_mul(1000)
            .wrapping_add(ts.tv_nsec as u64 / 1_000_000);
        Instant {
            millis: millis as u32,
        }
    }

    /// The raw counter value.
    pub const fn total_millis(&self) -> u32 {
        self.millis
    }

    /// Whether `self` lies before `other` on the wrapping clock.
    ///
    /// Like sequence numbers, instants have no total order; this is only
    /// meaningful for instants less than 2³¹ ms apart.
    pub fn is_before(&self, other: Instant) -> bool {
        (self.millis.wrapping_sub(other.millis) as i32) < 0
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ms", self.millis)
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant::from_millis(self.millis.wrapping_add(rhs.millis))
    }
}

impl ops::Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant::from_millis(self.millis.wrapping_sub(rhs.millis))
    }
}

impl ops::Sub<Instant> for Instant {
    type Output = Duration;

    /// Elapsed time since `rhs`. Unsigned wrapping arithmetic does all
    /// the magic, exactly as for sequence numbers.
    fn sub(self, rhs: Instant) -> Duration {
        Duration::from_millis(self.millis.wrapping_sub(rhs.millis))
    }
}

/// A relative amount of time, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration {
    millis: u32,
}

impl Duration {
    pub const ZERO: Duration = Duration::from_millis(0);
    pub const MAX: Duration = Duration::from_millis(u32::MAX);

    pub const fn from_millis(millis: u32) -> Duration {
        Duration { millis }
    }

    pub const fn from_secs(secs: u32) -> Duration {
        Duration {
            millis: secs * 1000,
        }
    }

    pub const fn total_millis(&self) -> u32 {
        self.millis
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ms", self.millis)
    }
}

impl ops::Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration::from_millis(self.millis.saturating_add(rhs.millis))
    }
}
