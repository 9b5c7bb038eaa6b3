use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

const MICROS_PER_SEC: i64 = 1_000_000;

/// An absolute point on the monotonic clock, in microseconds.
///
/// This is the time base for everything in the runtime: poll return times
/// handed to read callbacks, timer expirations, and the timer descriptor's
/// absolute arming. It deliberately is not wall-clock time; it never jumps.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// Read the monotonic clock.
    pub fn now() -> Timestamp {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // The monotonic clock is always available on the supported
        // platforms; a failure here means the process state is beyond
        // saving.
        if syscall!(clock_gettime(libc::CLOCK_MONOTONIC, &mut ts)).is_err() {
            panic!("clock_gettime(CLOCK_MONOTONIC) failed");
        }
        Timestamp {
            micros: ts.tv_sec * MICROS_PER_SEC + ts.tv_nsec / 1_000,
        }
    }

    pub fn from_micros(micros: i64) -> Timestamp {
        Timestamp { micros }
    }

    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    /// Elapsed time since `earlier`, zero if `earlier` is in the future.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        if self.micros <= earlier.micros {
            Duration::ZERO
        } else {
            Duration::from_micros((self.micros - earlier.micros) as u64)
        }
    }

    pub(crate) fn to_timespec(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.micros / MICROS_PER_SEC,
            tv_nsec: (self.micros % MICROS_PER_SEC) * 1_000,
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp {
            micros: self.micros + rhs.as_micros() as i64,
        }
    }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) {
        self.micros += rhs.as_micros() as i64;
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.duration_since(rhs)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timestamp({}.{:06}s)",
            self.micros / MICROS_PER_SEC,
            self.micros % MICROS_PER_SEC
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.micros / MICROS_PER_SEC,
            self.micros % MICROS_PER_SEC
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Timestamp;
    use std::time::Duration;

    #[test]
    fn monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b >= a);
    }

    #[test]
    fn arithmetic() {
        let t = Timestamp::from_micros(1_500_000);
        let later = t + Duration::from_millis(250);
        assert_eq!(later.as_micros(), 1_750_000);
        assert_eq!(later.duration_since(t), Duration::from_millis(250));
        // Saturates instead of going negative.
        assert_eq!(t.duration_since(later), Duration::ZERO);
    }
}
