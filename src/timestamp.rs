use std::fmt;
use std::ops::Add;
use std::time::Duration;

const MICROS_PER_SEC: i64 = 1_000_000;

/// A monotonic timestamp with microsecond resolution.
///
/// Backed by `CLOCK_MONOTONIC`, so it is unaffected by wall-clock jumps
/// and suitable both for receive timestamps and timer expirations.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Returns the current monotonic time.
    pub fn now() -> Timestamp {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let res = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        debug_assert_eq!(res, 0);
        Timestamp(ts.tv_sec as i64 * MICROS_PER_SEC + ts.tv_nsec as i64 / 1_000)
    }

    /// Microseconds since the monotonic clock's (unspecified) epoch.
    pub fn micros(self) -> i64 {
        self.0
    }

    pub(crate) fn from_micros(micros: i64) -> Timestamp {
        Timestamp(micros)
    }

    /// The elapsed time from `earlier` to `self`, zero if `earlier` is
    /// actually later.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros((self.0 - earlier.0).max(0) as u64)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "Timestamp({}.{:06}s)",
            self.0 / MICROS_PER_SEC,
            self.0 % MICROS_PER_SEC
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Timestamp;
    use std::time::Duration;

    #[test]
    fn ordering_and_arithmetic() {
        let t0 = Timestamp::now();
        let t1 = t0 + Duration::from_millis(5);
        assert!(t0 < t1);
        assert_eq!(t1.saturating_duration_since(t0), Duration::from_millis(5));
        assert_eq!(t0.saturating_duration_since(t1), Duration::ZERO);
    }

    #[test]
    fn monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a <= b);
    }
}
