use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time for expiry decisions.
///
/// Credential expiries are absolute Unix timestamps, so entries are compared
/// against `SystemTime` rather than a monotonic clock.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    fn now(&self) -> SystemTime;
}

/// Longest lifetime an entry can be given.
pub const MAX_LIFETIME: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + lifetime`, with the lifetime capped at [`MAX_LIFETIME`].
///
/// Never panics; if even the capped instant cannot be represented the result is `now`.
pub fn expiry_after(now: SystemTime, lifetime: Duration) -> SystemTime {
    now.checked_add(lifetime.min(MAX_LIFETIME)).unwrap_or(now)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to. Millisecond resolution.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            millis: AtomicU64::new(to_millis(start)),
        }
    }

    /// A clock starting `secs` seconds after the Unix epoch.
    pub fn at_unix(secs: u64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: SystemTime) {
        self.millis.store(to_millis(to), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::at_unix(1_000);
        assert_eq!(clock.now(), UNIX_EPOCH + Duration::from_secs(1_000));

        clock.advance(Duration::from_millis(1_500));
        assert_eq!(clock.now(), UNIX_EPOCH + Duration::from_millis(1_001_500));
    }

    #[test]
    fn test_expiry_after_caps_lifetime() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        assert_eq!(
            expiry_after(now, Duration::from_secs(60)),
            now + Duration::from_secs(60)
        );
        assert_eq!(expiry_after(now, Duration::MAX), now + MAX_LIFETIME);
    }

    #[test]
    fn test_manual_clock_set() {
        let clock = ManualClock::at_unix(0);
        clock.set(UNIX_EPOCH + Duration::from_secs(42));
        assert_eq!(clock.now(), UNIX_EPOCH + Duration::from_secs(42));
    }
}
