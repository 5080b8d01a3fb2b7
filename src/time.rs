//! Clock helpers: monotonic microsecond time and the NTP 32.32 fixed-point
//! format used by RTCP sender reports.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// NTP epoch offset: seconds between 1900-01-01 and 1970-01-01.
pub const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// Monotonic clock for all in-core timestamps (microseconds).
///
/// Every context derives its times from one `MonotonicClock` so that
/// timeouts, RTCP intervals and statistics windows are mutually comparable.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Microseconds elapsed since this clock was created.
    pub fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    /// Convert a microsecond value from this clock back to an `Instant`.
    pub fn instant_at(&self, us: u64) -> Instant {
        self.origin + Duration::from_micros(us)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Current wall clock as an NTP timestamp (seconds since 1900, 32.32 fixed
/// point).
pub fn ntp_now() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs() + NTP_EPOCH_OFFSET;
    let frac = ((now.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// Convert microseconds to the NTP 32.32 fixed-point format.
pub fn us_to_ntp(us: u64) -> u64 {
    let secs = us / 1_000_000;
    let frac = ((us % 1_000_000) << 32) / 1_000_000;
    (secs << 32) | frac
}

/// Convert an NTP 32.32 fixed-point value to microseconds.
pub fn ntp_to_us(ntp: u64) -> u64 {
    let secs = ntp >> 32;
    let frac = ntp & 0xFFFF_FFFF;
    secs * 1_000_000 + ((frac * 1_000_000) >> 32)
}

/// Middle 32 bits of an NTP timestamp (the LSR field of a reception report).
pub fn ntp_middle32(ntp: u64) -> u32 {
    ((ntp >> 16) & 0xFFFF_FFFF) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now_us();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.now_us();
        assert!(b > a);
    }

    #[test]
    fn test_ntp_now_reasonable() {
        let ntp = ntp_now();
        let secs = ntp >> 32;
        // Well past year 2020 in NTP epoch.
        assert!(secs > NTP_EPOCH_OFFSET + 50 * 365 * 86400);
    }

    #[test]
    fn test_us_ntp_roundtrip() {
        for us in [0u64, 1, 999_999, 1_000_000, 1_234_567_890] {
            let back = ntp_to_us(us_to_ntp(us));
            // The 32.32 fraction has sub-microsecond resolution, so the
            // round trip may lose at most 1 us.
            assert!(back.abs_diff(us) <= 1, "us={us} back={back}");
        }
    }

    #[test]
    fn test_ntp_middle32() {
        let ntp = 0x1122_3344_5566_7788u64;
        assert_eq!(ntp_middle32(ntp), 0x3344_5566);
    }
}
