/*
 * Wall-Clock Snapshots
 *
 * The scheduler refreshes one wall-clock snapshot per loop pass and uses
 * it as the sole time reference for that pass. This module provides the
 * snapshot type and the millisecond arithmetic the timer tree needs.
 */

use std::ptr;

/// A wall-clock instant with microsecond resolution.
///
/// The derived ordering is lexicographic on (sec, usec), which is exactly
/// the comparison the timer tree is keyed by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timeval {
    pub sec: i64,
    pub usec: i64,
}

impl Timeval {
    /// The zero instant. Tasks scheduled "immediately" carry this target
    /// time, which sorts before any real clock reading.
    pub const ZERO: Timeval = Timeval { sec: 0, usec: 0 };

    /// Read the current wall clock.
    pub fn now() -> Timeval {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        // gettimeofday cannot fail with a valid pointer and a null timezone.
        unsafe {
            libc::gettimeofday(&mut tv, ptr::null_mut());
        }
        Timeval {
            sec: tv.tv_sec as i64,
            usec: tv.tv_usec as i64,
        }
    }

    pub fn is_zero(self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    /// This instant plus `ms` milliseconds, with the microsecond field
    /// kept normalized below one second.
    pub fn add_ms(self, ms: u32) -> Timeval {
        let mut sec = self.sec + (ms / 1000) as i64;
        let mut usec = self.usec + ((ms % 1000) as i64) * 1000;
        if usec >= 1_000_000 {
            sec += 1;
            usec -= 1_000_000;
        }
        Timeval { sec, usec }
    }

    /// Milliseconds from `earlier` up to this instant, truncated.
    ///
    /// Sub-millisecond remainders are dropped, so a caller sleeping on the
    /// result wakes at or before the target, never after it. Returns 0
    /// when `earlier` is not actually earlier.
    pub fn delta_ms(self, earlier: Timeval) -> u32 {
        if self <= earlier {
            return 0;
        }
        let mut sec = self.sec - earlier.sec;
        let mut usec = self.usec - earlier.usec;
        if usec < 0 {
            sec -= 1;
            usec += 1_000_000;
        }
        let ms = sec * 1000 + usec / 1000;
        ms.clamp(0, u32::MAX as i64) as u32
    }
}
