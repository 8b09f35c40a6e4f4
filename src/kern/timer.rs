//! Boot-time clock
//!
//! Monotonic nanosecond clock with a per-boot origin, advanced by the
//! timer interrupt. Everything that needs a timestamp (task accounting,
//! sleep deadlines, the shell `uptime` command) reads this clock.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::types::NANOSECS_IN_SEC;

/// Timer interrupt rate
pub const TIMER_HZ: u64 = 1000;

/// Clock advance per timer tick
pub const NS_PER_TICK: u64 = NANOSECS_IN_SEC / TIMER_HZ;

static BOOT_TIME_NS: AtomicU64 = AtomicU64::new(0);

/// Nanoseconds since boot
pub fn boot_time() -> u64 {
    BOOT_TIME_NS.load(Ordering::Acquire)
}

/// Advance the clock by one tick. Called from the boot processor's
/// timer interrupt only, so ticks are never double counted.
pub fn tick() {
    BOOT_TIME_NS.fetch_add(NS_PER_TICK, Ordering::AcqRel);
}

/// Seconds part of the uptime
pub fn uptime_secs() -> u64 {
    boot_time() / NANOSECS_IN_SEC
}

/// Milliseconds part of the uptime below one second
pub fn uptime_millis() -> u64 {
    (boot_time() % NANOSECS_IN_SEC) / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_advances_clock() {
        let before = boot_time();
        tick();
        tick();
        assert_eq!(boot_time(), before + 2 * NS_PER_TICK);
    }
}
