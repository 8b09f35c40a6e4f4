//! Kernel command line parameters
//!
//! Space-separated `key=value` switches from the loader command line.
//! Only a handful matter: `smp=off` keeps the machine on the boot
//! processor, `trace=<level>` tunes the log.

use core::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;

static SMP_OFF: AtomicBool = AtomicBool::new(false);

/// Parse the command line and latch the recognized switches
pub fn parse(cmdline: &str) {
    for token in cmdline.split_whitespace() {
        match token {
            "smp=off" => SMP_OFF.store(true, Ordering::Release),
            "trace=error" => crate::trace::set_level(LevelFilter::Error),
            "trace=warn" => crate::trace::set_level(LevelFilter::Warn),
            "trace=info" => crate::trace::set_level(LevelFilter::Info),
            "trace=debug" => crate::trace::set_level(LevelFilter::Debug),
            "trace=trace" => crate::trace::set_level(LevelFilter::Trace),
            other => log::warn!("unknown boot parameter '{}'", other),
        }
    }
}

/// Whether AP startup is disabled
pub fn smp_off() -> bool {
    SMP_OFF.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smp_off_switch() {
        assert!(!smp_off());
        parse("console=serial smp=off");
        assert!(smp_off());
        SMP_OFF.store(false, Ordering::Release);
    }
}
