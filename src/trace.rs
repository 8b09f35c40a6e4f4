//! Kernel trace backend for the `log` facade
//!
//! Every record is stamped with the boot-time clock and mirrored to the
//! serial port and the dmesg ring. The VGA terminal is not part of the
//! trace path.

use log::{LevelFilter, Log, Metadata, Record};

use crate::dmesg;
#[cfg(not(test))]
use crate::kern::timer;

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        #[cfg(not(test))]
        crate::drivers::serial::write_fmt(format_args!(
            "[{:5}.{:03}] {:5} {}\n",
            timer::uptime_secs(),
            timer::uptime_millis(),
            record.level(),
            record.args()
        ));

        dmesg::append(record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Later calls only adjust the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Change the maximum logged level at runtime
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_reaches_dmesg() {
        init(LevelFilter::Info);
        let before = dmesg::len();
        log::info!("trace smoke");
        assert!(dmesg::len() > before || dmesg::len() == crate::dmesg::LINES);
    }
}
