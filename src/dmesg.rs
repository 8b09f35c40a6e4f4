//! In-memory kernel log
//!
//! A bounded ring of recent log lines, fed by the trace backend and
//! dumped by the `dmesg` shell command. When the ring is full the
//! oldest line is dropped.

use core::fmt::{self, Write};

use crate::collections::RingBuffer;
use crate::kern::lock::SpinLock;

pub const LINE_LEN: usize = 120;
pub const LINES: usize = 128;

pub type Line = heapless::String<LINE_LEN>;

static RING: SpinLock<RingBuffer<Line, LINES>> = SpinLock::new(RingBuffer::new());

/// Formatter that silently drops output past the line capacity
struct Clipped<'a>(&'a mut Line);

impl fmt::Write for Clipped<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.0.push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Append one formatted line, evicting the oldest when full
pub fn append(level: log::Level, args: &fmt::Arguments) {
    let mut line = Line::new();
    let _ = write!(Clipped(&mut line), "{:5} {}", level, args);

    let mut ring = RING.lock();
    if ring.is_full() {
        ring.get();
    }
    let _ = ring.put(line);
}

/// Visit the retained lines oldest first
pub fn for_each(mut visit: impl FnMut(&str)) {
    let ring = RING.lock();
    for line in ring.iter() {
        visit(line);
    }
}

/// Number of retained lines
pub fn len() -> usize {
    RING.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_dump() {
        let before = len();
        append(log::Level::Info, &format_args!("probe {}", 7));

        let mut found = false;
        for_each(|line| {
            if line.contains("probe 7") {
                found = true;
            }
        });
        assert!(found);
        assert!(len() > before);
    }

    #[test]
    fn test_long_lines_are_clipped() {
        let mut line = Line::new();
        let _ = write!(Clipped(&mut line), "{}", "y".repeat(LINE_LEN * 3));
        assert_eq!(line.len(), LINE_LEN);
    }
}
