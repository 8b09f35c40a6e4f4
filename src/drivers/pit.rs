//! 8254 programmable interval timer
//!
//! The PIT drives the boot processor's tick: it advances the boot-time
//! clock and feeds the scheduler's preemption check. Application
//! processors use their local APIC timers instead.

use crate::arch::x86_64::outb;
use crate::kern::{sched, timer};

const CHANNEL0: u16 = 0x40;
const COMMAND: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, rate generator
const MODE_RATE_GENERATOR: u8 = 0x36;

const INPUT_HZ: u32 = 1_193_182;

/// Program channel 0 for the kernel tick rate
pub fn setup() {
    let divisor = (INPUT_HZ / timer::TIMER_HZ as u32) as u16;
    unsafe {
        outb(COMMAND, MODE_RATE_GENERATOR);
        outb(CHANNEL0, divisor as u8);
        outb(CHANNEL0, (divisor >> 8) as u8);
    }
}

/// PIT interrupt body, invoked from the vector dispatch
pub fn handle_interrupt() {
    sched::timer_interrupt(true);
}
